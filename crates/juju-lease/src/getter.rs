//! Routing from model UUIDs to lease managers.
//!
//! The [`ManagerRegistry`] starts one [`Manager`] per model on first use and
//! keeps it for the life of the process. Getters wrap the registry for
//! callers that only need a [`LeaseCheckerWaiter`] for one namespace.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::error::{LeaseError, Result};
use crate::manager::{LeaseCheckerWaiter, Manager, ManagerDeps, ManagerHandle, ManagerSettings};
use crate::metrics::LeaseMetrics;
use crate::secretary::SecretaryFinder;
use crate::store::Store;

/// Whether a model can have its leases managed here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelStatus {
    /// Leases are served normally.
    Active,
    /// The model is being migrated; lease management is unavailable.
    Migrating,
}

/// Tells the registry which models this controller serves.
pub trait ModelCatalog: Send + Sync {
    /// Status of the model, or None if this controller does not know it.
    fn model_status(&self, model_uuid: &str) -> Option<ModelStatus>;
}

/// A [`ModelCatalog`] backed by an in-memory map.
#[derive(Debug, Default)]
pub struct StaticModelCatalog {
    models: DashMap<String, ModelStatus>,
}

impl StaticModelCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an active model.
    pub fn add(&self, model_uuid: impl Into<String>) {
        self.models.insert(model_uuid.into(), ModelStatus::Active);
    }

    /// Changes the status of a known model. Returns false if it is unknown.
    pub fn set_status(&self, model_uuid: &str, status: ModelStatus) -> bool {
        match self.models.get_mut(model_uuid) {
            Some(mut entry) => {
                *entry = status;
                true
            }
            None => false,
        }
    }

    /// Forgets a model. Returns false if it was unknown.
    pub fn remove(&self, model_uuid: &str) -> bool {
        self.models.remove(model_uuid).is_some()
    }

    /// Known model UUIDs, sorted.
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        models.sort();
        models
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn model_status(&self, model_uuid: &str) -> Option<ModelStatus> {
        self.models.get(model_uuid).map(|e| *e.value())
    }
}

/// Shared collaborators for every manager the registry starts.
#[derive(Clone)]
pub struct RegistryDeps {
    /// Lease store shared by all models.
    pub store: Arc<dyn Store>,
    /// Process-wide clock.
    pub clock: Arc<dyn Clock>,
    /// Namespace validation.
    pub secretaries: Arc<SecretaryFinder>,
    /// Process-wide counters.
    pub metrics: Arc<LeaseMetrics>,
    /// Models this controller serves.
    pub catalog: Arc<dyn ModelCatalog>,
}

/// One lease manager per model, started lazily.
pub struct ManagerRegistry {
    deps: RegistryDeps,
    settings: ManagerSettings,
    managers: DashMap<String, ManagerHandle>,
    shutdown: CancellationToken,
}

impl ManagerRegistry {
    /// Creates an empty registry. Managers stop when `shutdown` is cancelled.
    pub fn new(deps: RegistryDeps, settings: ManagerSettings, shutdown: CancellationToken) -> Self {
        Self {
            deps,
            settings,
            managers: DashMap::new(),
            shutdown,
        }
    }

    /// Returns the manager for `model_uuid`, starting it if needed.
    ///
    /// Fails with [`LeaseError::NotFound`] for models the catalog does not
    /// know (stopping any manager left over from before the model went away)
    /// and with [`LeaseError::NotSupported`] while the model is migrating.
    pub fn manager(&self, model_uuid: &str) -> Result<ManagerHandle> {
        match self.deps.catalog.model_status(model_uuid) {
            None => {
                if self.stop_manager(model_uuid) {
                    info!(model = %model_uuid, "model gone, stopped its lease manager");
                }
                return Err(LeaseError::NotFound(format!("model {}", model_uuid)));
            }
            Some(ModelStatus::Migrating) => {
                return Err(LeaseError::NotSupported(format!(
                    "lease management for model {} during migration",
                    model_uuid
                )));
            }
            Some(ModelStatus::Active) => {}
        }
        if self.shutdown.is_cancelled() {
            return Err(LeaseError::Stopped);
        }

        let mut entry = self
            .managers
            .entry(model_uuid.to_string())
            .or_insert_with(|| self.start_manager(model_uuid));
        if entry.is_stopped() {
            *entry = self.start_manager(model_uuid);
        }
        Ok(entry.clone())
    }

    fn start_manager(&self, model_uuid: &str) -> ManagerHandle {
        info!(model = %model_uuid, "starting lease manager");
        Manager::start(
            ManagerDeps {
                model_uuid: model_uuid.to_string(),
                store: Arc::clone(&self.deps.store),
                clock: Arc::clone(&self.deps.clock),
                secretaries: Arc::clone(&self.deps.secretaries),
                metrics: Arc::clone(&self.deps.metrics),
            },
            self.settings.clone(),
            self.shutdown.child_token(),
        )
    }

    /// Stops the manager for a model, if running. Returns true if one was.
    pub fn stop_manager(&self, model_uuid: &str) -> bool {
        match self.managers.remove(model_uuid) {
            Some((_, handle)) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    /// Models with a running manager, sorted.
    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.managers.iter().map(|e| e.key().clone()).collect();
        models.sort();
        models
    }

    /// Process-wide counters.
    pub fn metrics(&self) -> &Arc<LeaseMetrics> {
        &self.deps.metrics
    }

    /// Stops every manager and waits for all of them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<ManagerHandle> = self.managers.iter().map(|e| e.value().clone()).collect();
        self.managers.clear();
        for handle in handles {
            handle.stopped().await;
        }
        info!("all lease managers stopped");
    }
}

impl fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerRegistry")
            .field("models", &self.models())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Resolves the lease manager of any model for one namespace.
pub trait LeaseManagerGetter: Send + Sync {
    /// The checker/waiter for `model_uuid`.
    fn get_lease_manager(&self, model_uuid: &str) -> Result<Arc<dyn LeaseCheckerWaiter>>;
}

/// Resolves the lease manager of a fixed model for one namespace.
pub trait ModelLeaseManagerGetter: Send + Sync {
    /// The checker/waiter for the bound model.
    fn get_lease_manager(&self) -> Result<Arc<dyn LeaseCheckerWaiter>>;
}

/// [`LeaseManagerGetter`] over a registry.
#[derive(Clone, Debug)]
pub struct NamespacedGetter {
    registry: Arc<ManagerRegistry>,
    namespace: String,
}

impl NamespacedGetter {
    /// Creates a getter for `namespace`.
    pub fn new(registry: Arc<ManagerRegistry>, namespace: impl Into<String>) -> Self {
        Self {
            registry,
            namespace: namespace.into(),
        }
    }

    /// Binds the getter to one model.
    pub fn for_model(&self, model_uuid: impl Into<String>) -> ModelScopedGetter {
        ModelScopedGetter {
            inner: self.clone(),
            model_uuid: model_uuid.into(),
        }
    }
}

impl LeaseManagerGetter for NamespacedGetter {
    fn get_lease_manager(&self, model_uuid: &str) -> Result<Arc<dyn LeaseCheckerWaiter>> {
        Ok(self
            .registry
            .manager(model_uuid)?
            .checker_waiter(&self.namespace))
    }
}

/// [`ModelLeaseManagerGetter`] bound to one model.
#[derive(Clone, Debug)]
pub struct ModelScopedGetter {
    inner: NamespacedGetter,
    model_uuid: String,
}

impl ModelScopedGetter {
    /// The bound model.
    pub fn model_uuid(&self) -> &str {
        &self.model_uuid
    }
}

impl ModelLeaseManagerGetter for ModelScopedGetter {
    fn get_lease_manager(&self) -> Result<Arc<dyn LeaseCheckerWaiter>> {
        self.inner.get_lease_manager(&self.model_uuid)
    }
}
