//! Process-level wiring of the lease subsystem.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clock::Clock;
use crate::config::LeaseConfig;
use crate::error::Result;
use crate::getter::{ManagerRegistry, NamespacedGetter, RegistryDeps, StaticModelCatalog};
use crate::metrics::LeaseMetrics;
use crate::secretary::SecretaryFinder;
use crate::store::{KvLeaseStore, Store};
use crate::wal_store::PersistentKvStore;

/// Collaborators a [`LeaseWorker`] runs with.
#[derive(Clone)]
pub struct WorkerDeps {
    /// Process-wide clock.
    pub clock: Arc<dyn Clock>,
    /// Lease store shared by every model.
    pub store: Arc<dyn Store>,
    /// Models served by this process. Config models are added to it.
    pub models: Arc<StaticModelCatalog>,
    /// Process-wide counters.
    pub metrics: Arc<LeaseMetrics>,
}

/// Owns the manager registry of one process.
#[derive(Debug)]
pub struct LeaseWorker {
    registry: Arc<ManagerRegistry>,
    models: Arc<StaticModelCatalog>,
    shutdown: CancellationToken,
}

impl LeaseWorker {
    /// Validates `config` and wires the registry. Managers start on first use.
    pub fn start(config: &LeaseConfig, deps: WorkerDeps) -> Result<Self> {
        config.validate()?;
        for model in config.all_models() {
            deps.models.add(model);
        }

        let shutdown = CancellationToken::new();
        let registry = ManagerRegistry::new(
            RegistryDeps {
                store: deps.store,
                clock: deps.clock,
                secretaries: Arc::new(SecretaryFinder::with_defaults()),
                metrics: deps.metrics,
                catalog: deps.models.clone(),
            },
            config.manager_settings(),
            shutdown.clone(),
        );
        info!(models = deps.models.models().len(), "lease worker started");

        Ok(Self {
            registry: Arc::new(registry),
            models: deps.models,
            shutdown,
        })
    }

    /// A getter resolving managers for `namespace`.
    pub fn getter(&self, namespace: impl Into<String>) -> NamespacedGetter {
        NamespacedGetter::new(Arc::clone(&self.registry), namespace)
    }

    /// The manager registry.
    pub fn registry(&self) -> &Arc<ManagerRegistry> {
        &self.registry
    }

    /// The model catalog.
    pub fn models(&self) -> &Arc<StaticModelCatalog> {
        &self.models
    }

    /// Process-wide counters.
    pub fn metrics(&self) -> &Arc<LeaseMetrics> {
        self.registry.metrics()
    }

    /// Fires when the worker is shut down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops every manager and waits for them to exit.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        info!("lease worker stopped");
    }
}

/// Opens the persistent lease database under `config.data_dir`.
///
/// Returns the raw database too, so the caller can checkpoint it.
pub fn open_store(config: &LeaseConfig) -> Result<(Arc<PersistentKvStore>, Arc<dyn Store>)> {
    std::fs::create_dir_all(&config.data_dir)?;
    let kv = Arc::new(PersistentKvStore::open(&config.data_dir)?);
    let store: Arc<dyn Store> = Arc::new(KvLeaseStore::with_retry(kv.clone(), config.retry.clone()));
    info!(dir = %config.data_dir.display(), "opened lease store");
    Ok((kv, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::LeaseError;
    use crate::getter::LeaseManagerGetter;
    use crate::kvstore::MemoryKvStore;
    use crate::types::{LeaseKey, LeaseRequest, Timestamp, APPLICATION_LEADERSHIP};
    use std::time::Duration;

    const MODEL: &str = "a6b5c8f0-3d1e-4a8b-9c2d-0e1f2a3b4c5d";

    fn deps() -> WorkerDeps {
        WorkerDeps {
            clock: Arc::new(ManualClock::new(Timestamp::from_secs(1_000))),
            store: Arc::new(KvLeaseStore::new(Arc::new(MemoryKvStore::new()))),
            models: Arc::new(StaticModelCatalog::new()),
            metrics: Arc::new(LeaseMetrics::new()),
        }
    }

    #[tokio::test]
    async fn test_config_models_registered() {
        let config = LeaseConfig {
            models: vec![MODEL.into()],
            ..LeaseConfig::default()
        };
        let worker = LeaseWorker::start(&config, deps()).unwrap();
        assert_eq!(worker.models().models(), vec![MODEL.to_string()]);
        assert!(worker.registry().models().is_empty());

        let getter = worker.getter(APPLICATION_LEADERSHIP);
        assert!(getter.get_lease_manager(MODEL).is_ok());
        assert_eq!(worker.registry().models(), vec![MODEL.to_string()]);

        worker.shutdown().await;
        assert!(worker.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = LeaseConfig {
            command_queue_capacity: 0,
            ..LeaseConfig::default()
        };
        let err = LeaseWorker::start(&config, deps()).unwrap_err();
        assert!(matches!(err, LeaseError::NotValid(_)));
    }

    #[tokio::test]
    async fn test_open_store_persists_leases() {
        let dir = tempfile::tempdir().unwrap();
        let config = LeaseConfig {
            data_dir: dir.path().join("leases"),
            ..LeaseConfig::default()
        };
        let key = LeaseKey::new(APPLICATION_LEADERSHIP, MODEL, "mysql");
        let now = Timestamp::from_secs(1_000);

        {
            let (kv, store) = open_store(&config).unwrap();
            store
                .claim_lease(&key, &LeaseRequest::new("mysql/0", Duration::from_secs(60)), now)
                .await
                .unwrap();
            kv.checkpoint().unwrap();
        }

        let (_kv, store) = open_store(&config).unwrap();
        let leases = store.leases(MODEL, APPLICATION_LEADERSHIP).await.unwrap();
        assert_eq!(leases["mysql"].holder, "mysql/0");
        assert_eq!(leases["mysql"].expiry, Timestamp::from_secs(1_060));
    }
}
