//! Per-namespace validation of lease requests.
//!
//! A [`Secretary`] rejects malformed lease names, holders and durations
//! before a request reaches the store. Which secretary applies is decided by
//! a [`SecretaryFinder`], built once at startup and passed to every manager.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;

use crate::error::{LeaseError, Result};
use crate::types::{LeaseKey, APPLICATION_LEADERSHIP, SINGULAR_CONTROLLER};

static APPLICATION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*(?:-[a-z0-9]*[a-z][a-z0-9]*)*$").expect("valid application regex")
});

static UNIT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z][a-z0-9]*(?:-[a-z0-9]*[a-z][a-z0-9]*)*)/(0|[1-9][0-9]*)$")
        .expect("valid unit regex")
});

static AGENT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:machine-(?:0|[1-9][0-9]*)(?:-[a-z]+-(?:0|[1-9][0-9]*))*|controller-(?:0|[1-9][0-9]*))$")
        .expect("valid agent tag regex")
});

/// Validates lease requests for one namespace.
pub trait Secretary: Send + Sync {
    /// Checks the lease name (and the model it belongs to).
    fn check_lease(&self, key: &LeaseKey) -> Result<()>;

    /// Checks the holder name.
    fn check_holder(&self, holder: &str) -> Result<()>;

    /// Checks the requested duration.
    fn check_duration(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Err(LeaseError::NotValid("non-positive lease duration".into()));
        }
        Ok(())
    }
}

fn check_model_uuid(key: &LeaseKey) -> Result<()> {
    uuid::Uuid::parse_str(&key.model_uuid)
        .map(|_| ())
        .map_err(|_| LeaseError::NotValid(format!("model uuid {:?}", key.model_uuid)))
}

/// Returns true if `name` is a well-formed application name.
pub fn is_valid_application(name: &str) -> bool {
    APPLICATION_NAME.is_match(name)
}

/// Returns true if `name` is a well-formed unit name, `<application>/<n>`.
pub fn is_valid_unit(name: &str) -> bool {
    UNIT_NAME.is_match(name)
}

/// Application leadership: lease = application, holder = one of its units.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeadershipSecretary;

impl Secretary for LeadershipSecretary {
    fn check_lease(&self, key: &LeaseKey) -> Result<()> {
        check_model_uuid(key)?;
        if !is_valid_application(&key.lease) {
            return Err(LeaseError::NotValid(format!(
                "application name {:?}",
                key.lease
            )));
        }
        Ok(())
    }

    fn check_holder(&self, holder: &str) -> Result<()> {
        if !is_valid_unit(holder) {
            return Err(LeaseError::NotValid(format!("unit name {:?}", holder)));
        }
        Ok(())
    }
}

/// Singular controller: lease = model or controller UUID, holder = agent tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingularSecretary;

impl Secretary for SingularSecretary {
    fn check_lease(&self, key: &LeaseKey) -> Result<()> {
        check_model_uuid(key)?;
        if uuid::Uuid::parse_str(&key.lease).is_err() {
            return Err(LeaseError::NotValid(format!(
                "singular lease name {:?} is not a model or controller uuid",
                key.lease
            )));
        }
        Ok(())
    }

    fn check_holder(&self, holder: &str) -> Result<()> {
        if !AGENT_TAG.is_match(holder) {
            return Err(LeaseError::NotValid(format!("agent tag {:?}", holder)));
        }
        Ok(())
    }
}

/// Maps namespaces to the secretary responsible for them.
#[derive(Clone, Default)]
pub struct SecretaryFinder {
    secretaries: HashMap<String, Arc<dyn Secretary>>,
}

impl SecretaryFinder {
    /// Creates an empty finder. Every lookup fails until namespaces are registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// The namespaces every controller serves.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(APPLICATION_LEADERSHIP, Arc::new(LeadershipSecretary))
            .register(SINGULAR_CONTROLLER, Arc::new(SingularSecretary))
    }

    /// Registers (or replaces) the secretary for a namespace.
    pub fn register(mut self, namespace: impl Into<String>, secretary: Arc<dyn Secretary>) -> Self {
        self.secretaries.insert(namespace.into(), secretary);
        self
    }

    /// Looks up the secretary for a namespace.
    pub fn secretary(&self, namespace: &str) -> Result<&Arc<dyn Secretary>> {
        self.secretaries
            .get(namespace)
            .ok_or_else(|| LeaseError::NotValid(format!("unknown lease namespace {:?}", namespace)))
    }

    /// Runs every check that applies to a claim or extension.
    pub fn check_claim(&self, key: &LeaseKey, holder: &str, duration: Duration) -> Result<()> {
        let secretary = self.secretary(&key.namespace)?;
        secretary.check_lease(key)?;
        secretary.check_holder(holder)?;
        secretary.check_duration(duration)
    }

    /// Runs the checks that apply to revocation, pinning and token checks.
    pub fn check_holder_of(&self, key: &LeaseKey, holder: &str) -> Result<()> {
        let secretary = self.secretary(&key.namespace)?;
        secretary.check_lease(key)?;
        secretary.check_holder(holder)
    }

    /// Registered namespaces, sorted.
    pub fn namespaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.secretaries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for SecretaryFinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretaryFinder")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}
