#![warn(missing_docs)]

//! Juju lease subsystem: time-bounded exclusive leases over named resources
//!
//! Claim path: Caller → Manager (command loop) → Secretary → Store → published LeaseView
//! Check path: Token → LeaseView (no round trip to the manager)

pub mod clock;
pub mod config;
pub mod error;
pub mod getter;
pub mod kvstore;
pub mod manager;
pub mod metrics;
pub mod retry;
pub mod secretary;
pub mod singular;
pub mod store;
pub mod token;
pub mod types;
pub mod wal_store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LeaseConfig;
pub use error::{LeaseError, Result};
pub use getter::{
    LeaseManagerGetter, ManagerRegistry, ModelCatalog, ModelLeaseManagerGetter, ModelScopedGetter,
    ModelStatus, NamespacedGetter, RegistryDeps, StaticModelCatalog,
};
pub use kvstore::{KvStore, MemoryKvStore};
pub use manager::{
    Checker, Claimer, LeaseCheckerWaiter, Manager, ManagerDeps, ManagerHandle, ManagerSettings,
    NamespaceManager, Pinner, Revoker, Waiter,
};
pub use metrics::{LeaseMetrics, LeaseMetricsSnapshot, LeaseOp};
pub use retry::{RetryConfig, RetryExecutor};
pub use secretary::{LeadershipSecretary, Secretary, SecretaryFinder, SingularSecretary};
pub use singular::{SingularConfig, SingularFlag};
pub use store::{KvLeaseStore, Store};
pub use token::{LeaseView, Token};
pub use types::{LeaseInfo, LeaseKey, LeaseRequest, Timestamp, APPLICATION_LEADERSHIP, SINGULAR_CONTROLLER};
pub use wal_store::PersistentKvStore;
pub use worker::{open_store, LeaseWorker, WorkerDeps};
