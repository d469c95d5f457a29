//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use juju_lease::{
    KvLeaseStore, LeaseCheckerWaiter, LeaseConfig, LeaseMetrics, LeaseWorker, ManagerHandle,
    ManualClock, MemoryKvStore, RetryConfig, StaticModelCatalog, Store, Timestamp, WorkerDeps,
    APPLICATION_LEADERSHIP,
};

pub const MODEL: &str = "a6b5c8f0-3d1e-4a8b-9c2d-0e1f2a3b4c5d";
pub const OTHER_MODEL: &str = "0f6c2e8e-4c4b-4c0e-8a55-3b3a3c9e1d10";

/// Config with fast retries and the test models.
pub fn test_config() -> LeaseConfig {
    LeaseConfig {
        models: vec![MODEL.to_string(), OTHER_MODEL.to_string()],
        retry: RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            jitter: false,
            ..RetryConfig::default()
        },
        ..LeaseConfig::default()
    }
}

/// One controller process: a worker over a shared store and clock.
pub struct TestController {
    pub worker: LeaseWorker,
    pub metrics: Arc<LeaseMetrics>,
}

impl TestController {
    pub fn start(store: Arc<dyn Store>, clock: Arc<ManualClock>) -> Self {
        let metrics = Arc::new(LeaseMetrics::new());
        let worker = LeaseWorker::start(
            &test_config(),
            WorkerDeps {
                clock,
                store,
                models: Arc::new(StaticModelCatalog::new()),
                metrics: metrics.clone(),
            },
        )
        .expect("valid test config");
        Self { worker, metrics }
    }

    /// The manager for `model`, started if needed.
    pub fn manager(&self, model: &str) -> ManagerHandle {
        self.worker.registry().manager(model).expect("model is served")
    }

    /// Leadership checker/waiter of [`MODEL`].
    pub fn leadership(&self) -> Arc<dyn LeaseCheckerWaiter> {
        self.manager(MODEL).checker_waiter(APPLICATION_LEADERSHIP)
    }
}

/// A store, a manual clock, and controllers sharing them.
pub struct TestCluster {
    pub clock: Arc<ManualClock>,
    pub kv: Arc<MemoryKvStore>,
    pub store: Arc<dyn Store>,
    controllers: Vec<TestController>,
}

impl TestCluster {
    /// Create a cluster with the given number of controllers
    pub fn new(num_controllers: usize) -> Self {
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_000)));
        let kv = Arc::new(MemoryKvStore::new());
        let store: Arc<dyn Store> = Arc::new(KvLeaseStore::with_retry(kv.clone(), test_config().retry));
        let controllers = (0..num_controllers)
            .map(|_| TestController::start(store.clone(), clock.clone()))
            .collect();
        Self {
            clock,
            kv,
            store,
            controllers,
        }
    }

    pub fn controller(&self, index: usize) -> &TestController {
        &self.controllers[index]
    }

    /// Waits until `sleepers` manager loops are idle on the clock.
    pub async fn settle(&self, sleepers: usize) {
        tokio::time::timeout(Duration::from_secs(5), self.clock.wait_for_sleepers(sleepers))
            .await
            .expect("manager loops never went idle");
    }

    /// Moves the clock once `sleepers` loops are idle and waits for their ticks.
    pub async fn advance(&self, sleepers: usize, d: Duration) {
        self.settle(sleepers).await;
        self.clock.advance(d);
        self.settle(sleepers).await;
    }

    pub async fn shutdown(&self) {
        for controller in &self.controllers {
            controller.worker.shutdown().await;
        }
    }
}

/// Polls `condition` on wall time until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}
