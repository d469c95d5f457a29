//! Keeping a singular lease held.
//!
//! A [`SingularFlag`] claims one lease for one holder and keeps renewing it
//! once a configurable fraction of the lease duration has elapsed. If another
//! holder has the lease, the flag blocks until it lapses and then claims it.
//! Controllers use this to decide which of them runs model-singular workers.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{LeaseError, Result};
use crate::manager::ManagerHandle;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::types::{LeaseKey, LeaseRequest};

/// Configuration for a singular flag.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingularConfig {
    /// Duration of each claim.
    pub duration: Duration,
    /// Fraction of `duration` after which the claim is renewed (0.0-1.0].
    /// Default: 0.5.
    pub renew_threshold: f64,
    /// Back-off between claims that failed on a transient store error.
    pub retry: RetryConfig,
}

impl Default for SingularConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            renew_threshold: 0.5,
            retry: RetryConfig {
                initial_backoff_ms: 1_000,
                max_backoff_ms: 30_000,
                ..RetryConfig::default()
            },
        }
    }
}

impl SingularConfig {
    /// Time between successful claims.
    pub fn renew_interval(&self) -> Duration {
        let threshold = if self.renew_threshold > 0.0 && self.renew_threshold <= 1.0 {
            self.renew_threshold
        } else {
            0.5
        };
        self.duration.mul_f64(threshold)
    }
}

/// Background task holding a lease for one holder.
#[derive(Debug)]
pub struct SingularFlag {
    held: watch::Receiver<bool>,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl SingularFlag {
    /// Starts claiming `key` for `holder` through `manager`.
    ///
    /// The flag runs until `cancel` fires or [`SingularFlag::stop`] is called,
    /// then revokes the lease if it still holds it.
    pub fn start(
        manager: ManagerHandle,
        key: LeaseKey,
        holder: impl Into<String>,
        config: SingularConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (held_tx, held) = watch::channel(false);
        let worker = FlagWorker {
            manager,
            key,
            holder: holder.into(),
            config,
            held_tx,
            cancel: cancel.clone(),
        };
        Self {
            held,
            cancel,
            task: tokio::spawn(worker.run()),
        }
    }

    /// True while the holder owns the lease.
    pub fn is_held(&self) -> bool {
        *self.held.borrow()
    }

    /// Receives every change of [`SingularFlag::is_held`].
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.held.clone()
    }

    /// Stops the flag, releasing the lease, and returns how the task ended.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.task
            .await
            .map_err(|e| LeaseError::Io(std::io::Error::other(format!("singular flag task failed: {}", e))))?
    }
}

struct FlagWorker {
    manager: ManagerHandle,
    key: LeaseKey,
    holder: String,
    config: SingularConfig,
    held_tx: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl FlagWorker {
    fn set_held(&self, held: bool) {
        let was = self.held_tx.send_replace(held);
        if was != held {
            if held {
                info!(lease = %self.key, holder = %self.holder, "singular lease acquired");
            } else {
                info!(lease = %self.key, holder = %self.holder, "singular lease lost");
            }
        }
    }

    async fn run(self) -> Result<()> {
        let clock = Arc::clone(self.manager.clock());
        let request = LeaseRequest::new(self.holder.clone(), self.config.duration);
        let backoff = RetryExecutor::new(self.config.retry.clone());
        let mut failures = 0u32;

        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            match self.manager.claim(self.key.clone(), request.clone()).await {
                Ok(_) => {
                    failures = 0;
                    self.set_held(true);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break Ok(()),
                        _ = clock.sleep(self.config.renew_interval()) => {}
                    }
                }
                Err(LeaseError::ClaimDenied(_)) => {
                    self.set_held(false);
                    match self
                        .manager
                        .wait_until_expired(self.key.clone(), &self.cancel, None)
                        .await
                    {
                        Ok(()) => {}
                        Err(LeaseError::Cancelled) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                Err(e) if e.is_retryable() => {
                    self.set_held(false);
                    let delay = backoff.backoff(failures);
                    failures = failures.saturating_add(1);
                    warn!(lease = %self.key, error = %e, ?delay, "singular claim failed, retrying");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break Ok(()),
                        _ = clock.sleep(delay) => {}
                    }
                }
                Err(e) => {
                    self.set_held(false);
                    break Err(e);
                }
            }
        };

        if self.held_tx.send_replace(false) {
            if let Err(e) = self.manager.revoke(self.key.clone(), &self.holder).await {
                warn!(lease = %self.key, error = %e, "failed to release singular lease");
            } else {
                info!(lease = %self.key, holder = %self.holder, "singular lease released");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kvstore::MemoryKvStore;
    use crate::manager::{Manager, ManagerDeps, ManagerSettings};
    use crate::metrics::LeaseMetrics;
    use crate::secretary::SecretaryFinder;
    use crate::store::{KvLeaseStore, Store};
    use crate::types::{Timestamp, SINGULAR_CONTROLLER};

    const MODEL: &str = "a6b5c8f0-3d1e-4a8b-9c2d-0e1f2a3b4c5d";

    fn start_manager() -> (ManagerHandle, Arc<ManualClock>, Arc<KvLeaseStore<MemoryKvStore>>) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(1_000)));
        let store = Arc::new(KvLeaseStore::new(Arc::new(MemoryKvStore::new())));
        let handle = Manager::start(
            ManagerDeps {
                model_uuid: MODEL.to_string(),
                store: store.clone(),
                clock: clock.clone(),
                secretaries: Arc::new(SecretaryFinder::with_defaults()),
                metrics: Arc::new(LeaseMetrics::new()),
            },
            ManagerSettings::default(),
            CancellationToken::new(),
        );
        (handle, clock, store)
    }

    fn key() -> LeaseKey {
        LeaseKey::new(SINGULAR_CONTROLLER, MODEL, MODEL)
    }

    fn config() -> SingularConfig {
        SingularConfig {
            duration: Duration::from_secs(30),
            ..SingularConfig::default()
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[test]
    fn test_renew_interval() {
        assert_eq!(config().renew_interval(), Duration::from_secs(15));
        let odd = SingularConfig {
            renew_threshold: 3.0,
            ..config()
        };
        assert_eq!(odd.renew_interval(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_flag_acquires_and_renews() {
        let (handle, clock, _store) = start_manager();
        let flag = SingularFlag::start(handle.clone(), key(), "machine-0", config(), CancellationToken::new());

        let mut held = flag.subscribe();
        tokio::time::timeout(Duration::from_secs(5), held.wait_for(|h| *h))
            .await
            .unwrap()
            .unwrap();
        let first_expiry = handle.view().leases[&key()].expiry;
        assert_eq!(first_expiry, Timestamp::from_secs(1_030));

        // Manager loop plus the flag's renewal timer.
        clock.wait_for_sleepers(2).await;
        clock.advance(Duration::from_secs(15));
        eventually(|| handle.view().leases.get(&key()).is_some_and(|i| i.expiry > first_expiry)).await;
        assert_eq!(handle.view().leases[&key()].expiry, Timestamp::from_secs(1_045));
        assert!(flag.is_held());

        flag.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_flag_waits_for_release() {
        let (handle, _clock, _store) = start_manager();
        let first = SingularFlag::start(handle.clone(), key(), "machine-0", config(), CancellationToken::new());
        let mut first_held = first.subscribe();
        tokio::time::timeout(Duration::from_secs(5), first_held.wait_for(|h| *h))
            .await
            .unwrap()
            .unwrap();

        let second = SingularFlag::start(handle.clone(), key(), "controller-1", config(), CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_held());

        first.stop().await.unwrap();
        let mut second_held = second.subscribe();
        tokio::time::timeout(Duration::from_secs(5), second_held.wait_for(|h| *h))
            .await
            .unwrap()
            .unwrap();
        assert!(handle.token(key(), "controller-1").check().is_ok());

        second.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_revokes() {
        let (handle, _clock, store) = start_manager();
        let cancel = CancellationToken::new();
        let flag = SingularFlag::start(handle.clone(), key(), "machine-2", config(), cancel.clone());
        let mut held = flag.subscribe();
        tokio::time::timeout(Duration::from_secs(5), held.wait_for(|h| *h))
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        flag.stop().await.unwrap();
        assert!(store.leases(MODEL, SINGULAR_CONTROLLER).await.unwrap().is_empty());
        assert!(handle.token(key(), "machine-2").check().is_err());
    }

    #[tokio::test]
    async fn test_invalid_holder_ends_flag() {
        let (handle, _clock, _store) = start_manager();
        let flag = SingularFlag::start(handle, key(), "mysql/0", config(), CancellationToken::new());
        let mut held = flag.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while held.changed().await.is_ok() {}
        })
        .await
        .unwrap();
        assert!(!flag.is_held());
        let err = flag.stop().await.unwrap_err();
        assert!(matches!(err, LeaseError::NotValid(_)));
    }
}
