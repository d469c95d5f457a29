//! Lease manager: one actor per model.
//!
//! The actor owns the model's in-memory lease table and serializes every
//! claim, extend, revoke and pin through a bounded command queue. After each
//! store operation it publishes a [`LeaseView`] that [`Token`]s read without
//! a round trip. Between commands it sleeps until the soonest expiry, a
//! pending refresh retry or `max_sleep`, whichever comes first, then sweeps
//! expired rows, refreshes the view and releases waiters.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{LeaseError, Result};
use crate::metrics::{LeaseMetrics, LeaseOp};
use crate::retry::{RetryConfig, RetryExecutor};
use crate::secretary::SecretaryFinder;
use crate::store::Store;
use crate::token::{LeaseView, Token};
use crate::types::{LeaseInfo, LeaseKey, LeaseRequest, Timestamp};

/// Runtime settings for a lease manager.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Longest the manager sleeps between sweeps.
    pub max_sleep: Duration,
    /// How long the store may be unreachable before tokens stop validating.
    pub stale_after: Duration,
    /// Back-off for refresh retries while the store is unreachable.
    pub retry: RetryConfig,
    /// Capacity of the command queue.
    pub queue_capacity: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_sleep: Duration::from_secs(60),
            stale_after: Duration::from_secs(120),
            retry: RetryConfig::default(),
            queue_capacity: 64,
        }
    }
}

/// Collaborators a manager needs.
#[derive(Clone)]
pub struct ManagerDeps {
    /// The model whose leases this manager owns.
    pub model_uuid: String,
    /// Source of truth for lease rows.
    pub store: Arc<dyn Store>,
    /// Time source for every expiry decision.
    pub clock: Arc<dyn Clock>,
    /// Per-namespace request validation.
    pub secretaries: Arc<SecretaryFinder>,
    /// Process-wide counters.
    pub metrics: Arc<LeaseMetrics>,
}

impl fmt::Debug for ManagerDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerDeps")
            .field("model_uuid", &self.model_uuid)
            .field("clock", &self.clock)
            .field("secretaries", &self.secretaries)
            .finish_non_exhaustive()
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Claim {
        key: LeaseKey,
        request: LeaseRequest,
        reply: Reply<LeaseInfo>,
    },
    Extend {
        key: LeaseKey,
        request: LeaseRequest,
        reply: Reply<LeaseInfo>,
    },
    Revoke {
        key: LeaseKey,
        holder: String,
        reply: Reply<()>,
    },
    Pin {
        key: LeaseKey,
        entity: String,
        pin: bool,
        reply: Reply<()>,
    },
    Pinned {
        reply: Reply<HashMap<LeaseKey, Vec<String>>>,
    },
    Refresh {
        reply: Reply<()>,
    },
    Wait {
        key: LeaseKey,
        started: Option<oneshot::Sender<()>>,
        reply: Reply<()>,
    },
}

/// The actor behind a [`ManagerHandle`].
pub struct Manager {
    deps: ManagerDeps,
    settings: ManagerSettings,
    backoff: RetryExecutor,
    view_tx: watch::Sender<LeaseView>,
    leases: HashMap<LeaseKey, LeaseInfo>,
    waiters: HashMap<LeaseKey, Vec<Reply<()>>>,
    last_success: Timestamp,
    failures: u32,
    retry_at: Option<Timestamp>,
    healthy: bool,
}

impl Manager {
    /// Spawns the manager loop and returns a handle to it.
    ///
    /// The loop runs until `shutdown` is cancelled. Must be called from
    /// within a tokio runtime.
    pub fn start(
        deps: ManagerDeps,
        settings: ManagerSettings,
        shutdown: CancellationToken,
    ) -> ManagerHandle {
        let (command_tx, command_rx) = mpsc::channel(settings.queue_capacity.max(1));
        let now = deps.clock.now();
        let (view_tx, view_rx) = watch::channel(LeaseView {
            leases: Arc::default(),
            refreshed_at: now,
            healthy: true,
        });

        let handle = ManagerHandle {
            model_uuid: deps.model_uuid.clone(),
            commands: command_tx,
            view: view_rx,
            clock: Arc::clone(&deps.clock),
            shutdown: shutdown.clone(),
        };

        let manager = Manager {
            backoff: RetryExecutor::new(settings.retry.clone()),
            deps,
            settings,
            view_tx,
            leases: HashMap::new(),
            waiters: HashMap::new(),
            last_success: now,
            failures: 0,
            retry_at: None,
            healthy: true,
        };
        tokio::spawn(manager.run(command_rx, shutdown));

        handle
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        info!(model = %self.deps.model_uuid, "lease manager started");
        self.tick().await;

        loop {
            let sleep = self.deps.clock.sleep(self.next_wake());
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep => self.tick().await,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }

        commands.close();
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(LeaseError::Stopped));
            }
        }
        info!(model = %self.deps.model_uuid, "lease manager stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Claim {
                key,
                request,
                reply,
            } => {
                if !reply.is_closed() {
                    let _ = reply.send(self.claim(key, request).await);
                }
            }
            Command::Extend {
                key,
                request,
                reply,
            } => {
                if !reply.is_closed() {
                    let _ = reply.send(self.extend(key, request).await);
                }
            }
            Command::Revoke { key, holder, reply } => {
                if !reply.is_closed() {
                    let _ = reply.send(self.revoke(key, holder).await);
                }
            }
            Command::Pin {
                key,
                entity,
                pin,
                reply,
            } => {
                if !reply.is_closed() {
                    let _ = reply.send(self.pin(key, entity, pin).await);
                }
            }
            Command::Pinned { reply } => {
                if !reply.is_closed() {
                    let _ = reply.send(self.deps.store.pinned(&self.deps.model_uuid).await);
                }
            }
            Command::Refresh { reply } => {
                if !reply.is_closed() {
                    let _ = reply.send(self.refresh().await);
                }
            }
            Command::Wait {
                key,
                started,
                reply,
            } => self.register_waiter(key, started, reply).await,
        }
    }

    fn check_scope(&self, key: &LeaseKey) -> Result<()> {
        if key.model_uuid != self.deps.model_uuid {
            return Err(LeaseError::NotValid(format!(
                "lease {} does not belong to model {}",
                key, self.deps.model_uuid
            )));
        }
        Ok(())
    }

    fn check_lease_name(&self, key: &LeaseKey) -> Result<()> {
        self.check_scope(key)?;
        self.deps.secretaries.secretary(&key.namespace)?.check_lease(key)
    }

    fn held_by_other(&self, key: &LeaseKey, holder: &str, now: Timestamp) -> bool {
        self.leases
            .get(key)
            .is_some_and(|info| info.is_live(now) && info.holder != holder)
    }

    async fn claim(&mut self, key: LeaseKey, request: LeaseRequest) -> Result<LeaseInfo> {
        self.check_scope(&key)?;
        self.deps
            .secretaries
            .check_claim(&key, &request.holder, request.duration)?;

        let now = self.deps.clock.now();
        match self.deps.store.claim_lease(&key, &request, now).await {
            Ok(info) => {
                let extended = info.start != now
                    || self
                        .leases
                        .get(&key)
                        .is_some_and(|prev| prev.holder == info.holder && prev.start == info.start);
                if extended {
                    self.deps.metrics.record(LeaseOp::Extended);
                } else {
                    self.deps.metrics.record(LeaseOp::ClaimGranted);
                    info!(lease = %key, holder = %info.holder, expiry = %info.expiry, "lease claimed");
                }
                self.leases.insert(key, info.clone());
                self.store_reached(now).await;
                Ok(info)
            }
            Err(LeaseError::ClaimDenied(key)) => {
                self.deps.metrics.record(LeaseOp::ClaimDenied);
                debug!(lease = %key, holder = %request.holder, "lease claim denied");
                self.last_success = now;
                if !self.held_by_other(&key, &request.holder, now) {
                    let _ = self.refresh().await;
                }
                Err(LeaseError::ClaimDenied(key))
            }
            Err(e) => {
                warn!(lease = %key, error = %e, "lease claim failed");
                Err(e)
            }
        }
    }

    async fn extend(&mut self, key: LeaseKey, request: LeaseRequest) -> Result<LeaseInfo> {
        self.check_scope(&key)?;
        self.deps
            .secretaries
            .check_claim(&key, &request.holder, request.duration)?;

        let now = self.deps.clock.now();
        match self.deps.store.extend_lease(&key, &request, now).await {
            Ok(info) => {
                self.deps.metrics.record(LeaseOp::Extended);
                debug!(lease = %key, expiry = %info.expiry, "lease extended");
                self.leases.insert(key, info.clone());
                self.store_reached(now).await;
                Ok(info)
            }
            Err(e @ LeaseError::InvalidHolder { .. }) => {
                self.last_success = now;
                let _ = self.refresh().await;
                Err(e)
            }
            Err(e) => {
                warn!(lease = %key, error = %e, "lease extend failed");
                Err(e)
            }
        }
    }

    async fn revoke(&mut self, key: LeaseKey, holder: String) -> Result<()> {
        self.check_scope(&key)?;
        self.deps.secretaries.check_holder_of(&key, &holder)?;

        let now = self.deps.clock.now();
        match self.deps.store.revoke_lease(&key, &holder).await {
            Ok(()) => {
                if self.leases.remove(&key).is_some() {
                    self.deps.metrics.record(LeaseOp::Revoked);
                    info!(lease = %key, %holder, "lease revoked");
                }
                self.store_reached(now).await;
                Ok(())
            }
            Err(e @ LeaseError::InvalidHolder { .. }) => {
                self.last_success = now;
                let _ = self.refresh().await;
                Err(e)
            }
            Err(e) => {
                warn!(lease = %key, error = %e, "lease revoke failed");
                Err(e)
            }
        }
    }

    async fn pin(&mut self, key: LeaseKey, entity: String, pin: bool) -> Result<()> {
        self.check_lease_name(&key)?;

        let now = self.deps.clock.now();
        if pin {
            self.deps.store.pin_lease(&key, &entity).await?;
        } else {
            self.deps.store.unpin_lease(&key, &entity).await?;
        }
        if let Some(info) = self.leases.get_mut(&key) {
            if pin {
                info.pinned_by.insert(entity.clone());
            } else {
                info.pinned_by.remove(&entity);
            }
        }
        debug!(lease = %key, %entity, pin, "lease pins updated");
        self.store_reached(now).await;
        Ok(())
    }

    fn is_live(&self, key: &LeaseKey, now: Timestamp) -> bool {
        self.leases.get(key).is_some_and(|info| info.is_live(now))
    }

    /// Registers a wait, or answers at once if the store shows the lease free.
    ///
    /// The cache may predate a claim made through another manager, so a
    /// lease it does not show as held is looked up in the store first. If
    /// the store cannot be read the wait is registered and settled by the
    /// next successful refresh.
    async fn register_waiter(
        &mut self,
        key: LeaseKey,
        started: Option<oneshot::Sender<()>>,
        reply: Reply<()>,
    ) {
        if let Err(e) = self.check_lease_name(&key) {
            let _ = reply.send(Err(e));
            return;
        }
        if reply.is_closed() {
            return;
        }

        let mut confirmed = true;
        if !self.is_live(&key, self.deps.clock.now()) {
            confirmed = self.refresh().await.is_ok();
        }
        if !confirmed || self.is_live(&key, self.deps.clock.now()) {
            self.waiters.entry(key).or_default().push(reply);
        } else if reply.send(Ok(())).is_ok() {
            self.deps.metrics.record(LeaseOp::WaiterNotified);
        }
        if let Some(started) = started {
            let _ = started.send(());
        }
    }

    /// Records a successful store write and publishes the updated view.
    ///
    /// An unhealthy view is replaced by a full refresh instead, since rows
    /// may have changed while the store was unreachable.
    async fn store_reached(&mut self, now: Timestamp) {
        self.last_success = now;
        if self.healthy {
            self.publish();
        } else {
            let _ = self.refresh().await;
        }
    }

    async fn tick(&mut self) {
        let now = self.deps.clock.now();
        match self.deps.store.expire_leases(&self.deps.model_uuid, now).await {
            Ok(expired) => {
                self.last_success = now;
                if !expired.is_empty() {
                    self.deps
                        .metrics
                        .record_n(LeaseOp::Expired, expired.len() as u64);
                    for key in &expired {
                        info!(lease = %key, "lease expired");
                    }
                }
            }
            Err(e) => debug!(model = %self.deps.model_uuid, error = %e, "expiring leases failed"),
        }

        let _ = self.refresh().await;
        self.prune_waiters();
    }

    async fn refresh(&mut self) -> Result<()> {
        let now = self.deps.clock.now();
        match self.deps.store.model_leases(&self.deps.model_uuid).await {
            Ok(leases) => {
                self.leases = leases;
                self.last_success = now;
                self.failures = 0;
                self.retry_at = None;
                if !self.healthy {
                    info!(model = %self.deps.model_uuid, "lease store reachable again");
                    self.healthy = true;
                }
                self.deps.metrics.record(LeaseOp::Refresh);
                self.publish();
                Ok(())
            }
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                let backoff = self
                    .backoff
                    .backoff(self.failures - 1)
                    .max(Duration::from_millis(1));
                self.retry_at = Some(now.saturating_add(backoff));
                self.deps.metrics.record(LeaseOp::RefreshFailed);

                let stale_for = now.saturating_duration_since(self.last_success);
                if self.healthy && stale_for >= self.settings.stale_after {
                    error!(
                        model = %self.deps.model_uuid,
                        ?stale_for,
                        error = %e,
                        "lease store unreachable, leases can no longer be checked"
                    );
                    self.healthy = false;
                } else {
                    warn!(
                        model = %self.deps.model_uuid,
                        attempt = self.failures,
                        ?backoff,
                        error = %e,
                        "lease refresh failed"
                    );
                }
                self.publish_view();
                Err(e)
            }
        }
    }

    /// Publishes the view and releases waiters whose lease is free.
    ///
    /// Only called once the store has confirmed the table.
    fn publish(&mut self) {
        self.publish_view();
        self.release_waiters(self.deps.clock.now());
    }

    fn publish_view(&mut self) {
        self.view_tx.send_replace(LeaseView {
            leases: Arc::new(self.leases.clone()),
            refreshed_at: self.last_success,
            healthy: self.healthy,
        });
    }

    fn release_waiters(&mut self, now: Timestamp) {
        let leases = &self.leases;
        let released: Vec<LeaseKey> = self
            .waiters
            .keys()
            .filter(|key| !leases.get(*key).is_some_and(|info| info.is_live(now)))
            .cloned()
            .collect();

        for key in released {
            let Some(waiters) = self.waiters.remove(&key) else {
                continue;
            };
            debug!(lease = %key, waiters = waiters.len(), "lease no longer held, releasing waiters");
            for waiter in waiters {
                if waiter.send(Ok(())).is_ok() {
                    self.deps.metrics.record(LeaseOp::WaiterNotified);
                }
            }
        }
    }

    fn prune_waiters(&mut self) {
        self.waiters.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });
    }

    fn next_wake(&self) -> Duration {
        let now = self.deps.clock.now();
        let soonest_expiry = self
            .leases
            .values()
            .filter(|info| !info.is_pinned() && info.expiry > now)
            .map(|info| info.expiry.saturating_duration_since(now))
            .min();

        let mut wake = self.settings.max_sleep;
        if let Some(expiry) = soonest_expiry {
            wake = wake.min(expiry);
        }
        if let Some(retry_at) = self.retry_at {
            wake = wake.min(retry_at.saturating_duration_since(now));
        }
        wake
    }
}

/// Cheap, cloneable handle to a running [`Manager`].
#[derive(Clone)]
pub struct ManagerHandle {
    model_uuid: String,
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<LeaseView>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl ManagerHandle {
    /// The model this manager serves.
    pub fn model_uuid(&self) -> &str {
        &self.model_uuid
    }

    /// The clock the manager decides expiry with.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| LeaseError::Stopped)?;
        rx.await.map_err(|_| LeaseError::Stopped)?
    }

    /// Claims `key` for `request.holder`, extending it if already held by them.
    pub async fn claim(&self, key: LeaseKey, request: LeaseRequest) -> Result<LeaseInfo> {
        self.call(|reply| Command::Claim {
            key,
            request,
            reply,
        })
        .await
    }

    /// Extends a lease the holder already has.
    pub async fn extend(&self, key: LeaseKey, request: LeaseRequest) -> Result<LeaseInfo> {
        self.call(|reply| Command::Extend {
            key,
            request,
            reply,
        })
        .await
    }

    /// Releases a lease held by `holder`. Absent leases are a no-op.
    pub async fn revoke(&self, key: LeaseKey, holder: &str) -> Result<()> {
        let holder = holder.to_string();
        self.call(|reply| Command::Revoke { key, holder, reply })
            .await
    }

    /// Pins a lease on behalf of `entity`.
    pub async fn pin(&self, key: LeaseKey, entity: &str) -> Result<()> {
        let entity = entity.to_string();
        self.call(|reply| Command::Pin {
            key,
            entity,
            pin: true,
            reply,
        })
        .await
    }

    /// Removes `entity`'s pin.
    pub async fn unpin(&self, key: LeaseKey, entity: &str) -> Result<()> {
        let entity = entity.to_string();
        self.call(|reply| Command::Pin {
            key,
            entity,
            pin: false,
            reply,
        })
        .await
    }

    /// Pinned leases of the model, read from the store.
    pub async fn pinned(&self) -> Result<HashMap<LeaseKey, Vec<String>>> {
        self.call(|reply| Command::Pinned { reply }).await
    }

    /// Reloads the view from the store.
    pub async fn refresh(&self) -> Result<()> {
        self.call(|reply| Command::Refresh { reply }).await
    }

    /// A token for checking that `holder` still holds `key`.
    pub fn token(&self, key: LeaseKey, holder: &str) -> Token {
        Token::new(key, holder, self.view.clone(), Arc::clone(&self.clock))
    }

    /// The latest published view.
    pub fn view(&self) -> LeaseView {
        self.view.borrow().clone()
    }

    /// Leases of `namespace` that are held right now, keyed by lease name.
    pub fn leases(&self, namespace: &str) -> HashMap<String, LeaseInfo> {
        let now = self.clock.now();
        self.view
            .borrow()
            .leases
            .iter()
            .filter(|(key, info)| key.namespace == namespace && info.is_live(now))
            .map(|(key, info)| (key.lease.clone(), info.clone()))
            .collect()
    }

    /// Blocks until `key` is no longer held.
    ///
    /// `started`, if given, is signalled once the manager has registered the
    /// wait. Returns [`LeaseError::Cancelled`] if `cancel` fires first.
    pub async fn wait_until_expired(
        &self,
        key: LeaseKey,
        cancel: &CancellationToken,
        started: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LeaseError::Cancelled),
            sent = self.commands.send(Command::Wait { key, started, reply }) => {
                sent.map_err(|_| LeaseError::Stopped)?;
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LeaseError::Cancelled),
            released = rx => released.map_err(|_| LeaseError::Stopped)?,
        }
    }

    /// Operations on one namespace of this model.
    pub fn namespace(&self, namespace: &str) -> NamespaceManager {
        NamespaceManager {
            handle: self.clone(),
            namespace: namespace.to_string(),
        }
    }

    /// A [`Claimer`] for one namespace.
    pub fn claimer(&self, namespace: &str) -> Arc<dyn Claimer> {
        Arc::new(self.namespace(namespace))
    }

    /// A [`Revoker`] for one namespace.
    pub fn revoker(&self, namespace: &str) -> Arc<dyn Revoker> {
        Arc::new(self.namespace(namespace))
    }

    /// A [`Pinner`] for one namespace.
    pub fn pinner(&self, namespace: &str) -> Arc<dyn Pinner> {
        Arc::new(self.namespace(namespace))
    }

    /// A [`LeaseCheckerWaiter`] for one namespace.
    pub fn checker_waiter(&self, namespace: &str) -> Arc<dyn LeaseCheckerWaiter> {
        Arc::new(self.namespace(namespace))
    }

    /// Asks the manager loop to stop.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// True once the manager loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.view.has_changed().is_err()
    }

    /// Waits for the manager loop to exit.
    pub async fn stopped(&self) {
        let mut view = self.view.clone();
        while view.changed().await.is_ok() {}
    }
}

impl fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("model_uuid", &self.model_uuid)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Claims leases.
#[async_trait]
pub trait Claimer: Send + Sync {
    /// Claims `lease` for `holder`, or extends it if `holder` already has it.
    async fn claim(&self, lease: &str, holder: &str, duration: Duration) -> Result<()>;
}

/// Releases leases.
#[async_trait]
pub trait Revoker: Send + Sync {
    /// Releases `lease` if held by `holder`.
    async fn revoke(&self, lease: &str, holder: &str) -> Result<()>;
}

/// Pins leases so they cannot expire.
#[async_trait]
pub trait Pinner: Send + Sync {
    /// Pins `lease` on behalf of `entity`.
    async fn pin(&self, lease: &str, entity: &str) -> Result<()>;
    /// Removes `entity`'s pin from `lease`.
    async fn unpin(&self, lease: &str, entity: &str) -> Result<()>;
    /// Pinned leases and the entities pinning each.
    async fn pinned(&self) -> Result<HashMap<String, Vec<String>>>;
}

/// Hands out tokens.
pub trait Checker: Send + Sync {
    /// A token bound to `holder` for `lease`.
    fn token(&self, lease: &str, holder: &str) -> Token;
}

/// Blocks until leases lapse.
#[async_trait]
pub trait Waiter: Send + Sync {
    /// Blocks until `lease` is no longer held or `cancel` fires.
    async fn wait_until_expired(
        &self,
        lease: &str,
        cancel: &CancellationToken,
        started: Option<oneshot::Sender<()>>,
    ) -> Result<()>;
}

/// What facades and workers obtain from a lease manager getter.
pub trait LeaseCheckerWaiter: Checker + Waiter {}

impl<T: Checker + Waiter + ?Sized> LeaseCheckerWaiter for T {}

/// A manager handle bound to one namespace.
#[derive(Clone, Debug)]
pub struct NamespaceManager {
    handle: ManagerHandle,
    namespace: String,
}

impl NamespaceManager {
    /// The namespace operations are bound to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The underlying manager.
    pub fn handle(&self) -> &ManagerHandle {
        &self.handle
    }

    fn key(&self, lease: &str) -> LeaseKey {
        LeaseKey::new(self.namespace.as_str(), self.handle.model_uuid(), lease)
    }
}

#[async_trait]
impl Claimer for NamespaceManager {
    async fn claim(&self, lease: &str, holder: &str, duration: Duration) -> Result<()> {
        self.handle
            .claim(self.key(lease), LeaseRequest::new(holder, duration))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Revoker for NamespaceManager {
    async fn revoke(&self, lease: &str, holder: &str) -> Result<()> {
        self.handle.revoke(self.key(lease), holder).await
    }
}

#[async_trait]
impl Pinner for NamespaceManager {
    async fn pin(&self, lease: &str, entity: &str) -> Result<()> {
        self.handle.pin(self.key(lease), entity).await
    }

    async fn unpin(&self, lease: &str, entity: &str) -> Result<()> {
        self.handle.unpin(self.key(lease), entity).await
    }

    async fn pinned(&self) -> Result<HashMap<String, Vec<String>>> {
        Ok(self
            .handle
            .pinned()
            .await?
            .into_iter()
            .filter(|(key, _)| key.namespace == self.namespace)
            .map(|(key, entities)| (key.lease, entities))
            .collect())
    }
}

impl Checker for NamespaceManager {
    fn token(&self, lease: &str, holder: &str) -> Token {
        self.handle.token(self.key(lease), holder)
    }
}

#[async_trait]
impl Waiter for NamespaceManager {
    async fn wait_until_expired(
        &self,
        lease: &str,
        cancel: &CancellationToken,
        started: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        self.handle
            .wait_until_expired(self.key(lease), cancel, started)
            .await
    }
}
