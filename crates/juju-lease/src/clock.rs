//! Time sources.
//!
//! All expiry decisions are taken against a [`Clock`] rather than the system
//! time directly, so tests can drive lease expiry deterministically with a
//! [`ManualClock`].

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::{oneshot, Notify};

use crate::types::Timestamp;

/// Abstraction over time sources.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> Timestamp;

    /// Returns a future that completes once `duration` has passed on this clock.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Production clock backed by the system time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_system_time(SystemTime::now())
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }
}

#[derive(Debug)]
struct Sleeper {
    deadline: Timestamp,
    wake: oneshot::Sender<()>,
}

#[derive(Debug)]
struct ManualState {
    now: Timestamp,
    sleepers: Vec<Sleeper>,
}

/// A clock that only moves when told to.
///
/// A sleep is registered when [`Clock::sleep`] is called, not when the
/// returned future is first polled, so advancing the clock between the two
/// still wakes the sleeper.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
    sleepers_changed: Notify,
}

impl ManualClock {
    /// Creates a manual clock reading `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                sleepers: Vec::new(),
            }),
            sleepers_changed: Notify::new(),
        }
    }

    /// Moves the clock forward and wakes every sleeper whose deadline passed.
    pub fn advance(&self, d: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.now = state.now.saturating_add(d);
        Self::wake_due(&mut state);
    }

    /// Sets the clock to `t`. Moving backwards wakes nobody.
    pub fn set(&self, t: Timestamp) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.now = t;
        Self::wake_due(&mut state);
    }

    /// Number of sleepers still waiting on this clock.
    pub fn sleeper_count(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.sleepers.retain(|s| !s.wake.is_closed());
        state.sleepers.len()
    }

    /// Waits until at least `n` sleepers are registered.
    pub async fn wait_for_sleepers(&self, n: usize) {
        loop {
            let notified = self.sleepers_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.sleeper_count() >= n {
                return;
            }
            notified.await;
        }
    }

    fn wake_due(state: &mut ManualState) {
        let now = state.now;
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.sleepers)
            .into_iter()
            .partition(|s| s.deadline <= now);
        state.sleepers = pending;
        for sleeper in due {
            let _ = sleeper.wake.send(());
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .now
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let rx = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let deadline = state.now.saturating_add(duration);
            if deadline <= state.now {
                return future::ready(()).boxed();
            }
            state.sleepers.retain(|s| !s.wake.is_closed());
            let (tx, rx) = oneshot::channel();
            state.sleepers.push(Sleeper { deadline, wake: tx });
            rx
        };
        self.sleepers_changed.notify_waiters();
        async move {
            let _ = rx.await;
        }
        .boxed()
    }
}
