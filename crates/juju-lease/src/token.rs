//! Cheap lease-validity checks against a manager's published view.
//!
//! A manager publishes a [`LeaseView`] after every store operation. A
//! [`Token`] reads the latest view without a round trip to the manager, so
//! callers can check leadership on hot paths.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::clock::Clock;
use crate::error::{LeaseError, Result};
use crate::types::{LeaseInfo, LeaseKey, Timestamp};

/// Snapshot of a manager's lease table.
#[derive(Clone, Debug, Default)]
pub struct LeaseView {
    /// Every row the manager knows about, including expired ones not yet swept.
    pub leases: Arc<HashMap<LeaseKey, LeaseInfo>>,
    /// Time of the last store operation that succeeded.
    pub refreshed_at: Timestamp,
    /// False once the store has been unreachable for the staleness window.
    pub healthy: bool,
}

impl LeaseView {
    /// The lease row if it still grants ownership at `now`.
    pub fn live(&self, key: &LeaseKey, now: Timestamp) -> Option<&LeaseInfo> {
        self.leases.get(key).filter(|info| info.is_live(now))
    }

    /// True if `holder` holds `key` at `now`.
    pub fn is_held_by(&self, key: &LeaseKey, holder: &str, now: Timestamp) -> bool {
        self.live(key, now).is_some_and(|info| info.holder == holder)
    }
}

/// A capability to check that `holder` still holds `key`.
///
/// Tokens never keep a lease alive. Checking is a read of the manager's
/// latest published view plus a comparison against the clock.
#[derive(Clone)]
pub struct Token {
    key: LeaseKey,
    holder: String,
    view: watch::Receiver<LeaseView>,
    clock: Arc<dyn Clock>,
}

impl Token {
    pub(crate) fn new(
        key: LeaseKey,
        holder: impl Into<String>,
        view: watch::Receiver<LeaseView>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key,
            holder: holder.into(),
            view,
            clock,
        }
    }

    /// The lease this token refers to.
    pub fn key(&self) -> &LeaseKey {
        &self.key
    }

    /// The holder this token is bound to.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Returns Ok if the holder still holds the lease as of the latest view.
    ///
    /// Fails with [`LeaseError::Stopped`] once the manager has gone away and
    /// with [`LeaseError::Degraded`] while the manager cannot reach its store.
    pub fn check(&self) -> Result<()> {
        if self.view.has_changed().is_err() {
            return Err(LeaseError::Stopped);
        }
        let view = self.view.borrow();
        if !view.healthy {
            return Err(LeaseError::Degraded(format!(
                "lease view for {} last refreshed at {}",
                self.key.model_uuid, view.refreshed_at
            )));
        }
        if view.is_held_by(&self.key, &self.holder, self.clock.now()) {
            Ok(())
        } else {
            Err(LeaseError::NotHeld {
                key: self.key.clone(),
                holder: self.holder.clone(),
            })
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("key", &self.key)
            .field("holder", &self.holder)
            .finish()
    }
}
