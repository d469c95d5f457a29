//! Lease subsystem metrics collector.
//!
//! Tracks claim outcomes, expiries and refresh health for monitoring. One
//! collector is shared by every manager in the process.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lease operation type for metrics tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LeaseOp {
    /// A claim that granted a new lease.
    ClaimGranted,
    /// A claim or extend that pushed an existing lease forward.
    Extended,
    /// A claim refused because another holder has the lease.
    ClaimDenied,
    /// A lease released by its holder.
    Revoked,
    /// A lease deleted by the expiry tick.
    Expired,
    /// A successful refresh of a manager's view.
    Refresh,
    /// A refresh that failed to reach the store.
    RefreshFailed,
    /// A waiter released because its lease lapsed.
    WaiterNotified,
}

impl LeaseOp {
    /// Returns a string representation of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseOp::ClaimGranted => "claim_granted",
            LeaseOp::Extended => "extended",
            LeaseOp::ClaimDenied => "claim_denied",
            LeaseOp::Revoked => "revoked",
            LeaseOp::Expired => "expired",
            LeaseOp::Refresh => "refresh",
            LeaseOp::RefreshFailed => "refresh_failed",
            LeaseOp::WaiterNotified => "waiter_notified",
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseMetricsSnapshot {
    /// Claims that created a lease.
    pub claims_granted: u64,
    /// Claims and extends that moved an expiry forward.
    pub extended: u64,
    /// Claims refused.
    pub claims_denied: u64,
    /// Revocations.
    pub revocations: u64,
    /// Leases removed by expiry.
    pub expiries: u64,
    /// Successful view refreshes.
    pub refreshes: u64,
    /// Failed view refreshes.
    pub refresh_failures: u64,
    /// Waiters released.
    pub waiters_notified: u64,
}

impl LeaseMetricsSnapshot {
    /// Fraction of refreshes that failed.
    pub fn refresh_failure_rate(&self) -> f64 {
        let total = self.refreshes + self.refresh_failures;
        if total > 0 {
            self.refresh_failures as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Lock-free counters for the lease subsystem.
#[derive(Debug, Default)]
pub struct LeaseMetrics {
    claims_granted: AtomicU64,
    extended: AtomicU64,
    claims_denied: AtomicU64,
    revocations: AtomicU64,
    expiries: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    waiters_notified: AtomicU64,
}

impl LeaseMetrics {
    /// Creates a collector with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, op: LeaseOp) -> &AtomicU64 {
        match op {
            LeaseOp::ClaimGranted => &self.claims_granted,
            LeaseOp::Extended => &self.extended,
            LeaseOp::ClaimDenied => &self.claims_denied,
            LeaseOp::Revoked => &self.revocations,
            LeaseOp::Expired => &self.expiries,
            LeaseOp::Refresh => &self.refreshes,
            LeaseOp::RefreshFailed => &self.refresh_failures,
            LeaseOp::WaiterNotified => &self.waiters_notified,
        }
    }

    /// Records one occurrence of `op`.
    pub fn record(&self, op: LeaseOp) {
        self.record_n(op, 1);
    }

    /// Records `n` occurrences of `op`.
    pub fn record_n(&self, op: LeaseOp, n: u64) {
        self.counter(op).fetch_add(n, Ordering::Relaxed);
    }

    /// Current value of one counter.
    pub fn get(&self, op: LeaseOp) -> u64 {
        self.counter(op).load(Ordering::Relaxed)
    }

    /// Creates a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> LeaseMetricsSnapshot {
        LeaseMetricsSnapshot {
            claims_granted: self.get(LeaseOp::ClaimGranted),
            extended: self.get(LeaseOp::Extended),
            claims_denied: self.get(LeaseOp::ClaimDenied),
            revocations: self.get(LeaseOp::Revoked),
            expiries: self.get(LeaseOp::Expired),
            refreshes: self.get(LeaseOp::Refresh),
            refresh_failures: self.get(LeaseOp::RefreshFailed),
            waiters_notified: self.get(LeaseOp::WaiterNotified),
        }
    }

    /// Resets all counters.
    pub fn reset(&self) {
        for op in [
            LeaseOp::ClaimGranted,
            LeaseOp::Extended,
            LeaseOp::ClaimDenied,
            LeaseOp::Revoked,
            LeaseOp::Expired,
            LeaseOp::Refresh,
            LeaseOp::RefreshFailed,
            LeaseOp::WaiterNotified,
        ] {
            self.counter(op).store(0, Ordering::Relaxed);
        }
    }
}
