use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Namespace for application leadership leases (lease = application, holder = unit).
pub const APPLICATION_LEADERSHIP: &str = "application-leadership";

/// Namespace for singular controller responsibility (lease = model/controller UUID).
pub const SINGULAR_CONTROLLER: &str = "singular-controller";

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp { secs: 0, nanos: 0 };

    /// The latest representable instant.
    pub const MAX: Timestamp = Timestamp {
        secs: u64::MAX,
        nanos: 999_999_999,
    };

    /// Creates a timestamp at a whole number of seconds since the epoch.
    pub fn from_secs(secs: u64) -> Self {
        Self { secs, nanos: 0 }
    }

    /// Converts a wall-clock time. Times before the epoch clamp to the epoch.
    pub fn from_system_time(t: SystemTime) -> Self {
        let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self::from_duration(since)
    }

    fn from_duration(d: Duration) -> Self {
        Self {
            secs: d.as_secs(),
            nanos: d.subsec_nanos(),
        }
    }

    /// Returns the offset of this timestamp from the epoch.
    pub fn as_duration(&self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }

    /// Adds a duration, returning None on overflow.
    pub fn checked_add(self, d: Duration) -> Option<Self> {
        self.as_duration().checked_add(d).map(Self::from_duration)
    }

    /// Adds a duration, clamping to [`Timestamp::MAX`].
    pub fn saturating_add(self, d: Duration) -> Self {
        self.checked_add(d).unwrap_or(Timestamp::MAX)
    }

    /// Time elapsed from `earlier` to `self`, or zero if `earlier` is later.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        self.as_duration().saturating_sub(earlier.as_duration())
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// Fully qualified name of a lease.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LeaseKey {
    /// Logical partition, e.g. [`APPLICATION_LEADERSHIP`].
    pub namespace: String,
    /// Model the lease belongs to.
    pub model_uuid: String,
    /// The leased resource, e.g. an application name.
    pub lease: String,
}

impl LeaseKey {
    /// Creates a new lease key.
    pub fn new(
        namespace: impl Into<String>,
        model_uuid: impl Into<String>,
        lease: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            model_uuid: model_uuid.into(),
            lease: lease.into(),
        }
    }
}

impl fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.model_uuid, self.lease)
    }
}

/// A request to claim or extend a lease.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRequest {
    /// The entity asking for the lease.
    pub holder: String,
    /// How long the lease should last from now.
    pub duration: Duration,
}

impl LeaseRequest {
    /// Creates a new lease request.
    pub fn new(holder: impl Into<String>, duration: Duration) -> Self {
        Self {
            holder: holder.into(),
            duration,
        }
    }
}

/// The persisted state of a single lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Current holder.
    pub holder: String,
    /// When the current holder's claim began.
    pub start: Timestamp,
    /// After this instant the lease is stale.
    pub expiry: Timestamp,
    /// Entities that pinned the lease. A pinned lease never expires.
    pub pinned_by: BTreeSet<String>,
}

impl LeaseInfo {
    /// Creates an unpinned lease.
    pub fn new(holder: impl Into<String>, start: Timestamp, expiry: Timestamp) -> Self {
        Self {
            holder: holder.into(),
            start,
            expiry,
            pinned_by: BTreeSet::new(),
        }
    }

    /// True once `now` has reached the expiry.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expiry
    }

    /// True if any entity pinned the lease.
    pub fn is_pinned(&self) -> bool {
        !self.pinned_by.is_empty()
    }

    /// True if the lease still grants ownership at `now`.
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.is_pinned() || !self.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_timestamp_add_carries_nanos() {
        let t = Timestamp {
            secs: 10,
            nanos: 900_000_000,
        };
        let later = t.checked_add(Duration::from_millis(200)).unwrap();
        assert_eq!(later.secs, 11);
        assert_eq!(later.nanos, 100_000_000);
    }

    #[test]
    fn test_timestamp_saturating_add() {
        assert_eq!(
            Timestamp::MAX.saturating_add(Duration::from_secs(1)),
            Timestamp::MAX
        );
    }

    #[test]
    fn test_duration_since_saturates() {
        let a = Timestamp::from_secs(5);
        let b = Timestamp::from_secs(8);
        assert_eq!(b.saturating_duration_since(a), Duration::from_secs(3));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
    }

    #[test]
    fn test_lease_expiry_boundary() {
        let info = LeaseInfo::new("mysql/0", Timestamp::from_secs(0), Timestamp::from_secs(30));
        assert!(!info.is_expired(Timestamp::from_secs(29)));
        assert!(info.is_expired(Timestamp::from_secs(30)));
        assert!(!info.is_live(Timestamp::from_secs(31)));
    }

    #[test]
    fn test_pinned_lease_stays_live() {
        let mut info = LeaseInfo::new("mysql/0", Timestamp::from_secs(0), Timestamp::from_secs(30));
        info.pinned_by.insert("machine-0".to_string());
        assert!(info.is_live(Timestamp::from_secs(3600)));
    }

    #[test]
    fn test_key_display() {
        let key = LeaseKey::new(APPLICATION_LEADERSHIP, "abc", "wordpress");
        assert_eq!(key.to_string(), "application-leadership/abc/wordpress");
    }

    proptest! {
        #[test]
        fn prop_add_then_since_round_trips(secs in 0u64..1_000_000_000, nanos in 0u32..1_000_000_000, ms in 0u64..10_000_000) {
            let t = Timestamp { secs, nanos };
            let d = Duration::from_millis(ms);
            let later = t.checked_add(d).unwrap();
            prop_assert!(later >= t);
            prop_assert_eq!(later.saturating_duration_since(t), d);
        }
    }
}
