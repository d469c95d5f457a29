//! Durable lease table.
//!
//! A [`Store`] is the source of truth for who holds which lease. Every
//! operation runs as one transaction; the at-most-one-holder invariant is
//! enforced here, not in the managers that cache the table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::{LeaseError, Result};
use crate::kvstore::{BatchOp, KvStore, Precondition};
use crate::retry::{exhausted, RetryConfig, RetryExecutor};
use crate::types::{LeaseInfo, LeaseKey, LeaseRequest, Timestamp};

/// Durable CRUD over lease rows with atomicity per operation.
#[async_trait]
pub trait Store: Send + Sync {
    /// Claims `key` for `request.holder`.
    ///
    /// Succeeds if nobody holds an unexpired lease, and extends the lease if
    /// the caller already holds it. Fails with [`LeaseError::ClaimDenied`] if
    /// another holder has it.
    async fn claim_lease(&self, key: &LeaseKey, request: &LeaseRequest, now: Timestamp)
        -> Result<LeaseInfo>;

    /// Extends a lease the caller currently holds.
    ///
    /// Fails with [`LeaseError::InvalidHolder`] if the lease is absent, expired
    /// or held by somebody else.
    async fn extend_lease(&self, key: &LeaseKey, request: &LeaseRequest, now: Timestamp)
        -> Result<LeaseInfo>;

    /// Deletes the lease if `holder` holds it. Absent leases are a no-op.
    async fn revoke_lease(&self, key: &LeaseKey, holder: &str) -> Result<()>;

    /// All rows of one namespace in one model, keyed by lease name.
    async fn leases(&self, model_uuid: &str, namespace: &str) -> Result<HashMap<String, LeaseInfo>>;

    /// All rows of one model.
    async fn model_leases(&self, model_uuid: &str) -> Result<HashMap<LeaseKey, LeaseInfo>>;

    /// Deletes every unpinned row of the model with `expiry <= now`.
    async fn expire_leases(&self, model_uuid: &str, now: Timestamp) -> Result<Vec<LeaseKey>>;

    /// Pins the lease on behalf of `entity` so it cannot expire.
    async fn pin_lease(&self, key: &LeaseKey, entity: &str) -> Result<()>;

    /// Removes `entity`'s pin. Missing leases or pins are a no-op.
    async fn unpin_lease(&self, key: &LeaseKey, entity: &str) -> Result<()>;

    /// Pinned leases of the model and the entities pinning each.
    async fn pinned(&self, model_uuid: &str) -> Result<HashMap<LeaseKey, Vec<String>>>;
}

const ROW_PREFIX: &[u8] = b"lease\0";
const SEP: u8 = 0;

fn check_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LeaseError::NotValid(format!("empty {}", what)));
    }
    if value.as_bytes().contains(&SEP) {
        return Err(LeaseError::NotValid(format!("{} {:?} contains NUL", what, value)));
    }
    Ok(())
}

fn check_key(key: &LeaseKey) -> Result<()> {
    check_component("namespace", &key.namespace)?;
    check_component("model uuid", &key.model_uuid)?;
    check_component("lease name", &key.lease)
}

fn check_request(request: &LeaseRequest) -> Result<()> {
    check_component("holder", &request.holder)?;
    if request.duration.is_zero() {
        return Err(LeaseError::NotValid("zero lease duration".into()));
    }
    Ok(())
}

fn prefix(parts: &[&str]) -> Vec<u8> {
    let mut out = ROW_PREFIX.to_vec();
    for part in parts {
        out.extend_from_slice(part.as_bytes());
        out.push(SEP);
    }
    out
}

pub(crate) fn row_key(key: &LeaseKey) -> Vec<u8> {
    let mut out = prefix(&[&key.model_uuid, &key.namespace]);
    out.extend_from_slice(key.lease.as_bytes());
    out
}

pub(crate) fn parse_row_key(raw: &[u8]) -> Result<LeaseKey> {
    let rest = raw
        .strip_prefix(ROW_PREFIX)
        .ok_or_else(|| LeaseError::Codec("row key without lease prefix".into()))?;
    let parts: Vec<&[u8]> = rest.splitn(3, |b| *b == SEP).collect();
    let [model, namespace, lease] = parts.as_slice() else {
        return Err(LeaseError::Codec("malformed lease row key".into()));
    };
    Ok(LeaseKey::new(utf8(namespace)?, utf8(model)?, utf8(lease)?))
}

fn utf8(b: &[u8]) -> Result<String> {
    String::from_utf8(b.to_vec()).map_err(|e| LeaseError::Codec(e.to_string()))
}

fn decode_row(raw: &[u8]) -> Result<LeaseInfo> {
    Ok(bincode::deserialize(raw)?)
}

fn encode_row(info: &LeaseInfo) -> Result<Vec<u8>> {
    Ok(bincode::serialize(info)?)
}

/// Extends `existing` for another `duration` from `now`.
///
/// The new expiry is never earlier than one nanosecond past the old one, so
/// every successful extension moves the expiry forward.
fn extended(existing: LeaseInfo, duration: Duration, now: Timestamp) -> LeaseInfo {
    let requested = now.saturating_add(duration);
    let minimum = existing.expiry.saturating_add(Duration::from_nanos(1));
    LeaseInfo {
        expiry: requested.max(minimum),
        ..existing
    }
}

fn read_row<K: KvStore + ?Sized>(kv: &K, raw_key: &[u8]) -> Result<(Option<Vec<u8>>, Option<LeaseInfo>)> {
    let current = kv.get(raw_key)?;
    let row = current.as_deref().map(decode_row).transpose()?;
    Ok((current, row))
}

fn claim_txn<K: KvStore + ?Sized>(
    kv: &K,
    key: &LeaseKey,
    request: &LeaseRequest,
    now: Timestamp,
) -> Result<LeaseInfo> {
    let raw_key = row_key(key);
    let (current, row) = read_row(kv, &raw_key)?;

    let info = match row {
        Some(existing) if existing.is_live(now) && existing.holder == request.holder => {
            extended(existing, request.duration, now)
        }
        Some(existing) if existing.is_live(now) => {
            trace!(lease = %key, holder = %existing.holder, "claim denied");
            return Err(LeaseError::ClaimDenied(key.clone()));
        }
        _ => LeaseInfo::new(
            request.holder.clone(),
            now,
            now.saturating_add(request.duration),
        ),
    };

    kv.compare_and_write(
        vec![Precondition::new(raw_key.clone(), current)],
        vec![BatchOp::Put {
            key: raw_key,
            value: encode_row(&info)?,
        }],
    )?;
    Ok(info)
}

fn extend_txn<K: KvStore + ?Sized>(
    kv: &K,
    key: &LeaseKey,
    request: &LeaseRequest,
    now: Timestamp,
) -> Result<LeaseInfo> {
    let raw_key = row_key(key);
    let (current, row) = read_row(kv, &raw_key)?;

    let info = match row {
        Some(existing) if existing.is_live(now) && existing.holder == request.holder => {
            extended(existing, request.duration, now)
        }
        _ => {
            return Err(LeaseError::InvalidHolder {
                key: key.clone(),
                holder: request.holder.clone(),
            })
        }
    };

    kv.compare_and_write(
        vec![Precondition::new(raw_key.clone(), current)],
        vec![BatchOp::Put {
            key: raw_key,
            value: encode_row(&info)?,
        }],
    )?;
    Ok(info)
}

fn revoke_txn<K: KvStore + ?Sized>(kv: &K, key: &LeaseKey, holder: &str) -> Result<()> {
    let raw_key = row_key(key);
    let (current, row) = read_row(kv, &raw_key)?;

    match row {
        None => Ok(()),
        Some(existing) if existing.holder != holder => Err(LeaseError::InvalidHolder {
            key: key.clone(),
            holder: holder.to_string(),
        }),
        Some(_) => kv.compare_and_write(
            vec![Precondition::new(raw_key.clone(), current)],
            vec![BatchOp::Delete { key: raw_key }],
        ),
    }
}

fn expire_txn<K: KvStore + ?Sized>(kv: &K, model_uuid: &str, now: Timestamp) -> Result<Vec<LeaseKey>> {
    let mut expired = Vec::new();
    let mut preconditions = Vec::new();
    let mut ops = Vec::new();

    for (raw_key, raw_row) in kv.scan_prefix(&prefix(&[model_uuid]))? {
        let row = decode_row(&raw_row)?;
        if row.is_live(now) {
            continue;
        }
        expired.push(parse_row_key(&raw_key)?);
        preconditions.push(Precondition::new(raw_key.clone(), Some(raw_row)));
        ops.push(BatchOp::Delete { key: raw_key });
    }

    if !ops.is_empty() {
        kv.compare_and_write(preconditions, ops)?;
    }
    Ok(expired)
}

fn update_pins<K: KvStore + ?Sized>(kv: &K, key: &LeaseKey, entity: &str, pin: bool) -> Result<()> {
    let raw_key = row_key(key);
    let (current, row) = read_row(kv, &raw_key)?;

    let Some(mut info) = row else {
        return if pin {
            Err(LeaseError::NotFound(format!("lease {}", key)))
        } else {
            Ok(())
        };
    };

    let changed = if pin {
        info.pinned_by.insert(entity.to_string())
    } else {
        info.pinned_by.remove(entity)
    };
    if !changed {
        return Ok(());
    }

    kv.compare_and_write(
        vec![Precondition::new(raw_key.clone(), current)],
        vec![BatchOp::Put {
            key: raw_key,
            value: encode_row(&info)?,
        }],
    )
}

fn scan_model<K: KvStore + ?Sized>(kv: &K, model_uuid: &str) -> Result<HashMap<LeaseKey, LeaseInfo>> {
    kv.scan_prefix(&prefix(&[model_uuid]))?
        .into_iter()
        .map(|(k, v)| Ok((parse_row_key(&k)?, decode_row(&v)?)))
        .collect()
}

/// [`Store`] over a transactional [`KvStore`].
///
/// Conflicting writers are resolved optimistically: each operation reads the
/// rows it depends on, then commits with [`KvStore::compare_and_write`]. A
/// transaction that lost the race is rerun with backoff.
pub struct KvLeaseStore<K: ?Sized> {
    kv: Arc<K>,
    retry: RetryExecutor,
}

impl<K: KvStore + ?Sized + 'static> KvLeaseStore<K> {
    /// Creates a store with the default retry policy.
    pub fn new(kv: Arc<K>) -> Self {
        Self::with_retry(kv, RetryConfig::default())
    }

    /// Creates a store with a custom retry policy for conflicting transactions.
    pub fn with_retry(kv: Arc<K>, retry: RetryConfig) -> Self {
        Self {
            kv,
            retry: RetryExecutor::new(retry),
        }
    }

    /// The underlying key-value store.
    pub fn kv(&self) -> &Arc<K> {
        &self.kv
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&K) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let kv = Arc::clone(&self.kv);
        tokio::task::spawn_blocking(move || f(&*kv))
            .await
            .map_err(|e| LeaseError::Store(format!("store task failed: {}", e)))?
    }

    async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: Fn(&K) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        self.retry
            .execute(|| {
                let f = Arc::clone(&f);
                self.blocking(move |kv: &K| (*f)(kv))
            })
            .await
            .map_err(|e| exhausted(e, self.retry.config().max_retries + 1))
    }
}

#[async_trait]
impl<K: KvStore + ?Sized + 'static> Store for KvLeaseStore<K> {
    async fn claim_lease(
        &self,
        key: &LeaseKey,
        request: &LeaseRequest,
        now: Timestamp,
    ) -> Result<LeaseInfo> {
        check_key(key)?;
        check_request(request)?;
        let (key, request) = (key.clone(), request.clone());
        let info = self
            .transact(move |kv| claim_txn(kv, &key, &request, now))
            .await?;
        debug!(holder = %info.holder, expiry = %info.expiry, "lease claim stored");
        Ok(info)
    }

    async fn extend_lease(
        &self,
        key: &LeaseKey,
        request: &LeaseRequest,
        now: Timestamp,
    ) -> Result<LeaseInfo> {
        check_key(key)?;
        check_request(request)?;
        let (key, request) = (key.clone(), request.clone());
        self.transact(move |kv| extend_txn(kv, &key, &request, now))
            .await
    }

    async fn revoke_lease(&self, key: &LeaseKey, holder: &str) -> Result<()> {
        check_key(key)?;
        check_component("holder", holder)?;
        let (key, holder) = (key.clone(), holder.to_string());
        self.transact(move |kv| revoke_txn(kv, &key, &holder)).await
    }

    async fn leases(&self, model_uuid: &str, namespace: &str) -> Result<HashMap<String, LeaseInfo>> {
        check_component("model uuid", model_uuid)?;
        check_component("namespace", namespace)?;
        let scan_prefix = prefix(&[model_uuid, namespace]);
        self.blocking(move |kv| {
            kv.scan_prefix(&scan_prefix)?
                .into_iter()
                .map(|(k, v)| Ok((parse_row_key(&k)?.lease, decode_row(&v)?)))
                .collect()
        })
        .await
    }

    async fn model_leases(&self, model_uuid: &str) -> Result<HashMap<LeaseKey, LeaseInfo>> {
        check_component("model uuid", model_uuid)?;
        let model_uuid = model_uuid.to_string();
        self.blocking(move |kv| scan_model(kv, &model_uuid)).await
    }

    async fn expire_leases(&self, model_uuid: &str, now: Timestamp) -> Result<Vec<LeaseKey>> {
        check_component("model uuid", model_uuid)?;
        let model_uuid = model_uuid.to_string();
        self.transact(move |kv| expire_txn(kv, &model_uuid, now))
            .await
    }

    async fn pin_lease(&self, key: &LeaseKey, entity: &str) -> Result<()> {
        check_key(key)?;
        check_component("entity", entity)?;
        let (key, entity) = (key.clone(), entity.to_string());
        self.transact(move |kv| update_pins(kv, &key, &entity, true))
            .await
    }

    async fn unpin_lease(&self, key: &LeaseKey, entity: &str) -> Result<()> {
        check_key(key)?;
        check_component("entity", entity)?;
        let (key, entity) = (key.clone(), entity.to_string());
        self.transact(move |kv| update_pins(kv, &key, &entity, false))
            .await
    }

    async fn pinned(&self, model_uuid: &str) -> Result<HashMap<LeaseKey, Vec<String>>> {
        let leases = self.model_leases(model_uuid).await?;
        Ok(leases
            .into_iter()
            .filter(|(_, info)| info.is_pinned())
            .map(|(key, info)| (key, info.pinned_by.into_iter().collect()))
            .collect())
    }
}
