//! Embedded transactional key-value store backing the lease table.
//!
//! [`MemoryKvStore`] keeps everything in a BTreeMap and is used by tests and
//! single-process deployments. [`crate::wal_store::PersistentKvStore`] adds a
//! write-ahead log for durability.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::error::LeaseError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Key-value store trait for lease persistence.
///
/// Writes that depend on earlier reads go through [`KvStore::compare_and_write`],
/// which gives optimistic transactions: the batch only applies if nothing
/// the caller read has changed in the meantime.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, LeaseError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), LeaseError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), LeaseError>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, LeaseError>;

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), LeaseError>;

    /// Atomically apply `ops` if every precondition still holds.
    ///
    /// Fails with [`LeaseError::Conflict`] and writes nothing otherwise.
    fn compare_and_write(
        &self,
        preconditions: Vec<Precondition>,
        ops: Vec<BatchOp>,
    ) -> Result<(), LeaseError>;
}

/// A single operation in a write batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// The value a key must still have for a conditional write to apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Precondition {
    /// Key that was read.
    pub key: Key,
    /// Value seen by the read; None if the key was absent.
    pub expected: Option<Value>,
}

impl Precondition {
    /// Creates a precondition from a previous read.
    pub fn new(key: Key, expected: Option<Value>) -> Self {
        Self { key, expected }
    }

    pub(crate) fn check(&self, data: &BTreeMap<Key, Value>) -> Result<(), LeaseError> {
        if data.get(&self.key) == self.expected.as_ref() {
            Ok(())
        } else {
            Err(LeaseError::Conflict(
                String::from_utf8_lossy(&self.key).replace('\0', "/"),
            ))
        }
    }
}

pub(crate) fn apply_ops(data: &mut BTreeMap<Key, Value>, ops: Vec<BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key, value);
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

pub(crate) fn scan(data: &BTreeMap<Key, Value>, prefix: &[u8]) -> Vec<KvPair> {
    data.range::<Vec<u8>, _>(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// It does not persist data across restarts.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, LeaseError> {
        let data = self
            .data
            .read()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), LeaseError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), LeaseError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, LeaseError> {
        let data = self
            .data
            .read()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        Ok(scan(&data, prefix))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), LeaseError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        apply_ops(&mut data, ops);
        Ok(())
    }

    fn compare_and_write(
        &self,
        preconditions: Vec<Precondition>,
        ops: Vec<BatchOp>,
    ) -> Result<(), LeaseError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        for pre in &preconditions {
            pre.check(&data)?;
        }
        apply_ops(&mut data, ops);
        Ok(())
    }
}
