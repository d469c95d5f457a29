//! Persistent file-backed KV store with WAL and checkpoint support.
//!
//! Uses an in-memory BTreeMap as read cache, a write-ahead log (WAL) for durability,
//! and checkpoint files for fast recovery. Every batch is a single WAL record, so a
//! crash never leaves half of a lease transaction on disk.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::LeaseError;
use crate::kvstore::{apply_ops, scan, BatchOp, Key, KvPair, KvStore, Precondition, Value};

const WAL_FILENAME: &str = "wal.bin";
const CHECKPOINT_FILENAME: &str = "checkpoint.bin";
/// Records larger than this can only come from a corrupted length prefix.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone)]
enum WalOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl From<&BatchOp> for WalOp {
    fn from(op: &BatchOp) -> Self {
        match op {
            BatchOp::Put { key, value } => WalOp::Put {
                key: key.clone(),
                value: value.clone(),
            },
            BatchOp::Delete { key } => WalOp::Delete { key: key.clone() },
        }
    }
}

impl From<WalOp> for BatchOp {
    fn from(op: WalOp) -> Self {
        match op {
            WalOp::Put { key, value } => BatchOp::Put { key, value },
            WalOp::Delete { key } => BatchOp::Delete { key },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WalRecord {
    seq: u64,
    ops: Vec<WalOp>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

struct WalWriter {
    file: File,
    seq: u64,
    /// Set when a failed append could not be rolled back.
    poisoned: bool,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl WalWriter {
    fn open(path: &Path, valid_len: u64, seq: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() > valid_len {
            warn!(path = %path.display(), valid_len, "truncating torn WAL tail");
            file.set_len(valid_len)?;
        }
        Ok(WalWriter {
            file,
            seq,
            poisoned: false,
            #[cfg(test)]
            fail_after: None,
        })
    }

    /// Appends one record. On failure the log is cut back to its previous
    /// length, so a later append never lands behind a partial record.
    fn append(&mut self, ops: &[BatchOp]) -> Result<(), LeaseError> {
        if self.poisoned {
            return Err(LeaseError::Store(
                "WAL has an unrecoverable partial record, refusing writes".into(),
            ));
        }
        let record = WalRecord {
            seq: self.seq + 1,
            ops: ops.iter().map(WalOp::from).collect(),
        };
        let encoded = bincode::serialize(&record)?;
        let mut frame = Vec::with_capacity(4 + encoded.len());
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);

        let start = self.file.metadata()?.len();
        if let Err(e) = self.write_frame(&frame) {
            warn!(error = %e, valid_len = start, "WAL append failed, rolling back");
            if let Err(rollback) = self.file.set_len(start).and_then(|()| self.file.sync_all()) {
                error!(error = %rollback, "WAL rollback failed, refusing further writes");
                self.poisoned = true;
            }
            return Err(LeaseError::Io(e));
        }
        self.seq = record.seq;
        Ok(())
    }

    #[cfg(not(test))]
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.write_all(frame)?;
        self.file.sync_all()
    }

    #[cfg(test)]
    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        if let Some(limit) = self.fail_after.take() {
            self.file.write_all(&frame[..limit.min(frame.len())])?;
            return Err(std::io::Error::other("short write"));
        }
        self.file.write_all(frame)?;
        self.file.sync_all()
    }

    fn truncate(&mut self) -> std::io::Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Persistent file-backed KV store.
///
/// Provides durability through a write-ahead log (WAL) and periodic checkpoints.
/// On open, loads the last checkpoint and replays any remaining WAL records.
/// Writers are serialized by the WAL lock, which makes
/// [`KvStore::compare_and_write`] atomic.
pub struct PersistentKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    wal: Mutex<WalWriter>,
    dir: PathBuf,
}

impl PersistentKvStore {
    /// Opens or creates a persistent KV store in the given directory.
    pub fn open(dir: &Path) -> Result<Self, LeaseError> {
        fs::create_dir_all(dir)?;

        let mut data = BTreeMap::new();
        let mut seq = load_checkpoint(&dir.join(CHECKPOINT_FILENAME), &mut data)?;
        let wal_path = dir.join(WAL_FILENAME);
        let (valid_len, wal_seq) = replay_wal(&wal_path, &mut data)?;
        seq = seq.max(wal_seq);

        debug!(dir = %dir.display(), keys = data.len(), seq, "opened persistent kv store");

        Ok(Self {
            data: RwLock::new(data),
            wal: Mutex::new(WalWriter::open(&wal_path, valid_len, seq)?),
            dir: dir.to_path_buf(),
        })
    }

    /// Creates a checkpoint of the current state and truncates the WAL.
    pub fn checkpoint(&self) -> Result<(), LeaseError> {
        let mut wal = self
            .wal
            .lock()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        let entries: Vec<(Vec<u8>, Vec<u8>)> = {
            let data = self
                .data
                .read()
                .map_err(|e| LeaseError::Store(e.to_string()))?;
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let checkpoint = Checkpoint {
            seq: wal.seq,
            entries,
        };
        let encoded = bincode::serialize(&checkpoint)?;

        let checkpoint_path = self.dir.join(CHECKPOINT_FILENAME);
        let tmp_path = checkpoint_path.with_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp_path)?;
            tmp_file.write_all(&encoded)?;
            tmp_file.sync_all()?;
        }
        fs::rename(&tmp_path, &checkpoint_path)?;
        wal.truncate()?;

        debug!(seq = checkpoint.seq, "kv checkpoint written");
        Ok(())
    }

    fn commit(&self, preconditions: &[Precondition], ops: Vec<BatchOp>) -> Result<(), LeaseError> {
        let mut wal = self
            .wal
            .lock()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        {
            let data = self
                .data
                .read()
                .map_err(|e| LeaseError::Store(e.to_string()))?;
            for pre in preconditions {
                pre.check(&data)?;
            }
        }
        wal.append(&ops)?;

        let mut data = self
            .data
            .write()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        apply_ops(&mut data, ops);
        Ok(())
    }
}

fn load_checkpoint(path: &Path, data: &mut BTreeMap<Key, Value>) -> Result<u64, LeaseError> {
    if !path.exists() {
        return Ok(0);
    }

    let mut contents = Vec::new();
    File::open(path)?.read_to_end(&mut contents)?;
    if contents.is_empty() {
        return Ok(0);
    }

    let checkpoint: Checkpoint = bincode::deserialize(&contents)
        .map_err(|e| LeaseError::Codec(format!("failed to deserialize checkpoint: {}", e)))?;
    data.extend(checkpoint.entries);
    Ok(checkpoint.seq)
}

/// Replays complete WAL records into `data`.
///
/// Returns the length of the readable prefix of the log and the highest
/// sequence number seen. A record cut short by a crash ends the replay.
fn replay_wal(path: &Path, data: &mut BTreeMap<Key, Value>) -> Result<(u64, u64), LeaseError> {
    if !path.exists() {
        return Ok((0, 0));
    }

    let mut file = File::open(path)?;
    let mut valid_len = 0u64;
    let mut max_seq = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        match file.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(LeaseError::Io(e)),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            warn!(len, "WAL record length out of range, stopping replay");
            break;
        }
        let mut record_buf = vec![0u8; len];
        match file.read_exact(&mut record_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(LeaseError::Io(e)),
        }

        let record: WalRecord = bincode::deserialize(&record_buf)
            .map_err(|e| LeaseError::Codec(format!("failed to deserialize WAL record: {}", e)))?;
        max_seq = max_seq.max(record.seq);
        apply_ops(data, record.ops.into_iter().map(BatchOp::from).collect());
        valid_len += 4 + len as u64;
    }

    Ok((valid_len, max_seq))
}

impl KvStore for PersistentKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, LeaseError> {
        let data = self
            .data
            .read()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<(), LeaseError> {
        self.commit(&[], vec![BatchOp::Put { key, value }])
    }

    fn delete(&self, key: &[u8]) -> Result<(), LeaseError> {
        self.commit(&[], vec![BatchOp::Delete { key: key.to_vec() }])
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, LeaseError> {
        let data = self
            .data
            .read()
            .map_err(|e| LeaseError::Store(e.to_string()))?;
        Ok(scan(&data, prefix))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), LeaseError> {
        self.commit(&[], ops)
    }

    fn compare_and_write(
        &self,
        preconditions: Vec<Precondition>,
        ops: Vec<BatchOp>,
    ) -> Result<(), LeaseError> {
        self.commit(&preconditions, ops)
    }
}
