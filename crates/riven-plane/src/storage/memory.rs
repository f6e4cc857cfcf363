//! In-memory storage backend
//!
//! Default backend for tests and ephemeral planes. Data is lost on restart.
//! Supports fault injection so callers can exercise the timeout and retry paths.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::{StorageError, VaultBackend, VaultFile, WriteBatch, WriteOp};

#[derive(Debug, Default)]
struct Contents {
    records: BTreeMap<String, Vec<u8>>,
    files: HashMap<VaultFile, Vec<u8>>,
}

/// In-memory vault backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    contents: RwLock<Contents>,
    stalled: AtomicBool,
    failures: AtomicU32,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// While stalled, every call hangs until the caller's timeout fires
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with a transient error
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of stored records
    pub fn record_count(&self) -> usize {
        self.read().map(|c| c.records.len()).unwrap_or(0)
    }

    async fn gate(&self) -> Result<(), StorageError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Contents>, StorageError> {
        self.contents
            .read()
            .map_err(|_| StorageError::Corrupt("memory backend lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Contents>, StorageError> {
        self.contents
            .write()
            .map_err(|_| StorageError::Corrupt("memory backend lock poisoned".into()))
    }
}

#[async_trait]
impl VaultBackend for MemoryBackend {
    async fn read_record(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.gate().await?;
        Ok(self.read()?.records.get(key).cloned())
    }

    async fn list_records(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.gate().await?;
        let contents = self.read()?;
        Ok(contents
            .records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
        self.gate().await?;
        let mut contents = self.write()?;
        debug!(ops = batch.len(), "Applying batch");

        for op in batch.ops() {
            match op {
                WriteOp::PutRecord { key, value } => {
                    contents.records.insert(key.clone(), value.clone());
                }
                WriteOp::DeleteRecord { key } => {
                    contents.records.remove(key);
                }
                WriteOp::WriteFile { file, bytes } => {
                    contents.files.insert(*file, bytes.clone());
                }
            }
        }
        Ok(())
    }

    async fn read_file(&self, file: VaultFile) -> Result<Option<Vec<u8>>, StorageError> {
        self.gate().await?;
        Ok(self.read()?.files.get(&file).cloned())
    }

    async fn erase_file(&self, file: VaultFile) -> Result<(), StorageError> {
        self.gate().await?;
        let mut contents = self.write()?;
        if let Some(mut bytes) = contents.files.remove(&file) {
            bytes.fill(0);
        }
        Ok(())
    }

    async fn erase_records(&self, prefix: &str) -> Result<u64, StorageError> {
        self.gate().await?;
        let mut contents = self.write()?;
        let keys: Vec<String> = contents
            .records
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();

        for key in &keys {
            if let Some(mut bytes) = contents.records.remove(key) {
                bytes.fill(0);
            }
        }
        Ok(keys.len() as u64)
    }
}
