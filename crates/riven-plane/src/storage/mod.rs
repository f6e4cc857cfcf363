//! Storage abstraction for vaults
//!
//! A vault is a set of opaque records (already sealed by the vault store) plus a handful of
//! plain files that external tools read directly. Backends only move bytes around; all
//! cryptography happens above this layer.
//!
//! Two backends are provided:
//! - [`MemoryBackend`]: ephemeral, with fault injection for tests
//! - [`FileBackend`]: a directory on disk with atomic writes and a redo journal

pub mod file;
pub mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use riven_core::{Result, TrustError};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Error type for backend operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Vault is locked by another process: {0}")]
    Locked(String),

    #[error("Corrupt storage: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::Unavailable(_))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

/// Plain files stored next to the records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultFile {
    /// The device binding
    Binding,
    /// Random salt mixed into every derived key
    Salt,
    /// Present once the vault has been revoked by the tamper responder
    Tombstone,
    /// `{blessed, canPropagate}` for external launchers
    Blessing,
    /// COSE_Sign1 envelope of the genesis signature
    Signature,
}

impl VaultFile {
    pub const ALL: [VaultFile; 5] = [
        VaultFile::Binding,
        VaultFile::Salt,
        VaultFile::Tombstone,
        VaultFile::Blessing,
        VaultFile::Signature,
    ];

    /// File name inside a vault directory
    pub fn file_name(self) -> &'static str {
        match self {
            VaultFile::Binding => "binding.json",
            VaultFile::Salt => "salt",
            VaultFile::Tombstone => "tombstone.json",
            VaultFile::Blessing => "blessing.json",
            VaultFile::Signature => "signature.cose",
        }
    }
}

/// One write inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteOp {
    PutRecord { key: String, value: Vec<u8> },
    DeleteRecord { key: String },
    WriteFile { file: VaultFile, bytes: Vec<u8> },
}

/// Writes that become visible together or not at all
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::PutRecord {
            key: key.into(),
            value,
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::DeleteRecord { key: key.into() });
        self
    }

    pub fn write_file(&mut self, file: VaultFile, bytes: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::WriteFile { file, bytes });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Storage backend for one vault
///
/// Implementations must be thread-safe. `apply` must be all-or-nothing, including across a
/// crash: a batch that was started either lands completely or not at all.
#[async_trait]
pub trait VaultBackend: Send + Sync + Debug {
    /// Read one record
    async fn read_record(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StorageError>;

    /// Keys starting with `prefix`, sorted
    async fn list_records(&self, prefix: &str) -> std::result::Result<Vec<String>, StorageError>;

    /// Apply a batch atomically
    async fn apply(&self, batch: WriteBatch) -> std::result::Result<(), StorageError>;

    /// Read one plain file
    async fn read_file(&self, file: VaultFile) -> std::result::Result<Option<Vec<u8>>, StorageError>;

    /// Overwrite and remove one plain file
    async fn erase_file(&self, file: VaultFile) -> std::result::Result<(), StorageError>;

    /// Overwrite and remove every record starting with `prefix`, returning the count
    async fn erase_records(&self, prefix: &str) -> std::result::Result<u64, StorageError>;
}

/// Timeout and retry policy for backend calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPolicy {
    /// Bound on a single call
    pub timeout: Duration,
    /// Extra attempts after the first
    pub retries: u32,
    /// Wait before retry `n` is `backoff * n`
    pub backoff: Duration,
}

impl Default for IoPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// A backend whose every call is bounded by an [`IoPolicy`]
///
/// Transient failures and timeouts are retried; once the attempts are exhausted the caller
/// sees [`TrustError::StorageUnavailable`].
#[derive(Debug, Clone)]
pub struct BoundedBackend {
    inner: Arc<dyn VaultBackend>,
    policy: IoPolicy,
}

impl BoundedBackend {
    pub fn new(inner: Arc<dyn VaultBackend>, policy: IoPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> IoPolicy {
        self.policy
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, StorageError>>,
    {
        let attempts = self.policy.retries + 1;
        let mut last = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.policy.timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if err.is_transient() => {
                    last = err.to_string();
                }
                Ok(Err(StorageError::Corrupt(detail))) => {
                    return Err(riven_core::IntegrityFault::CorruptRecord(detail).into());
                }
                Ok(Err(err)) => return Err(TrustError::StorageUnavailable(err.to_string())),
                Err(_) => {
                    last = format!("timed out after {:?}", self.policy.timeout);
                }
            }

            if attempt < attempts {
                warn!(op, attempt, error = %last, "Storage call failed, retrying");
                tokio::time::sleep(self.policy.backoff * attempt).await;
            }
        }

        Err(TrustError::StorageUnavailable(format!(
            "{} failed after {} attempts: {}",
            op, attempts, last
        )))
    }

    pub async fn read_record(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.call("read_record", || self.inner.read_record(key)).await
    }

    pub async fn list_records(&self, prefix: &str) -> Result<Vec<String>> {
        self.call("list_records", || self.inner.list_records(prefix))
            .await
    }

    pub async fn apply(&self, batch: WriteBatch) -> Result<()> {
        self.call("apply", || self.inner.apply(batch.clone())).await
    }

    pub async fn read_file(&self, file: VaultFile) -> Result<Option<Vec<u8>>> {
        self.call("read_file", || self.inner.read_file(file)).await
    }

    pub async fn write_file(&self, file: VaultFile, bytes: Vec<u8>) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.write_file(file, bytes);
        self.apply(batch).await
    }

    pub async fn erase_file(&self, file: VaultFile) -> Result<()> {
        self.call("erase_file", || self.inner.erase_file(file)).await
    }

    pub async fn erase_records(&self, prefix: &str) -> Result<u64> {
        self.call("erase_records", || self.inner.erase_records(prefix))
            .await
    }
}
