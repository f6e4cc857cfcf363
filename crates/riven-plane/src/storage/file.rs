//! On-disk storage backend
//!
//! Layout of a vault directory:
//!
//! ```text
//! <root>/vault.lock        exclusive lock held while the backend is open
//! <root>/journal.json      redo journal of the batch being applied, if any
//! <root>/records/<hex key> one file per record
//! <root>/binding.json, salt, tombstone.json, blessing.json, signature.cose
//! ```
//!
//! Every file write goes through a temp file that is synced and renamed into place. A batch is
//! first written to the journal; once the journal is durable the batch is applied and the
//! journal removed. Opening a directory with a leftover journal re-applies it.

use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use super::{StorageError, VaultBackend, VaultFile, WriteBatch, WriteOp};

const RECORDS_DIR: &str = "records";
const JOURNAL_FILE: &str = "journal.json";
const LOCK_FILE: &str = "vault.lock";

/// Directory-backed vault storage
#[derive(Debug)]
pub struct FileBackend {
    root: PathBuf,
    _lock: File,
}

impl FileBackend {
    /// Open (creating if needed) the vault directory at `root`
    ///
    /// Fails with [`StorageError::Locked`] if another handle holds the directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(RECORDS_DIR))?;

        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::Locked(root.display().to_string()))?;

        if replay_journal(&root)? {
            warn!(root = %root.display(), "Replayed interrupted batch from journal");
        }

        info!(root = %root.display(), "Opened vault directory");

        Ok(Self { root, _lock: lock })
    }

    /// Vault directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a plain vault file
    pub fn file_path(&self, file: VaultFile) -> PathBuf {
        self.root.join(file.file_name())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(PathBuf) -> Result<T, StorageError> + Send + 'static,
    {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || f(root))
            .await
            .map_err(|e| StorageError::Io(format!("blocking task failed: {}", e)))?
    }
}

fn record_path(root: &Path, key: &str) -> PathBuf {
    root.join(RECORDS_DIR).join(hex::encode(key.as_bytes()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Overwrite with zeros, sync, then unlink
fn erase(path: &Path) -> io::Result<bool> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(&vec![0u8; len as usize])?;
    file.sync_all()?;
    drop(file);

    fs::remove_file(path)?;
    Ok(true)
}

fn apply_ops(root: &Path, batch: &WriteBatch) -> io::Result<()> {
    for op in batch.ops() {
        match op {
            WriteOp::PutRecord { key, value } => write_atomic(&record_path(root, key), value)?,
            WriteOp::DeleteRecord { key } => {
                erase(&record_path(root, key))?;
            }
            WriteOp::WriteFile { file, bytes } => {
                write_atomic(&root.join(file.file_name()), bytes)?
            }
        }
    }
    Ok(())
}

/// Re-apply a leftover journal; returns whether one was found
fn replay_journal(root: &Path) -> Result<bool, StorageError> {
    let path = root.join(JOURNAL_FILE);
    let Some(bytes) = read_optional(&path)? else {
        return Ok(false);
    };

    let batch: WriteBatch = serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::Corrupt(format!("journal: {}", e)))?;
    apply_ops(root, &batch)?;
    fs::remove_file(&path)?;
    Ok(true)
}

fn list_keys(root: &Path, prefix: &str) -> io::Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in fs::read_dir(root.join(RECORDS_DIR))? {
        let entry = entry?;
        let name = entry.file_name();
        // Temp files and anything else that is not a hex-encoded key
        let Some(key) = name
            .to_str()
            .and_then(|n| hex::decode(n).ok())
            .and_then(|b| String::from_utf8(b).ok())
        else {
            continue;
        };
        if key.starts_with(prefix) {
            keys.push(key);
        }
    }
    keys.sort();
    Ok(keys)
}

#[async_trait]
impl VaultBackend for FileBackend {
    async fn read_record(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_string();
        self.blocking(move |root| Ok(read_optional(&record_path(&root, &key))?))
            .await
    }

    async fn list_records(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_string();
        self.blocking(move |root| Ok(list_keys(&root, &prefix)?))
            .await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
        self.blocking(move |root| {
            let journal = root.join(JOURNAL_FILE);
            let bytes = serde_json::to_vec(&batch)
                .map_err(|e| StorageError::Corrupt(format!("journal: {}", e)))?;

            write_atomic(&journal, &bytes)?;
            apply_ops(&root, &batch)?;
            fs::remove_file(&journal)?;
            Ok(())
        })
        .await
    }

    async fn read_file(&self, file: VaultFile) -> Result<Option<Vec<u8>>, StorageError> {
        self.blocking(move |root| Ok(read_optional(&root.join(file.file_name()))?))
            .await
    }

    async fn erase_file(&self, file: VaultFile) -> Result<(), StorageError> {
        self.blocking(move |root| {
            erase(&root.join(file.file_name()))?;
            Ok(())
        })
        .await
    }

    async fn erase_records(&self, prefix: &str) -> Result<u64, StorageError> {
        let prefix = prefix.to_string();
        self.blocking(move |root| {
            let mut erased = 0;
            for key in list_keys(&root, &prefix)? {
                if erase(&record_path(&root, &key))? {
                    erased += 1;
                }
            }
            Ok(erased)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let backend = FileBackend::open(dir.path()).unwrap();
            let mut batch = WriteBatch::new();
            batch
                .put("signature/abc", b"sealed".to_vec())
                .write_file(VaultFile::Blessing, br#"{"blessed":true}"#.to_vec());
            backend.apply(batch).await.unwrap();
        }

        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(
            backend.read_record("signature/abc").await.unwrap(),
            Some(b"sealed".to_vec())
        );
        assert!(backend.file_path(VaultFile::Blessing).exists());
        assert!(!dir.path().join(JOURNAL_FILE).exists());
    }

    #[tokio::test]
    async fn test_second_open_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let _first = FileBackend::open(dir.path()).unwrap();

        let second = FileBackend::open(dir.path());
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[tokio::test]
    async fn test_leftover_journal_is_replayed() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(RECORDS_DIR)).unwrap();

        let mut batch = WriteBatch::new();
        batch.put("lineage/x", b"1".to_vec()).put("lineage/y", b"2".to_vec());
        fs::write(
            dir.path().join(JOURNAL_FILE),
            serde_json::to_vec(&batch).unwrap(),
        )
        .unwrap();

        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(
            backend.list_records("lineage/").await.unwrap(),
            vec!["lineage/x", "lineage/y"]
        );
        assert!(!dir.path().join(JOURNAL_FILE).exists());
    }

    #[tokio::test]
    async fn test_erase_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();

        let mut batch = WriteBatch::new();
        batch
            .put("reflection/entry/1", vec![7; 64])
            .write_file(VaultFile::Salt, vec![1; 32]);
        backend.apply(batch).await.unwrap();

        assert_eq!(backend.erase_records("reflection/").await.unwrap(), 1);
        backend.erase_file(VaultFile::Salt).await.unwrap();

        assert!(backend.list_records("").await.unwrap().is_empty());
        assert!(!backend.file_path(VaultFile::Salt).exists());
    }
}
