//! Reflection log access
//!
//! Entries are written by [`VaultStore::commit`]; this module appends explicit entries and
//! replays the log lazily, one decrypted entry per step.

use riven_core::{DeviceId, ReflectionEntry, ReflectionPayload, Result};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::vault::VaultStore;

/// Append-only audit trail of one vault
#[derive(Debug, Clone)]
pub struct ReflectionLog {
    store: Arc<VaultStore>,
}

impl ReflectionLog {
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self { store }
    }

    /// Append one entry and return its sequence number
    pub async fn append(&self, payload: ReflectionPayload) -> Result<u64> {
        let mut txn = self.store.begin();
        txn.reflect(payload);
        let sequences = self.store.commit(txn).await?;
        Ok(sequences.last().copied().unwrap_or_default())
    }

    /// Cursor over the log in timestamp order, optionally only entries written by `device`
    ///
    /// The set of entries is fixed when the cursor is created. A tombstoned vault yields
    /// nothing.
    pub async fn replay(&self, device: Option<DeviceId>) -> Result<ReflectionReplay> {
        let keys = self.store.reflection_keys().await?;
        Ok(ReflectionReplay {
            store: self.store.clone(),
            keys: keys.into(),
            device,
        })
    }
}

/// Lazy cursor returned by [`ReflectionLog::replay`]
#[derive(Debug)]
pub struct ReflectionReplay {
    store: Arc<VaultStore>,
    keys: VecDeque<String>,
    device: Option<DeviceId>,
}

impl ReflectionReplay {
    /// Next matching entry, decrypted and hash-checked
    pub async fn next(&mut self) -> Result<Option<(ReflectionEntry, ReflectionPayload)>> {
        while let Some(key) = self.keys.pop_front() {
            let (entry, payload) = self.store.read_reflection(&key).await?;
            match self.device {
                Some(device) if !entry.device_id.ct_eq(&device) => continue,
                _ => return Ok(Some((entry, payload))),
            }
        }
        Ok(None)
    }

    /// Entries not yet visited, before device filtering
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }

    /// Drain the cursor
    pub async fn collect_all(mut self) -> Result<Vec<(ReflectionEntry, ReflectionPayload)>> {
        let mut entries = Vec::new();
        while let Some(item) = self.next().await? {
            entries.push(item);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IoPolicy, MemoryBackend, VaultBackend, VaultFile, WriteBatch};
    use riven_core::crypto::generate_salt;
    use riven_core::DeviceBinding;

    async fn log(device: DeviceId) -> ReflectionLog {
        let backend = Arc::new(MemoryBackend::new());
        let mut batch = WriteBatch::new();
        batch
            .write_file(VaultFile::Binding, DeviceBinding::new(device).to_bytes().unwrap())
            .write_file(VaultFile::Salt, generate_salt().to_vec());
        backend.apply(batch).await.unwrap();
        ReflectionLog::new(Arc::new(VaultStore::new(
            backend,
            Arc::new(crate::vault::FixedFingerprint(device)),
            IoPolicy::default(),
        )))
    }

    fn note(n: u32) -> ReflectionPayload {
        ReflectionPayload::Submitted {
            body: serde_json::json!({ "n": n }),
        }
    }

    #[tokio::test]
    async fn test_append_and_replay_in_order() {
        let device = DeviceId::generate();
        let log = log(device).await;

        for n in 0..5 {
            assert_eq!(log.append(note(n)).await.unwrap(), u64::from(n) + 1);
        }

        let entries = log.replay(None).await.unwrap().collect_all().await.unwrap();
        assert_eq!(entries.len(), 5);
        assert!(entries.windows(2).all(|w| w[0].0.timestamp <= w[1].0.timestamp));
        assert_eq!(entries[3].1, note(3));
        assert!(entries.iter().all(|(entry, _)| entry.device_id == device));
    }

    #[tokio::test]
    async fn test_replay_filters_by_device() {
        let log = log(DeviceId::generate()).await;
        log.append(note(1)).await.unwrap();

        let mut cursor = log.replay(Some(DeviceId::generate())).await.unwrap();
        assert_eq!(cursor.remaining(), 1);
        assert!(cursor.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cursor_is_lazy() {
        let log = log(DeviceId::generate()).await;
        log.append(note(1)).await.unwrap();
        log.append(note(2)).await.unwrap();

        let mut cursor = log.replay(None).await.unwrap();
        let (first, _) = cursor.next().await.unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(cursor.remaining(), 1);
    }
}
