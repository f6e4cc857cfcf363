//! Pairing ledger
//!
//! One record per (paired device, token) under `pairing/<device>/<token hash>`. A record is
//! only ever replaced by a strictly better-scoring one.

use chrono::{DateTime, Utc};
use riven_core::{DeviceId, ReflectionPayload, Result, TokenHash, TrustError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::vault::VaultStore;

fn pairing_prefix(device: &DeviceId) -> String {
    format!("pairing/{}/", device.to_hex())
}

fn pairing_key(device: &DeviceId, token: &TokenHash) -> String {
    format!("{}{}", pairing_prefix(device), token.to_hex())
}

/// Outcome of a successful cross-device verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRecord {
    pub paired_device_id: DeviceId,
    pub paired_with_device_id: DeviceId,
    pub paired_at: DateTime<Utc>,
    pub trust_score: u8,
    pub token_hash: TokenHash,
}

/// Records pairings between this vault's device and others
#[derive(Debug, Clone)]
pub struct PairingLedger {
    store: Arc<VaultStore>,
}

impl PairingLedger {
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self { store }
    }

    /// Record a pairing, refusing to replace an equal or better record
    pub async fn record_pairing(
        &self,
        device: DeviceId,
        paired_with: DeviceId,
        token_hash: TokenHash,
        score: u8,
        at: DateTime<Utc>,
    ) -> Result<PairingRecord> {
        let key = pairing_key(&device, &token_hash);

        if let Some(existing) = self.store.get_json::<PairingRecord>(&key).await? {
            if existing.trust_score >= score {
                return Err(TrustError::PairingDowngrade {
                    device,
                    existing: existing.trust_score,
                    offered: score,
                });
            }
        }

        let record = PairingRecord {
            paired_device_id: device,
            paired_with_device_id: paired_with,
            paired_at: at,
            trust_score: score,
            token_hash,
        };

        let mut txn = self.store.begin();
        txn.put_json(key, &record)?;
        txn.reflect(ReflectionPayload::Pairing {
            device_id: device,
            token_hash: token_hash.to_hex(),
            score,
        });
        self.store.commit(txn).await?;

        info!(device = %device, score, "Recorded pairing");
        Ok(record)
    }

    /// All pairing records of a device
    pub async fn records(&self, device: &DeviceId) -> Result<Vec<PairingRecord>> {
        let mut records = Vec::new();
        for key in self.store.list(&pairing_prefix(device)).await? {
            if let Some(record) = self.store.get_json(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Most recent pairing record of a device
    pub async fn lookup(&self, device: &DeviceId) -> Result<PairingRecord> {
        self.records(device)
            .await?
            .into_iter()
            .max_by_key(|r| r.paired_at)
            .ok_or_else(|| TrustError::NotFound(format!("pairing for {}", device)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IoPolicy, MemoryBackend, VaultBackend, VaultFile, WriteBatch};
    use chrono::Duration;
    use riven_core::crypto::generate_salt;
    use riven_core::DeviceBinding;

    async fn ledger() -> PairingLedger {
        let backend = Arc::new(MemoryBackend::new());
        let device = DeviceId::generate();
        let mut batch = WriteBatch::new();
        batch
            .write_file(VaultFile::Binding, DeviceBinding::new(device).to_bytes().unwrap())
            .write_file(VaultFile::Salt, generate_salt().to_vec());
        backend.apply(batch).await.unwrap();

        PairingLedger::new(Arc::new(VaultStore::new(
            backend,
            Arc::new(crate::vault::FixedFingerprint(device)),
            IoPolicy::default(),
        )))
    }

    fn token(n: u8) -> TokenHash {
        TokenHash::parse(&format!("cal-riven://{}", hex::encode([n; 32]))).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_returns_most_recent() {
        let ledger = ledger().await;
        let device = DeviceId::generate();
        let host = DeviceId::generate();
        let t0 = Utc::now();

        ledger.record_pairing(device, host, token(1), 90, t0).await.unwrap();
        ledger
            .record_pairing(device, host, token(2), 60, t0 + Duration::hours(1))
            .await
            .unwrap();

        let latest = ledger.lookup(&device).await.unwrap();
        assert_eq!(latest.token_hash, token(2));
        assert_eq!(ledger.records(&device).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pairing_is_monotonic() {
        let ledger = ledger().await;
        let device = DeviceId::generate();
        let host = DeviceId::generate();
        let now = Utc::now();

        ledger.record_pairing(device, host, token(1), 70, now).await.unwrap();

        let err = ledger
            .record_pairing(device, host, token(1), 70, now)
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::PairingDowngrade { existing: 70, offered: 70, .. }));

        let upgraded = ledger.record_pairing(device, host, token(1), 80, now).await.unwrap();
        assert_eq!(ledger.lookup(&device).await.unwrap(), upgraded);
    }

    #[tokio::test]
    async fn test_lookup_unknown_device() {
        let ledger = ledger().await;
        let err = ledger.lookup(&DeviceId::generate()).await.unwrap_err();
        assert!(matches!(err, TrustError::NotFound(_)));
    }
}
