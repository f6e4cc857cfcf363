//! Tamper response
//!
//! The single path taken on any integrity fault: log the fault, tombstone the vault, revoke the
//! published blessing and erase every record together with the key material. Callers only
//! ever see [`TrustError::TrustCheckFailed`].

use chrono::{DateTime, Utc};
use riven_core::{BlessingFile, IntegrityFault, Result, TrustError};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::storage::{BoundedBackend, VaultFile, WriteBatch};

/// Contents of the tombstone file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub revoked_at: DateTime<Utc>,
}

/// Destroys a vault's state when its integrity can no longer be trusted
#[derive(Debug, Clone)]
pub struct TamperResponder {
    io: BoundedBackend,
}

impl TamperResponder {
    pub fn new(io: BoundedBackend) -> Self {
        Self { io }
    }

    /// Tombstone, if the vault has been revoked
    pub async fn tombstone(&self) -> Result<Option<Tombstone>> {
        match self.io.read_file(VaultFile::Tombstone).await? {
            None => Ok(None),
            // An unreadable tombstone still marks the vault dead
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Tombstone {
                    revoked_at: Utc::now(),
                }
            }))),
        }
    }

    pub async fn is_tombstoned(&self) -> Result<bool> {
        Ok(self.io.read_file(VaultFile::Tombstone).await?.is_some())
    }

    /// Handle an error on its way out of the kernel
    ///
    /// Integrity faults wipe the vault and become `TrustCheckFailed`; anything else passes
    /// through unchanged.
    pub async fn respond(&self, err: TrustError) -> TrustError {
        match err {
            TrustError::Integrity(fault) => {
                self.wipe(&fault).await;
                TrustError::TrustCheckFailed
            }
            other => other,
        }
    }

    /// Tombstone the vault and erase its contents
    ///
    /// Best effort past the tombstone: storage failures are logged and the wipe continues.
    pub async fn wipe(&self, fault: &IntegrityFault) {
        error!(fault = %fault, "SECURITY: integrity fault detected, revoking vault");

        let tombstone = Tombstone {
            revoked_at: Utc::now(),
        };
        let mut batch = WriteBatch::new();
        batch
            .write_file(
                VaultFile::Tombstone,
                serde_json::to_vec(&tombstone).unwrap_or_default(),
            )
            .write_file(
                VaultFile::Blessing,
                BlessingFile::revoked().to_bytes().unwrap_or_default(),
            );
        if let Err(e) = self.io.apply(batch).await {
            error!(error = %e, "SECURITY: failed to write tombstone");
        }

        match self.io.erase_records("").await {
            Ok(erased) => info!(erased, "Erased vault records"),
            Err(e) => error!(error = %e, "SECURITY: failed to erase vault records"),
        }

        for file in [VaultFile::Salt, VaultFile::Signature] {
            if let Err(e) = self.io.erase_file(file).await {
                error!(file = ?file, error = %e, "SECURITY: failed to erase vault file");
            }
        }

        error!("SECURITY: vault revoked and wiped");
    }

    /// Remove everything, tombstone included, before re-provisioning
    pub async fn purge(&self) -> Result<()> {
        self.io.erase_records("").await?;
        for file in VaultFile::ALL {
            self.io.erase_file(file).await?;
        }
        info!("Purged revoked vault");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IoPolicy, MemoryBackend, VaultBackend};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wipe_tombstones_and_erases() {
        let backend = Arc::new(MemoryBackend::new());
        let responder = TamperResponder::new(BoundedBackend::new(backend.clone(), IoPolicy::default()));

        let mut batch = WriteBatch::new();
        batch
            .put("reflection/entry/1", vec![1])
            .put("keys/seal", vec![2])
            .write_file(VaultFile::Salt, vec![3; 32])
            .write_file(VaultFile::Blessing, br#"{"blessed":true,"canPropagate":true}"#.to_vec());
        backend.apply(batch).await.unwrap();

        let err = responder
            .respond(TrustError::Integrity(IntegrityFault::BindingMismatch))
            .await;

        assert!(matches!(err, TrustError::TrustCheckFailed));
        assert!(responder.is_tombstoned().await.unwrap());
        assert_eq!(backend.record_count(), 0);
        assert!(backend.read_file(VaultFile::Salt).await.unwrap().is_none());

        let blessing = backend.read_file(VaultFile::Blessing).await.unwrap().unwrap();
        assert_eq!(BlessingFile::from_bytes(&blessing).unwrap(), BlessingFile::revoked());
    }

    #[tokio::test]
    async fn test_non_integrity_errors_pass_through() {
        let backend = Arc::new(MemoryBackend::new());
        let responder = TamperResponder::new(BoundedBackend::new(backend, IoPolicy::default()));

        let err = responder.respond(TrustError::Revoked).await;
        assert!(matches!(err, TrustError::Revoked));
        assert!(!responder.is_tombstoned().await.unwrap());
    }
}
