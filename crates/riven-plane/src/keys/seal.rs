//! Seal key of a vault
//!
//! The seal key is an Ed25519 key pair generated at provisioning and stored as an encrypted
//! record. It signs the genesis signature into the signature file, which is re-verified every
//! time the kernel checks the vault. Erasing the records erases the key with them.

use riven_core::{
    IntegrityFault, KeyPair, Result, SignedSignature, TrustError, VaultSignature,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zeroize::Zeroize;

use crate::storage::VaultFile;
use crate::vault::{VaultStore, VaultTxn};

/// Record key of the seal key
pub const SEAL_KEY_RECORD: &str = "keys/seal";

#[derive(Serialize, Deserialize)]
struct StoredSealKey {
    kid: String,
    secret: String,
}

impl Drop for StoredSealKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// Loads and uses the vault's seal key
#[derive(Debug, Clone)]
pub struct SealKeys {
    store: Arc<VaultStore>,
}

impl SealKeys {
    pub fn new(store: Arc<VaultStore>) -> Self {
        Self { store }
    }

    /// Stage a fresh seal key and the signature file for `genesis`
    pub fn provision(&self, txn: &mut VaultTxn, genesis: &VaultSignature) -> Result<KeyPair> {
        let key_pair = KeyPair::generate(genesis.vault_id.to_hex());

        let stored = StoredSealKey {
            kid: key_pair.kid().to_string(),
            secret: hex::encode(&key_pair.secret_bytes()[..]),
        };
        txn.put_json(SEAL_KEY_RECORD, &stored)?;

        let signed = key_pair.sign_signature(genesis)?;
        txn.write_file(VaultFile::Signature, signed.to_bytes()?);

        Ok(key_pair)
    }

    /// Load the seal key
    pub async fn load(&self) -> Result<KeyPair> {
        let stored: StoredSealKey = self
            .store
            .get_json(SEAL_KEY_RECORD)
            .await?
            .ok_or(IntegrityFault::KeyMaterialMissing)?;

        let mut secret = [0u8; 32];
        hex::decode_to_slice(&stored.secret, &mut secret)
            .map_err(|_| TrustError::from(IntegrityFault::KeyMaterialMissing))?;
        let key_pair = KeyPair::from_bytes(stored.kid.clone(), &secret);
        secret.zeroize();

        Ok(key_pair)
    }

    /// The raw signature file
    pub async fn signature_file(&self) -> Result<Option<Vec<u8>>> {
        self.store.io().read_file(VaultFile::Signature).await
    }

    /// Check that the signature file carries `genesis`, signed by this vault's seal key
    pub async fn verify_signature_file(&self, genesis: &VaultSignature) -> Result<()> {
        let result = self.verify_inner(genesis).await;
        match result {
            Err(err) if err.is_integrity_fault() => Err(self.store.escalate(err).await),
            other => other,
        }
    }

    async fn verify_inner(&self, genesis: &VaultSignature) -> Result<()> {
        let key_pair = self.load().await?;
        let bytes = self
            .signature_file()
            .await?
            .ok_or(IntegrityFault::SignatureFile)?;

        let signed = SignedSignature::from_bytes(&bytes)
            .map_err(|_| TrustError::from(IntegrityFault::SignatureFile))?;
        let carried = key_pair.public_key().verify_signature(&signed)?;

        if carried != *genesis {
            return Err(IntegrityFault::SignatureFile.into());
        }
        Ok(())
    }
}
