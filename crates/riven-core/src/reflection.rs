//! Reflection log entries
//!
//! Every accepted operation is recorded as a [`ReflectionPayload`], sealed under the vault's
//! reflection key and stored as a [`ReflectionEntry`]. The entry keeps the SHA-256 of the
//! plaintext payload so that replay can detect substituted ciphertext.

use crate::error::{Result, TrustError};
use crate::token::TokenLabel;
use crate::types::{serde_bytes_base64, serde_hex, DeviceId, SigPrefix, SignatureHash, VaultId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// One append-only audit entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionEntry {
    /// Position in the log, starting at 1
    pub sequence: u64,

    /// Never earlier than the previous entry's timestamp
    pub timestamp: DateTime<Utc>,

    pub device_id: DeviceId,

    pub vault_sig_prefix: SigPrefix,

    #[serde(with = "serde_bytes_base64")]
    pub payload_ciphertext: Vec<u8>,

    /// SHA-256 of the plaintext payload
    #[serde(with = "serde_hex")]
    pub payload_hash: [u8; 32],
}

impl ReflectionEntry {
    /// Check a decrypted payload against the recorded hash
    pub fn payload_matches(&self, plaintext: &[u8]) -> bool {
        bool::from(payload_hash(plaintext).ct_eq(&self.payload_hash))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TrustError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TrustError::from)
    }
}

/// SHA-256 of a plaintext payload
pub fn payload_hash(plaintext: &[u8]) -> [u8; 32] {
    Sha256::digest(plaintext).into()
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReflectionPayload {
    /// A record was written through the vault store
    Put { key: String },

    /// A record was deleted through the vault store
    Delete { key: String },

    /// The genesis vault was created
    Provisioned {
        vault_id: VaultId,
        signature_hash: SignatureHash,
    },

    Spawn {
        mirror_id: VaultId,
        parent_id: VaultId,
        tier: u32,
        can_propagate: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    Pairing {
        device_id: DeviceId,
        token_hash: String,
        score: u8,
    },

    BlessingGranted {
        identity: VaultId,
        authority: VaultId,
        can_propagate: bool,
    },

    BlessingRevoked {
        identity: VaultId,
        authority: VaultId,
    },

    /// A mirror subtree was removed
    Pruned { mirror_id: VaultId, removed: u32 },

    /// The vault was moved to a new device binding
    Rebound { previous: DeviceId, current: DeviceId },

    TokenIssued {
        token_hash: String,
        label: TokenLabel,
    },

    /// Opaque payload submitted by an external caller
    Submitted { body: serde_json::Value },
}

impl ReflectionPayload {
    /// Stable name of the payload type
    pub fn kind(&self) -> &'static str {
        match self {
            ReflectionPayload::Put { .. } => "put",
            ReflectionPayload::Delete { .. } => "delete",
            ReflectionPayload::Provisioned { .. } => "provisioned",
            ReflectionPayload::Spawn { .. } => "spawn",
            ReflectionPayload::Pairing { .. } => "pairing",
            ReflectionPayload::BlessingGranted { .. } => "blessing_granted",
            ReflectionPayload::BlessingRevoked { .. } => "blessing_revoked",
            ReflectionPayload::Pruned { .. } => "pruned",
            ReflectionPayload::Rebound { .. } => "rebound",
            ReflectionPayload::TokenIssued { .. } => "token_issued",
            ReflectionPayload::Submitted { .. } => "submitted",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TrustError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TrustError::from)
    }
}
