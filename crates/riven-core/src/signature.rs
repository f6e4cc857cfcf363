//! Soul chain signatures
//!
//! A [`VaultSignature`] proves descent from the genesis vault through a singly-linked list of
//! parent hashes. Walking the list is modelled as a pure state machine ([`ChainWalk`]) so that
//! the plane can drive it with asynchronous store lookups, while [`verify_chain_with`] drives
//! it synchronously for callers that already hold the records.
//!
//! ## Walk rules
//!
//! - Every visited record must hash to the value its child referenced
//! - A record may appear only once per walk (no cycles)
//! - Depth counts parent edges: the genesis is at depth 0
//! - The walk must end at the configured genesis, not at any other root

use crate::error::{Result, TrustError};
use crate::types::{serde_hex, DeviceId, SignatureHash, VaultId};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

/// Default bound on the number of parent edges between a signature and genesis
pub const DEFAULT_MAX_CHAIN_DEPTH: u32 = 32;

/// One link of the soul chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSignature {
    /// Vault or mirror this signature was issued for
    pub vault_id: VaultId,

    /// Device identity hashed into the signature
    pub device_id: DeviceId,

    /// Random 128-bit nonce hashed into the signature
    #[serde(with = "serde_hex")]
    pub nonce: [u8; 16],

    /// `SHA-256(device_id || parent hash or 32 zero bytes || nonce)`
    pub signature_hash: SignatureHash,

    /// Hash of the parent signature, absent only for the genesis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_signature: Option<SignatureHash>,

    /// When the signature was issued
    pub issued_at: DateTime<Utc>,
}

impl VaultSignature {
    /// Compute a signature hash from its inputs
    pub fn compute_hash(
        device_id: &DeviceId,
        parent: Option<&SignatureHash>,
        nonce: &[u8; 16],
    ) -> SignatureHash {
        let parent = parent.unwrap_or(&SignatureHash::ZERO);

        let mut hasher = Sha256::new();
        hasher.update(device_id.as_bytes());
        hasher.update(parent.as_bytes());
        hasher.update(nonce);
        SignatureHash::from_bytes(hasher.finalize().into())
    }

    /// Issue a genesis signature for a freshly bound device
    pub fn genesis(device_id: DeviceId) -> Self {
        Self::issue_at(device_id, device_id, None, Utc::now())
    }

    /// Issue a child signature referencing `parent`
    pub fn child(vault_id: VaultId, device_id: DeviceId, parent: &VaultSignature) -> Self {
        Self::issue_at(vault_id, device_id, Some(parent.signature_hash), Utc::now())
    }

    /// Issue a signature with an explicit parent hash and issuance time
    pub fn issue_at(
        vault_id: VaultId,
        device_id: DeviceId,
        parent_signature: Option<SignatureHash>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);

        let signature_hash = Self::compute_hash(&device_id, parent_signature.as_ref(), &nonce);

        Self {
            vault_id,
            device_id,
            nonce,
            signature_hash,
            parent_signature,
            issued_at,
        }
    }

    /// True when this signature has no parent
    pub fn is_genesis(&self) -> bool {
        self.parent_signature.is_none()
    }

    /// Recompute the hash from the stored inputs
    pub fn recompute(&self) -> SignatureHash {
        Self::compute_hash(&self.device_id, self.parent_signature.as_ref(), &self.nonce)
    }

    /// Check the stored hash against its inputs in constant time
    pub fn verify_hash(&self) -> bool {
        self.recompute().ct_eq(&self.signature_hash)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TrustError::from)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TrustError::from)
    }
}

/// Why a chain walk was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainFault {
    #[error("signature visited twice")]
    Cycle,

    #[error("chain longer than {max} links")]
    TooDeep { max: u32 },

    #[error("signature hash does not recompute")]
    HashMismatch,

    #[error("parent {0} cannot be resolved")]
    Unresolvable(SignatureHash),

    #[error("chain ends at a root other than the genesis")]
    ForeignRoot,
}

impl ChainFault {
    /// Depth overflow is a policy outcome; everything else means the chain was tampered with
    pub fn into_error(self) -> TrustError {
        match self {
            ChainFault::TooDeep { max } => TrustError::DepthExceeded { max },
            other => TrustError::Integrity(other.into()),
        }
    }
}

impl From<ChainFault> for crate::error::IntegrityFault {
    fn from(fault: ChainFault) -> Self {
        crate::error::IntegrityFault::Chain(fault)
    }
}

/// Outcome of visiting one signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStep {
    /// Resolve this parent hash and visit it next
    Continue(SignatureHash),
    /// The walk reached genesis after `depth` edges
    Reached { depth: u32 },
}

/// Incremental verifier for one walk from a signature back to genesis
#[derive(Debug, Clone)]
pub struct ChainWalk {
    genesis: SignatureHash,
    max_depth: u32,
    depth: u32,
    expected: Option<SignatureHash>,
    seen: HashSet<SignatureHash>,
}

impl ChainWalk {
    /// Start a walk that must end at `genesis` within `max_depth` edges
    pub fn new(genesis: SignatureHash, max_depth: u32) -> Self {
        Self {
            genesis,
            max_depth,
            depth: 0,
            expected: None,
            seen: HashSet::new(),
        }
    }

    /// Number of edges walked so far
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Visit the next signature of the walk
    ///
    /// The first call takes the signature under test; each later call takes the record
    /// resolved for the hash returned by the previous [`WalkStep::Continue`].
    pub fn visit(&mut self, signature: &VaultSignature) -> std::result::Result<WalkStep, ChainFault> {
        if !self.seen.insert(signature.signature_hash) {
            return Err(ChainFault::Cycle);
        }

        // The resolver must hand back the record the child pointed at
        if let Some(expected) = self.expected {
            if !signature.signature_hash.ct_eq(&expected) {
                return Err(ChainFault::HashMismatch);
            }
        }

        if !signature.verify_hash() {
            return Err(ChainFault::HashMismatch);
        }

        match signature.parent_signature {
            None if signature.signature_hash.ct_eq(&self.genesis) => {
                Ok(WalkStep::Reached { depth: self.depth })
            }
            None => Err(ChainFault::ForeignRoot),
            Some(parent) => {
                if self.depth >= self.max_depth {
                    return Err(ChainFault::TooDeep { max: self.max_depth });
                }
                self.depth += 1;
                self.expected = Some(parent);
                Ok(WalkStep::Continue(parent))
            }
        }
    }
}

/// Verify `signature` descends from `genesis`, resolving parents with `resolve`
///
/// Returns the number of edges between the signature and genesis.
pub fn verify_chain_with<F>(
    signature: &VaultSignature,
    genesis: &SignatureHash,
    max_depth: u32,
    mut resolve: F,
) -> std::result::Result<u32, ChainFault>
where
    F: FnMut(&SignatureHash) -> Option<VaultSignature>,
{
    let mut walk = ChainWalk::new(*genesis, max_depth);
    let mut current = signature.clone();

    loop {
        match walk.visit(&current)? {
            WalkStep::Reached { depth } => return Ok(depth),
            WalkStep::Continue(parent) => {
                current = resolve(&parent).ok_or(ChainFault::Unresolvable(parent))?;
            }
        }
    }
}
