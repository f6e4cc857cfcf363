//! Error types for the Cal Riven trust kernel
//!
//! Every failure belongs to one of four classes (see [`ErrorKind`]). Integrity faults carry
//! their detail only inside the process: once the tamper responder has handled one, callers
//! see the detail-free [`TrustError::TrustCheckFailed`].

use crate::blessing::DenyReason;
use crate::signature::ChainFault;
use crate::types::{DeviceId, VaultId};
use thiserror::Error;

/// Result type alias using TrustError
pub type Result<T> = std::result::Result<T, TrustError>;

/// Coarse classification of a [`TrustError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed token, signature or request. Reject and retry with fresh input.
    Format,
    /// Binding, signature or decryption mismatch. Never recoverable locally.
    Integrity,
    /// Blessing denied, depth exceeded, score too low. Expected; choose another action.
    Policy,
    /// Storage timeout. Retry with backoff.
    Transient,
}

impl ErrorKind {
    /// Process exit code used by the CLI surface
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::Format => 1,
            ErrorKind::Policy => 2,
            ErrorKind::Integrity => 3,
            ErrorKind::Transient => 4,
        }
    }

    /// Stable lowercase name, used in API error bodies
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Format => "format",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Policy => "policy",
            ErrorKind::Transient => "transient",
        }
    }
}

/// The specific integrity check that failed
///
/// Only ever logged internally. Never part of a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityFault {
    #[error("device binding does not match this device")]
    BindingMismatch,

    #[error("device binding missing or unreadable")]
    BindingUnreadable,

    #[error("vault key material missing")]
    KeyMaterialMissing,

    #[error("record '{0}' failed authenticated decryption")]
    Decryption(String),

    #[error("signature chain rejected: {0}")]
    Chain(ChainFault),

    #[error("signature file does not verify against the seal key")]
    SignatureFile,

    #[error("reflection payload hash mismatch at sequence {0}")]
    ReflectionHash(u64),

    #[error("stored token record does not hash to its key")]
    TokenRecord,

    #[error("corrupt record '{0}'")]
    CorruptRecord(String),
}

/// Errors that can occur in the trust kernel
#[derive(Error, Debug)]
pub enum TrustError {
    /// Token string is not `cal-riven://<64 hex>`
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Token is well formed but was never issued by this vault
    #[error("Unknown token: {0}")]
    UnknownToken(String),

    /// Device, vault or signature identifier could not be parsed
    #[error("Malformed identifier: {0}")]
    MalformedIdentifier(String),

    /// Request is structurally invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Caller-supplied JSON could not be (de)serialized
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Integrity fault detected, not yet handled by the tamper responder
    #[error("trust check failed")]
    Integrity(IntegrityFault),

    /// Integrity fault after the tamper responder wiped the vault
    #[error("trust check failed")]
    TrustCheckFailed,

    /// Blessing gate denied propagation
    #[error("Blessing denied: {0}")]
    BlessingDenied(DenyReason),

    /// Chain or lineage would exceed the configured maximum depth
    #[error("Maximum depth {max} exceeded")]
    DepthExceeded { max: u32 },

    /// Parent already has the configured number of direct children
    #[error("Fan-out limit {max} reached for {parent}")]
    FanoutExceeded { parent: VaultId, max: u32 },

    /// Cross-device verification scored below the pairing threshold
    #[error("Trust score {score} below threshold {threshold}")]
    ScoreTooLow { score: u8, threshold: u8 },

    /// An equal-or-better pairing already exists for this device and token
    #[error("Pairing for {device} already recorded with score {existing} (offered {offered})")]
    PairingDowngrade {
        device: DeviceId,
        existing: u8,
        offered: u8,
    },

    /// Device already carries a binding
    #[error("Device already bound to {0}")]
    AlreadyBound(DeviceId),

    /// Issuing the signature would close a cycle in the chain
    #[error("Signature chain would contain a cycle")]
    ChainCycle,

    /// Blessing state machine rejected the transition
    #[error("Invalid blessing transition: {0}")]
    InvalidTransition(String),

    /// Vault was revoked and must be re-provisioned
    #[error("Vault has been revoked")]
    Revoked,

    /// Vault has no genesis yet
    #[error("Vault not provisioned")]
    NotProvisioned,

    /// Record or identity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage did not answer within the bounded timeout
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl TrustError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            TrustError::MalformedToken(_)
            | TrustError::UnknownToken(_)
            | TrustError::MalformedIdentifier(_)
            | TrustError::InvalidRequest(_)
            | TrustError::SerializationError(_) => ErrorKind::Format,
            TrustError::Integrity(_) | TrustError::TrustCheckFailed => ErrorKind::Integrity,
            TrustError::StorageUnavailable(_) => ErrorKind::Transient,
            TrustError::BlessingDenied(_)
            | TrustError::DepthExceeded { .. }
            | TrustError::FanoutExceeded { .. }
            | TrustError::ScoreTooLow { .. }
            | TrustError::PairingDowngrade { .. }
            | TrustError::AlreadyBound(_)
            | TrustError::ChainCycle
            | TrustError::InvalidTransition(_)
            | TrustError::Revoked
            | TrustError::NotProvisioned
            | TrustError::NotFound(_) => ErrorKind::Policy,
        }
    }

    /// CLI exit code for this error
    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// True for unhandled integrity faults that still need the tamper responder
    pub fn is_integrity_fault(&self) -> bool {
        matches!(self, TrustError::Integrity(_))
    }
}

impl From<IntegrityFault> for TrustError {
    fn from(fault: IntegrityFault) -> Self {
        TrustError::Integrity(fault)
    }
}

impl From<serde_json::Error> for TrustError {
    fn from(err: serde_json::Error) -> Self {
        TrustError::SerializationError(err.to_string())
    }
}

impl From<coset::CoseError> for TrustError {
    fn from(err: coset::CoseError) -> Self {
        TrustError::MalformedIdentifier(format!("COSE: {:?}", err))
    }
}
