//! # Riven Core
//!
//! Core types, codecs and cryptographic primitives for the Cal Riven trust kernel.
//!
//! ## Key Concepts
//!
//! - **Device binding**: the immutable 128-bit identity of the device a vault lives on
//! - **Soul chain**: hash-linked [`VaultSignature`]s proving descent from the genesis vault
//! - **Trust token**: a QR-transportable bearer credential whose score decays over time
//! - **Blessing**: the permission to spawn descendants ("mirrors")
//! - **Reflection**: one entry of the append-only, encrypted audit trail
//!
//! ## Trust Invariants
//!
//! 1. **Binding**: a device binding is never silently replaced
//! 2. **Descent**: every signature walks back to genesis without cycles, within the depth bound
//! 3. **Attenuation**: propagation rights are copied downwards and can only shrink
//!
//! Everything in this crate is pure: storage, locking and tamper response live in
//! `riven-plane`.

pub mod binding;
pub mod blessing;
pub mod crypto;
pub mod error;
pub mod lineage;
pub mod reflection;
pub mod signature;
pub mod token;
pub mod types;

pub use binding::DeviceBinding;
pub use blessing::{Blessing, BlessingFile, BlessingState, DenyReason, PropagationDecision};
pub use crypto::{KeyPair, PublicKey, SignedSignature, VaultCipher};
pub use error::{ErrorKind, IntegrityFault, Result, TrustError};
pub use lineage::{AttenuationPolicy, MirrorConfig, MirrorLineage};
pub use reflection::{ReflectionEntry, ReflectionPayload};
pub use signature::{verify_chain_with, ChainFault, ChainWalk, VaultSignature, WalkStep};
pub use token::{TokenHash, TokenLabel, TrustToken};
pub use types::{DeviceId, SigPrefix, SignatureHash, VaultId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get the library version
pub fn version() -> &'static str {
    VERSION
}
