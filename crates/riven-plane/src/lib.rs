//! Riven Plane
//!
//! The stateful half of the Cal Riven trust kernel: an encrypted, device-bound vault and the
//! components that guard it.
//!
//! - [`vault::VaultStore`] seals every record under a key derived from the device binding
//! - [`core::SignatureChain`] issues and walks the soul chain back to genesis
//! - [`core::TrustTokenCodec`] and [`core::PairingLedger`] verify tokens and record pairings
//! - [`core::BlessingGate`] and [`core::MirrorPropagator`] decide and perform spawns
//! - [`core::ReflectionLog`] replays the encrypted audit trail
//! - [`core::TamperResponder`] tombstones and wipes the vault on any integrity fault
//!
//! [`TrustKernel`] ties them together behind a per-vault lock.
//!
//! ## API Endpoints
//!
//! - `GET /health` - Liveness check
//! - `GET /ready` - Readiness, true once the vault is provisioned and not revoked
//! - `POST /v1/blessing/check` - Ask whether an identity may spawn
//! - `POST /v1/reflections` - Append an opaque payload to the reflection log
//! - `POST /v1/mirrors` - Spawn a mirror, idempotent per key

pub mod api;
pub mod config;
pub mod core;
pub mod kernel;
pub mod keys;
pub mod storage;
pub mod vault;

pub use api::create_router;
pub use api::handlers::AppState;
pub use config::{ConfigError, KernelConfig, PlaneConfig};
pub use kernel::{IssuedToken, Provisioned, TrustKernel, VaultState, VaultStatus, Verification};
pub use storage::{FileBackend, MemoryBackend, VaultBackend};
pub use vault::{DeviceFingerprint, FixedFingerprint, HostFingerprint};
