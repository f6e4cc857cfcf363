//! Trust components of a vault
//!
//! Each component holds an explicit `Arc<VaultStore>` handle; there is no global vault.

pub mod chain;
pub mod codec;
pub mod gate;
pub mod ledger;
pub mod propagator;
pub mod reflection;
pub mod tamper;

pub use chain::SignatureChain;
pub use codec::{Assessment, TrustTokenCodec};
pub use gate::BlessingGate;
pub use ledger::{PairingLedger, PairingRecord};
pub use propagator::{MirrorPropagator, PropagationLimits};
pub use reflection::{ReflectionLog, ReflectionReplay};
pub use tamper::{TamperResponder, Tombstone};
