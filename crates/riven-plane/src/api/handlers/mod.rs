//! API request handlers

pub mod blessing;
pub mod mirror;
pub mod reflection;

use std::sync::Arc;

use crate::config::PlaneConfig;
use crate::kernel::TrustKernel;

pub use blessing::{check_blessing, BlessingCheckRequest, BlessingCheckResponse};
pub use mirror::{spawn_mirror, SpawnMirrorRequest};
pub use reflection::{submit_reflection, SubmitReflectionRequest, SubmitReflectionResponse};

/// Application state shared across handlers
pub struct AppState {
    /// Kernel of the vault this plane serves
    pub kernel: Arc<TrustKernel>,
    pub config: PlaneConfig,
}
