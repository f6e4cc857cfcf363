//! Device binding record

use crate::error::{Result, TrustError};
use crate::types::DeviceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The immutable identity of the device a vault lives on
///
/// Created once per device. Replacing it requires an explicit, authorized rebind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub device_id: DeviceId,
    pub created_at: DateTime<Utc>,
}

impl DeviceBinding {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            created_at: Utc::now(),
        }
    }

    /// Constant-time check of a candidate identity against this binding
    pub fn matches(&self, candidate: &DeviceId) -> bool {
        self.device_id.ct_eq(candidate)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TrustError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TrustError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_own_device_only() {
        let binding = DeviceBinding::new(DeviceId::from_bytes([1; 16]));
        assert!(binding.matches(&DeviceId::from_bytes([1; 16])));
        assert!(!binding.matches(&DeviceId::from_bytes([2; 16])));
    }

    #[test]
    fn test_roundtrip_bytes() {
        let binding = DeviceBinding::new(DeviceId::generate());
        let restored = DeviceBinding::from_bytes(&binding.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, binding);
    }
}
