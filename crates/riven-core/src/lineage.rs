//! Mirror lineage
//!
//! Mirrors form a strict tree rooted at the genesis vault (tier 0). A child's tier is always
//! its parent's tier plus one.

use crate::error::{Result, TrustError};
use crate::types::VaultId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default maximum tier of a mirror
pub const DEFAULT_MAX_TIER: u32 = 32;

/// Immutable lineage record of one mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorLineage {
    pub mirror_id: VaultId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<VaultId>,

    pub tier: u32,

    pub spawned_at: DateTime<Utc>,
}

impl MirrorLineage {
    /// Lineage root for the genesis vault
    pub fn genesis(vault_id: VaultId, at: DateTime<Utc>) -> Self {
        Self {
            mirror_id: vault_id,
            parent_id: None,
            tier: 0,
            spawned_at: at,
        }
    }

    /// Lineage of a new child of this mirror
    pub fn child(&self, mirror_id: VaultId, at: DateTime<Utc>) -> Self {
        Self {
            mirror_id,
            parent_id: Some(self.mirror_id),
            tier: self.tier + 1,
            spawned_at: at,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TrustError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TrustError::from)
    }
}

/// Caller-supplied options for a spawn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Free-form name recorded in the reflection log
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Ask for the child to be able to propagate; never widens what policy allows
    #[serde(default = "default_propagate")]
    pub propagate: bool,
}

fn default_propagate() -> bool {
    true
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            label: None,
            propagate: true,
        }
    }
}

/// How propagation rights shrink from parent to child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum AttenuationPolicy {
    /// Children propagate exactly when their parent does
    #[default]
    Inherit,
    /// Children never propagate
    Terminal,
    /// Children propagate only up to the given tier
    TierLimit { max_propagating_tier: u32 },
}

impl AttenuationPolicy {
    /// Propagation right of a child at `child_tier`
    pub fn child_can_propagate(&self, parent_can: bool, child_tier: u32, requested: bool) -> bool {
        let allowed = match self {
            AttenuationPolicy::Inherit => true,
            AttenuationPolicy::Terminal => false,
            AttenuationPolicy::TierLimit {
                max_propagating_tier,
            } => child_tier <= *max_propagating_tier,
        };
        parent_can && requested && allowed
    }
}

impl fmt::Display for AttenuationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttenuationPolicy::Inherit => write!(f, "inherit"),
            AttenuationPolicy::Terminal => write!(f, "terminal"),
            AttenuationPolicy::TierLimit {
                max_propagating_tier,
            } => write!(f, "tier-limit:{}", max_propagating_tier),
        }
    }
}

impl FromStr for AttenuationPolicy {
    type Err = TrustError;

    /// Parses `inherit`, `terminal` or `tier-limit:<n>`
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "inherit" => Ok(AttenuationPolicy::Inherit),
            "terminal" => Ok(AttenuationPolicy::Terminal),
            other => {
                let tier = other
                    .strip_prefix("tier-limit:")
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| {
                        TrustError::InvalidRequest(format!(
                            "unknown attenuation policy '{}'",
                            other
                        ))
                    })?;
                Ok(AttenuationPolicy::TierLimit {
                    max_propagating_tier: tier,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceId;

    #[test]
    fn test_child_tier_increments() {
        let now = Utc::now();
        let root = MirrorLineage::genesis(DeviceId::generate(), now);
        let child = root.child(DeviceId::generate(), now);
        let grandchild = child.child(DeviceId::generate(), now);

        assert!(root.is_genesis());
        assert_eq!(child.tier, 1);
        assert_eq!(child.parent_id, Some(root.mirror_id));
        assert_eq!(grandchild.tier, 2);
    }

    #[test]
    fn test_policies() {
        assert!(AttenuationPolicy::Inherit.child_can_propagate(true, 5, true));
        assert!(!AttenuationPolicy::Inherit.child_can_propagate(true, 5, false));
        assert!(!AttenuationPolicy::Terminal.child_can_propagate(true, 1, true));

        let limit = AttenuationPolicy::TierLimit {
            max_propagating_tier: 2,
        };
        assert!(limit.child_can_propagate(true, 2, true));
        assert!(!limit.child_can_propagate(true, 3, true));
        assert!(!limit.child_can_propagate(false, 1, true));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("inherit".parse::<AttenuationPolicy>().unwrap(), AttenuationPolicy::Inherit);
        assert_eq!(
            "tier-limit:4".parse::<AttenuationPolicy>().unwrap(),
            AttenuationPolicy::TierLimit {
                max_propagating_tier: 4
            }
        );
        assert!("tier-limit:x".parse::<AttenuationPolicy>().is_err());
        assert!("sometimes".parse::<AttenuationPolicy>().is_err());
    }

    #[test]
    fn test_config_defaults_to_propagate() {
        let config: MirrorConfig = serde_json::from_str("{}").unwrap();
        assert!(config.propagate);
        assert!(config.label.is_none());
    }
}
