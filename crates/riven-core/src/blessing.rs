//! Blessings: permission to spawn descendants
//!
//! A blessing moves through `Unblessed -> Blessed -> Revoked`. `Revoked` is terminal. Children
//! receive a copy of their parent's blessing whose `can_propagate` may only shrink.

use crate::error::{Result, TrustError};
use crate::types::SignatureHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a blessing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlessingState {
    #[default]
    Unblessed,
    Blessed,
    Revoked,
}

impl fmt::Display for BlessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlessingState::Unblessed => write!(f, "unblessed"),
            BlessingState::Blessed => write!(f, "blessed"),
            BlessingState::Revoked => write!(f, "revoked"),
        }
    }
}

/// Stored blessing of one identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Blessing {
    pub state: BlessingState,

    /// Whether this identity may spawn mirrors
    pub can_propagate: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_at: Option<DateTime<Utc>>,

    /// Signature of the authority that granted the blessing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_by: Option<SignatureHash>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Blessing {
    /// The `{false, false}` default every identity starts with
    pub fn unblessed() -> Self {
        Self::default()
    }

    /// Blessing of the genesis vault, which authorizes itself
    pub fn genesis(signature: SignatureHash, at: DateTime<Utc>) -> Self {
        Self {
            state: BlessingState::Blessed,
            can_propagate: true,
            granted_at: Some(at),
            granted_by: Some(signature),
            revoked_at: None,
        }
    }

    /// True while the blessing is in the `Blessed` state
    pub fn blessed(&self) -> bool {
        self.state == BlessingState::Blessed
    }

    pub fn is_revoked(&self) -> bool {
        self.state == BlessingState::Revoked
    }

    /// `Unblessed -> Blessed`
    pub fn grant(
        &self,
        authority: SignatureHash,
        can_propagate: bool,
        at: DateTime<Utc>,
    ) -> Result<Blessing> {
        if self.state != BlessingState::Unblessed {
            return Err(TrustError::InvalidTransition(format!(
                "cannot bless an identity that is {}",
                self.state
            )));
        }

        Ok(Blessing {
            state: BlessingState::Blessed,
            can_propagate,
            granted_at: Some(at),
            granted_by: Some(authority),
            revoked_at: None,
        })
    }

    /// `Unblessed | Blessed -> Revoked`
    pub fn revoke(&self, at: DateTime<Utc>) -> Result<Blessing> {
        if self.is_revoked() {
            return Err(TrustError::InvalidTransition("already revoked".into()));
        }

        Ok(Blessing {
            state: BlessingState::Revoked,
            can_propagate: false,
            granted_at: self.granted_at,
            granted_by: self.granted_by,
            revoked_at: Some(at),
        })
    }

    /// Copy this blessing to a child, attenuating propagation
    ///
    /// The child can propagate only if this blessing can and `can_propagate` is set.
    pub fn inherit(
        &self,
        granted_by: SignatureHash,
        can_propagate: bool,
        at: DateTime<Utc>,
    ) -> Result<Blessing> {
        if !self.blessed() {
            return Err(TrustError::InvalidTransition(format!(
                "cannot inherit from an identity that is {}",
                self.state
            )));
        }

        Ok(Blessing {
            state: BlessingState::Blessed,
            can_propagate: self.can_propagate && can_propagate,
            granted_at: Some(at),
            granted_by: Some(granted_by),
            revoked_at: None,
        })
    }

    /// Whether this blessing on its own permits spawning
    pub fn decision(&self) -> PropagationDecision {
        match self.state {
            BlessingState::Revoked => PropagationDecision::Deny(DenyReason::Revoked),
            BlessingState::Unblessed => PropagationDecision::Deny(DenyReason::NotBlessed),
            BlessingState::Blessed if !self.can_propagate => {
                PropagationDecision::Deny(DenyReason::PropagationNotGranted)
            }
            BlessingState::Blessed => PropagationDecision::Allow,
        }
    }

    /// Externally visible projection
    pub fn to_file(&self) -> BlessingFile {
        BlessingFile {
            blessed: self.blessed(),
            can_propagate: self.blessed() && self.can_propagate,
        }
    }
}

/// The blessing file read by external launchers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BlessingFile {
    pub blessed: bool,
    pub can_propagate: bool,
}

impl BlessingFile {
    /// The file written after a revocation or a tamper wipe
    pub fn revoked() -> Self {
        Self::default()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TrustError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TrustError::from)
    }
}

/// Why the gate refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotBlessed,
    Revoked,
    PropagationNotGranted,
    UnknownIdentity,
    ChainTooDeep,
    NotAncestor,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::NotBlessed => "not_blessed",
            DenyReason::Revoked => "revoked",
            DenyReason::PropagationNotGranted => "propagation_not_granted",
            DenyReason::UnknownIdentity => "unknown_identity",
            DenyReason::ChainTooDeep => "chain_too_deep",
            DenyReason::NotAncestor => "not_ancestor",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DenyReason::NotBlessed => "identity is not blessed",
            DenyReason::Revoked => "identity has been revoked",
            DenyReason::PropagationNotGranted => "identity may not propagate",
            DenyReason::UnknownIdentity => "identity is unknown to this vault",
            DenyReason::ChainTooDeep => "signature chain exceeds the maximum depth",
            DenyReason::NotAncestor => "authority is not an ancestor of the target",
        };
        f.write_str(text)
    }
}

/// Result of `check_propagation`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationDecision {
    Allow,
    Deny(DenyReason),
}

impl PropagationDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, PropagationDecision::Allow)
    }

    /// Turn a denial into a policy error
    pub fn into_result(self) -> Result<()> {
        match self {
            PropagationDecision::Allow => Ok(()),
            PropagationDecision::Deny(reason) => Err(TrustError::BlessingDenied(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority() -> SignatureHash {
        SignatureHash::from_bytes([9u8; 32])
    }

    #[test]
    fn test_default_is_unblessed() {
        let blessing = Blessing::unblessed();
        assert!(!blessing.blessed());
        assert!(!blessing.can_propagate);
        assert_eq!(
            blessing.decision(),
            PropagationDecision::Deny(DenyReason::NotBlessed)
        );
        assert_eq!(blessing.to_file(), BlessingFile::revoked());
    }

    #[test]
    fn test_grant_then_revoke() {
        let now = Utc::now();
        let blessed = Blessing::unblessed().grant(authority(), true, now).unwrap();
        assert!(blessed.decision().is_allowed());
        assert_eq!(blessed.granted_by, Some(authority()));

        let revoked = blessed.revoke(now).unwrap();
        assert!(revoked.is_revoked());
        assert!(!revoked.can_propagate);
        assert_eq!(revoked.decision(), PropagationDecision::Deny(DenyReason::Revoked));
    }

    #[test]
    fn test_revoked_is_terminal() {
        let now = Utc::now();
        let revoked = Blessing::unblessed().revoke(now).unwrap();

        assert!(matches!(
            revoked.grant(authority(), true, now),
            Err(TrustError::InvalidTransition(_))
        ));
        assert!(matches!(revoked.revoke(now), Err(TrustError::InvalidTransition(_))));
    }

    #[test]
    fn test_grant_twice_rejected() {
        let now = Utc::now();
        let blessed = Blessing::unblessed().grant(authority(), false, now).unwrap();
        assert!(blessed.grant(authority(), true, now).is_err());
    }

    #[test]
    fn test_inherit_never_expands() {
        let now = Utc::now();
        let parent = Blessing::unblessed().grant(authority(), false, now).unwrap();
        let child = parent.inherit(authority(), true, now).unwrap();

        assert!(child.blessed());
        assert!(!child.can_propagate);
        assert_eq!(
            child.decision(),
            PropagationDecision::Deny(DenyReason::PropagationNotGranted)
        );
    }

    #[test]
    fn test_blessing_file_is_camel_case() {
        let file = BlessingFile {
            blessed: true,
            can_propagate: true,
        };
        let json = String::from_utf8(file.to_bytes().unwrap()).unwrap();
        assert_eq!(json, r#"{"blessed":true,"canPropagate":true}"#);
    }
}
