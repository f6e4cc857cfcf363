//! Trust tokens
//!
//! A token is derived deterministically from its fields: the SHA-256 of the canonical JSON
//! serialization, transported as `cal-riven://<64 lowercase hex>`. The string carries no
//! fields of its own; the issuing vault resolves it against its issuance records.

use crate::error::{Result, TrustError};
use crate::signature::VaultSignature;
use crate::types::{serde_hex, DeviceId, SigPrefix};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

/// URI scheme of the transport format
pub const TOKEN_SCHEME: &str = "cal-riven://";

/// Current token format version
pub const TOKEN_VERSION: u8 = 1;

/// Score at issuance
pub const MAX_SCORE: u8 = 100;

/// Points lost per whole hour since issuance
pub const DECAY_PER_HOUR: i64 = 2;

/// Minimum score for cross-device pairing
pub const DEFAULT_PAIRING_THRESHOLD: u8 = 50;

/// Why a token was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenLabel {
    Genesis,
    Pairing,
}

impl fmt::Display for TokenLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenLabel::Genesis => write!(f, "genesis"),
            TokenLabel::Pairing => write!(f, "pairing"),
        }
    }
}

impl FromStr for TokenLabel {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "genesis" => Ok(TokenLabel::Genesis),
            "pairing" => Ok(TokenLabel::Pairing),
            other => Err(TrustError::InvalidRequest(format!(
                "unknown token label '{}'",
                other
            ))),
        }
    }
}

/// Fields of a trust token
///
/// Field order is part of the canonical serialization; do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustToken {
    pub device_id: DeviceId,
    pub vault_sig_prefix: SigPrefix,
    pub issued_at: DateTime<Utc>,
    pub label: TokenLabel,
    pub version: u8,
}

impl TrustToken {
    /// Build a token for `device_id` under `signature`
    pub fn new(
        device_id: DeviceId,
        signature: &VaultSignature,
        label: TokenLabel,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            vault_sig_prefix: signature.signature_hash.prefix(),
            issued_at,
            label,
            version: TOKEN_VERSION,
        }
    }

    /// Canonical serialization the hash is taken over
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(TrustError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(TrustError::from)
    }

    pub fn hash(&self) -> Result<TokenHash> {
        let digest = Sha256::digest(self.canonical_bytes()?);
        Ok(TokenHash(digest.into()))
    }

    /// Transport string for this token
    pub fn encode(&self) -> Result<String> {
        Ok(self.hash()?.to_string())
    }

    /// True when this token hashes to `hash`
    pub fn matches(&self, hash: &TokenHash) -> Result<bool> {
        Ok(bool::from(self.hash()?.0.ct_eq(&hash.0)))
    }

    /// Time-decayed score at `now`
    pub fn score(&self, now: DateTime<Utc>) -> u8 {
        score_at(self.issued_at, now)
    }
}

/// `max(0, 100 - 2 * whole hours elapsed)`; a clock behind issuance counts as zero hours
pub fn score_at(issued_at: DateTime<Utc>, now: DateTime<Utc>) -> u8 {
    let hours = (now - issued_at).num_hours().max(0);
    let lost = hours.saturating_mul(DECAY_PER_HOUR);
    (i64::from(MAX_SCORE) - lost).max(0) as u8
}

/// SHA-256 identity of a token
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenHash(#[serde(with = "serde_hex")] [u8; 32]);

impl TokenHash {
    /// Parse the `cal-riven://<64 lowercase hex>` transport form
    pub fn parse(token: &str) -> Result<Self> {
        let hex_part = token
            .strip_prefix(TOKEN_SCHEME)
            .ok_or_else(|| TrustError::MalformedToken("missing cal-riven:// scheme".into()))?;

        if hex_part.len() != 64 {
            return Err(TrustError::MalformedToken(format!(
                "expected 64 hex characters, got {}",
                hex_part.len()
            )));
        }

        if !hex_part
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(TrustError::MalformedToken(
                "token must be lowercase hex".into(),
            ));
        }

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut bytes)
            .map_err(|e| TrustError::MalformedToken(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Bare hex digest, without the scheme
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TokenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", TOKEN_SCHEME, self.to_hex())
    }
}

impl fmt::Debug for TokenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenHash({})", self.to_hex())
    }
}

impl FromStr for TokenHash {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token_at(issued_at: DateTime<Utc>) -> TrustToken {
        let device = DeviceId::generate();
        let signature = VaultSignature::genesis(device);
        TrustToken::new(device, &signature, TokenLabel::Genesis, issued_at)
    }

    #[test]
    fn test_score_decay_points() {
        let t0 = Utc::now();
        let token = token_at(t0);

        assert_eq!(token.score(t0), 100);
        assert_eq!(token.score(t0 + Duration::minutes(59)), 100);
        assert_eq!(token.score(t0 + Duration::hours(1)), 98);
        assert_eq!(token.score(t0 + Duration::hours(10)), 80);
        assert_eq!(token.score(t0 + Duration::hours(40)), 20);
        assert_eq!(token.score(t0 + Duration::hours(50)), 0);
        assert_eq!(token.score(t0 + Duration::hours(5000)), 0);
    }

    #[test]
    fn test_clock_skew_counts_as_zero_hours() {
        let t0 = Utc::now();
        let token = token_at(t0);
        assert_eq!(token.score(t0 - Duration::hours(3)), 100);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let token = token_at(Utc::now());
        let a = token.encode().unwrap();
        let b = token.clone().encode().unwrap();

        assert_eq!(a, b);
        assert!(a.starts_with("cal-riven://"));
        assert_eq!(a.len(), TOKEN_SCHEME.len() + 64);
    }

    #[test]
    fn test_parse_roundtrip() {
        let token = token_at(Utc::now());
        let encoded = token.encode().unwrap();
        let hash = TokenHash::parse(&encoded).unwrap();

        assert_eq!(hash.to_string(), encoded);
        assert!(token.matches(&hash).unwrap());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let cases: Vec<String> = vec![
            String::new(),
            "cal-riven://".into(),
            "https://example.com".into(),
            "cal-riven://abc".into(),
            format!("cal-riven://{}", "A".repeat(64)),
            format!("cal-riven://{}", "g".repeat(64)),
            format!("cal-riven://{}", "a".repeat(65)),
        ];

        for case in &cases {
            assert!(
                matches!(TokenHash::parse(case), Err(TrustError::MalformedToken(_))),
                "accepted {:?}",
                case
            );
        }
    }

    #[test]
    fn test_changed_field_changes_hash() {
        let token = token_at(Utc::now());
        let mut relabelled = token.clone();
        relabelled.label = TokenLabel::Pairing;

        assert_ne!(token.hash().unwrap(), relabelled.hash().unwrap());
    }
}
