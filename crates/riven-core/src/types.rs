//! Identifier types shared across the trust kernel
//!
//! All identifiers are fixed-width byte arrays that serialize as lowercase hex strings.

use crate::error::{Result, TrustError};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

/// Opaque 128-bit device identity
///
/// Produced once per physical device by the device binder, and once per mirror by the
/// propagator. A mirror's signature hashes its own identity, never its parent's device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(#[serde(with = "serde_hex")] [u8; 16]);

/// Identity of a vault or mirror in the signature chain
///
/// A vault is identified by the device identity its signature was issued for.
pub type VaultId = DeviceId;

impl DeviceId {
    /// Wrap raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time equality, for comparisons against untrusted candidates
    pub fn ct_eq(&self, other: &DeviceId) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.to_hex())
    }
}

impl FromStr for DeviceId {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex::<16>(s, "device id").map(Self)
    }
}

/// 256-bit signature hash: `SHA-256(deviceId || parentHash || nonce)`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignatureHash(#[serde(with = "serde_hex")] [u8; 32]);

impl SignatureHash {
    /// Placeholder hashed in place of the parent for the genesis signature
    pub const ZERO: SignatureHash = SignatureHash([0u8; 32]);

    /// Wrap raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 16 bytes, as embedded in trust tokens and reflection entries
    pub fn prefix(&self) -> SigPrefix {
        let mut prefix = [0u8; 16];
        prefix.copy_from_slice(&self.0[..16]);
        SigPrefix(prefix)
    }

    /// Constant-time equality
    pub fn ct_eq(&self, other: &SignatureHash) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl fmt::Display for SignatureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SignatureHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureHash({})", self.to_hex())
    }
}

impl FromStr for SignatureHash {
    type Err = TrustError;

    fn from_str(s: &str) -> Result<Self> {
        parse_hex::<32>(s, "signature hash").map(Self)
    }
}

/// First 16 bytes of a [`SignatureHash`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SigPrefix(#[serde(with = "serde_hex")] [u8; 16]);

impl SigPrefix {
    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for SigPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SigPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SigPrefix({})", hex::encode(self.0))
    }
}

fn parse_hex<const N: usize>(s: &str, what: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(s.trim())
        .map_err(|e| TrustError::MalformedIdentifier(format!("{}: {}", what, e)))?;
    bytes.try_into().map_err(|v: Vec<u8>| {
        TrustError::MalformedIdentifier(format!(
            "{}: expected {} bytes, got {}",
            what,
            N,
            v.len()
        ))
    })
}

/// Hex serialization for fixed-width byte arrays
pub(crate) mod serde_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|v: Vec<u8>| {
            serde::de::Error::custom(format!("expected {} bytes, got {}", N, v.len()))
        })
    }
}

/// Base64 serialization for variable-length byte strings
pub(crate) mod serde_bytes_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_hex_roundtrip() {
        let id = DeviceId::generate();
        let parsed: DeviceId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(parsed.ct_eq(&id));
    }

    #[test]
    fn test_device_id_rejects_wrong_length() {
        let result = "abcd".parse::<DeviceId>();
        assert!(matches!(result, Err(TrustError::MalformedIdentifier(_))));
    }

    #[test]
    fn test_device_id_serializes_as_hex_string() {
        let id = DeviceId::from_bytes([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
    }

    #[test]
    fn test_signature_prefix_is_leading_half() {
        let mut bytes = [0u8; 32];
        bytes[..16].copy_from_slice(&[7u8; 16]);
        let hash = SignatureHash::from_bytes(bytes);
        assert_eq!(hash.prefix().as_bytes(), &[7u8; 16]);
    }
}
