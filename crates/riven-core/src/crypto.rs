//! Cryptographic primitives for the vault
//!
//! Two concerns live here:
//!
//! - **Seal keys**: Ed25519 key pairs that sign the genesis [`VaultSignature`] into the
//!   COSE_Sign1 *signature file* handed to external tools.
//! - **Record sealing**: [`VaultCipher`], XChaCha20-Poly1305 under a key derived with BLAKE3
//!   from the device binding and a per-vault salt. Changing either input makes every existing
//!   record fail authentication.

use crate::error::{IntegrityFault, Result, TrustError};
use crate::signature::VaultSignature;
use crate::types::DeviceId;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use coset::{iana, CborSerializable, CoseSign1, CoseSign1Builder, HeaderBuilder};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// COSE algorithm identifier for EdDSA (Ed25519)
const EDDSA_ALG: iana::Algorithm = iana::Algorithm::EdDSA;

/// BLAKE3 context for the record key
pub const RECORD_KEY_CONTEXT: &str = "cal-riven vault record key v1";

/// BLAKE3 context for the reflection payload key
pub const REFLECTION_KEY_CONTEXT: &str = "cal-riven reflection payload key v1";

/// Length of the random per-vault salt
pub const SALT_LEN: usize = 32;

const NONCE_LEN: usize = 24;

/// The genesis signature wrapped in COSE_Sign1
#[derive(Debug, Clone)]
pub struct SignedSignature {
    cose: CoseSign1,
}

impl SignedSignature {
    /// Key ID from the protected header
    pub fn kid(&self) -> Option<String> {
        let kid = &self.cose.protected.header.key_id;
        if kid.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(kid).to_string())
        }
    }

    /// Serialize to CBOR bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.cose.clone().to_vec().map_err(TrustError::from)
    }

    /// Deserialize from CBOR bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let cose = CoseSign1::from_slice(bytes).map_err(TrustError::from)?;
        Ok(Self { cose })
    }

    /// Decode the payload without checking the signature
    ///
    /// Display only. Use [`PublicKey::verify_signature`] before trusting the result.
    pub fn extract(&self) -> Result<VaultSignature> {
        let payload = self
            .cose
            .payload
            .as_ref()
            .ok_or_else(|| TrustError::InvalidRequest("signature file has no payload".into()))?;
        VaultSignature::from_bytes(payload)
    }
}

/// Ed25519 seal key of one vault
pub struct KeyPair {
    kid: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("signing_key", &"[redacted]")
            .finish()
    }
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate(kid: impl Into<String>) -> Self {
        Self {
            kid: kid.into(),
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore a key pair from its secret bytes
    pub fn from_bytes(kid: impl Into<String>, bytes: &[u8; 32]) -> Self {
        Self {
            kid: kid.into(),
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            kid: self.kid.clone(),
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Secret bytes, wiped when dropped
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    /// Sign a vault signature into a COSE_Sign1 envelope
    pub fn sign_signature(&self, signature: &VaultSignature) -> Result<SignedSignature> {
        let payload = signature.to_bytes()?;

        let protected = HeaderBuilder::new()
            .algorithm(EDDSA_ALG)
            .key_id(self.kid.as_bytes().to_vec())
            .build();

        let cose = CoseSign1Builder::new()
            .protected(protected)
            .payload(payload)
            .try_create_signature(&[], |data| {
                Ok::<_, TrustError>(self.signing_key.sign(data).to_bytes().to_vec())
            })?
            .build();

        Ok(SignedSignature { cose })
    }
}

/// Ed25519 public half of a seal key
#[derive(Clone)]
pub struct PublicKey {
    kid: String,
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey").field("kid", &self.kid).finish()
    }
}

impl PublicKey {
    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Verify a signature file and return the signature it carries
    pub fn verify_signature(&self, signed: &SignedSignature) -> Result<VaultSignature> {
        let cose = &signed.cose;

        let kid = &cose.protected.header.key_id;
        if kid.as_slice() != self.kid.as_bytes() {
            return Err(IntegrityFault::SignatureFile.into());
        }

        let signature_bytes: [u8; 64] = cose
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| TrustError::from(IntegrityFault::SignatureFile))?;
        let signature = Signature::from_bytes(&signature_bytes);

        self.verifying_key
            .verify(&cose.tbs_data(&[]), &signature)
            .map_err(|_| TrustError::from(IntegrityFault::SignatureFile))?;

        signed
            .extract()
            .map_err(|_| TrustError::from(IntegrityFault::SignatureFile))
    }
}

/// Fresh random vault salt
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Authenticated cipher for vault records
///
/// Sealed form: `nonce (24 bytes) || ciphertext+tag`. The record key is bound in as AAD so a
/// ciphertext cannot be moved to another key.
pub struct VaultCipher {
    key: Zeroizing<[u8; 32]>,
}

impl std::fmt::Debug for VaultCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultCipher([redacted])")
    }
}

impl VaultCipher {
    /// Derive a cipher from the device identity and vault salt
    pub fn derive(context: &str, device_id: &DeviceId, salt: &[u8]) -> Self {
        let mut material = Zeroizing::new(Vec::with_capacity(16 + salt.len()));
        material.extend_from_slice(device_id.as_bytes());
        material.extend_from_slice(salt);

        Self {
            key: Zeroizing::new(blake3::derive_key(context, &material)),
        }
    }

    /// Encrypt `plaintext` stored under `aad`
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key[..]));

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| TrustError::InvalidRequest("record too large to seal".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed record; any failure is an integrity fault naming `aad`
    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        let fault = || {
            TrustError::from(IntegrityFault::Decryption(
                String::from_utf8_lossy(aad).to_string(),
            ))
        };

        if sealed.len() < NONCE_LEN {
            return Err(fault());
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key[..]));
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| fault())
    }
}
