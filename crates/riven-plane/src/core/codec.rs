//! Trust token issuance and verification
//!
//! Issued tokens are kept as immutable records under `token/<hash>` so a transport string can
//! be resolved back to its fields and scored.

use chrono::{DateTime, Utc};
use riven_core::{IntegrityFault, ReflectionPayload, Result, TokenHash, TrustError, TrustToken};
use serde::Serialize;
use std::sync::Arc;

use crate::vault::{VaultStore, VaultTxn};

fn token_key(hash: &TokenHash) -> String {
    format!("token/{}", hash.to_hex())
}

/// Outcome of scoring a token for a candidate device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Assessment {
    /// The candidate is this vault's own device; no threshold applies
    SameDevice { score: u8 },
    /// Another device whose score meets the threshold
    CrossDevice { score: u8 },
}

impl Assessment {
    pub fn score(&self) -> u8 {
        match self {
            Assessment::SameDevice { score } | Assessment::CrossDevice { score } => *score,
        }
    }
}

/// Encodes, resolves and scores trust tokens
#[derive(Debug, Clone)]
pub struct TrustTokenCodec {
    store: Arc<VaultStore>,
    threshold: u8,
}

impl TrustTokenCodec {
    pub fn new(store: Arc<VaultStore>, threshold: u8) -> Self {
        Self { store, threshold }
    }

    /// Minimum cross-device score
    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Stage the issuance record and return the transport hash
    pub fn encode(&self, txn: &mut VaultTxn, token: &TrustToken) -> Result<TokenHash> {
        let hash = token.hash()?;
        txn.put(token_key(&hash), token.canonical_bytes()?);
        txn.reflect(ReflectionPayload::TokenIssued {
            token_hash: hash.to_hex(),
            label: token.label,
        });
        Ok(hash)
    }

    /// Resolve a transport string to the token it was issued as
    pub async fn decode(&self, token: &str) -> Result<TrustToken> {
        let hash = TokenHash::parse(token)?;
        let bytes = self
            .store
            .get_optional(&token_key(&hash))
            .await?
            .ok_or_else(|| TrustError::UnknownToken(token.to_string()))?;

        let record = TrustToken::from_bytes(&bytes)
            .ok()
            .filter(|record| record.matches(&hash).unwrap_or(false));

        match record {
            Some(record) => Ok(record),
            None => Err(self
                .store
                .escalate(IntegrityFault::TokenRecord.into())
                .await),
        }
    }

    pub fn score(&self, token: &TrustToken, now: DateTime<Utc>) -> u8 {
        token.score(now)
    }

    /// Score `token` at `now` for a presenting device
    ///
    /// `same_device` is the binder's verdict on the presenter. The vault's own device always
    /// passes; any other device needs the threshold.
    pub fn assess(
        &self,
        token: &TrustToken,
        same_device: bool,
        now: DateTime<Utc>,
    ) -> Result<Assessment> {
        let score = self.score(token, now);

        if same_device {
            return Ok(Assessment::SameDevice { score });
        }

        if score < self.threshold {
            return Err(TrustError::ScoreTooLow {
                score,
                threshold: self.threshold,
            });
        }
        Ok(Assessment::CrossDevice { score })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IoPolicy, MemoryBackend, VaultBackend, VaultFile, WriteBatch};
    use chrono::Duration;
    use riven_core::crypto::generate_salt;
    use riven_core::{DeviceBinding, DeviceId, TokenLabel, VaultSignature};

    async fn codec() -> (TrustTokenCodec, DeviceBinding, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let binding = DeviceBinding::new(DeviceId::generate());
        let mut batch = WriteBatch::new();
        batch
            .write_file(VaultFile::Binding, binding.to_bytes().unwrap())
            .write_file(VaultFile::Salt, generate_salt().to_vec());
        backend.apply(batch).await.unwrap();

        let store = Arc::new(VaultStore::new(
            backend.clone(),
            Arc::new(crate::vault::FixedFingerprint(binding.device_id)),
            IoPolicy::default(),
        ));
        (TrustTokenCodec::new(store, 50), binding, backend)
    }

    #[tokio::test]
    async fn test_decode_returns_issued_token() {
        let (codec, binding, _) = codec().await;
        let signature = VaultSignature::genesis(binding.device_id);
        let token = TrustToken::new(binding.device_id, &signature, TokenLabel::Genesis, Utc::now());

        let mut txn = codec.store.begin();
        let hash = codec.encode(&mut txn, &token).unwrap();
        codec.store.commit(txn).await.unwrap();

        let decoded = codec.decode(&hash.to_string()).await.unwrap();
        assert_eq!(decoded, token);
    }

    #[tokio::test]
    async fn test_decode_unknown_and_malformed() {
        let (codec, _, _) = codec().await;

        let unknown = format!("cal-riven://{}", "ab".repeat(32));
        assert!(matches!(
            codec.decode(&unknown).await,
            Err(TrustError::UnknownToken(_))
        ));
        assert!(matches!(
            codec.decode("cal-riven://nope").await,
            Err(TrustError::MalformedToken(_))
        ));
    }

    #[tokio::test]
    async fn test_assess_thresholds() {
        let (codec, binding, _) = codec().await;
        let t0 = Utc::now();
        let signature = VaultSignature::genesis(binding.device_id);
        let token = TrustToken::new(binding.device_id, &signature, TokenLabel::Genesis, t0);

        assert_eq!(
            codec.assess(&token, true, t0 + Duration::hours(49)).unwrap(),
            Assessment::SameDevice { score: 2 }
        );
        assert_eq!(
            codec.assess(&token, false, t0 + Duration::hours(25)).unwrap(),
            Assessment::CrossDevice { score: 50 }
        );
        assert!(matches!(
            codec.assess(&token, false, t0 + Duration::hours(26)),
            Err(TrustError::ScoreTooLow { score: 48, threshold: 50 })
        ));
    }
}
