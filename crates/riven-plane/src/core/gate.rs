//! Blessing gate
//!
//! Every spawn passes through [`BlessingGate::check_propagation`]. Blessings are stored under
//! `blessing/<id>`; an identity without a record is unblessed.

use chrono::{DateTime, Utc};
use riven_core::{
    Blessing, DenyReason, PropagationDecision, ReflectionPayload, Result, TrustError, VaultId,
    VaultSignature,
};
use std::sync::Arc;
use tracing::{info, warn};

use super::chain::SignatureChain;
use crate::storage::VaultFile;
use crate::vault::{VaultStore, VaultTxn};

fn blessing_key(id: &VaultId) -> String {
    format!("blessing/{}", id.to_hex())
}

/// Decides who may spawn and records grants and revocations
#[derive(Debug, Clone)]
pub struct BlessingGate {
    store: Arc<VaultStore>,
    chain: SignatureChain,
}

impl BlessingGate {
    pub fn new(store: Arc<VaultStore>, chain: SignatureChain) -> Self {
        Self { store, chain }
    }

    /// Current blessing of `id`; everything is revoked once the vault is tombstoned
    pub async fn blessing(&self, id: &VaultId) -> Result<Blessing> {
        if self.store.is_tombstoned().await? {
            return Ok(Blessing::unblessed().revoke(Utc::now())?);
        }
        Ok(self
            .store
            .get_json(&blessing_key(id))
            .await?
            .unwrap_or_default())
    }

    /// Whether `id` may spawn right now
    ///
    /// Integrity faults met while walking the chain are returned as errors, not denials.
    pub async fn check_propagation(&self, id: &VaultId) -> Result<PropagationDecision> {
        let decision = self.decide(id).await?;
        if let PropagationDecision::Deny(reason) = decision {
            warn!(identity = %id, reason = reason.as_str(), "Propagation denied");
        }
        Ok(decision)
    }

    async fn decide(&self, id: &VaultId) -> Result<PropagationDecision> {
        if self.store.is_tombstoned().await? {
            return Ok(PropagationDecision::Deny(DenyReason::Revoked));
        }

        let Some(signature) = self.chain.signature_of(id).await? else {
            return Ok(PropagationDecision::Deny(DenyReason::UnknownIdentity));
        };

        match self.chain.verify_chain(&signature).await {
            Ok(_) => {}
            Err(TrustError::DepthExceeded { .. }) => {
                return Ok(PropagationDecision::Deny(DenyReason::ChainTooDeep));
            }
            Err(err) => return Err(err),
        }

        Ok(self.blessing(id).await?.decision())
    }

    /// Stage a blessing; the genesis identity's blessing is mirrored into the blessing file
    pub fn stage(
        &self,
        txn: &mut VaultTxn,
        id: &VaultId,
        blessing: &Blessing,
        is_genesis: bool,
    ) -> Result<()> {
        txn.put_json(blessing_key(id), blessing)?;
        if is_genesis {
            txn.write_file(VaultFile::Blessing, blessing.to_file().to_bytes()?);
        }
        Ok(())
    }

    /// Check that `authority` may act on `target`
    ///
    /// The authority must itself be allowed to propagate and must be a strict ancestor of
    /// the target. Returns both signatures.
    pub async fn require_authority_over(
        &self,
        authority: &VaultId,
        target: &VaultId,
    ) -> Result<(VaultSignature, VaultSignature)> {
        self.check_propagation(authority).await?.into_result()?;

        let authority_sig = self
            .chain
            .signature_of(authority)
            .await?
            .ok_or(TrustError::BlessingDenied(DenyReason::UnknownIdentity))?;
        let target_sig = self
            .chain
            .signature_of(target)
            .await?
            .ok_or(TrustError::BlessingDenied(DenyReason::UnknownIdentity))?;

        let ancestry = self.chain.ancestry(&target_sig).await?;
        if !ancestry.contains(&authority_sig.signature_hash) {
            warn!(authority = %authority, target = %target, "Authority is not an ancestor");
            return Err(TrustError::BlessingDenied(DenyReason::NotAncestor));
        }

        Ok((authority_sig, target_sig))
    }

    /// `Unblessed -> Blessed` for `target`, granted by `authority`
    pub async fn grant(
        &self,
        target: &VaultId,
        authority: &VaultId,
        can_propagate: bool,
        at: DateTime<Utc>,
    ) -> Result<Blessing> {
        let (authority_sig, _) = self.require_authority_over(authority, target).await?;

        let blessing = self
            .blessing(target)
            .await?
            .grant(authority_sig.signature_hash, can_propagate, at)?;

        let mut txn = self.store.begin();
        self.stage(&mut txn, target, &blessing, false)?;
        txn.reflect(ReflectionPayload::BlessingGranted {
            identity: *target,
            authority: *authority,
            can_propagate,
        });
        self.store.commit(txn).await?;

        info!(identity = %target, authority = %authority, can_propagate, "Blessing granted");
        Ok(blessing)
    }

    /// Revoke `target` and the given descendants on behalf of `authority`
    ///
    /// Identities that are already revoked are skipped. Returns the identities revoked.
    pub async fn revoke(
        &self,
        target: &VaultId,
        descendants: &[VaultId],
        authority: &VaultId,
        at: DateTime<Utc>,
    ) -> Result<Vec<VaultId>> {
        self.require_authority_over(authority, target).await?;

        let mut txn = self.store.begin();
        let mut revoked = Vec::new();
        self.stage_revocations(&mut txn, target, descendants, authority, at, &mut revoked)
            .await?;
        self.store.commit(txn).await?;

        info!(identity = %target, authority = %authority, count = revoked.len(), "Blessings revoked");
        Ok(revoked)
    }

    /// Stage revocation of `target` and `descendants` without checking authority
    pub(crate) async fn stage_revocations(
        &self,
        txn: &mut VaultTxn,
        target: &VaultId,
        descendants: &[VaultId],
        authority: &VaultId,
        at: DateTime<Utc>,
        revoked: &mut Vec<VaultId>,
    ) -> Result<()> {
        for id in std::iter::once(target).chain(descendants.iter()) {
            let current = self.blessing(id).await?;
            if current.is_revoked() {
                continue;
            }
            self.stage(txn, id, &current.revoke(at)?, false)?;
            txn.reflect(ReflectionPayload::BlessingRevoked {
                identity: *id,
                authority: *authority,
            });
            revoked.push(*id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IoPolicy, MemoryBackend, VaultBackend, WriteBatch};
    use riven_core::crypto::generate_salt;
    use riven_core::{BlessingFile, DeviceBinding, DeviceId};

    struct Fixture {
        gate: BlessingGate,
        chain: SignatureChain,
        store: Arc<VaultStore>,
        backend: Arc<MemoryBackend>,
        genesis: VaultSignature,
    }

    async fn fixture() -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let device = DeviceId::generate();
        let mut batch = WriteBatch::new();
        batch
            .write_file(VaultFile::Binding, DeviceBinding::new(device).to_bytes().unwrap())
            .write_file(VaultFile::Salt, generate_salt().to_vec());
        backend.apply(batch).await.unwrap();

        let store = Arc::new(VaultStore::new(
            backend.clone(),
            Arc::new(crate::vault::FixedFingerprint(device)),
            IoPolicy::default(),
        ));
        let chain = SignatureChain::new(store.clone(), 32);
        let gate = BlessingGate::new(store.clone(), chain.clone());

        let mut txn = store.begin();
        let genesis = chain.issue_genesis(&mut txn, device).unwrap();
        let blessing = Blessing::genesis(genesis.signature_hash, Utc::now());
        gate.stage(&mut txn, &genesis.vault_id, &blessing, true).unwrap();
        store.commit(txn).await.unwrap();

        Fixture {
            gate,
            chain,
            store,
            backend,
            genesis,
        }
    }

    async fn child_of(f: &Fixture, parent: &VaultSignature) -> VaultSignature {
        let id = DeviceId::generate();
        let mut txn = f.store.begin();
        let child = f.chain.issue(&mut txn, id, id, parent).await.unwrap();
        f.store.commit(txn).await.unwrap();
        child
    }

    #[tokio::test]
    async fn test_genesis_may_propagate() {
        let f = fixture().await;
        let decision = f.gate.check_propagation(&f.genesis.vault_id).await.unwrap();
        assert_eq!(decision, PropagationDecision::Allow);

        let file = f.backend.read_file(VaultFile::Blessing).await.unwrap().unwrap();
        let file = BlessingFile::from_bytes(&file).unwrap();
        assert!(file.blessed && file.can_propagate);
    }

    #[tokio::test]
    async fn test_unknown_and_unblessed_are_denied() {
        let f = fixture().await;
        assert_eq!(
            f.gate.check_propagation(&DeviceId::generate()).await.unwrap(),
            PropagationDecision::Deny(DenyReason::UnknownIdentity)
        );

        let child = child_of(&f, &f.genesis).await;
        assert_eq!(
            f.gate.check_propagation(&child.vault_id).await.unwrap(),
            PropagationDecision::Deny(DenyReason::NotBlessed)
        );
    }

    #[tokio::test]
    async fn test_grant_requires_ancestor() {
        let f = fixture().await;
        let a = child_of(&f, &f.genesis).await;
        let b = child_of(&f, &f.genesis).await;

        let blessing = f
            .gate
            .grant(&a.vault_id, &f.genesis.vault_id, true, Utc::now())
            .await
            .unwrap();
        assert!(blessing.blessed());
        assert_eq!(blessing.granted_by, Some(f.genesis.signature_hash));

        // Siblings have no authority over each other
        let err = f
            .gate
            .grant(&b.vault_id, &a.vault_id, true, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::BlessingDenied(DenyReason::NotAncestor)));
    }

    #[tokio::test]
    async fn test_revoke_cascades_and_is_terminal() {
        let f = fixture().await;
        let a = child_of(&f, &f.genesis).await;
        let b = child_of(&f, &a).await;
        let now = Utc::now();

        f.gate.grant(&a.vault_id, &f.genesis.vault_id, true, now).await.unwrap();
        f.gate.grant(&b.vault_id, &f.genesis.vault_id, false, now).await.unwrap();

        let revoked = f
            .gate
            .revoke(&a.vault_id, &[b.vault_id], &f.genesis.vault_id, now)
            .await
            .unwrap();
        assert_eq!(revoked, vec![a.vault_id, b.vault_id]);

        assert_eq!(
            f.gate.check_propagation(&a.vault_id).await.unwrap(),
            PropagationDecision::Deny(DenyReason::Revoked)
        );
        assert!(matches!(
            f.gate.grant(&a.vault_id, &f.genesis.vault_id, true, now).await,
            Err(TrustError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_tombstoned_vault_revokes_everyone() {
        let f = fixture().await;
        f.store
            .tamper()
            .respond(riven_core::IntegrityFault::BindingMismatch.into())
            .await;

        assert!(f.gate.blessing(&f.genesis.vault_id).await.unwrap().is_revoked());
        assert_eq!(
            f.gate.check_propagation(&f.genesis.vault_id).await.unwrap(),
            PropagationDecision::Deny(DenyReason::Revoked)
        );
    }
}
