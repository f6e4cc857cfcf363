//! Signature chain storage and verification
//!
//! Signatures are stored under `signature/<hash>`; `identity/<id>` maps a vault or mirror to
//! its signature hash and `genesis` names the root of the chain.

use riven_core::{
    ChainFault, ChainWalk, DeviceId, IntegrityFault, Result, SignatureHash, TrustError, VaultId,
    VaultSignature, WalkStep,
};
use std::sync::Arc;

use crate::vault::{VaultStore, VaultTxn};

/// Record naming the genesis signature
pub const GENESIS_RECORD: &str = "genesis";

fn signature_key(hash: &SignatureHash) -> String {
    format!("signature/{}", hash.to_hex())
}

fn identity_key(id: &VaultId) -> String {
    format!("identity/{}", id.to_hex())
}

/// Issues and verifies the soul chain of one vault
#[derive(Debug, Clone)]
pub struct SignatureChain {
    store: Arc<VaultStore>,
    max_depth: u32,
}

impl SignatureChain {
    pub fn new(store: Arc<VaultStore>, max_depth: u32) -> Self {
        Self { store, max_depth }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// The genesis signature; `NotProvisioned` before provisioning
    pub async fn genesis(&self) -> Result<VaultSignature> {
        let hash: SignatureHash = self
            .store
            .get_json(GENESIS_RECORD)
            .await?
            .ok_or(TrustError::NotProvisioned)?;

        match self.get(&hash).await? {
            Some(genesis) => Ok(genesis),
            None => Err(self
                .store
                .escalate(IntegrityFault::CorruptRecord(GENESIS_RECORD.into()).into())
                .await),
        }
    }

    /// True once a genesis exists
    pub async fn is_provisioned(&self) -> Result<bool> {
        Ok(self.store.get_optional(GENESIS_RECORD).await?.is_some())
    }

    /// Signature with the given hash
    pub async fn get(&self, hash: &SignatureHash) -> Result<Option<VaultSignature>> {
        self.store.get_json(&signature_key(hash)).await
    }

    /// Signature issued for a vault or mirror
    pub async fn signature_of(&self, id: &VaultId) -> Result<Option<VaultSignature>> {
        let hash: Option<SignatureHash> = self.store.get_json(&identity_key(id)).await?;
        match hash {
            Some(hash) => self.get(&hash).await,
            None => Ok(None),
        }
    }

    /// Stage the genesis signature for a freshly bound device
    pub fn issue_genesis(&self, txn: &mut VaultTxn, device_id: DeviceId) -> Result<VaultSignature> {
        let signature = VaultSignature::genesis(device_id);
        stage(txn, &signature)?;
        txn.put_json(GENESIS_RECORD, &signature.signature_hash)?;
        txn.sign_with(signature.signature_hash.prefix());
        Ok(signature)
    }

    /// Stage a signature for `vault_id` descending from `parent`
    pub async fn issue(
        &self,
        txn: &mut VaultTxn,
        vault_id: VaultId,
        device_id: DeviceId,
        parent: &VaultSignature,
    ) -> Result<VaultSignature> {
        let signature = VaultSignature::child(vault_id, device_id, parent);

        // A hash already in the chain would close a loop
        if signature.signature_hash == parent.signature_hash
            || self.get(&signature.signature_hash).await?.is_some()
        {
            return Err(TrustError::ChainCycle);
        }

        stage(txn, &signature)?;
        Ok(signature)
    }

    /// Walk `signature` back to genesis, returning its depth
    ///
    /// Exceeding the depth bound is a policy error; any other failure is an integrity fault
    /// and has already been handled by the tamper responder.
    pub async fn verify_chain(&self, signature: &VaultSignature) -> Result<u32> {
        self.walk(signature).await.map(|(depth, _)| depth)
    }

    /// Verified strict ancestors of `signature`, nearest first
    pub async fn ancestry(&self, signature: &VaultSignature) -> Result<Vec<SignatureHash>> {
        self.walk(signature).await.map(|(_, ancestors)| ancestors)
    }

    async fn walk(&self, signature: &VaultSignature) -> Result<(u32, Vec<SignatureHash>)> {
        let result = self.walk_inner(signature).await;
        match result {
            Err(err) if err.is_integrity_fault() => Err(self.store.escalate(err).await),
            other => other,
        }
    }

    async fn walk_inner(&self, signature: &VaultSignature) -> Result<(u32, Vec<SignatureHash>)> {
        let genesis = self.genesis().await?;
        let mut walk = ChainWalk::new(genesis.signature_hash, self.max_depth);
        let mut ancestors = Vec::new();
        let mut current = signature.clone();

        loop {
            match walk.visit(&current).map_err(ChainFault::into_error)? {
                WalkStep::Reached { depth } => return Ok((depth, ancestors)),
                WalkStep::Continue(parent) => {
                    ancestors.push(parent);
                    current = self
                        .get(&parent)
                        .await?
                        .ok_or_else(|| ChainFault::Unresolvable(parent).into_error())?;
                }
            }
        }
    }
}

fn stage(txn: &mut VaultTxn, signature: &VaultSignature) -> Result<()> {
    txn.put_json(signature_key(&signature.signature_hash), signature)?;
    txn.put_json(identity_key(&signature.vault_id), &signature.signature_hash)?;
    Ok(())
}
