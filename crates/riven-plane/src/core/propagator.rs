//! Mirror propagation
//!
//! Lineage records live under `lineage/<id>`, the child index under `children/<parent>/<child>`
//! and completed spawns under `spawn/<sha256 of the idempotency key>`, indexed back from the
//! mirror by `spawned/<id>` so a prune can clear them.
//!
//! The propagator performs its checks and the commit as separate storage calls; callers that
//! need fan-out to hold under concurrency serialize spawns per vault (the kernel does).

use chrono::{DateTime, Utc};
use riven_core::{
    AttenuationPolicy, Blessing, DenyReason, DeviceId, IntegrityFault, MirrorConfig,
    MirrorLineage, ReflectionPayload, Result, TrustError, VaultId, VaultSignature,
};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use super::chain::SignatureChain;
use super::gate::BlessingGate;
use crate::vault::{VaultStore, VaultTxn};

fn lineage_key(id: &VaultId) -> String {
    format!("lineage/{}", id.to_hex())
}

fn children_prefix(parent: &VaultId) -> String {
    format!("children/{}/", parent.to_hex())
}

fn child_key(parent: &VaultId, child: &VaultId) -> String {
    format!("{}{}", children_prefix(parent), child.to_hex())
}

fn spawn_key(idempotency_key: &str) -> String {
    format!("spawn/{}", hex::encode(Sha256::digest(idempotency_key.as_bytes())))
}

fn spawned_key(mirror: &VaultId) -> String {
    format!("spawned/{}", mirror.to_hex())
}

/// Limits applied to every spawn
#[derive(Debug, Clone, Copy)]
pub struct PropagationLimits {
    pub policy: AttenuationPolicy,
    pub max_tier: u32,
    pub max_fanout: Option<u32>,
}

/// Spawns and prunes mirrors
#[derive(Debug, Clone)]
pub struct MirrorPropagator {
    store: Arc<VaultStore>,
    chain: SignatureChain,
    gate: BlessingGate,
    limits: PropagationLimits,
}

impl MirrorPropagator {
    pub fn new(
        store: Arc<VaultStore>,
        chain: SignatureChain,
        gate: BlessingGate,
        limits: PropagationLimits,
    ) -> Self {
        Self {
            store,
            chain,
            gate,
            limits,
        }
    }

    pub fn limits(&self) -> PropagationLimits {
        self.limits
    }

    /// Lineage record of a mirror
    pub async fn lineage(&self, id: &VaultId) -> Result<Option<MirrorLineage>> {
        self.store.get_json(&lineage_key(id)).await
    }

    /// Direct children of a mirror, in key order
    pub async fn children(&self, parent: &VaultId) -> Result<Vec<VaultId>> {
        let prefix = children_prefix(parent);
        let mut children = Vec::new();
        for key in self.store.list(&prefix).await? {
            let parsed = key
                .strip_prefix(&prefix)
                .and_then(|hex| hex.parse::<DeviceId>().ok());
            match parsed {
                Some(id) => children.push(id),
                None => {
                    return Err(self
                        .store
                        .escalate(IntegrityFault::CorruptRecord(key).into())
                        .await)
                }
            }
        }
        Ok(children)
    }

    /// Every descendant of `root`, breadth first, excluding `root`
    pub async fn descendants(&self, root: &VaultId) -> Result<Vec<VaultId>> {
        let mut found = Vec::new();
        let mut queue = VecDeque::from([*root]);
        while let Some(id) = queue.pop_front() {
            for child in self.children(&id).await? {
                found.push(child);
                queue.push_back(child);
            }
        }
        Ok(found)
    }

    /// Stage the lineage root for the genesis vault
    pub fn stage_root(
        &self,
        txn: &mut VaultTxn,
        genesis: &VaultSignature,
        at: DateTime<Utc>,
    ) -> Result<MirrorLineage> {
        let lineage = MirrorLineage::genesis(genesis.vault_id, at);
        txn.put_json(lineage_key(&lineage.mirror_id), &lineage)?;
        Ok(lineage)
    }

    /// Stage a new identity below `parent`: signature, blessing, lineage and child index
    ///
    /// The signature names `device`, or the new identity itself when the child is a mirror
    /// with no device of its own.
    pub(crate) async fn stage_child(
        &self,
        txn: &mut VaultTxn,
        parent: &MirrorLineage,
        parent_sig: &VaultSignature,
        device: Option<DeviceId>,
        blessing: impl FnOnce(&VaultSignature, u32) -> Result<Blessing>,
        at: DateTime<Utc>,
    ) -> Result<(MirrorLineage, Blessing)> {
        let mirror_id = DeviceId::generate();
        let lineage = parent.child(mirror_id, at);

        let device_id = device.unwrap_or(mirror_id);
        let signature = self.chain.issue(txn, mirror_id, device_id, parent_sig).await?;
        let blessing = blessing(&signature, lineage.tier)?;

        self.gate.stage(txn, &mirror_id, &blessing, false)?;
        txn.put_json(lineage_key(&mirror_id), &lineage)?;
        txn.put(child_key(&parent.mirror_id, &mirror_id), Vec::new());

        Ok((lineage, blessing))
    }

    /// Recorded lineage of `parent`, which must match what the caller holds
    async fn recorded_parent(&self, parent: &MirrorLineage) -> Result<MirrorLineage> {
        let stored = self
            .lineage(&parent.mirror_id)
            .await?
            .ok_or(TrustError::BlessingDenied(DenyReason::UnknownIdentity))?;
        if stored != *parent {
            return Err(TrustError::InvalidRequest(
                "parent lineage does not match the recorded lineage".into(),
            ));
        }
        Ok(stored)
    }

    /// Spawn a child of `parent`
    ///
    /// Retrying with the same `idempotency_key` returns the lineage created by the first
    /// successful call, as long as that mirror has not been pruned since.
    pub async fn spawn_mirror(
        &self,
        parent: &MirrorLineage,
        config: &MirrorConfig,
        idempotency_key: &str,
        at: DateTime<Utc>,
    ) -> Result<MirrorLineage> {
        if idempotency_key.trim().is_empty() {
            return Err(TrustError::InvalidRequest(
                "idempotency key must not be empty".into(),
            ));
        }

        let spawn_record = spawn_key(idempotency_key);
        if let Some(existing) = self.store.get_json::<MirrorLineage>(&spawn_record).await? {
            if existing.parent_id != Some(parent.mirror_id) {
                return Err(TrustError::InvalidRequest(
                    "idempotency key was used for a different parent".into(),
                ));
            }
            if self.lineage(&existing.mirror_id).await?.is_some() {
                debug!(mirror = %existing.mirror_id, "Replayed spawn");
                return Ok(existing);
            }
            debug!(mirror = %existing.mirror_id, "Spawn record outlived its mirror");
        }

        self.gate
            .check_propagation(&parent.mirror_id)
            .await?
            .into_result()?;
        let parent = self.recorded_parent(parent).await?;

        if parent.tier + 1 > self.limits.max_tier {
            return Err(TrustError::DepthExceeded {
                max: self.limits.max_tier,
            });
        }

        if let Some(max) = self.limits.max_fanout {
            if self.children(&parent.mirror_id).await?.len() as u64 >= u64::from(max) {
                return Err(TrustError::FanoutExceeded {
                    parent: parent.mirror_id,
                    max,
                });
            }
        }

        let parent_sig = self
            .chain
            .signature_of(&parent.mirror_id)
            .await?
            .ok_or(TrustError::BlessingDenied(DenyReason::UnknownIdentity))?;
        let parent_blessing = self.gate.blessing(&parent.mirror_id).await?;
        let policy = self.limits.policy;

        let mut txn = self.store.begin();
        let (lineage, blessing) = self
            .stage_child(
                &mut txn,
                &parent,
                &parent_sig,
                None,
                |_, tier| {
                    let can = policy.child_can_propagate(
                        parent_blessing.can_propagate,
                        tier,
                        config.propagate,
                    );
                    parent_blessing.inherit(parent_sig.signature_hash, can, at)
                },
                at,
            )
            .await?;

        txn.put_json(spawned_key(&lineage.mirror_id), &spawn_record)?;
        txn.put_json(spawn_record, &lineage)?;
        txn.reflect(ReflectionPayload::Spawn {
            mirror_id: lineage.mirror_id,
            parent_id: parent.mirror_id,
            tier: lineage.tier,
            can_propagate: blessing.can_propagate,
            label: config.label.clone(),
        });
        self.store.commit(txn).await?;

        info!(
            mirror = %lineage.mirror_id,
            parent = %parent.mirror_id,
            tier = lineage.tier,
            can_propagate = blessing.can_propagate,
            "Spawned mirror"
        );
        Ok(lineage)
    }

    /// Remove a mirror and its subtree, revoking every blessing in it
    ///
    /// Signatures stay in the chain; spawn records go, so their keys spawn afresh. Returns the
    /// identities removed, `mirror` first.
    pub async fn prune(
        &self,
        mirror: &VaultId,
        authority: &VaultId,
        at: DateTime<Utc>,
    ) -> Result<Vec<VaultId>> {
        let lineage = self
            .lineage(mirror)
            .await?
            .ok_or_else(|| TrustError::NotFound(format!("mirror {}", mirror)))?;
        let Some(parent) = lineage.parent_id else {
            return Err(TrustError::InvalidRequest(
                "the genesis vault cannot be pruned".into(),
            ));
        };

        self.gate.require_authority_over(authority, mirror).await?;
        let descendants = self.descendants(mirror).await?;

        let mut txn = self.store.begin();
        let mut revoked = Vec::new();
        self.gate
            .stage_revocations(&mut txn, mirror, &descendants, authority, at, &mut revoked)
            .await?;

        txn.delete(child_key(&parent, mirror));
        let removed: Vec<VaultId> = std::iter::once(*mirror).chain(descendants).collect();
        for id in &removed {
            txn.delete(lineage_key(id));
            if let Some(spawn_record) = self.store.get_json::<String>(&spawned_key(id)).await? {
                txn.delete(spawn_record);
                txn.delete(spawned_key(id));
            }
            for child in self.children(id).await? {
                txn.delete(child_key(id, &child));
            }
        }

        txn.reflect(ReflectionPayload::Pruned {
            mirror_id: *mirror,
            removed: removed.len() as u32,
        });
        self.store.commit(txn).await?;

        info!(mirror = %mirror, removed = removed.len(), "Pruned mirror subtree");
        Ok(removed)
    }
}
