//! The trust kernel
//!
//! [`TrustKernel`] wires the components of one vault together and is the only entry point
//! used by the HTTP plane and the CLI. Every operation holds the vault's exclusive lock from
//! its precondition checks through its commit, so concurrent callers are serialized.

use chrono::{DateTime, Utc};
use riven_core::{
    Blessing, DenyReason, DeviceBinding, DeviceId, MirrorConfig, MirrorLineage,
    PropagationDecision, ReflectionPayload, Result, SignatureHash, TokenHash, TokenLabel,
    TrustError, TrustToken, VaultId, VaultSignature,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::KernelConfig;
use crate::core::{
    Assessment, BlessingGate, MirrorPropagator, PairingLedger, PairingRecord, PropagationLimits,
    ReflectionLog, ReflectionReplay, SignatureChain, TrustTokenCodec,
};
use crate::keys::SealKeys;
use crate::storage::{FileBackend, StorageError, VaultBackend, VaultFile};
use crate::vault::{DeviceBinder, DeviceFingerprint, VaultStore};

/// Result of provisioning
#[derive(Debug, Clone, Serialize)]
pub struct Provisioned {
    pub binding: DeviceBinding,
    pub genesis: VaultSignature,
    pub lineage: MirrorLineage,
    /// False when the vault already existed
    pub created: bool,
}

/// A freshly issued token
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    /// Transport form, `cal-riven://<hash>`
    pub token: String,
    pub token_hash: TokenHash,
    pub issued_at: DateTime<Utc>,
    pub label: TokenLabel,
}

/// Outcome of verifying a token
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub score: u8,
    pub same_device: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing: Option<PairingRecord>,
}

/// Lifecycle state of a vault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultState {
    Unprovisioned,
    Active,
    Revoked,
}

/// Snapshot returned by [`TrustKernel::status`]
#[derive(Debug, Clone, Serialize)]
pub struct VaultStatus {
    pub state: VaultState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault_id: Option<VaultId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genesis: Option<SignatureHash>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    pub reflections: usize,
}

/// One device-bound vault and its trust components
#[derive(Debug)]
pub struct TrustKernel {
    config: KernelConfig,
    store: Arc<VaultStore>,
    binder: DeviceBinder,
    chain: SignatureChain,
    codec: TrustTokenCodec,
    ledger: PairingLedger,
    gate: BlessingGate,
    propagator: MirrorPropagator,
    reflections: ReflectionLog,
    seal: SealKeys,
    lock: Mutex<()>,
}

impl TrustKernel {
    /// Kernel over an arbitrary backend
    pub fn new(
        backend: Arc<dyn VaultBackend>,
        fingerprint: Arc<dyn DeviceFingerprint>,
        config: KernelConfig,
    ) -> Self {
        let store = Arc::new(VaultStore::new(
            backend,
            fingerprint.clone(),
            config.io_policy(),
        ));
        let chain = SignatureChain::new(store.clone(), config.max_chain_depth);
        let gate = BlessingGate::new(store.clone(), chain.clone());
        let limits = PropagationLimits {
            policy: config.attenuation,
            max_tier: config.max_tier,
            max_fanout: config.max_fanout,
        };

        Self {
            binder: DeviceBinder::new(store.clone(), fingerprint),
            codec: TrustTokenCodec::new(store.clone(), config.pairing_threshold),
            ledger: PairingLedger::new(store.clone()),
            propagator: MirrorPropagator::new(store.clone(), chain.clone(), gate.clone(), limits),
            reflections: ReflectionLog::new(store.clone()),
            seal: SealKeys::new(store.clone()),
            chain,
            gate,
            store,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Kernel over the vault directory named in `config`
    pub fn open_dir(config: KernelConfig, fingerprint: Arc<dyn DeviceFingerprint>) -> Result<Self> {
        let dir = config
            .require_vault_dir()
            .map_err(|e| TrustError::InvalidRequest(e.to_string()))?;

        let backend = FileBackend::open(dir).map_err(|e| match e {
            StorageError::Locked(path) => TrustError::StorageUnavailable(format!(
                "vault is in use by another process: {}",
                path
            )),
            other => TrustError::StorageUnavailable(other.to_string()),
        })?;

        Ok(Self::new(Arc::new(backend), fingerprint, config))
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Direct access to the encrypted store
    pub fn store(&self) -> &Arc<VaultStore> {
        &self.store
    }

    /// No integrity fault leaves the kernel without tripping the tamper responder
    async fn contain<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(err) if err.is_integrity_fault() => Err(self.store.escalate(err).await),
            other => other,
        }
    }

    /// Checks every operation on a provisioned vault starts with
    ///
    /// The binding must belong to this host, the genesis must exist and the signature file
    /// must carry it under the vault's seal key.
    async fn precheck(&self) -> Result<(DeviceBinding, VaultSignature)> {
        if self.store.is_tombstoned().await? {
            return Err(TrustError::Revoked);
        }
        let binding = self.binder.check_host().await?;
        let genesis = self.chain.genesis().await?;
        self.seal.verify_signature_file(&genesis).await?;
        Ok((binding, genesis))
    }

    /// Create the vault on this device, or return the existing one
    ///
    /// A tombstoned vault is purged and provisioned from scratch.
    pub async fn provision(&self) -> Result<Provisioned> {
        let _guard = self.lock.lock().await;
        let result = self.provision_locked().await;
        self.contain(result).await
    }

    async fn provision_locked(&self) -> Result<Provisioned> {
        if self.store.is_tombstoned().await? {
            warn!("Re-provisioning a revoked vault");
            self.store.tamper().purge().await?;
        }

        self.binder.bind().await?;
        let binding = self.binder.check_host().await?;

        let io = self.store.io();
        if io.read_file(VaultFile::Salt).await?.is_none() {
            io.write_file(
                VaultFile::Salt,
                riven_core::crypto::generate_salt().to_vec(),
            )
            .await?;
        }

        if self.chain.is_provisioned().await? {
            let (binding, genesis) = self.precheck().await?;
            let lineage = self
                .propagator
                .lineage(&genesis.vault_id)
                .await?
                .ok_or_else(|| TrustError::NotFound("genesis lineage".into()))?;
            return Ok(Provisioned {
                binding,
                genesis,
                lineage,
                created: false,
            });
        }

        let now = Utc::now();
        let mut txn = self.store.begin();
        let genesis = self.chain.issue_genesis(&mut txn, binding.device_id)?;
        self.seal.provision(&mut txn, &genesis)?;
        self.gate.stage(
            &mut txn,
            &genesis.vault_id,
            &Blessing::genesis(genesis.signature_hash, now),
            true,
        )?;
        let lineage = self.propagator.stage_root(&mut txn, &genesis, now)?;
        txn.reflect(ReflectionPayload::Provisioned {
            vault_id: genesis.vault_id,
            signature_hash: genesis.signature_hash,
        });
        self.store.commit(txn).await?;

        info!(vault = %genesis.vault_id, signature = %genesis.signature_hash, "Provisioned vault");
        Ok(Provisioned {
            binding,
            genesis,
            lineage,
            created: true,
        })
    }

    /// Run the startup checks and report status
    pub async fn open(&self) -> Result<VaultStatus> {
        let _guard = self.lock.lock().await;
        let result = match self.precheck().await {
            Ok(_) => self.status_inner().await,
            Err(err) => Err(err),
        };
        self.contain(result).await
    }

    pub async fn status(&self) -> Result<VaultStatus> {
        let _guard = self.lock.lock().await;
        let result = self.status_inner().await;
        self.contain(result).await
    }

    /// A vault bound elsewhere is never reported as active here
    async fn status_inner(&self) -> Result<VaultStatus> {
        if let Some(tombstone) = self.store.tamper().tombstone().await? {
            return Ok(VaultStatus {
                state: VaultState::Revoked,
                device_id: None,
                vault_id: None,
                genesis: None,
                revoked_at: Some(tombstone.revoked_at),
                reflections: 0,
            });
        }

        let binding = self.store.binding().await?;
        let has_salt = self.store.io().read_file(VaultFile::Salt).await?.is_some();
        let genesis = if binding.is_some() && has_salt {
            self.binder.check_host().await?;
            match self.chain.genesis().await {
                Ok(genesis) => Some(genesis),
                Err(TrustError::NotProvisioned) => None,
                Err(err) => return Err(err),
            }
        } else {
            None
        };

        Ok(VaultStatus {
            state: if genesis.is_some() {
                VaultState::Active
            } else {
                VaultState::Unprovisioned
            },
            device_id: binding.map(|b| b.device_id),
            vault_id: genesis.as_ref().map(|g| g.vault_id),
            genesis: genesis.as_ref().map(|g| g.signature_hash),
            revoked_at: None,
            reflections: self.store.reflection_keys().await?.len(),
        })
    }

    /// The genesis signature
    pub async fn genesis(&self) -> Result<VaultSignature> {
        let _guard = self.lock.lock().await;
        let result = self.precheck().await.map(|(_, genesis)| genesis);
        self.contain(result).await
    }

    /// The raw signature file
    pub async fn signature_file(&self) -> Result<Vec<u8>> {
        let _guard = self.lock.lock().await;
        let result = self.signature_file_locked().await;
        self.contain(result).await
    }

    async fn signature_file_locked(&self) -> Result<Vec<u8>> {
        self.precheck().await?;
        self.seal
            .signature_file()
            .await?
            .ok_or_else(|| TrustError::NotFound("signature file".into()))
    }

    /// Whether `identity` may spawn; a revoked vault denies everyone
    pub async fn request_blessing_check(&self, identity: &VaultId) -> Result<PropagationDecision> {
        let _guard = self.lock.lock().await;
        let result = self.blessing_check_locked(identity).await;
        self.contain(result).await
    }

    async fn blessing_check_locked(&self, identity: &VaultId) -> Result<PropagationDecision> {
        if self.store.is_tombstoned().await? {
            return Ok(PropagationDecision::Deny(DenyReason::Revoked));
        }
        self.precheck().await?;
        self.gate.check_propagation(identity).await
    }

    /// Current blessing of `identity`
    pub async fn blessing(&self, identity: &VaultId) -> Result<Blessing> {
        let _guard = self.lock.lock().await;
        let result = self.blessing_locked(identity).await;
        self.contain(result).await
    }

    async fn blessing_locked(&self, identity: &VaultId) -> Result<Blessing> {
        if !self.store.is_tombstoned().await? {
            self.precheck().await?;
        }
        self.gate.blessing(identity).await
    }

    /// Append an externally supplied payload to the reflection log
    pub async fn submit_reflection(&self, body: serde_json::Value) -> Result<u64> {
        if body.is_null() {
            return Err(TrustError::InvalidRequest("payload must not be null".into()));
        }

        let _guard = self.lock.lock().await;
        let result = match self.precheck().await {
            Ok(_) => {
                self.reflections
                    .append(ReflectionPayload::Submitted { body })
                    .await
            }
            Err(err) => Err(err),
        };
        self.contain(result).await
    }

    /// Spawn a mirror below `parent`, or below the genesis vault if `parent` is `None`
    pub async fn spawn_mirror_request(
        &self,
        parent: Option<VaultId>,
        config: &MirrorConfig,
        idempotency_key: &str,
    ) -> Result<MirrorLineage> {
        let _guard = self.lock.lock().await;
        let result = self.spawn_locked(parent, config, idempotency_key).await;
        self.contain(result).await
    }

    async fn spawn_locked(
        &self,
        parent: Option<VaultId>,
        config: &MirrorConfig,
        idempotency_key: &str,
    ) -> Result<MirrorLineage> {
        let (_, genesis) = self.precheck().await?;

        let parent = parent.unwrap_or(genesis.vault_id);
        let lineage = self
            .propagator
            .lineage(&parent)
            .await?
            .ok_or(TrustError::BlessingDenied(DenyReason::UnknownIdentity))?;

        self.propagator
            .spawn_mirror(&lineage, config, idempotency_key, Utc::now())
            .await
    }

    pub async fn issue_token(&self, label: TokenLabel) -> Result<IssuedToken> {
        self.issue_token_at(label, Utc::now()).await
    }

    /// Issue a token for this device and vault, recorded in the issuance registry
    pub async fn issue_token_at(&self, label: TokenLabel, at: DateTime<Utc>) -> Result<IssuedToken> {
        let _guard = self.lock.lock().await;
        let result = self.issue_locked(label, at).await;
        self.contain(result).await
    }

    async fn issue_locked(&self, label: TokenLabel, at: DateTime<Utc>) -> Result<IssuedToken> {
        let (binding, genesis) = self.precheck().await?;

        let token = TrustToken::new(binding.device_id, &genesis, label, at);
        let mut txn = self.store.begin();
        let hash = self.codec.encode(&mut txn, &token)?;
        self.store.commit(txn).await?;

        info!(label = %label, "Issued trust token");
        Ok(IssuedToken {
            token: hash.to_string(),
            token_hash: hash,
            issued_at: token.issued_at,
            label,
        })
    }

    pub async fn verify_token(&self, token: &str, candidate: DeviceId) -> Result<Verification> {
        self.verify_token_at(token, candidate, Utc::now()).await
    }

    /// Verify `token` presented by `candidate` at `now`
    ///
    /// The vault's own device always succeeds without touching the pairing ledger. Another
    /// device is paired if the score meets the threshold and refused otherwise.
    pub async fn verify_token_at(
        &self,
        token: &str,
        candidate: DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Verification> {
        let _guard = self.lock.lock().await;
        let result = self.verify_locked(token, candidate, now).await;
        self.contain(result).await
    }

    async fn verify_locked(
        &self,
        token: &str,
        candidate: DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Verification> {
        let (binding, _) = self.precheck().await?;
        let record = self.codec.decode(token).await?;
        let same_device = self.binder.verify(&candidate).await?;

        let assessment = match self.codec.assess(&record, same_device, now) {
            Ok(assessment) => assessment,
            Err(err) => {
                warn!(device = %candidate, error = %err, "Token verification refused");
                return Err(err);
            }
        };

        match assessment {
            Assessment::SameDevice { score } => Ok(Verification {
                score,
                same_device: true,
                pairing: None,
            }),
            Assessment::CrossDevice { score } => {
                let hash = record.hash()?;
                let pairing = self
                    .ledger
                    .record_pairing(candidate, binding.device_id, hash, score, now)
                    .await?;
                Ok(Verification {
                    score,
                    same_device: false,
                    pairing: Some(pairing),
                })
            }
        }
    }

    /// Most recent pairing of `device`
    pub async fn lookup_pairing(&self, device: &DeviceId) -> Result<PairingRecord> {
        let _guard = self.lock.lock().await;
        let result = match self.precheck().await {
            Ok(_) => self.ledger.lookup(device).await,
            Err(err) => Err(err),
        };
        self.contain(result).await
    }

    /// Cursor over the reflection log; empty once the vault is revoked
    pub async fn replay(&self, device: Option<DeviceId>) -> Result<ReflectionReplay> {
        let _guard = self.lock.lock().await;
        let result = self.replay_locked(device).await;
        self.contain(result).await
    }

    async fn replay_locked(&self, device: Option<DeviceId>) -> Result<ReflectionReplay> {
        if !self.store.is_tombstoned().await? {
            self.precheck().await?;
        }
        self.reflections.replay(device).await
    }

    /// Grant a blessing to `target` on behalf of `authority`
    pub async fn grant(
        &self,
        target: &VaultId,
        authority: &VaultId,
        can_propagate: bool,
    ) -> Result<Blessing> {
        let _guard = self.lock.lock().await;
        let result = match self.precheck().await {
            Ok(_) => {
                self.gate
                    .grant(target, authority, can_propagate, Utc::now())
                    .await
            }
            Err(err) => Err(err),
        };
        self.contain(result).await
    }

    /// Give a paired device an identity below `authority`, initially unblessed
    pub async fn enroll(&self, device: DeviceId, authority: &VaultId) -> Result<MirrorLineage> {
        let _guard = self.lock.lock().await;
        let result = self.enroll_locked(device, authority).await;
        self.contain(result).await
    }

    async fn enroll_locked(&self, device: DeviceId, authority: &VaultId) -> Result<MirrorLineage> {
        self.precheck().await?;

        self.ledger.lookup(&device).await?;
        self.gate
            .check_propagation(authority)
            .await?
            .into_result()?;

        let parent = self
            .propagator
            .lineage(authority)
            .await?
            .ok_or(TrustError::BlessingDenied(DenyReason::UnknownIdentity))?;
        if parent.tier + 1 > self.config.max_tier {
            return Err(TrustError::DepthExceeded {
                max: self.config.max_tier,
            });
        }
        let parent_sig = self
            .chain
            .signature_of(authority)
            .await?
            .ok_or(TrustError::BlessingDenied(DenyReason::UnknownIdentity))?;

        let now = Utc::now();
        let mut txn = self.store.begin();
        let (lineage, _) = self
            .propagator
            .stage_child(
                &mut txn,
                &parent,
                &parent_sig,
                Some(device),
                |_, _| Ok(Blessing::unblessed()),
                now,
            )
            .await?;
        txn.reflect(ReflectionPayload::Spawn {
            mirror_id: lineage.mirror_id,
            parent_id: parent.mirror_id,
            tier: lineage.tier,
            can_propagate: false,
            label: Some(format!("enrolled device {}", device)),
        });
        self.store.commit(txn).await?;

        info!(identity = %lineage.mirror_id, device = %device, "Enrolled paired device");
        Ok(lineage)
    }

    /// Revoke `target` and its lineage subtree on behalf of `authority`
    pub async fn revoke(&self, target: &VaultId, authority: &VaultId) -> Result<Vec<VaultId>> {
        let _guard = self.lock.lock().await;
        let result = self.revoke_locked(target, authority).await;
        self.contain(result).await
    }

    async fn revoke_locked(&self, target: &VaultId, authority: &VaultId) -> Result<Vec<VaultId>> {
        self.precheck().await?;
        let descendants = self.propagator.descendants(target).await?;
        self.gate
            .revoke(target, &descendants, authority, Utc::now())
            .await
    }

    /// Remove a mirror subtree
    pub async fn prune(&self, mirror: &VaultId, authority: &VaultId) -> Result<Vec<VaultId>> {
        let _guard = self.lock.lock().await;
        let result = match self.precheck().await {
            Ok(_) => self.propagator.prune(mirror, authority, Utc::now()).await,
            Err(err) => Err(err),
        };
        self.contain(result).await
    }

    pub async fn lineage(&self, id: &VaultId) -> Result<MirrorLineage> {
        let _guard = self.lock.lock().await;
        let result = self.lineage_locked(id).await;
        self.contain(result).await
    }

    async fn lineage_locked(&self, id: &VaultId) -> Result<MirrorLineage> {
        self.precheck().await?;
        self.propagator
            .lineage(id)
            .await?
            .ok_or_else(|| TrustError::NotFound(format!("mirror {}", id)))
    }

    pub async fn children(&self, id: &VaultId) -> Result<Vec<VaultId>> {
        let _guard = self.lock.lock().await;
        let result = match self.precheck().await {
            Ok(_) => self.propagator.children(id).await,
            Err(err) => Err(err),
        };
        self.contain(result).await
    }

    /// Hand the vault off to `target`, a device paired with this one
    ///
    /// Runs on the bound host: a copy of the vault cannot pass the host check anywhere else.
    /// Only the genesis identity, still blessed and propagating, may authorise the move, and
    /// `target` must hold a pairing record. Every record is re-encrypted for `target` in one
    /// batch, after which the vault belongs to `target` and this host is foreign to it.
    pub async fn rebind(&self, target: DeviceId, authority: &VaultId) -> Result<DeviceBinding> {
        let _guard = self.lock.lock().await;
        let result = self.rebind_locked(target, authority).await;
        self.contain(result).await
    }

    async fn rebind_locked(&self, target: DeviceId, authority: &VaultId) -> Result<DeviceBinding> {
        let (current, genesis) = self.precheck().await?;
        if *authority != genesis.vault_id {
            return Err(TrustError::InvalidTransition(
                "only the genesis identity may rebind the vault".into(),
            ));
        }
        self.gate
            .check_propagation(authority)
            .await?
            .into_result()?;

        if current.matches(&target) {
            return Err(TrustError::AlreadyBound(current.device_id));
        }
        let pairing = self.ledger.lookup(&target).await?;

        let next = DeviceBinding::new(target);
        warn!(
            previous = %current.device_id,
            current = %next.device_id,
            score = pairing.trust_score,
            "Handing vault off to a paired device"
        );
        self.store
            .rekey(
                &next,
                ReflectionPayload::Rebound {
                    previous: current.device_id,
                    current: next.device_id,
                },
            )
            .await?;
        Ok(next)
    }
}
