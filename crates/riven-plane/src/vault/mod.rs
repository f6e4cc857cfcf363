//! Encrypted vault store
//!
//! Every record is sealed with a key derived from the live host fingerprint and the vault
//! salt. Keys are derived per call and never cached. The stored device binding must name the
//! host before any key is derived, so a vault copied to another device, or a binding edited
//! underneath the store, fails the very next read and is handed to the tamper responder.
//!
//! Every mutation appends to the reflection log within the same atomic batch.

pub mod binder;

pub use binder::{DeviceBinder, DeviceFingerprint, FixedFingerprint, HostFingerprint};

use chrono::{DateTime, Utc};
use riven_core::crypto::{RECORD_KEY_CONTEXT, REFLECTION_KEY_CONTEXT};
use riven_core::reflection::payload_hash;
use riven_core::{
    DeviceBinding, DeviceId, IntegrityFault, ReflectionEntry, ReflectionPayload, Result, SigPrefix,
    TrustError, VaultCipher,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::tamper::TamperResponder;
use crate::storage::{BoundedBackend, IoPolicy, VaultBackend, VaultFile, WriteBatch};

/// Key prefix of reflection entries
pub const REFLECTION_PREFIX: &str = "reflection/entry/";

const REFLECTION_HEAD: &str = "reflection/head";

/// Storage key of the reflection entry with sequence `sequence`
pub fn reflection_key(sequence: u64) -> String {
    format!("{}{:020}", REFLECTION_PREFIX, sequence)
}

/// Position of the end of the reflection log
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ReflectionHead {
    sequence: u64,
    timestamp: Option<DateTime<Utc>>,
    vault_sig_prefix: SigPrefix,
}

impl ReflectionHead {
    fn empty() -> Self {
        Self {
            sequence: 0,
            timestamp: None,
            vault_sig_prefix: SigPrefix::default(),
        }
    }
}

struct VaultKeys {
    device_id: DeviceId,
    records: VaultCipher,
    reflections: VaultCipher,
}

impl VaultKeys {
    fn derive(device_id: DeviceId, salt: &[u8]) -> Self {
        Self {
            device_id,
            records: VaultCipher::derive(RECORD_KEY_CONTEXT, &device_id, salt),
            reflections: VaultCipher::derive(REFLECTION_KEY_CONTEXT, &device_id, salt),
        }
    }
}

/// A set of writes committed together with their reflection entries
#[derive(Debug, Default)]
pub struct VaultTxn {
    records: Vec<(String, Option<Vec<u8>>)>,
    files: Vec<(VaultFile, Vec<u8>)>,
    reflections: Vec<ReflectionPayload>,
    signer: Option<SigPrefix>,
}

impl VaultTxn {
    /// Write a record
    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>) {
        let key = key.into();
        self.reflections
            .push(ReflectionPayload::Put { key: key.clone() });
        self.records.push((key, Some(value)));
    }

    /// Write a record as JSON
    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, bytes);
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.reflections
            .push(ReflectionPayload::Delete { key: key.clone() });
        self.records.push((key, None));
    }

    /// Write a plain vault file in the same batch
    pub fn write_file(&mut self, file: VaultFile, bytes: Vec<u8>) {
        self.files.push((file, bytes));
    }

    /// Append an explicit reflection entry
    pub fn reflect(&mut self, payload: ReflectionPayload) {
        self.reflections.push(payload);
    }

    /// Stamp reflection entries with this signature prefix from now on
    pub fn sign_with(&mut self, prefix: SigPrefix) {
        self.signer = Some(prefix);
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.files.is_empty() && self.reflections.is_empty()
    }
}

/// Encrypted key-value store for one vault
#[derive(Debug)]
pub struct VaultStore {
    io: BoundedBackend,
    fingerprint: Arc<dyn DeviceFingerprint>,
    tamper: Arc<TamperResponder>,
    commit_lock: Mutex<()>,
}

impl VaultStore {
    pub fn new(
        backend: Arc<dyn VaultBackend>,
        fingerprint: Arc<dyn DeviceFingerprint>,
        policy: IoPolicy,
    ) -> Self {
        let io = BoundedBackend::new(backend, policy);
        let tamper = Arc::new(TamperResponder::new(io.clone()));
        Self {
            io,
            fingerprint,
            tamper,
            commit_lock: Mutex::new(()),
        }
    }

    /// Raw, bounded access to the backend
    pub fn io(&self) -> &BoundedBackend {
        &self.io
    }

    pub fn tamper(&self) -> &Arc<TamperResponder> {
        &self.tamper
    }

    /// Route an error through the tamper responder
    pub async fn escalate(&self, err: TrustError) -> TrustError {
        self.tamper.respond(err).await
    }

    async fn checked<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Err(err) if err.is_integrity_fault() => Err(self.escalate(err).await),
            other => other,
        }
    }

    pub async fn is_tombstoned(&self) -> Result<bool> {
        self.tamper.is_tombstoned().await
    }

    async fn ensure_live(&self) -> Result<()> {
        if self.is_tombstoned().await? {
            return Err(TrustError::Revoked);
        }
        Ok(())
    }

    async fn load_binding(&self) -> Result<Option<DeviceBinding>> {
        match self.io.read_file(VaultFile::Binding).await? {
            None => Ok(None),
            Some(bytes) => DeviceBinding::from_bytes(&bytes)
                .map(Some)
                .map_err(|_| IntegrityFault::BindingUnreadable.into()),
        }
    }

    /// The stored device binding, if any
    pub async fn binding(&self) -> Result<Option<DeviceBinding>> {
        let result = self.load_binding().await;
        self.checked(result).await
    }

    /// Keys of this host; the stored binding must name it
    async fn keys(&self) -> Result<VaultKeys> {
        let binding = self.load_binding().await?.ok_or(TrustError::NotProvisioned)?;
        let host = self.fingerprint.device_id()?;
        if !binding.matches(&host) {
            return Err(IntegrityFault::BindingMismatch.into());
        }
        self.keys_for(host).await
    }

    async fn keys_for(&self, device_id: DeviceId) -> Result<VaultKeys> {
        let salt = self
            .io
            .read_file(VaultFile::Salt)
            .await?
            .ok_or(IntegrityFault::KeyMaterialMissing)?;
        Ok(VaultKeys::derive(device_id, &salt))
    }

    async fn open_record(&self, keys: &VaultKeys, key: &str) -> Result<Option<Vec<u8>>> {
        match self.io.read_record(key).await? {
            None => Ok(None),
            Some(sealed) => keys.records.open(key.as_bytes(), &sealed).map(Some),
        }
    }

    async fn get_inner(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_live().await?;
        let keys = self.keys().await?;
        self.open_record(&keys, key).await
    }

    /// Read and decrypt a record
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.get_optional(key)
            .await?
            .ok_or_else(|| TrustError::NotFound(key.to_string()))
    }

    /// Read and decrypt a record that may not exist
    pub async fn get_optional(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self.get_inner(key).await;
        self.checked(result).await
    }

    /// Read a JSON record; a record that decrypts but does not parse is corrupt
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(bytes) = self.get_optional(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(self
                .escalate(IntegrityFault::CorruptRecord(key.to_string()).into())
                .await),
        }
    }

    /// Keys with the given prefix, sorted
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_live().await?;
        self.io.list_records(prefix).await
    }

    /// Write one record
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut txn = self.begin();
        txn.put(key, value);
        self.commit(txn).await.map(|_| ())
    }

    /// Delete one record
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut txn = self.begin();
        txn.delete(key);
        self.commit(txn).await.map(|_| ())
    }

    pub fn begin(&self) -> VaultTxn {
        VaultTxn::default()
    }

    /// Seal and apply a transaction in one batch
    ///
    /// Returns the sequence numbers of the reflection entries appended.
    pub async fn commit(&self, txn: VaultTxn) -> Result<Vec<u64>> {
        let result = self.commit_inner(txn).await;
        self.checked(result).await
    }

    async fn commit_inner(&self, txn: VaultTxn) -> Result<Vec<u64>> {
        let _guard = self.commit_lock.lock().await;
        self.ensure_live().await?;

        let keys = self.keys().await?;
        let mut head = self.head(&keys).await?;
        if let Some(prefix) = txn.signer {
            head.vault_sig_prefix = prefix;
        }

        let mut batch = WriteBatch::new();
        for (key, value) in txn.records {
            match value {
                Some(value) => {
                    let sealed = keys.records.seal(key.as_bytes(), &value)?;
                    batch.put(key, sealed);
                }
                None => {
                    batch.delete(key);
                }
            }
        }
        for (file, bytes) in txn.files {
            batch.write_file(file, bytes);
        }

        let mut sequences = Vec::with_capacity(txn.reflections.len());
        for payload in &txn.reflections {
            let entry = seal_reflection(&keys, &mut head, payload)?;
            let key = reflection_key(entry.sequence);
            let sealed = keys.records.seal(key.as_bytes(), &entry.to_bytes()?)?;
            batch.put(key, sealed);
            sequences.push(entry.sequence);
        }

        let sealed_head = keys
            .records
            .seal(REFLECTION_HEAD.as_bytes(), &serde_json::to_vec(&head)?)?;
        batch.put(REFLECTION_HEAD, sealed_head);

        debug!(ops = batch.len(), reflections = sequences.len(), "Committing vault batch");
        self.io.apply(batch).await?;
        Ok(sequences)
    }

    async fn head(&self, keys: &VaultKeys) -> Result<ReflectionHead> {
        match self.open_record(keys, REFLECTION_HEAD).await? {
            None => Ok(ReflectionHead::empty()),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|_| IntegrityFault::CorruptRecord(REFLECTION_HEAD.into()).into()),
        }
    }

    /// Keys of every reflection entry in sequence order; empty once tombstoned
    pub async fn reflection_keys(&self) -> Result<Vec<String>> {
        if self.is_tombstoned().await? {
            return Ok(Vec::new());
        }
        self.io.list_records(REFLECTION_PREFIX).await
    }

    /// Decrypt one reflection entry and check its payload hash
    pub async fn read_reflection(&self, key: &str) -> Result<(ReflectionEntry, ReflectionPayload)> {
        let result = self.read_reflection_inner(key).await;
        self.checked(result).await
    }

    async fn read_reflection_inner(&self, key: &str) -> Result<(ReflectionEntry, ReflectionPayload)> {
        self.ensure_live().await?;
        let keys = self.keys().await?;
        let bytes = self
            .open_record(&keys, key)
            .await?
            .ok_or_else(|| TrustError::NotFound(key.to_string()))?;

        let entry = ReflectionEntry::from_bytes(&bytes)
            .map_err(|_| TrustError::from(IntegrityFault::CorruptRecord(key.to_string())))?;
        let plaintext = keys
            .reflections
            .open(key.as_bytes(), &entry.payload_ciphertext)?;
        if !entry.payload_matches(&plaintext) {
            return Err(IntegrityFault::ReflectionHash(entry.sequence).into());
        }

        let payload = ReflectionPayload::from_bytes(&plaintext)
            .map_err(|_| TrustError::from(IntegrityFault::CorruptRecord(key.to_string())))?;
        Ok((entry, payload))
    }

    /// Re-encrypt every record for another device and store its binding, in one batch
    ///
    /// Runs on the bound host, which can no longer open the vault afterwards. `payload` is
    /// appended to the log under the new keys.
    pub async fn rekey(&self, binding: &DeviceBinding, payload: ReflectionPayload) -> Result<u64> {
        let result = self.rekey_inner(binding, payload).await;
        self.checked(result).await
    }

    async fn rekey_inner(&self, binding: &DeviceBinding, payload: ReflectionPayload) -> Result<u64> {
        let _guard = self.commit_lock.lock().await;
        self.ensure_live().await?;

        let old = self.keys().await?;
        let new = self.keys_for(binding.device_id).await?;
        let mut head = self.head(&old).await?;

        let mut batch = WriteBatch::new();
        for key in self.io.list_records("").await? {
            let Some(plaintext) = self.open_record(&old, &key).await? else {
                continue;
            };

            let plaintext = if key.starts_with(REFLECTION_PREFIX) {
                let mut entry = ReflectionEntry::from_bytes(&plaintext)
                    .map_err(|_| TrustError::from(IntegrityFault::CorruptRecord(key.clone())))?;
                let inner = old
                    .reflections
                    .open(key.as_bytes(), &entry.payload_ciphertext)?;
                entry.payload_ciphertext = new.reflections.seal(key.as_bytes(), &inner)?;
                entry.to_bytes()?
            } else {
                plaintext
            };

            let sealed = new.records.seal(key.as_bytes(), &plaintext)?;
            batch.put(key, sealed);
        }

        let entry = seal_reflection(&new, &mut head, &payload)?;
        let key = reflection_key(entry.sequence);
        let sealed = new.records.seal(key.as_bytes(), &entry.to_bytes()?)?;
        batch.put(key, sealed);

        let sealed_head = new
            .records
            .seal(REFLECTION_HEAD.as_bytes(), &serde_json::to_vec(&head)?)?;
        batch
            .put(REFLECTION_HEAD, sealed_head)
            .write_file(VaultFile::Binding, binding.to_bytes()?);

        self.io.apply(batch).await?;
        Ok(entry.sequence)
    }
}

fn seal_reflection(
    keys: &VaultKeys,
    head: &mut ReflectionHead,
    payload: &ReflectionPayload,
) -> Result<ReflectionEntry> {
    let sequence = head.sequence + 1;
    let now = Utc::now();
    // Never step backwards, even if the wall clock does
    let timestamp = match head.timestamp {
        Some(previous) if previous > now => previous,
        _ => now,
    };

    let key = reflection_key(sequence);
    let plaintext = payload.to_bytes()?;
    let entry = ReflectionEntry {
        sequence,
        timestamp,
        device_id: keys.device_id,
        vault_sig_prefix: head.vault_sig_prefix,
        payload_ciphertext: keys.reflections.seal(key.as_bytes(), &plaintext)?,
        payload_hash: payload_hash(&plaintext),
    };

    head.sequence = sequence;
    head.timestamp = Some(timestamp);
    Ok(entry)
}
