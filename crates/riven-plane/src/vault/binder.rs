//! Device binding
//!
//! The binder owns the vault's [`DeviceBinding`]: created once from the host fingerprint,
//! never overwritten by `bind`, and compared in constant time. The only way to move a binding
//! is the kernel's authorised hand-off, which re-seals every record for the new device.

use riven_core::{DeviceBinding, DeviceId, IntegrityFault, Result, TrustError};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::VaultStore;
use crate::storage::VaultFile;

const FINGERPRINT_DOMAIN: &[u8] = b"cal-riven device fingerprint v1";

/// Source of the current host's device identity
pub trait DeviceFingerprint: Send + Sync + Debug {
    fn device_id(&self) -> Result<DeviceId>;
}

/// Fingerprint of the machine this process runs on
///
/// Hashes the first machine id found, falling back to the hostname, and keeps 128 bits.
#[derive(Debug, Clone)]
pub struct HostFingerprint {
    sources: Vec<PathBuf>,
}

impl HostFingerprint {
    pub fn new() -> Self {
        Self {
            sources: vec![
                PathBuf::from("/etc/machine-id"),
                PathBuf::from("/var/lib/dbus/machine-id"),
                PathBuf::from("/etc/hostname"),
            ],
        }
    }

    /// Read the identity from custom paths instead
    pub fn with_sources(sources: Vec<PathBuf>) -> Self {
        Self { sources }
    }

    fn raw_identity(&self) -> Option<String> {
        self.sources
            .iter()
            .filter_map(|path| std::fs::read_to_string(path).ok())
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
    }
}

impl Default for HostFingerprint {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFingerprint for HostFingerprint {
    fn device_id(&self) -> Result<DeviceId> {
        let raw = self
            .raw_identity()
            .ok_or_else(|| TrustError::NotFound("host machine identity".into()))?;

        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(raw.as_bytes());
        let digest = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Ok(DeviceId::from_bytes(id))
    }
}

/// A fixed identity, for tests and for acting as another device
#[derive(Debug, Clone, Copy)]
pub struct FixedFingerprint(pub DeviceId);

impl DeviceFingerprint for FixedFingerprint {
    fn device_id(&self) -> Result<DeviceId> {
        Ok(self.0)
    }
}

/// Creates and checks the vault's device binding
#[derive(Debug, Clone)]
pub struct DeviceBinder {
    store: Arc<VaultStore>,
    fingerprint: Arc<dyn DeviceFingerprint>,
}

impl DeviceBinder {
    pub fn new(store: Arc<VaultStore>, fingerprint: Arc<dyn DeviceFingerprint>) -> Self {
        Self { store, fingerprint }
    }

    /// Identity of the host right now
    pub fn host_device(&self) -> Result<DeviceId> {
        self.fingerprint.device_id()
    }

    /// Stored binding, if any
    pub async fn current(&self) -> Result<Option<DeviceBinding>> {
        self.store.binding().await
    }

    /// Bind the vault to this host; returns an existing binding unchanged
    pub async fn bind(&self) -> Result<DeviceBinding> {
        if let Some(existing) = self.current().await? {
            return Ok(existing);
        }

        let binding = DeviceBinding::new(self.host_device()?);
        self.store
            .io()
            .write_file(VaultFile::Binding, binding.to_bytes()?)
            .await?;

        info!(device = %binding.device_id, "Bound vault to device");
        Ok(binding)
    }

    /// Constant-time check of a candidate against the stored binding
    pub async fn verify(&self, candidate: &DeviceId) -> Result<bool> {
        Ok(self
            .current()
            .await?
            .map(|binding| binding.matches(candidate))
            .unwrap_or(false))
    }

    /// The stored binding, which must belong to this host
    ///
    /// A binding for another device is an integrity fault.
    pub async fn check_host(&self) -> Result<DeviceBinding> {
        let binding = self.current().await?.ok_or(TrustError::NotProvisioned)?;
        let host = self.host_device()?;

        if !binding.matches(&host) {
            return Err(self
                .store
                .escalate(IntegrityFault::BindingMismatch.into())
                .await);
        }
        Ok(binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IoPolicy, MemoryBackend};

    fn binder(device: DeviceId) -> DeviceBinder {
        let fingerprint: Arc<dyn DeviceFingerprint> = Arc::new(FixedFingerprint(device));
        let store = Arc::new(VaultStore::new(
            Arc::new(MemoryBackend::new()),
            fingerprint.clone(),
            IoPolicy::default(),
        ));
        DeviceBinder::new(store, fingerprint)
    }

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let device = DeviceId::generate();
        let binder = binder(device);

        let first = binder.bind().await.unwrap();
        let second = binder.bind().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.device_id, device);
    }

    #[tokio::test]
    async fn test_check_host_rejects_foreign_binding() {
        let binder = binder(DeviceId::generate());
        binder.bind().await.unwrap();

        let thief = DeviceBinder::new(
            binder.store.clone(),
            Arc::new(FixedFingerprint(DeviceId::generate())),
        );
        let err = thief.check_host().await.unwrap_err();
        assert!(matches!(err, TrustError::TrustCheckFailed));
        assert!(binder.store.is_tombstoned().await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_candidates() {
        let device = DeviceId::generate();
        let binder = binder(device);

        assert!(!binder.verify(&device).await.unwrap());
        binder.bind().await.unwrap();
        assert!(binder.verify(&device).await.unwrap());
        assert!(!binder.verify(&DeviceId::generate()).await.unwrap());
    }

    #[test]
    fn test_host_fingerprint_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine-id");
        std::fs::write(&path, "0123456789abcdef\n").unwrap();

        let fingerprint = HostFingerprint::with_sources(vec![path]);
        assert_eq!(
            fingerprint.device_id().unwrap(),
            fingerprint.device_id().unwrap()
        );
    }
}
