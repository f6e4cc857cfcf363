//! Kernel and plane configuration
//!
//! Both structs have defaults and a `from_env()` constructor reading `RIVEN_*` variables.

use riven_core::lineage::DEFAULT_MAX_TIER;
use riven_core::signature::DEFAULT_MAX_CHAIN_DEPTH;
use riven_core::token::DEFAULT_PAIRING_THRESHOLD;
use riven_core::AttenuationPolicy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::storage::IoPolicy;

/// Configuration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is not a valid value: {value}")]
    Invalid { var: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

fn var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var: name, value }),
    }
}

/// Limits and storage settings of one vault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
    /// Directory of the on-disk vault
    pub vault_dir: Option<PathBuf>,

    /// Longest allowed signature chain, counted in links from genesis
    pub max_chain_depth: u32,

    /// Highest tier a mirror may be spawned at
    pub max_tier: u32,

    /// Minimum score for cross-device verification
    pub pairing_threshold: u8,

    pub attenuation: AttenuationPolicy,

    /// Maximum direct children per mirror, unbounded if unset
    pub max_fanout: Option<u32>,

    pub io_timeout: Duration,
    pub storage_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let io = IoPolicy::default();
        Self {
            vault_dir: None,
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
            max_tier: DEFAULT_MAX_TIER,
            pairing_threshold: DEFAULT_PAIRING_THRESHOLD,
            attenuation: AttenuationPolicy::default(),
            max_fanout: None,
            io_timeout: io.timeout,
            storage_retries: io.retries,
            retry_backoff: io.backoff,
        }
    }
}

impl KernelConfig {
    /// Defaults overridden by `RIVEN_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.vault_dir = var("RIVEN_VAULT_DIR").map(PathBuf::from);
        if let Some(depth) = parse_var("RIVEN_MAX_DEPTH")? {
            config.max_chain_depth = depth;
            config.max_tier = depth;
        }
        if let Some(threshold) = parse_var::<u8>("RIVEN_PAIRING_THRESHOLD")? {
            if threshold > riven_core::token::MAX_SCORE {
                return Err(ConfigError::Invalid {
                    var: "RIVEN_PAIRING_THRESHOLD",
                    value: threshold.to_string(),
                });
            }
            config.pairing_threshold = threshold;
        }
        if let Some(policy) = parse_var("RIVEN_ATTENUATION")? {
            config.attenuation = policy;
        }
        config.max_fanout = parse_var("RIVEN_MAX_FANOUT")?;
        if let Some(ms) = parse_var::<u64>("RIVEN_IO_TIMEOUT_MS")? {
            config.io_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var("RIVEN_STORAGE_RETRIES")? {
            config.storage_retries = retries;
        }

        Ok(config)
    }

    /// Storage policy derived from this config
    pub fn io_policy(&self) -> IoPolicy {
        IoPolicy {
            timeout: self.io_timeout,
            retries: self.storage_retries,
            backoff: self.retry_backoff,
        }
    }

    /// The vault directory, which file-backed kernels require
    pub fn require_vault_dir(&self) -> Result<&PathBuf, ConfigError> {
        self.vault_dir
            .as_ref()
            .ok_or(ConfigError::Missing("RIVEN_VAULT_DIR"))
    }
}

/// HTTP plane settings
#[derive(Debug, Clone, Default)]
pub struct PlaneConfig {
    /// Name reported by `/ready`
    pub name: Option<String>,

    /// Public URL of this plane
    pub public_url: Option<String>,

    pub port: u16,
}

impl PlaneConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            name: var("RIVEN_PLANE_NAME"),
            public_url: var("RIVEN_PUBLIC_URL"),
            port: parse_var("RIVEN_PLANE_PORT")?.unwrap_or(8080),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.max_chain_depth, 32);
        assert_eq!(config.pairing_threshold, 50);
        assert_eq!(config.attenuation, AttenuationPolicy::Inherit);
        assert_eq!(config.io_policy(), IoPolicy::default());
        assert!(config.require_vault_dir().is_err());
    }

    // Environment variables are process-wide, so every env case lives in this one test
    #[test]
    fn test_from_env() {
        env::set_var("RIVEN_MAX_DEPTH", "8");
        env::set_var("RIVEN_ATTENUATION", "tier-limit:3");
        env::set_var("RIVEN_MAX_FANOUT", "4");
        env::set_var("RIVEN_IO_TIMEOUT_MS", "250");
        let config = KernelConfig::from_env().unwrap();
        assert_eq!(config.max_chain_depth, 8);
        assert_eq!(config.max_tier, 8);
        assert_eq!(
            config.attenuation,
            AttenuationPolicy::TierLimit {
                max_propagating_tier: 3
            }
        );
        assert_eq!(config.max_fanout, Some(4));
        assert_eq!(config.io_timeout, Duration::from_millis(250));

        env::set_var("RIVEN_PAIRING_THRESHOLD", "101");
        assert!(matches!(
            KernelConfig::from_env(),
            Err(ConfigError::Invalid { var: "RIVEN_PAIRING_THRESHOLD", .. })
        ));

        env::set_var("RIVEN_PAIRING_THRESHOLD", "lots");
        assert!(KernelConfig::from_env().is_err());

        for name in [
            "RIVEN_MAX_DEPTH",
            "RIVEN_ATTENUATION",
            "RIVEN_MAX_FANOUT",
            "RIVEN_IO_TIMEOUT_MS",
            "RIVEN_PAIRING_THRESHOLD",
        ] {
            env::remove_var(name);
        }
    }
}
