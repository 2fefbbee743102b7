//! Coordinator configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use tecdsa_core::mta::MIN_MODULUS_BITS;
use tecdsa_core::sign::AggregateOptions;

use crate::{CeremonyError, Result};

/// Longest accepted round timeout: one week
pub const MAX_ROUND_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// What to do when a participant submits twice in one round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Identical resubmission is a no-op, a different one is rejected
    #[default]
    IgnoreIdentical,
    /// Every resubmission is rejected
    Reject,
}

/// Coordinator settings, loadable from JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Signatures require this many devices
    pub threshold: usize,
    /// Devices taking part in each DKG
    pub total_signers: usize,
    /// Seconds each round stays open
    pub round_timeout_secs: u64,
    /// Resubmission handling
    pub duplicate_policy: DuplicatePolicy,
    /// Shared secret required to enroll, if set
    pub enrollment_key: Option<String>,
    /// Enrollment cap
    pub max_devices: usize,
    /// EIP-155 chain id for `v`
    pub chain_id: Option<u64>,
    /// Normalize `s` to the lower half of the order
    pub low_s: bool,
    /// Target identity used when `start_dkg` gets none
    pub default_target: String,
    /// Smallest Paillier modulus accepted at enrollment
    pub min_paillier_bits: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            threshold: tecdsa_core::DEFAULT_THRESHOLD,
            total_signers: tecdsa_core::DEFAULT_SIGNERS,
            round_timeout_secs: 300,
            duplicate_policy: DuplicatePolicy::default(),
            enrollment_key: None,
            max_devices: 16,
            chain_id: None,
            low_s: true,
            default_target: "default".to_string(),
            min_paillier_bits: MIN_MODULUS_BITS,
        }
    }
}

impl CoordinatorConfig {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CeremonyError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Check the settings are coherent
    pub fn validate(&self) -> Result<()> {
        if self.threshold < 1 || self.threshold > self.total_signers {
            return Err(CeremonyError::InvalidConfig(format!(
                "threshold {} must be in 1..={}",
                self.threshold, self.total_signers
            )));
        }
        if self.max_devices < self.total_signers {
            return Err(CeremonyError::InvalidConfig(format!(
                "max_devices {} is below total_signers {}",
                self.max_devices, self.total_signers
            )));
        }
        if self.min_paillier_bits < MIN_MODULUS_BITS {
            return Err(CeremonyError::InvalidConfig(format!(
                "min_paillier_bits must be at least {}",
                MIN_MODULUS_BITS
            )));
        }
        if self.round_timeout_secs == 0 || self.round_timeout_secs > MAX_ROUND_TIMEOUT_SECS {
            return Err(CeremonyError::InvalidConfig(format!(
                "round_timeout_secs {} must be in 1..={}",
                self.round_timeout_secs, MAX_ROUND_TIMEOUT_SECS
            )));
        }
        if self.default_target.is_empty() {
            return Err(CeremonyError::InvalidConfig(
                "default_target is empty".into(),
            ));
        }
        Ok(())
    }

    /// Round length as a chrono duration
    pub fn round_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.round_timeout_secs.min(MAX_ROUND_TIMEOUT_SECS) as i64)
    }

    /// Signature encoding options
    pub fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            low_s: self.low_s,
            chain_id: self.chain_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = CoordinatorConfig::from_json(r#"{ "threshold": 2, "chain_id": 1 }"#).unwrap();
        assert_eq!(config.threshold, 2);
        assert_eq!(config.total_signers, 5);
        assert_eq!(config.chain_id, Some(1));
        assert_eq!(config.duplicate_policy, DuplicatePolicy::IgnoreIdentical);
        assert!(config.low_s);
    }

    #[test]
    fn test_rejects_incoherent_settings() {
        assert!(CoordinatorConfig::from_json(r#"{ "threshold": 6 }"#).is_err());
        assert!(CoordinatorConfig::from_json(r#"{ "threshold": 0 }"#).is_err());
        assert!(CoordinatorConfig::from_json(r#"{ "max_devices": 3 }"#).is_err());
        assert!(CoordinatorConfig::from_json(r#"{ "min_paillier_bits": 1024 }"#).is_err());
        assert!(CoordinatorConfig::from_json(r#"{ "duplicate_policy": "overwrite" }"#).is_err());
        assert!(CoordinatorConfig::from_json(r#"{ "round_timeout_secs": 0 }"#).is_err());
        assert!(CoordinatorConfig::from_json(
            r#"{ "round_timeout_secs": 18446744073709551615 }"#
        )
        .is_err());
        let week = CoordinatorConfig::from_json(r#"{ "round_timeout_secs": 604800 }"#).unwrap();
        assert_eq!(week.round_timeout(), chrono::Duration::days(7));

        let reject = CoordinatorConfig::from_json(r#"{ "duplicate_policy": "reject" }"#).unwrap();
        assert_eq!(reject.duplicate_policy, DuplicatePolicy::Reject);
    }
}
