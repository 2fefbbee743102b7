//! Error types for threshold ECDSA operations

use crate::ParticipantId;
use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while generating, verifying or combining protocol data
#[derive(Debug, Error)]
pub enum Error {
    /// Threshold outside `1..=total`
    #[error("Invalid threshold: {threshold} of {total}")]
    InvalidThreshold { threshold: usize, total: usize },

    /// Invalid configuration or input shape
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Share index 0, duplicated, or outside the participant set
    #[error("Invalid share index: {0}")]
    InvalidShareIndex(u32),

    /// Feldman check of a received share failed
    #[error("Share from {sender} failed Feldman verification")]
    ShareVerificationFailed { sender: ParticipantId },

    /// A zero-knowledge range proof did not verify
    #[error("Range proof from {prover} failed verification")]
    RangeProofFailed { prover: ParticipantId },

    /// Message verification failed
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// `r` evaluated to zero
    #[error("Degenerate nonce point: r = 0")]
    DegenerateR,

    /// `s` evaluated to zero or the self-check rejected the signature
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Group key derived in this ceremony differs from the persisted one
    #[error("Group key mismatch for target {0}")]
    GroupKeyMismatch(String),

    /// Malformed key, signature or request envelope
    #[error("Authorization failed: {0}")]
    Authorization(String),

    /// Missing local state for a ceremony, session or target
    #[error("Missing state: {0}")]
    MissingState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Key store I/O failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether this error means another party cheated or the protocol
    /// arithmetic broke, which is fatal to the ceremony or session.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::ShareVerificationFailed { .. }
                | Error::RangeProofFailed { .. }
                | Error::VerificationFailed(_)
                | Error::DegenerateR
                | Error::InvalidSignature(_)
                | Error::GroupKeyMismatch(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
