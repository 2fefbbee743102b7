//! Coordinator errors

use serde::{Deserialize, Serialize};
use tecdsa_core::{CeremonyId, ParticipantId, SessionId};
use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CeremonyError>;

/// Submissions received versus required in the current round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Accepted so far
    pub received: usize,
    /// Quorum
    pub required: usize,
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.received, self.required)
    }
}

/// Broad class of a failure, deciding how callers react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Cheating or broken arithmetic; the ceremony or session is aborted
    Protocol,
    /// Request rejected; nothing else changes
    Authorization,
    /// Round deadline passed; the round owner is aborted
    Resource,
    /// I/O trouble; safe to retry
    Transient,
    /// Malformed input, wrong phase or unknown id
    Request,
}

/// Errors returned by the coordinator
#[derive(Debug, Error)]
pub enum CeremonyError {
    /// Unknown device, non-member, or bad request signature
    #[error("Participant {participant} not authorized: {reason}")]
    UnauthorizedParticipant {
        participant: ParticipantId,
        reason: String,
        progress: Progress,
    },

    /// Submission after the round closed, timed out or was aborted
    #[error("Round closed: {0}")]
    RoundClosed(String),

    /// Prerequisite state missing (too few devices, DKG unfinished)
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// The requested result does not exist yet
    #[error("Quorum not yet reached ({progress})")]
    QuorumNotYetReached { progress: Progress },

    /// Fatal protocol failure
    #[error("Internal protocol failure: {reason}")]
    InternalProtocolFailure { reason: String, progress: Progress },

    /// Resubmission that differs from the accepted one, or any resubmission under `reject`
    #[error("Conflicting resubmission from {0}")]
    ConflictingSubmission(String),

    /// Unknown ceremony
    #[error("Ceremony {0} not found")]
    CeremonyNotFound(CeremonyId),

    /// Unknown signing session
    #[error("Session {0} not found")]
    SessionNotFound(SessionId),

    /// Malformed request body
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid coordinator configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Storage or transport failure
    #[error("Transient failure: {0}")]
    Transient(String),
}

impl CeremonyError {
    /// Failure class
    pub fn kind(&self) -> ErrorKind {
        match self {
            CeremonyError::InternalProtocolFailure { .. } => ErrorKind::Protocol,
            CeremonyError::UnauthorizedParticipant { .. } => ErrorKind::Authorization,
            CeremonyError::RoundClosed(_) => ErrorKind::Resource,
            CeremonyError::Transient(_) => ErrorKind::Transient,
            _ => ErrorKind::Request,
        }
    }

    /// HTTP status code for the error
    pub fn status_code(&self) -> u16 {
        match self {
            CeremonyError::UnauthorizedParticipant { .. } => 403,
            CeremonyError::RoundClosed(_)
            | CeremonyError::NotInitialized(_)
            | CeremonyError::InvalidRequest(_)
            | CeremonyError::InvalidConfig(_) => 400,
            CeremonyError::QuorumNotYetReached { .. } => 202,
            CeremonyError::ConflictingSubmission(_) => 409,
            CeremonyError::CeremonyNotFound(_) | CeremonyError::SessionNotFound(_) => 404,
            CeremonyError::InternalProtocolFailure { .. } => 500,
            CeremonyError::Transient(_) => 503,
        }
    }

    /// Stable error code for clients
    pub fn code(&self) -> &'static str {
        match self {
            CeremonyError::UnauthorizedParticipant { .. } => "UnauthorizedParticipant",
            CeremonyError::RoundClosed(_) => "RoundClosed",
            CeremonyError::NotInitialized(_) => "NotInitialized",
            CeremonyError::QuorumNotYetReached { .. } => "QuorumNotYetReached",
            CeremonyError::InternalProtocolFailure { .. } => "InternalProtocolFailure",
            CeremonyError::ConflictingSubmission(_) => "ConflictingSubmission",
            CeremonyError::CeremonyNotFound(_) => "CeremonyNotFound",
            CeremonyError::SessionNotFound(_) => "SessionNotFound",
            CeremonyError::InvalidRequest(_) => "InvalidRequest",
            CeremonyError::InvalidConfig(_) => "InvalidConfig",
            CeremonyError::Transient(_) => "Transient",
        }
    }

    /// Round progress carried by protocol, authorization and waiting errors
    pub fn progress(&self) -> Option<Progress> {
        match self {
            CeremonyError::UnauthorizedParticipant { progress, .. }
            | CeremonyError::QuorumNotYetReached { progress }
            | CeremonyError::InternalProtocolFailure { progress, .. } => Some(*progress),
            _ => None,
        }
    }

    /// Map a core error raised while handling a round
    pub fn from_core(err: tecdsa_core::Error, participant: &str, progress: Progress) -> Self {
        match err {
            tecdsa_core::Error::Authorization(reason) => CeremonyError::UnauthorizedParticipant {
                participant: participant.to_string(),
                reason,
                progress,
            },
            tecdsa_core::Error::Storage(reason) => CeremonyError::Transient(reason),
            e if e.is_protocol_violation() => CeremonyError::InternalProtocolFailure {
                reason: e.to_string(),
                progress,
            },
            e => CeremonyError::InvalidRequest(e.to_string()),
        }
    }
}

impl From<tecdsa_core::Error> for CeremonyError {
    fn from(err: tecdsa_core::Error) -> Self {
        CeremonyError::from_core(err, "unknown", Progress::default())
    }
}

impl From<serde_json::Error> for CeremonyError {
    fn from(err: serde_json::Error) -> Self {
        CeremonyError::InvalidConfig(err.to_string())
    }
}

impl From<std::io::Error> for CeremonyError {
    fn from(err: std::io::Error) -> Self {
        CeremonyError::Transient(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_and_status_codes() {
        let progress = Progress {
            received: 2,
            required: 5,
        };
        let unauthorized = CeremonyError::UnauthorizedParticipant {
            participant: "device_9".into(),
            reason: "not enrolled".into(),
            progress,
        };
        assert_eq!(unauthorized.kind(), ErrorKind::Authorization);
        assert_eq!(unauthorized.status_code(), 403);
        assert_eq!(unauthorized.progress(), Some(progress));

        let waiting = CeremonyError::QuorumNotYetReached { progress };
        assert_eq!(waiting.status_code(), 202);
        assert_eq!(waiting.to_string(), "Quorum not yet reached (2/5)");

        let closed = CeremonyError::RoundClosed("timed out".into());
        assert_eq!(closed.kind(), ErrorKind::Resource);
        assert_eq!(closed.status_code(), 400);
    }

    #[test]
    fn test_core_errors_are_classified() {
        let err = CeremonyError::from_core(
            tecdsa_core::Error::RangeProofFailed {
                prover: "device_2".into(),
            },
            "device_2",
            Progress::default(),
        );
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.code(), "InternalProtocolFailure");

        let err = CeremonyError::from_core(
            tecdsa_core::Error::Authorization("bad signature".into()),
            "device_2",
            Progress::default(),
        );
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let err: CeremonyError = tecdsa_core::Error::InvalidShareIndex(0).into();
        assert_eq!(err.kind(), ErrorKind::Request);
    }
}
