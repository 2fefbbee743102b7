//! Ceremony and signing-session records held by the registry

use chrono::{DateTime, Utc};
use k256::Scalar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tecdsa_core::keygen::{CeremonyInfo, DkgSubmission, KeyShareConfirmation};
use tecdsa_core::mta::{MtaPublicKey, MtaRequest, MtaResponse};
use tecdsa_core::sign::{
    DeltaShare, NonceCommitment, NoncePoint, SignatureShare, SigningRequest,
};
use tecdsa_core::{ParticipantId, Point, Signature};
use tracing::warn;

use crate::phase::{Admission, Round};
use crate::{CeremonyError, DuplicatePolicy, Phase, Progress, Result};

/// Directed MtA pair: (initiator, responder)
pub type MtaPair = (ParticipantId, ParticipantId);

/// How an accepted submission left its round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitStatus {
    /// Stored; the round still needs more submissions
    Waiting,
    /// Stored, or already stored, and the round has closed
    Complete,
    /// Identical resubmission; nothing changed
    Duplicate,
}

/// Reply to a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    /// Waiting, complete or duplicate
    pub status: SubmitStatus,
    /// Counters of the round the submission belonged to
    pub progress: Progress,
    /// Phase after the submission
    pub phase: Phase,
    /// Final signature, once released
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

impl SubmitOutcome {
    fn after(admission: Admission, progress: Progress, phase: Phase) -> Self {
        let status = match admission {
            Admission::Duplicate => SubmitStatus::Duplicate,
            _ if progress.received >= progress.required => SubmitStatus::Complete,
            _ => SubmitStatus::Waiting,
        };
        Self {
            status,
            progress,
            phase,
            signature: None,
        }
    }
}

/// Map a round admission to an outcome, or to an error on conflict
pub(crate) fn admitted<K: Ord, V: PartialEq>(
    admission: Admission,
    round: &Round<K, V>,
    participant: &str,
    phase: Phase,
) -> Result<SubmitOutcome> {
    match admission {
        Admission::Conflict => Err(CeremonyError::ConflictingSubmission(participant.to_string())),
        _ => Ok(SubmitOutcome::after(admission, round.progress(), phase)),
    }
}

/// A DKG ceremony
pub struct Ceremony {
    pub(crate) info: CeremonyInfo,
    pub(crate) phase: Phase,
    pub(crate) channel_keys: BTreeMap<ParticipantId, [u8; 32]>,
    pub(crate) submissions: Round<ParticipantId, DkgSubmission>,
    pub(crate) group_public_key: Option<Point>,
    pub(crate) public_shares: BTreeMap<ParticipantId, Point>,
    pub(crate) confirmations: Round<ParticipantId, KeyShareConfirmation>,
    pub(crate) abort_reason: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) deadline: DateTime<Utc>,
}

impl Ceremony {
    pub(crate) fn new(
        info: CeremonyInfo,
        channel_keys: BTreeMap<ParticipantId, [u8; 32]>,
        now: DateTime<Utc>,
    ) -> Self {
        let n = info.participants.len();
        Self {
            info,
            phase: Phase::Created,
            channel_keys,
            submissions: Round::new(n),
            group_public_key: None,
            public_shares: BTreeMap::new(),
            confirmations: Round::new(n),
            abort_reason: None,
            created_at: now,
            deadline: now,
        }
    }

    /// Counters of whichever round is current
    pub(crate) fn progress(&self) -> Progress {
        match self.phase {
            Phase::DkgComplete => self.confirmations.progress(),
            _ => self.submissions.progress(),
        }
    }

    pub(crate) fn is_member(&self, participant_id: &str) -> bool {
        self.info.participants.contains_key(participant_id)
    }

    pub(crate) fn non_member(&self, participant_id: &str) -> CeremonyError {
        CeremonyError::UnauthorizedParticipant {
            participant: participant_id.to_string(),
            reason: format!("not a participant of ceremony {}", self.info.ceremony_id),
            progress: self.progress(),
        }
    }

    /// Fail unless the DKG round can take submissions at `now`; an overdue
    /// round is aborted on the spot
    pub(crate) fn ensure_open(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.phase == Phase::Aborted {
            return Err(closed(&self.abort_reason));
        }
        if self.phase.is_collecting() && now > self.deadline {
            self.abort("round timed out");
            return Err(closed(&self.abort_reason));
        }
        Ok(())
    }

    /// Abort with a protocol failure and build the error to return
    pub(crate) fn fail(&mut self, reason: impl Into<String>) -> CeremonyError {
        let progress = self.progress();
        let reason = reason.into();
        self.abort(&reason);
        CeremonyError::InternalProtocolFailure { reason, progress }
    }

    /// Move to `Aborted`; returns false if it already was
    pub(crate) fn abort(&mut self, reason: &str) -> bool {
        if self.phase == Phase::Aborted {
            return false;
        }
        warn!(
            ceremony = %self.info.ceremony_id,
            phase = %self.phase,
            reason,
            "Ceremony aborted"
        );
        self.phase = Phase::Aborted;
        self.abort_reason = Some(reason.to_string());
        true
    }

    pub(crate) fn view(&self) -> CeremonyView {
        CeremonyView {
            info: self.info.clone(),
            phase: self.phase,
            progress: self.progress(),
            channel_keys: self.channel_keys.clone(),
            group_public_key: self.group_public_key,
            address: self
                .group_public_key
                .map(|key| tecdsa_core::ethereum_address(&key.0)),
            confirmed: self.confirmations.entries().keys().cloned().collect(),
            abort_reason: self.abort_reason.clone(),
            created_at: self.created_at,
            deadline: self.phase.is_collecting().then_some(self.deadline),
        }
    }
}

/// Public state of a ceremony
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyView {
    /// Ceremony description participants deal against
    pub info: CeremonyInfo,
    /// Current phase
    pub phase: Phase,
    /// Counters of the current round
    pub progress: Progress,
    /// Channel keys DKG shares are sealed to
    pub channel_keys: BTreeMap<ParticipantId, [u8; 32]>,
    /// Group key, once derived
    pub group_public_key: Option<Point>,
    /// Ethereum address of the group key
    pub address: Option<String>,
    /// Participants that confirmed their key share
    pub confirmed: Vec<ParticipantId>,
    /// Why the ceremony stopped
    pub abort_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Deadline of the open round
    pub deadline: Option<DateTime<Utc>>,
}

/// A signing session
pub struct SigningSession {
    pub(crate) request: SigningRequest,
    pub(crate) phase: Phase,
    pub(crate) group_public_key: Point,
    pub(crate) mta_keys: BTreeMap<ParticipantId, MtaPublicKey>,
    pub(crate) commitments: Round<ParticipantId, NonceCommitment>,
    pub(crate) nonce: Option<NoncePoint>,
    pub(crate) mta_requests: Round<MtaPair, MtaRequest>,
    pub(crate) mta_responses: Round<MtaPair, MtaResponse>,
    pub(crate) deltas: Round<ParticipantId, DeltaShare>,
    pub(crate) delta: Option<Scalar>,
    pub(crate) shares: Round<ParticipantId, SignatureShare>,
    pub(crate) signature: Option<Signature>,
    pub(crate) abort_reason: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) deadline: DateTime<Utc>,
}

impl SigningSession {
    pub(crate) fn new(
        request: SigningRequest,
        group_public_key: Point,
        mta_keys: BTreeMap<ParticipantId, MtaPublicKey>,
        now: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Self {
        let m = request.signers.len();
        let pairs = m * m.saturating_sub(1);
        Self {
            request,
            phase: Phase::SigningCollectingCommitments,
            group_public_key,
            mta_keys,
            commitments: Round::new(m),
            nonce: None,
            mta_requests: Round::new(pairs),
            mta_responses: Round::new(pairs),
            deltas: Round::new(m),
            delta: None,
            shares: Round::new(m),
            signature: None,
            abort_reason: None,
            created_at: now,
            deadline,
        }
    }

    /// Counters of whichever round is current
    pub(crate) fn progress(&self) -> Progress {
        match self.phase {
            Phase::SigningCollectingCommitments => self.commitments.progress(),
            Phase::SigningCollectingMta => self.mta_responses.progress(),
            Phase::SigningCollectingDeltas => self.deltas.progress(),
            _ => self.shares.progress(),
        }
    }

    pub(crate) fn is_signer(&self, participant_id: &str) -> bool {
        self.request.signers.contains_key(participant_id)
    }

    pub(crate) fn non_signer(&self, participant_id: &str) -> CeremonyError {
        CeremonyError::UnauthorizedParticipant {
            participant: participant_id.to_string(),
            reason: format!("not a signer of session {}", self.request.session_id),
            progress: self.progress(),
        }
    }

    /// Fail unless `phase` is collecting at `now`; an overdue round is
    /// aborted on the spot
    pub(crate) fn ensure_open(&mut self, phase: Phase, now: DateTime<Utc>) -> Result<()> {
        if self.phase == Phase::Aborted {
            return Err(closed(&self.abort_reason));
        }
        if self.phase.is_collecting() && now > self.deadline {
            self.abort("round timed out");
            return Err(closed(&self.abort_reason));
        }
        if self.phase != phase {
            return Err(CeremonyError::RoundClosed(format!(
                "session is {}, not {}",
                self.phase, phase
            )));
        }
        Ok(())
    }

    /// Whether the session has moved beyond `phase` without aborting
    pub(crate) fn is_past(&self, phase: Phase) -> bool {
        self.phase != Phase::Aborted && rank(self.phase) > rank(phase)
    }

    /// Abort with a protocol failure and build the error to return
    pub(crate) fn fail(&mut self, reason: impl Into<String>) -> CeremonyError {
        let progress = self.progress();
        let reason = reason.into();
        self.abort(&reason);
        CeremonyError::InternalProtocolFailure { reason, progress }
    }

    /// Move to `Aborted`; returns false if the session had already stopped
    pub(crate) fn abort(&mut self, reason: &str) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        warn!(
            session = %self.request.session_id,
            phase = %self.phase,
            reason,
            "Signing session aborted"
        );
        self.phase = Phase::Aborted;
        self.abort_reason = Some(reason.to_string());
        true
    }

    pub(crate) fn view(&self) -> SessionView {
        SessionView {
            request: self.request.clone(),
            phase: self.phase,
            progress: self.progress(),
            mta_keys: self.mta_keys.clone(),
            commitments: if self.commitments.is_complete() {
                self.commitments.entries().clone()
            } else {
                BTreeMap::new()
            },
            delta: self.delta.map(|delta| DeltaShare { delta }),
            signature: self.signature.clone(),
            abort_reason: self.abort_reason.clone(),
            created_at: self.created_at,
            deadline: self.phase.is_collecting().then_some(self.deadline),
        }
    }
}

/// Public state of a signing session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    /// What signers join with
    pub request: SigningRequest,
    /// Current phase
    pub phase: Phase,
    /// Counters of the current round
    pub progress: Progress,
    /// MtA keys of the signers, snapshotted when the session started
    pub mta_keys: BTreeMap<ParticipantId, MtaPublicKey>,
    /// Every signer's (R_i, Gamma_i), once all are in
    pub commitments: BTreeMap<ParticipantId, NonceCommitment>,
    /// Public delta, once all delta shares are in
    pub delta: Option<DeltaShare>,
    /// Final signature, once released
    pub signature: Option<Signature>,
    /// Why the session stopped
    pub abort_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Deadline of the open round
    pub deadline: Option<DateTime<Utc>>,
}

/// MtA traffic waiting for one signer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtaInbox {
    /// Requests addressed to the signer that it has not answered yet
    pub requests: Vec<MtaRequest>,
    /// Answers to the signer's own requests
    pub responses: Vec<MtaResponse>,
}

fn closed(reason: &Option<String>) -> CeremonyError {
    CeremonyError::RoundClosed(reason.clone().unwrap_or_else(|| "aborted".into()))
}

fn rank(phase: Phase) -> u8 {
    match phase {
        Phase::Created => 0,
        Phase::DkgCollecting => 1,
        Phase::DkgComplete => 2,
        Phase::SigningCollectingCommitments => 3,
        Phase::SigningCollectingMta => 4,
        Phase::SigningCollectingDeltas => 5,
        Phase::SigningCollectingShares => 6,
        Phase::Completed => 7,
        Phase::Aborted => 8,
    }
}

/// Duplicate handling for a round that already closed
pub(crate) fn late_submission<K: Ord, V: PartialEq>(
    round: &Round<K, V>,
    key: &K,
    value: &V,
    policy: DuplicatePolicy,
    participant: &str,
    phase: Phase,
) -> Result<SubmitOutcome> {
    admitted(round.recheck(key, value, policy), round, participant, phase)
}
