//! DKG message types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::channel::SealedShare;
use crate::{CeremonyId, ParticipantId, Point, ShareIndex, TargetId};

/// Public description of a DKG ceremony
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeremonyInfo {
    /// Ceremony ID
    pub ceremony_id: CeremonyId,
    /// Target identity the key is generated for
    pub target: TargetId,
    /// Threshold t
    pub threshold: usize,
    /// Participants and their 1-based share indices
    pub participants: BTreeMap<ParticipantId, ShareIndex>,
}

impl CeremonyInfo {
    /// Share index of `participant_id`
    pub fn index_of(&self, participant_id: &str) -> Option<ShareIndex> {
        self.participants.get(participant_id).copied()
    }
}

/// A participant's DKG submission: Feldman commitments plus one sealed share per participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgSubmission {
    /// `coefficient[i]·G` for i in 0..t
    pub commitments: Vec<Point>,
    /// Recipient → share sealed to the recipient's channel key
    pub shares: BTreeMap<ParticipantId, SealedShare>,
}

/// What one sender contributed to one recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgContribution {
    /// Sender's commitments
    pub commitments: Vec<Point>,
    /// Share addressed to the recipient
    pub share: SealedShare,
}

/// Everything a recipient needs to finish DKG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgBundle {
    /// Ceremony description
    pub info: CeremonyInfo,
    /// Recipient the bundle was assembled for
    pub recipient: ParticipantId,
    /// Sender → contribution
    pub contributions: BTreeMap<ParticipantId, DkgContribution>,
}

/// Recipient's confirmation that every share it received verified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShareConfirmation {
    /// `x_i·G`
    pub public_share: Point,
    /// Group key as derived by the recipient
    pub group_public_key: Point,
}

/// Recipient's report that a sender's share failed verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgFailureReport {
    /// Sender whose share was rejected
    pub accused: ParticipantId,
    /// Human-readable reason
    pub reason: String,
}
