//! Signing round messages

use k256::Scalar;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{bytes32_hex, scalar_hex};
use crate::{CeremonyId, ParticipantId, Point, SessionId, ShareIndex, TargetId};

/// Everything a signer needs to join a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    /// Session being joined
    pub session_id: SessionId,
    /// Ceremony whose key signs
    pub ceremony_id: CeremonyId,
    /// Target identity of that key
    pub target: TargetId,
    /// 32-byte message hash
    #[serde(with = "bytes32_hex")]
    pub message_hash: [u8; 32],
    /// Signer set with share indices
    pub signers: BTreeMap<ParticipantId, ShareIndex>,
}

/// Round 1: ephemeral commitments `R_i = k_i·G`, `Gamma_i = gamma_i·G`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceCommitment {
    /// R_i
    pub r_point: Point,
    /// Gamma_i
    pub gamma_point: Point,
}

/// Delta round: additive share of `k·gamma`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaShare {
    /// delta_i
    #[serde(with = "scalar_hex")]
    pub delta: Scalar,
}

/// Final round: additive share of `s`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare {
    /// sigma_i
    #[serde(with = "scalar_hex")]
    pub sigma: Scalar,
}
