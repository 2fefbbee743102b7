//! Per-signer session state
//!
//! A signer samples `k_i` and `gamma_i`, publishes their commitments, runs an
//! MtA exchange with every other signer in both directions, and then derives
//!
//! - `delta_i = k_i·gamma_i + Σ alpha_delta + Σ beta_delta`
//! - `chi_i = gamma_i·w_i + Σ alpha_chi + Σ beta_chi`
//! - `sigma_i = delta⁻¹·(m·gamma_i + r·chi_i)`
//!
//! where `w_i = lambda_i·x_i` is the key share weighted for the signer set.
//! Summed over the set, `Σ sigma_i = k⁻¹·(m + r·x)`.

use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use std::collections::{BTreeMap, BTreeSet};
use zeroize::Zeroize;

use super::aggregate::{combine_nonce_points, message_scalar};
use super::{NonceCommitment, SigningRequest};
use crate::keygen::vss::lagrange_coefficient;
use crate::mta::MtaShares;
use crate::{Error, GroupKeyMaterial, ParticipantId, Point, Result, SessionId, ShareIndex};

/// Secrets and accumulators of one signer in one session
pub struct SigningState {
    session_id: SessionId,
    participant_id: ParticipantId,
    signers: BTreeMap<ParticipantId, ShareIndex>,
    message_hash: [u8; 32],
    k: Scalar,
    gamma: Scalar,
    weighted_share: Scalar,
    delta: Scalar,
    chi: Scalar,
    /// Responders whose answer to our request was absorbed
    alphas_from: BTreeSet<ParticipantId>,
    /// Initiators we answered
    betas_for: BTreeSet<ParticipantId>,
}

impl SigningState {
    /// Sample the session nonces for `participant_id`
    pub fn new<R: CryptoRngCore>(
        request: &SigningRequest,
        key: &GroupKeyMaterial,
        rng: &mut R,
    ) -> Result<Self> {
        let participant_id = key.participant_id.clone();
        let own_index = *request
            .signers
            .get(&participant_id)
            .ok_or_else(|| Error::MissingState(format!("{} is not a signer", participant_id)))?;
        if own_index != key.share_index {
            return Err(Error::InvalidShareIndex(own_index));
        }
        if request.signers.len() < key.threshold {
            return Err(Error::InvalidThreshold {
                threshold: key.threshold,
                total: request.signers.len(),
            });
        }
        for (id, index) in &request.signers {
            if key.participants.get(id) != Some(index) {
                return Err(Error::InvalidShareIndex(*index));
            }
        }

        let indices: Vec<ShareIndex> = request.signers.values().copied().collect();
        let lambda = lagrange_coefficient(own_index, &indices)?;
        let weighted_share = lambda * key.secret_share;

        let k = Scalar::random(&mut *rng);
        let gamma = Scalar::random(&mut *rng);

        Ok(Self {
            session_id: request.session_id,
            participant_id,
            signers: request.signers.clone(),
            message_hash: request.message_hash,
            k,
            gamma,
            weighted_share,
            delta: k * gamma,
            chi: gamma * weighted_share,
            alphas_from: BTreeSet::new(),
            betas_for: BTreeSet::new(),
        })
    }

    /// Session this state belongs to
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Signers other than this one
    pub fn peers(&self) -> impl Iterator<Item = &ParticipantId> {
        self.signers
            .keys()
            .filter(move |id| **id != self.participant_id)
    }

    /// `(R_i, Gamma_i)`
    pub fn commitment(&self) -> NonceCommitment {
        NonceCommitment {
            r_point: Point(ProjectivePoint::GENERATOR * self.k),
            gamma_point: Point(ProjectivePoint::GENERATOR * self.gamma),
        }
    }

    /// Nonce share k_i, needed to build MtA requests
    pub(crate) fn k(&self) -> &Scalar {
        &self.k
    }

    /// Blinding share gamma_i
    pub(crate) fn gamma(&self) -> &Scalar {
        &self.gamma
    }

    /// Lagrange-weighted key share w_i
    pub(crate) fn weighted_share(&self) -> &Scalar {
        &self.weighted_share
    }

    fn check_peer(&self, peer: &str) -> Result<()> {
        if peer == self.participant_id || !self.signers.contains_key(peer) {
            return Err(Error::MissingState(format!(
                "{} is not a peer in session {}",
                peer, self.session_id
            )));
        }
        Ok(())
    }

    /// Fold in the shares from answering `initiator`'s request
    pub fn absorb_betas(&mut self, initiator: &str, shares: &MtaShares) -> Result<bool> {
        self.check_peer(initiator)?;
        if !self.betas_for.insert(initiator.to_string()) {
            return Ok(false);
        }
        self.delta += shares.delta;
        self.chi += shares.chi;
        Ok(true)
    }

    /// Fold in the shares decrypted from `responder`'s answer
    pub fn absorb_alphas(&mut self, responder: &str, shares: &MtaShares) -> Result<bool> {
        self.check_peer(responder)?;
        if !self.alphas_from.insert(responder.to_string()) {
            return Ok(false);
        }
        self.delta += shares.delta;
        self.chi += shares.chi;
        Ok(true)
    }

    /// Whether this signer has taken part in all 2·(m−1) exchanges it is in
    pub fn mta_complete(&self) -> bool {
        let peers = self.signers.len() - 1;
        self.alphas_from.len() == peers && self.betas_for.len() == peers
    }

    /// Responders we still wait on
    pub fn pending_responses(&self) -> Vec<ParticipantId> {
        self.peers()
            .filter(|p| !self.alphas_from.contains(*p))
            .cloned()
            .collect()
    }

    /// delta_i, available once every exchange is done
    pub fn delta_share(&self) -> Result<Scalar> {
        if !self.mta_complete() {
            return Err(Error::MissingState(format!(
                "MtA incomplete for session {}",
                self.session_id
            )));
        }
        Ok(self.delta)
    }

    /// sigma_i given the public delta and every signer's commitment
    pub fn signature_share(
        &self,
        delta: &Scalar,
        commitments: &BTreeMap<ParticipantId, NonceCommitment>,
    ) -> Result<Scalar> {
        if !self.mta_complete() {
            return Err(Error::MissingState(format!(
                "MtA incomplete for session {}",
                self.session_id
            )));
        }
        if commitments.len() != self.signers.len()
            || !self.signers.keys().all(|id| commitments.contains_key(id))
        {
            return Err(Error::VerificationFailed(
                "Commitment set does not match the signer set".into(),
            ));
        }
        let own = commitments
            .get(&self.participant_id)
            .ok_or_else(|| Error::MissingState("Own commitment missing".into()))?;
        if own != &self.commitment() {
            return Err(Error::VerificationFailed(
                "Published commitment differs from ours".into(),
            ));
        }

        let delta_inv = Option::<Scalar>::from(delta.invert())
            .ok_or_else(|| Error::VerificationFailed("Aggregated delta is zero".into()))?;
        let nonce = combine_nonce_points(commitments.values().map(|c| &c.r_point))?;
        let m = message_scalar(&self.message_hash);

        Ok(delta_inv * (m * self.gamma + nonce.r * self.chi))
    }
}

impl Drop for SigningState {
    fn drop(&mut self) {
        self.k.zeroize();
        self.gamma.zeroize();
        self.weighted_share.zeroize();
        self.delta.zeroize();
        self.chi.zeroize();
    }
}
