//! Signing rounds
//!
//! Commitments, then the MtA relay, then delta shares, then signature
//! shares. Each round opens a fresh deadline when the previous one closes.

use std::collections::{BTreeMap, BTreeSet};
use tecdsa_core::mta::{self, MtaPayload};
use tecdsa_core::sign::{
    aggregate, combine_deltas, combine_nonce_points, DeltaShare, NonceCommitment,
    SignatureShare, SigningRequest,
};
use tecdsa_core::{CeremonyId, ParticipantId, SessionId};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::Coordinator;
use crate::phase::Admission;
use crate::state::{
    admitted, late_submission, MtaInbox, SessionView, SigningSession, SubmitOutcome,
    SubmitStatus,
};
use crate::{CeremonyError, Phase, Result};

impl Coordinator {
    /// Open a signing session over `message_hash` with the key of a ceremony
    ///
    /// `signers` defaults to every participant of the ceremony; at least t
    /// are required.
    #[instrument(skip(self, message_hash, signers))]
    pub fn start_signing(
        &self,
        ceremony_id: &CeremonyId,
        message_hash: [u8; 32],
        signers: Option<Vec<ParticipantId>>,
    ) -> Result<SessionView> {
        let (request, group_public_key) = {
            let ceremony = self
                .registry
                .ceremonies
                .get(ceremony_id)
                .ok_or(CeremonyError::CeremonyNotFound(*ceremony_id))?;
            if ceremony.phase != Phase::DkgComplete {
                return Err(CeremonyError::NotInitialized(format!(
                    "Ceremony {} is {}",
                    ceremony_id, ceremony.phase
                )));
            }

            let current = self
                .registry
                .share_metadata(&ceremony.info.target)
                .map(|m| m.ceremony_id);
            if current != Some(*ceremony_id) {
                return Err(CeremonyError::NotInitialized(format!(
                    "Key shares of ceremony {} are not all confirmed or were superseded",
                    ceremony_id
                )));
            }
            let group_public_key = ceremony.group_public_key.ok_or_else(|| {
                CeremonyError::NotInitialized("Group key not derived".into())
            })?;

            let chosen: BTreeSet<ParticipantId> = match signers {
                Some(list) => {
                    let set: BTreeSet<ParticipantId> = list.iter().cloned().collect();
                    if set.len() != list.len() {
                        return Err(CeremonyError::InvalidRequest(
                            "Duplicate signer".into(),
                        ));
                    }
                    set
                }
                None => ceremony.info.participants.keys().cloned().collect(),
            };
            if chosen.len() < ceremony.info.threshold {
                return Err(CeremonyError::InvalidRequest(format!(
                    "{} signers given, threshold is {}",
                    chosen.len(),
                    ceremony.info.threshold
                )));
            }

            let mut signers = BTreeMap::new();
            for participant_id in chosen {
                let index = ceremony.info.index_of(&participant_id).ok_or_else(|| {
                    CeremonyError::InvalidRequest(format!(
                        "{} is not a participant of ceremony {}",
                        participant_id, ceremony_id
                    ))
                })?;
                signers.insert(participant_id, index);
            }

            let request = SigningRequest {
                session_id: Uuid::new_v4(),
                ceremony_id: *ceremony_id,
                target: ceremony.info.target.clone(),
                message_hash,
                signers,
            };
            (request, group_public_key)
        };

        let mut mta_keys = BTreeMap::new();
        for participant_id in request.signers.keys() {
            let device = self.registry.device(participant_id).ok_or_else(|| {
                CeremonyError::NotInitialized(format!("{} is no longer enrolled", participant_id))
            })?;
            mta_keys.insert(participant_id.clone(), device.mta_key);
        }

        let session_id = request.session_id;
        let session = SigningSession::new(
            request,
            group_public_key,
            mta_keys,
            self.now(),
            self.deadline(),
        );
        info!(
            session = %session_id,
            ceremony = %ceremony_id,
            signers = session.request.signers.len(),
            message_hash = %hex::encode(message_hash),
            "Signing session started"
        );
        let view = session.view();
        self.registry.sessions.insert(session_id, session);
        Ok(view)
    }

    /// Accept a signer's (R_i, Gamma_i)
    #[instrument(skip(self, commitment))]
    pub fn submit_commitment(
        &self,
        session_id: &SessionId,
        participant_id: &str,
        commitment: NonceCommitment,
    ) -> Result<SubmitOutcome> {
        self.admit(participant_id)?;
        let now = self.now();
        let mut session = self.session_entry(session_id)?;
        if !session.is_signer(participant_id) {
            return Err(session.non_signer(participant_id));
        }

        let phase = Phase::SigningCollectingCommitments;
        let key = participant_id.to_string();
        if session.is_past(phase) {
            return late_submission(
                &session.commitments,
                &key,
                &commitment,
                self.config.duplicate_policy,
                participant_id,
                session.phase,
            );
        }
        session.ensure_open(phase, now)?;

        let admission = session
            .commitments
            .submit(key, commitment, self.config.duplicate_policy);
        if admission == Admission::Accepted && session.commitments.is_complete() {
            let nonce = combine_nonce_points(
                session.commitments.entries().values().map(|c| &c.r_point),
            );
            match nonce {
                Ok(nonce) => session.nonce = Some(nonce),
                Err(e) => return Err(session.fail(e.to_string())),
            }
            session.phase = Phase::SigningCollectingMta;
            session.deadline = self.deadline();
            if session.mta_responses.is_complete() {
                // A single signer has no pairs to run
                session.phase = Phase::SigningCollectingDeltas;
            }
            info!(session = %session_id, phase = %session.phase, "Commitment round complete");
        }

        admitted(admission, &session.commitments, participant_id, session.phase)
    }

    /// Relay one leg of an MtA exchange
    ///
    /// Requests have their range proofs checked before they are stored; a
    /// failing proof aborts the session. A response is accepted only for a
    /// stored request.
    #[instrument(skip(self, payload))]
    pub fn submit_mta(
        &self,
        session_id: &SessionId,
        from: &str,
        to: &str,
        payload: MtaPayload,
    ) -> Result<SubmitOutcome> {
        self.admit(from)?;
        let now = self.now();
        let mut session = self.session_entry(session_id)?;
        if !session.is_signer(from) {
            return Err(session.non_signer(from));
        }
        if !session.is_signer(to) || from == to {
            return Err(CeremonyError::InvalidRequest(format!(
                "{} is not a peer of {} in this session",
                to, from
            )));
        }
        if payload.route() != (from, to) {
            return Err(CeremonyError::InvalidRequest(
                "Payload route does not match sender and recipient".into(),
            ));
        }

        let phase = Phase::SigningCollectingMta;
        let policy = self.config.duplicate_policy;
        if session.is_past(phase) {
            return match &payload {
                MtaPayload::Request(request) => late_submission(
                    &session.mta_requests,
                    &pair(from, to),
                    request,
                    policy,
                    from,
                    session.phase,
                ),
                MtaPayload::Response(response) => late_submission(
                    &session.mta_responses,
                    &pair(to, from),
                    response,
                    policy,
                    from,
                    session.phase,
                ),
            };
        }
        session.ensure_open(phase, now)?;

        match payload {
            MtaPayload::Request(request) => {
                let (initiator_key, responder_key) =
                    match (session.mta_keys.get(from), session.mta_keys.get(to)) {
                        (Some(i), Some(r)) => (i.clone(), r.clone()),
                        _ => {
                            return Err(CeremonyError::NotInitialized(
                                "MtA key missing for signer".into(),
                            ))
                        }
                    };
                if let Err(e) = mta::verify_request(session_id, &request, &initiator_key, &responder_key) {
                    return Err(session.fail(e.to_string()));
                }

                let admission = session.mta_requests.submit(pair(from, to), request, policy);
                debug!(initiator = from, responder = to, ?admission, "MtA request relayed");
                match admission {
                    Admission::Conflict => {
                        Err(CeremonyError::ConflictingSubmission(from.to_string()))
                    }
                    _ => Ok(SubmitOutcome {
                        status: if admission == Admission::Duplicate {
                            SubmitStatus::Duplicate
                        } else {
                            SubmitStatus::Waiting
                        },
                        progress: session.mta_responses.progress(),
                        phase: session.phase,
                        signature: None,
                    }),
                }
            }
            MtaPayload::Response(response) => {
                let key = pair(to, from);
                if !session.mta_requests.contains(&key) {
                    return Err(CeremonyError::InvalidRequest(format!(
                        "No MtA request from {} to {}",
                        to, from
                    )));
                }
                let valid = session.mta_keys.get(to).map_or(false, |initiator_key| {
                    initiator_key.is_valid_ciphertext(&response.delta_ciphertext)
                        && initiator_key.is_valid_ciphertext(&response.chi_ciphertext)
                });
                if !valid {
                    return Err(session.fail(format!("Malformed MtA response from {}", from)));
                }

                let admission = session.mta_responses.submit(key, response, policy);
                if admission == Admission::Accepted && session.mta_responses.is_complete() {
                    session.phase = Phase::SigningCollectingDeltas;
                    session.deadline = self.deadline();
                    info!(session = %session_id, "MtA round complete");
                }
                debug!(initiator = to, responder = from, ?admission, "MtA response relayed");
                admitted(admission, &session.mta_responses, from, session.phase)
            }
        }
    }

    /// MtA requests still to answer and responses to absorb, for one signer
    pub fn mta_inbox(&self, session_id: &SessionId, participant_id: &str) -> Result<MtaInbox> {
        self.admit(participant_id)?;
        let session = self
            .registry
            .sessions
            .get(session_id)
            .ok_or(CeremonyError::SessionNotFound(*session_id))?;
        if !session.is_signer(participant_id) {
            return Err(session.non_signer(participant_id));
        }

        let requests = session
            .mta_requests
            .entries()
            .iter()
            .filter(|((_, responder), _)| responder == participant_id)
            .filter(|(key, _)| !session.mta_responses.contains(key))
            .map(|(_, request)| request.clone())
            .collect();
        let responses = session
            .mta_responses
            .entries()
            .iter()
            .filter(|((initiator, _), _)| initiator == participant_id)
            .map(|(_, response)| response.clone())
            .collect();
        Ok(MtaInbox {
            requests,
            responses,
        })
    }

    /// Accept a signer's delta_i; publishes delta once all are in
    #[instrument(skip(self, share))]
    pub fn submit_delta(
        &self,
        session_id: &SessionId,
        participant_id: &str,
        share: DeltaShare,
    ) -> Result<SubmitOutcome> {
        self.admit(participant_id)?;
        let now = self.now();
        let mut session = self.session_entry(session_id)?;
        if !session.is_signer(participant_id) {
            return Err(session.non_signer(participant_id));
        }

        let phase = Phase::SigningCollectingDeltas;
        let key = participant_id.to_string();
        if session.is_past(phase) {
            return late_submission(
                &session.deltas,
                &key,
                &share,
                self.config.duplicate_policy,
                participant_id,
                session.phase,
            );
        }
        session.ensure_open(phase, now)?;

        let admission = session
            .deltas
            .submit(key, share, self.config.duplicate_policy);
        if admission == Admission::Accepted && session.deltas.is_complete() {
            let delta = combine_deltas(session.deltas.entries().values().map(|d| &d.delta));
            match delta {
                Ok(delta) => session.delta = Some(delta),
                Err(e) => return Err(session.fail(e.to_string())),
            }
            session.phase = Phase::SigningCollectingShares;
            session.deadline = self.deadline();
            info!(session = %session_id, "Delta round complete");
        }

        admitted(admission, &session.deltas, participant_id, session.phase)
    }

    /// Accept a signer's sigma_i; the m-th share releases the signature
    ///
    /// The signature is verified against the group key before release.
    /// Submissions after completion never aggregate again.
    #[instrument(skip(self, share))]
    pub fn submit_signature_share(
        &self,
        session_id: &SessionId,
        participant_id: &str,
        share: SignatureShare,
    ) -> Result<SubmitOutcome> {
        self.admit(participant_id)?;
        let now = self.now();
        let mut session = self.session_entry(session_id)?;
        if !session.is_signer(participant_id) {
            return Err(session.non_signer(participant_id));
        }

        let phase = Phase::SigningCollectingShares;
        let key = participant_id.to_string();
        if session.is_past(phase) {
            let mut outcome = late_submission(
                &session.shares,
                &key,
                &share,
                self.config.duplicate_policy,
                participant_id,
                session.phase,
            )?;
            outcome.signature = session.signature.clone();
            return Ok(outcome);
        }
        session.ensure_open(phase, now)?;

        let admission = session
            .shares
            .submit(key, share, self.config.duplicate_policy);
        if admission == Admission::Accepted && session.shares.is_complete() {
            let nonce = match session.nonce {
                Some(nonce) => nonce,
                None => return Err(session.fail("Nonce point missing")),
            };
            let signature = aggregate(
                &session.group_public_key.0,
                &session.request.message_hash,
                &nonce,
                session.shares.entries().values().map(|s| &s.sigma),
                &self.config.aggregate_options(),
            );
            match signature {
                Ok(signature) => {
                    info!(
                        session = %session_id,
                        r = %hex::encode(signature.r),
                        v = signature.v,
                        "Signature released"
                    );
                    session.signature = Some(signature);
                    session.phase = Phase::Completed;
                }
                Err(e) => return Err(session.fail(e.to_string())),
            }
        }

        let mut outcome = admitted(admission, &session.shares, participant_id, session.phase)?;
        outcome.signature = session.signature.clone();
        Ok(outcome)
    }

    fn session_entry(
        &self,
        session_id: &SessionId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, SessionId, SigningSession>> {
        self.registry
            .sessions
            .get_mut(session_id)
            .ok_or(CeremonyError::SessionNotFound(*session_id))
    }
}

fn pair(initiator: &str, responder: &str) -> (ParticipantId, ParticipantId) {
    (initiator.to_string(), responder.to_string())
}
