//! A signing device
//!
//! [`Participant`] owns a device's secrets: its request-signing key, its
//! channel key for sealed DKG shares, its Paillier key for MtA, and a
//! [`KeyStore`] with the key material it holds per target. It never talks to
//! the network itself; callers move its outputs to the coordinator and feed
//! the coordinator's outputs back in.
//!
//! DKG output is held per ceremony until every participant has confirmed,
//! and only then written to the store. A ceremony that aborts after this
//! device finalized leaves the store untouched, so the next ceremony for the
//! target deals from the same committed state as every other device.

use dashmap::DashMap;
use k256::Scalar;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};
use zeroize::Zeroize;

#[cfg(feature = "multi-thread")]
use rayon::prelude::*;

use crate::auth::{DeviceKey, SignedRequest};
use crate::channel::ChannelSecret;
use crate::keygen::{
    self, CeremonyInfo, DkgBundle, DkgSubmission, KeyShareConfirmation, PendingDkg,
};
use crate::mta::{self, MtaKeyPair, MtaPublicKey, MtaRequest, MtaResponse};
use crate::sign::{DeltaShare, NonceCommitment, SignatureShare, SigningRequest, SigningState};
use crate::store::KeyStore;
use crate::types::bytes32_hex;
use crate::{CeremonyId, Error, GroupKeyMaterial, ParticipantId, Point, Result, SessionId};

/// Public identity a device enrolls with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device ID
    pub participant_id: ParticipantId,
    /// ed25519 key that signs the device's requests
    #[serde(with = "bytes32_hex")]
    pub verifying_key: [u8; 32],
    /// x25519 key DKG shares are sealed to
    #[serde(with = "bytes32_hex")]
    pub channel_key: [u8; 32],
    /// Paillier and ring-Pedersen parameters
    pub mta_key: MtaPublicKey,
}

/// A device taking part in ceremonies
pub struct Participant<S: KeyStore> {
    participant_id: ParticipantId,
    device_key: DeviceKey,
    channel: ChannelSecret,
    mta_key: MtaKeyPair,
    store: S,
    pending_dkg: DashMap<CeremonyId, PendingDkg>,
    finalized_dkg: DashMap<CeremonyId, GroupKeyMaterial>,
    sessions: DashMap<SessionId, SigningState>,
}

impl<S: KeyStore> Participant<S> {
    /// Create a device with fresh keys
    pub fn new(participant_id: impl Into<ParticipantId>, store: S, paillier_bits: usize) -> Result<Self> {
        let mta_key = MtaKeyPair::generate(paillier_bits)?;
        Ok(Self::with_mta_key(participant_id, store, mta_key))
    }

    /// Create a device around an existing Paillier key
    pub fn with_mta_key(participant_id: impl Into<ParticipantId>, store: S, mta_key: MtaKeyPair) -> Self {
        Self {
            participant_id: participant_id.into(),
            device_key: DeviceKey::random(),
            channel: ChannelSecret::random(),
            mta_key,
            store,
            pending_dkg: DashMap::new(),
            finalized_dkg: DashMap::new(),
            sessions: DashMap::new(),
        }
    }

    /// Device ID
    pub fn id(&self) -> &str {
        &self.participant_id
    }

    /// Public identity for enrollment
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            participant_id: self.participant_id.clone(),
            verifying_key: self.device_key.verifying_key(),
            channel_key: self.channel.public_key(),
            mta_key: self.mta_key.public().clone(),
        }
    }

    /// Key store backing this device
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Wrap `body` in a request for `operation` on the ceremony or session
    /// `resource`, signed by this device
    pub fn sign_request<T: Serialize>(
        &self,
        operation: &str,
        resource: &uuid::Uuid,
        body: T,
    ) -> Result<SignedRequest<T>> {
        self.device_key
            .sign(&self.participant_id, operation, &resource.to_string(), body)
    }

    /// Deal this device's polynomial for a ceremony
    ///
    /// If the device already holds committed key material for the target,
    /// its coefficient[0] is dealt again so the group key does not change.
    #[instrument(skip_all, fields(participant = %self.participant_id, ceremony = %info.ceremony_id))]
    pub fn dkg_contribution(
        &self,
        info: &CeremonyInfo,
        channel_keys: &BTreeMap<ParticipantId, [u8; 32]>,
    ) -> Result<DkgSubmission> {
        if self.pending_dkg.contains_key(&info.ceremony_id)
            || self.finalized_dkg.contains_key(&info.ceremony_id)
        {
            return Err(Error::InvalidConfig(format!(
                "Already contributed to ceremony {}",
                info.ceremony_id
            )));
        }

        let existing = self.store.get(&self.participant_id, &info.target)?;
        let secret = existing.as_ref().map(|m| m.secret_coefficient);
        let (submission, pending) =
            keygen::contribute(info, &self.participant_id, channel_keys, secret, &mut OsRng)?;
        self.pending_dkg.insert(info.ceremony_id, pending);

        info!(
            target_id = %info.target,
            reshare = existing.is_some(),
            "DKG contribution ready"
        );
        Ok(submission)
    }

    /// Verify the shares addressed to this device
    ///
    /// The resulting key share is held until [`Self::commit_key_share`].
    #[instrument(skip_all, fields(participant = %self.participant_id, ceremony = %bundle.info.ceremony_id))]
    pub fn finalize_dkg(&self, bundle: &DkgBundle) -> Result<KeyShareConfirmation> {
        let (_, pending) = self
            .pending_dkg
            .remove(&bundle.info.ceremony_id)
            .ok_or_else(|| {
                Error::MissingState(format!("No contribution for ceremony {}", bundle.info.ceremony_id))
            })?;

        let existing = self.store.get(&self.participant_id, &pending.info().target)?;
        let material = keygen::finalize(&pending, &self.channel, bundle, existing.as_ref())?;

        let public_share = material
            .public_shares
            .get(&self.participant_id)
            .copied()
            .ok_or_else(|| Error::MissingState("Own public share missing".into()))?;
        let confirmation = KeyShareConfirmation {
            public_share,
            group_public_key: material.group_public_key,
        };

        debug!(address = %material.address(), "Key share verified, awaiting confirmations");
        self.finalized_dkg.insert(bundle.info.ceremony_id, material);
        Ok(confirmation)
    }

    /// Persist the key share of a ceremony every participant confirmed
    ///
    /// `confirmed` is the coordinator's list of confirmed participants; all
    /// of the ceremony's participants must be in it. Returns the address.
    #[instrument(skip_all, fields(participant = %self.participant_id, ceremony = %ceremony_id))]
    pub fn commit_key_share(
        &self,
        ceremony_id: &CeremonyId,
        confirmed: &[ParticipantId],
    ) -> Result<String> {
        let material = self.finalized_dkg.get(ceremony_id).ok_or_else(|| {
            Error::MissingState(format!("No finalized key share for ceremony {}", ceremony_id))
        })?;
        if let Some(missing) = material
            .participants
            .keys()
            .find(|id| !confirmed.contains(*id))
        {
            return Err(Error::MissingState(format!(
                "{} has not confirmed ceremony {}",
                missing, ceremony_id
            )));
        }
        drop(material);

        let (_, material) = self.finalized_dkg.remove(ceremony_id).ok_or_else(|| {
            Error::MissingState(format!("No finalized key share for ceremony {}", ceremony_id))
        })?;
        self.store.put(&material)?;
        let address = material.address();
        info!(%address, "Key share stored");
        Ok(address)
    }

    /// Drop everything held for a ceremony that will not complete
    pub fn discard_dkg(&self, ceremony_id: &CeremonyId) {
        let pending = self.pending_dkg.remove(ceremony_id).is_some();
        let finalized = self.finalized_dkg.remove(ceremony_id).is_some();
        if pending || finalized {
            debug!(ceremony = %ceremony_id, "DKG state discarded");
        }
    }

    /// Join a signing session and return the ephemeral commitments
    #[instrument(skip_all, fields(participant = %self.participant_id, session = %request.session_id))]
    pub fn begin_signing(&self, request: &SigningRequest) -> Result<NonceCommitment> {
        let material = self
            .store
            .get(&self.participant_id, &request.target)?
            .ok_or_else(|| Error::MissingState(format!("No key material for {}", request.target)))?;
        if material.ceremony_id != request.ceremony_id {
            return Err(Error::MissingState(format!(
                "Key material is from ceremony {}, session uses {}",
                material.ceremony_id, request.ceremony_id
            )));
        }
        if self.sessions.contains_key(&request.session_id) {
            return Err(Error::InvalidConfig(format!(
                "Already joined session {}",
                request.session_id
            )));
        }

        let state = SigningState::new(request, &material, &mut OsRng)?;
        let commitment = state.commitment();
        self.sessions.insert(request.session_id, state);

        debug!(signers = request.signers.len(), "Joined signing session");
        Ok(commitment)
    }

    /// One MtA request per peer in the session
    #[instrument(skip_all, fields(participant = %self.participant_id, session = %session_id))]
    pub fn mta_requests(
        &self,
        session_id: &SessionId,
        mta_keys: &BTreeMap<ParticipantId, MtaPublicKey>,
    ) -> Result<Vec<MtaRequest>> {
        let (mut k, mut gamma, peers) = {
            let state = self.session(session_id)?;
            let peers = state
                .peers()
                .map(|peer| {
                    mta_keys
                        .get(peer)
                        .map(|key| (peer.clone(), key.clone()))
                        .ok_or_else(|| Error::MissingState(format!("No MtA key for {}", peer)))
                })
                .collect::<Result<Vec<_>>>()?;
            (*state.k(), *state.gamma(), peers)
        };

        let build = |(peer, key): &(ParticipantId, MtaPublicKey)| {
            mta::initiate(session_id, &self.participant_id, peer, &self.mta_key, key, &k, &gamma)
        };

        #[cfg(feature = "multi-thread")]
        let requests: Result<Vec<MtaRequest>> = peers.par_iter().map(build).collect();
        #[cfg(not(feature = "multi-thread"))]
        let requests: Result<Vec<MtaRequest>> = peers.iter().map(build).collect();

        k.zeroize();
        gamma.zeroize();

        let requests = requests?;
        debug!(count = requests.len(), "MtA requests prepared");
        Ok(requests)
    }

    /// Answer a peer's MtA request, keeping the responder shares
    #[instrument(skip_all, fields(participant = %self.participant_id, session = %session_id, initiator = %request.initiator))]
    pub fn answer_mta(
        &self,
        session_id: &SessionId,
        request: &MtaRequest,
        initiator_key: &MtaPublicKey,
    ) -> Result<MtaResponse> {
        if request.responder != self.participant_id {
            return Err(Error::VerificationFailed(format!(
                "MtA request addressed to {}",
                request.responder
            )));
        }

        let mut state = self.session_mut(session_id)?;
        let (response, betas) = mta::respond(
            session_id,
            request,
            initiator_key,
            self.mta_key.public(),
            state.gamma(),
            state.weighted_share(),
        )?;
        state.absorb_betas(&request.initiator, &betas)?;
        Ok(response)
    }

    /// Decrypt a peer's answer to one of our requests
    #[instrument(skip_all, fields(participant = %self.participant_id, session = %session_id, responder = %response.responder))]
    pub fn absorb_mta_response(&self, session_id: &SessionId, response: &MtaResponse) -> Result<()> {
        if response.initiator != self.participant_id {
            return Err(Error::VerificationFailed(format!(
                "MtA response addressed to {}",
                response.initiator
            )));
        }
        let alphas = mta::finish(&self.mta_key, response)?;
        self.session_mut(session_id)?
            .absorb_alphas(&response.responder, &alphas)?;
        Ok(())
    }

    /// delta_i for the session
    pub fn delta_share(&self, session_id: &SessionId) -> Result<DeltaShare> {
        let delta = self.session(session_id)?.delta_share()?;
        Ok(DeltaShare { delta })
    }

    /// sigma_i for the session; the session's secrets are dropped afterwards
    #[instrument(skip_all, fields(participant = %self.participant_id, session = %session_id))]
    pub fn signature_share(
        &self,
        session_id: &SessionId,
        delta: &Scalar,
        commitments: &BTreeMap<ParticipantId, NonceCommitment>,
    ) -> Result<SignatureShare> {
        let sigma = self.session(session_id)?.signature_share(delta, commitments)?;
        self.sessions.remove(session_id);
        debug!("Signature share produced");
        Ok(SignatureShare { sigma })
    }

    /// Forget a session, zeroing its secrets
    pub fn abandon_session(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }

    /// Public share the device stored for `target`
    pub fn public_share(&self, target: &str) -> Result<Option<Point>> {
        Ok(self
            .store
            .get(&self.participant_id, target)?
            .and_then(|m| m.public_shares.get(&self.participant_id).copied()))
    }

    fn session(
        &self,
        session_id: &SessionId,
    ) -> Result<dashmap::mapref::one::Ref<'_, SessionId, SigningState>> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| Error::MissingState(format!("Not in session {}", session_id)))
    }

    fn session_mut(
        &self,
        session_id: &SessionId,
    ) -> Result<dashmap::mapref::one::RefMut<'_, SessionId, SigningState>> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::MissingState(format!("Not in session {}", session_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::DkgContribution;
    use crate::mta::MIN_MODULUS_BITS;
    use crate::sign::{aggregate, combine_deltas, combine_nonce_points, recover_address, AggregateOptions};
    use crate::store::MemoryKeyStore;

    fn device(id: &str) -> Participant<MemoryKeyStore> {
        Participant::new(id, MemoryKeyStore::new(), MIN_MODULUS_BITS).unwrap()
    }

    fn run_dkg(devices: &[Participant<MemoryKeyStore>], threshold: usize) -> CeremonyInfo {
        let info = CeremonyInfo {
            ceremony_id: uuid::Uuid::new_v4(),
            target: "treasury".into(),
            threshold,
            participants: devices
                .iter()
                .enumerate()
                .map(|(i, d)| (d.id().to_string(), i as u32 + 1))
                .collect(),
        };
        let channel_keys: BTreeMap<_, _> = devices
            .iter()
            .map(|d| (d.id().to_string(), d.identity().channel_key))
            .collect();

        let submissions: BTreeMap<_, _> = devices
            .iter()
            .map(|d| (d.id().to_string(), d.dkg_contribution(&info, &channel_keys).unwrap()))
            .collect();

        for d in devices {
            let bundle = DkgBundle {
                info: info.clone(),
                recipient: d.id().to_string(),
                contributions: submissions
                    .iter()
                    .map(|(sender, sub)| {
                        (
                            sender.clone(),
                            DkgContribution {
                                commitments: sub.commitments.clone(),
                                share: sub.shares[d.id()].clone(),
                            },
                        )
                    })
                    .collect(),
            };
            d.finalize_dkg(&bundle).unwrap();
        }
        let everyone: Vec<ParticipantId> = info.participants.keys().cloned().collect();
        for d in devices {
            d.commit_key_share(&info.ceremony_id, &everyone).unwrap();
        }
        info
    }

    #[test]
    fn test_devices_sign_without_coordinator() {
        let devices = vec![device("device_1"), device("device_2")];
        let info = run_dkg(&devices, 2);

        let request = SigningRequest {
            session_id: uuid::Uuid::new_v4(),
            ceremony_id: info.ceremony_id,
            target: info.target.clone(),
            message_hash: [3u8; 32],
            signers: info.participants.clone(),
        };
        let commitments: BTreeMap<_, _> = devices
            .iter()
            .map(|d| (d.id().to_string(), d.begin_signing(&request).unwrap()))
            .collect();
        assert!(devices[0].begin_signing(&request).is_err());

        let mta_keys: BTreeMap<_, _> = devices
            .iter()
            .map(|d| (d.id().to_string(), d.identity().mta_key))
            .collect();
        let sid = request.session_id;
        for d in &devices {
            for req in d.mta_requests(&sid, &mta_keys).unwrap() {
                let responder = devices.iter().find(|p| p.id() == req.responder).unwrap();
                let resp = responder
                    .answer_mta(&sid, &req, &mta_keys[&req.initiator])
                    .unwrap();
                d.absorb_mta_response(&sid, &resp).unwrap();
            }
        }

        let deltas: Vec<Scalar> = devices
            .iter()
            .map(|d| d.delta_share(&sid).unwrap().delta)
            .collect();
        let delta = combine_deltas(&deltas).unwrap();
        let shares: Vec<Scalar> = devices
            .iter()
            .map(|d| d.signature_share(&sid, &delta, &commitments).unwrap().sigma)
            .collect();

        let material = devices[0].store().get("device_1", "treasury").unwrap().unwrap();
        let nonce = combine_nonce_points(commitments.values().map(|c| &c.r_point)).unwrap();
        let sig = aggregate(
            &material.group_public_key.0,
            &request.message_hash,
            &nonce,
            &shares,
            &AggregateOptions::default(),
        )
        .unwrap();
        assert_eq!(recover_address(&request.message_hash, &sig).unwrap(), material.address());

        // Session secrets are gone once the share is produced
        assert!(devices[0].delta_share(&sid).is_err());
    }

    #[test]
    fn test_second_dkg_for_target_keeps_address() {
        let devices = vec![device("device_1"), device("device_2"), device("device_3")];
        run_dkg(&devices, 2);
        let first = devices[2].store().get("device_3", "treasury").unwrap().unwrap();

        let second_info = run_dkg(&devices, 2);
        let second = devices[2].store().get("device_3", "treasury").unwrap().unwrap();

        assert_eq!(first.address(), second.address());
        assert_eq!(second.ceremony_id, second_info.ceremony_id);
        assert_ne!(first.secret_share, second.secret_share);
    }

    #[test]
    fn test_signed_requests_verify_under_identity() {
        let device = device("device_1");
        let session = uuid::Uuid::new_v4();
        let req = device
            .sign_request("submit_delta", &session, serde_json::json!({ "x": 1 }))
            .unwrap();
        req.verify(&device.identity().verifying_key, "submit_delta", &session.to_string())
            .unwrap();
    }

    #[test]
    fn test_key_share_waits_for_every_confirmation() {
        let devices = vec![device("device_1"), device("device_2")];
        let info = CeremonyInfo {
            ceremony_id: uuid::Uuid::new_v4(),
            target: "vault".into(),
            threshold: 2,
            participants: [("device_1".to_string(), 1), ("device_2".to_string(), 2)]
                .into_iter()
                .collect(),
        };
        let channel_keys: BTreeMap<_, _> = devices
            .iter()
            .map(|d| (d.id().to_string(), d.identity().channel_key))
            .collect();
        let submissions: BTreeMap<_, _> = devices
            .iter()
            .map(|d| (d.id().to_string(), d.dkg_contribution(&info, &channel_keys).unwrap()))
            .collect();
        let bundle = DkgBundle {
            info: info.clone(),
            recipient: "device_1".into(),
            contributions: submissions
                .iter()
                .map(|(sender, sub)| {
                    (
                        sender.clone(),
                        DkgContribution {
                            commitments: sub.commitments.clone(),
                            share: sub.shares["device_1"].clone(),
                        },
                    )
                })
                .collect(),
        };
        devices[0].finalize_dkg(&bundle).unwrap();

        // Verified but not committed
        assert!(devices[0].store().get("device_1", "vault").unwrap().is_none());
        assert!(matches!(
            devices[0].commit_key_share(&info.ceremony_id, &["device_1".to_string()]),
            Err(Error::MissingState(_))
        ));
        assert!(devices[0].store().get("device_1", "vault").unwrap().is_none());

        // An abandoned ceremony leaves nothing behind
        devices[0].discard_dkg(&info.ceremony_id);
        let everyone = vec!["device_1".to_string(), "device_2".to_string()];
        assert!(devices[0].commit_key_share(&info.ceremony_id, &everyone).is_err());
        assert!(devices[0].public_share("vault").unwrap().is_none());
    }
}
