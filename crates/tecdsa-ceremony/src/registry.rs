//! Ceremony registry
//!
//! Owns every piece of coordinator state: enrolled devices, ceremonies,
//! signing sessions and the per-target share metadata. Ceremonies and
//! sessions live in `DashMap`s addressed by generated ids; holding an entry
//! gives exclusive access to that ceremony or session.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tecdsa_core::auth::{parse_verifying_key, SignedRequest};
use tecdsa_core::mta::MtaPublicKey;
use tecdsa_core::types::bytes32_hex;
use tecdsa_core::{
    CeremonyId, DeviceIdentity, ParticipantId, Point, SessionId, ShareIndex, TargetId,
};
use tracing::info;

use crate::state::{Ceremony, SigningSession};
use crate::{CeremonyError, Progress, Result};

/// Admission check consulted before any submission
pub trait Enrollment {
    /// Whether `participant_id` is an enrolled device
    fn is_enrolled(&self, participant_id: &str) -> bool;
}

/// An enrolled device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device ID
    pub participant_id: ParticipantId,
    /// 1-based share index, in enrollment order
    pub share_index: ShareIndex,
    /// ed25519 request key
    #[serde(with = "bytes32_hex")]
    pub verifying_key: [u8; 32],
    /// x25519 share channel key
    #[serde(with = "bytes32_hex")]
    pub channel_key: [u8; 32],
    /// Paillier and ring-Pedersen parameters
    pub mta_key: MtaPublicKey,
    /// Enrollment time
    pub enrolled_at: DateTime<Utc>,
}

impl DeviceRecord {
    fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.verifying_key == identity.verifying_key
            && self.channel_key == identity.channel_key
            && self.mta_key == identity.mta_key
    }
}

/// Public facts about the key of a target identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareMetadata {
    /// Target identity
    pub target: TargetId,
    /// Ceremony that produced the current shares
    pub ceremony_id: CeremonyId,
    /// Group public key
    pub group_public_key: Point,
    /// Ethereum address of the group key
    pub address: String,
    /// Threshold t
    pub threshold: usize,
    /// Participants and share indices
    pub participants: BTreeMap<ParticipantId, ShareIndex>,
    /// Last update
    pub updated_at: DateTime<Utc>,
}

/// All coordinator state
#[derive(Default)]
pub struct Registry {
    devices: DashMap<ParticipantId, DeviceRecord>,
    enrollment_lock: Mutex<()>,
    /// Serializes opening DKG ceremonies so a target has one collecting
    pub(crate) dkg_start_lock: Mutex<()>,
    pub(crate) ceremonies: DashMap<CeremonyId, Ceremony>,
    pub(crate) sessions: DashMap<SessionId, SigningSession>,
    metadata: DashMap<TargetId, ShareMetadata>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device, assigning the next share index
    ///
    /// Enrolling the same identity again returns the existing record.
    pub fn enroll(&self, identity: &DeviceIdentity, max_devices: usize) -> Result<DeviceRecord> {
        if identity.participant_id.is_empty() {
            return Err(CeremonyError::InvalidRequest("Empty participant id".into()));
        }

        let _guard = self
            .enrollment_lock
            .lock()
            .map_err(|_| CeremonyError::Transient("Enrollment lock poisoned".into()))?;

        if let Some(existing) = self.devices.get(&identity.participant_id) {
            if existing.matches(identity) {
                return Ok(existing.clone());
            }
            return Err(CeremonyError::UnauthorizedParticipant {
                participant: identity.participant_id.clone(),
                reason: "already enrolled with a different identity".into(),
                progress: Progress::default(),
            });
        }
        if self.devices.len() >= max_devices {
            return Err(CeremonyError::NotInitialized(format!(
                "Device limit of {} reached",
                max_devices
            )));
        }

        let record = DeviceRecord {
            participant_id: identity.participant_id.clone(),
            share_index: self.devices.len() as ShareIndex + 1,
            verifying_key: identity.verifying_key,
            channel_key: identity.channel_key,
            mta_key: identity.mta_key.clone(),
            enrolled_at: Utc::now(),
        };
        self.devices
            .insert(record.participant_id.clone(), record.clone());

        info!(
            participant = %record.participant_id,
            share_index = record.share_index,
            "Device enrolled"
        );
        Ok(record)
    }

    /// Record of one device
    pub fn device(&self, participant_id: &str) -> Option<DeviceRecord> {
        self.devices.get(participant_id).map(|d| d.value().clone())
    }

    /// Every device, by share index
    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> =
            self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by_key(|d| d.share_index);
        devices
    }

    /// Check a signed request against the sender's enrolled key, the
    /// operation and the ceremony or session it was signed for
    pub fn authenticate<T: Serialize>(
        &self,
        request: &SignedRequest<T>,
        operation: &str,
        resource: &str,
    ) -> Result<()> {
        let unauthorized = |reason: String| CeremonyError::UnauthorizedParticipant {
            participant: request.participant_id.clone(),
            reason,
            progress: Progress::default(),
        };
        let device = self
            .device(&request.participant_id)
            .ok_or_else(|| unauthorized("not enrolled".into()))?;
        request
            .verify(&device.verifying_key, operation, resource)
            .map_err(|e| unauthorized(e.to_string()))
    }

    /// Validate an enrollment request's keys
    pub fn check_identity(identity: &DeviceIdentity, min_paillier_bits: usize) -> Result<()> {
        parse_verifying_key(&identity.verifying_key).map_err(|e| {
            CeremonyError::UnauthorizedParticipant {
                participant: identity.participant_id.clone(),
                reason: e.to_string(),
                progress: Progress::default(),
            }
        })?;
        identity
            .mta_key
            .validate(min_paillier_bits)
            .map_err(|e| CeremonyError::InvalidRequest(e.to_string()))
    }

    /// Share metadata of a target
    pub fn share_metadata(&self, target: &str) -> Option<ShareMetadata> {
        self.metadata.get(target).map(|m| m.value().clone())
    }

    /// Store metadata for a target; the group key of a target never changes
    pub fn record_metadata(&self, metadata: ShareMetadata) -> Result<()> {
        if let Some(existing) = self.metadata.get(&metadata.target) {
            if existing.group_public_key != metadata.group_public_key {
                return Err(CeremonyError::InternalProtocolFailure {
                    reason: format!("Group key for {} would change", metadata.target),
                    progress: Progress::default(),
                });
            }
        }
        info!(
            target_id = %metadata.target,
            address = %metadata.address,
            "Share metadata recorded"
        );
        self.metadata.insert(metadata.target.clone(), metadata);
        Ok(())
    }

    /// Number of ceremonies ever started
    pub fn ceremony_count(&self) -> usize {
        self.ceremonies.len()
    }

    /// Number of signing sessions ever started
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Enrollment for Registry {
    fn is_enrolled(&self, participant_id: &str) -> bool {
        self.devices.contains_key(participant_id)
    }
}
