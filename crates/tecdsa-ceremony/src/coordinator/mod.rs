//! Ceremony coordinator
//!
//! The coordinator is the only writer of ceremony and session state. Every
//! operation takes the entry it touches from the registry, applies one
//! submission and returns right away with the round's progress. It never
//! sees a secret scalar: DKG shares arrive sealed to their recipients and
//! MtA payloads are Paillier ciphertexts under the initiator's key.
//!
//! ```text
//! start_dkg ─► submit_dkg ×n ─► dkg_bundle / confirm_key_share ×n
//!     │
//!     ▼
//! start_signing ─► submit_commitment ×m ─► submit_mta ×2·m(m−1)
//!               ─► submit_delta ×m ─► submit_signature_share ×m ─► (r, s, v)
//! ```

mod dkg;
mod signing;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tecdsa_core::auth::SignedRequest;
use tecdsa_core::{CeremonyId, DeviceIdentity, SessionId};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::registry::{DeviceRecord, Enrollment, Registry};
use crate::state::{CeremonyView, SessionView};
use crate::{CeremonyError, CoordinatorConfig, Progress, Result};

/// Source of the current time for round deadlines
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Round and quorum state machine for DKG ceremonies and signing sessions
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Registry,
    clock: Arc<dyn Clock>,
}

impl Coordinator {
    /// Coordinator on the wall clock
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Coordinator on a caller-supplied clock
    pub fn with_clock(config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Registry::new(),
            clock,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Device and share metadata registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn deadline(&self) -> DateTime<Utc> {
        self.now()
            .checked_add_signed(self.config.round_timeout())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Enroll a device
    #[instrument(skip_all, fields(participant = %identity.participant_id))]
    pub fn enroll(
        &self,
        enrollment_key: Option<&str>,
        identity: &DeviceIdentity,
    ) -> Result<DeviceRecord> {
        if let Some(expected) = &self.config.enrollment_key {
            let presented = enrollment_key.unwrap_or_default();
            if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
                return Err(CeremonyError::UnauthorizedParticipant {
                    participant: identity.participant_id.clone(),
                    reason: "bad enrollment key".into(),
                    progress: Progress::default(),
                });
            }
        }
        Registry::check_identity(identity, self.config.min_paillier_bits)?;
        self.registry.enroll(identity, self.config.max_devices)
    }

    /// Check a signed request against the sender's enrolled key, for
    /// `operation` on the ceremony or session `resource`
    pub fn authorize<T: Serialize>(
        &self,
        request: &SignedRequest<T>,
        operation: &str,
        resource: &Uuid,
    ) -> Result<()> {
        self.registry
            .authenticate(request, operation, &resource.to_string())
    }

    /// Reject submissions from devices that never enrolled
    fn admit(&self, participant_id: &str) -> Result<()> {
        if self.registry.is_enrolled(participant_id) {
            Ok(())
        } else {
            Err(CeremonyError::UnauthorizedParticipant {
                participant: participant_id.to_string(),
                reason: "not enrolled".into(),
                progress: Progress::default(),
            })
        }
    }

    /// Public state of a ceremony
    pub fn ceremony(&self, ceremony_id: &CeremonyId) -> Result<CeremonyView> {
        self.registry
            .ceremonies
            .get(ceremony_id)
            .map(|c| c.view())
            .ok_or(CeremonyError::CeremonyNotFound(*ceremony_id))
    }

    /// Public state of a signing session
    pub fn session(&self, session_id: &SessionId) -> Result<SessionView> {
        self.registry
            .sessions
            .get(session_id)
            .map(|s| s.view())
            .ok_or(CeremonyError::SessionNotFound(*session_id))
    }

    /// Abort a ceremony; aborting twice is a no-op
    pub fn abort_ceremony(&self, ceremony_id: &CeremonyId, reason: &str) -> Result<CeremonyView> {
        let mut ceremony = self
            .registry
            .ceremonies
            .get_mut(ceremony_id)
            .ok_or(CeremonyError::CeremonyNotFound(*ceremony_id))?;
        ceremony.abort(reason);
        Ok(ceremony.view())
    }

    /// Abort a signing session; aborting twice, or after completion, is a no-op
    pub fn abort_session(&self, session_id: &SessionId, reason: &str) -> Result<SessionView> {
        let mut session = self
            .registry
            .sessions
            .get_mut(session_id)
            .ok_or(CeremonyError::SessionNotFound(*session_id))?;
        session.abort(reason);
        Ok(session.view())
    }

    /// Abort every ceremony and session whose open round is past its
    /// deadline at `now`. Returns how many were aborted.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut aborted = 0;
        for mut ceremony in self.registry.ceremonies.iter_mut() {
            if ceremony.phase.is_collecting() && now > ceremony.deadline && ceremony.abort("round timed out") {
                aborted += 1;
            }
        }
        for mut session in self.registry.sessions.iter_mut() {
            if session.phase.is_collecting() && now > session.deadline && session.abort("round timed out") {
                aborted += 1;
            }
        }
        if aborted > 0 {
            info!(aborted, "Expired rounds swept");
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tecdsa_core::auth::DeviceKey;
    use tecdsa_core::mta::{MtaKeyPair, MIN_MODULUS_BITS};

    fn identity(id: &str) -> DeviceIdentity {
        DeviceIdentity {
            participant_id: id.into(),
            verifying_key: DeviceKey::random().verifying_key(),
            channel_key: [1u8; 32],
            mta_key: MtaKeyPair::generate(MIN_MODULUS_BITS).unwrap().public().clone(),
        }
    }

    #[test]
    fn test_enrollment_key_is_enforced() {
        let config = CoordinatorConfig {
            enrollment_key: Some("open sesame".into()),
            ..Default::default()
        };
        let coordinator = Coordinator::new(config).unwrap();
        let device = identity("device_1");

        let err = coordinator.enroll(None, &device).unwrap_err();
        assert_eq!(err.status_code(), 403);
        assert!(coordinator.enroll(Some("guess"), &device).is_err());

        let record = coordinator.enroll(Some("open sesame"), &device).unwrap();
        assert_eq!(record.share_index, 1);
    }

    #[test]
    fn test_unknown_ids_are_not_found() {
        let coordinator = Coordinator::new(CoordinatorConfig::default()).unwrap();
        let id = uuid::Uuid::new_v4();
        assert_eq!(coordinator.ceremony(&id).unwrap_err().status_code(), 404);
        assert_eq!(coordinator.session(&id).unwrap_err().status_code(), 404);
        assert_eq!(coordinator.sweep_expired(Utc::now()), 0);
    }

    #[test]
    fn test_concurrent_dkg_starts_open_one_ceremony() {
        let config = CoordinatorConfig {
            threshold: 1,
            total_signers: 2,
            ..Default::default()
        };
        let coordinator = Coordinator::new(config).unwrap();
        coordinator.enroll(None, &identity("device_1")).unwrap();
        coordinator.enroll(None, &identity("device_2")).unwrap();

        let opened = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| coordinator.start_dkg(Some("vault")).is_ok()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(opened, 1);
        assert_eq!(coordinator.registry().ceremony_count(), 1);
    }
}
