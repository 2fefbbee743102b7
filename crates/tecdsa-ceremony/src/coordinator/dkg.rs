//! DKG rounds

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tecdsa_core::keygen::{
    vss, CeremonyInfo, DkgBundle, DkgContribution, DkgFailureReport, DkgSubmission,
    KeyShareConfirmation,
};
use tecdsa_core::{ethereum_address, CeremonyId, ParticipantId, Point};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::Coordinator;
use crate::phase::Admission;
use crate::registry::ShareMetadata;
use crate::state::{admitted, late_submission, Ceremony, CeremonyView, SubmitOutcome};
use crate::{CeremonyError, Phase, Result};

impl Coordinator {
    /// Open a DKG ceremony for `target` (the configured default if `None`)
    ///
    /// A target that already has a key is re-dealt among its existing
    /// participants with its existing threshold, so the key stays the same.
    #[instrument(skip(self))]
    pub fn start_dkg(&self, target: Option<&str>) -> Result<CeremonyView> {
        let target = target.unwrap_or(&self.config.default_target).to_string();
        if target.is_empty() {
            return Err(CeremonyError::InvalidRequest("Empty target".into()));
        }

        let (participants, threshold) = match self.registry.share_metadata(&target) {
            Some(metadata) => (metadata.participants, metadata.threshold),
            None => {
                let devices = self.registry.devices();
                if devices.len() < self.config.total_signers {
                    return Err(CeremonyError::NotInitialized(format!(
                        "{} of {} devices enrolled",
                        devices.len(),
                        self.config.total_signers
                    )));
                }
                let participants = devices
                    .into_iter()
                    .take(self.config.total_signers)
                    .map(|d| (d.participant_id, d.share_index))
                    .collect();
                (participants, self.config.threshold)
            }
        };

        let mut channel_keys = BTreeMap::new();
        for participant_id in participants.keys() {
            let device = self.registry.device(participant_id).ok_or_else(|| {
                CeremonyError::NotInitialized(format!("{} is no longer enrolled", participant_id))
            })?;
            channel_keys.insert(participant_id.clone(), device.channel_key);
        }

        let _guard = self
            .registry
            .dkg_start_lock
            .lock()
            .map_err(|_| CeremonyError::Transient("DKG start lock poisoned".into()))?;
        let busy = self.registry.ceremonies.iter().any(|c| {
            c.info.target == target && c.phase == Phase::DkgCollecting
        });
        if busy {
            return Err(CeremonyError::InvalidRequest(format!(
                "A DKG for {} is already collecting",
                target
            )));
        }

        let info = CeremonyInfo {
            ceremony_id: Uuid::new_v4(),
            target,
            threshold,
            participants,
        };
        let mut ceremony = Ceremony::new(info, channel_keys, self.now());
        ceremony.phase = Phase::DkgCollecting;
        ceremony.deadline = self.deadline();

        info!(
            ceremony = %ceremony.info.ceremony_id,
            target_id = %ceremony.info.target,
            threshold = ceremony.info.threshold,
            participants = ceremony.info.participants.len(),
            "DKG ceremony started"
        );
        let view = ceremony.view();
        self.registry
            .ceremonies
            .insert(ceremony.info.ceremony_id, ceremony);
        Ok(view)
    }

    /// Accept one participant's commitments and sealed shares
    #[instrument(skip(self, submission))]
    pub fn submit_dkg(
        &self,
        ceremony_id: &CeremonyId,
        participant_id: &str,
        submission: DkgSubmission,
    ) -> Result<SubmitOutcome> {
        self.admit(participant_id)?;
        let now = self.now();
        let mut ceremony = self
            .registry
            .ceremonies
            .get_mut(ceremony_id)
            .ok_or(CeremonyError::CeremonyNotFound(*ceremony_id))?;

        if !ceremony.is_member(participant_id) {
            return Err(ceremony.non_member(participant_id));
        }
        if ceremony.phase == Phase::DkgComplete {
            let key = participant_id.to_string();
            return late_submission(
                &ceremony.submissions,
                &key,
                &submission,
                self.config.duplicate_policy,
                participant_id,
                ceremony.phase,
            );
        }
        ceremony.ensure_open(now)?;

        check_shape(&ceremony.info, &submission)?;

        let admission = ceremony.submissions.submit(
            participant_id.to_string(),
            submission,
            self.config.duplicate_policy,
        );
        if admission == Admission::Accepted && ceremony.submissions.is_complete() {
            self.close_dkg_round(&mut ceremony)?;
        }

        info!(
            participant = participant_id,
            progress = %ceremony.submissions.progress(),
            ?admission,
            "DKG submission"
        );
        admitted(admission, &ceremony.submissions, participant_id, ceremony.phase)
    }

    /// All n submissions are in: derive the group key and public shares
    fn close_dkg_round(&self, ceremony: &mut Ceremony) -> Result<()> {
        let group_key = {
            let all = ceremony.submissions.entries().values().map(|s| &s.commitments);
            match vss::group_public_key(all) {
                Ok(key) => Point(key),
                Err(e) => return Err(ceremony.fail(e.to_string())),
            }
        };

        if let Some(existing) = self.registry.share_metadata(&ceremony.info.target) {
            if existing.group_public_key != group_key {
                return Err(ceremony.fail(format!(
                    "Group key for {} changed from {}",
                    ceremony.info.target, existing.address
                )));
            }
        }

        let public_shares: BTreeMap<ParticipantId, Point> = ceremony
            .info
            .participants
            .iter()
            .map(|(id, index)| {
                let all = ceremony.submissions.entries().values().map(|s| &s.commitments);
                (id.clone(), Point(vss::public_share(all, *index)))
            })
            .collect();

        ceremony.group_public_key = Some(group_key);
        ceremony.public_shares = public_shares;
        ceremony.phase = Phase::DkgComplete;

        info!(
            ceremony = %ceremony.info.ceremony_id,
            address = %ethereum_address(&group_key.0),
            "DKG round complete"
        );
        Ok(())
    }

    /// Everything `recipient` needs to finish DKG
    pub fn dkg_bundle(&self, ceremony_id: &CeremonyId, recipient: &str) -> Result<DkgBundle> {
        self.admit(recipient)?;
        let ceremony = self
            .registry
            .ceremonies
            .get(ceremony_id)
            .ok_or(CeremonyError::CeremonyNotFound(*ceremony_id))?;

        if !ceremony.is_member(recipient) {
            return Err(ceremony.non_member(recipient));
        }
        match ceremony.phase {
            Phase::DkgComplete => {}
            Phase::Aborted => {
                return Err(CeremonyError::RoundClosed(
                    ceremony.abort_reason.clone().unwrap_or_default(),
                ))
            }
            _ => {
                return Err(CeremonyError::QuorumNotYetReached {
                    progress: ceremony.submissions.progress(),
                })
            }
        }

        let mut contributions = BTreeMap::new();
        for (sender, submission) in ceremony.submissions.entries() {
            let share = submission.shares.get(recipient).ok_or_else(|| {
                CeremonyError::InvalidRequest(format!("{} dealt no share to {}", sender, recipient))
            })?;
            contributions.insert(
                sender.clone(),
                DkgContribution {
                    commitments: submission.commitments.clone(),
                    share: share.clone(),
                },
            );
        }

        Ok(DkgBundle {
            info: ceremony.info.clone(),
            recipient: recipient.to_string(),
            contributions,
        })
    }

    /// A recipient confirms its shares verified; once all n confirm, the
    /// target's share metadata is recorded and signing may start
    #[instrument(skip(self, confirmation))]
    pub fn confirm_key_share(
        &self,
        ceremony_id: &CeremonyId,
        participant_id: &str,
        confirmation: KeyShareConfirmation,
    ) -> Result<SubmitOutcome> {
        self.admit(participant_id)?;
        let mut ceremony = self
            .registry
            .ceremonies
            .get_mut(ceremony_id)
            .ok_or(CeremonyError::CeremonyNotFound(*ceremony_id))?;

        if !ceremony.is_member(participant_id) {
            return Err(ceremony.non_member(participant_id));
        }
        match ceremony.phase {
            Phase::DkgComplete => {}
            Phase::Aborted => {
                return Err(CeremonyError::RoundClosed(
                    ceremony.abort_reason.clone().unwrap_or_default(),
                ))
            }
            _ => {
                return Err(CeremonyError::QuorumNotYetReached {
                    progress: ceremony.submissions.progress(),
                })
            }
        }

        if ceremony.group_public_key != Some(confirmation.group_public_key) {
            return Err(ceremony.fail(format!(
                "{} derived a different group key",
                participant_id
            )));
        }
        if ceremony.public_shares.get(participant_id) != Some(&confirmation.public_share) {
            return Err(ceremony.fail(format!(
                "Public share of {} does not match the commitments",
                participant_id
            )));
        }

        let policy = self.config.duplicate_policy;
        let admission =
            ceremony
                .confirmations
                .submit(participant_id.to_string(), confirmation, policy);
        if admission == Admission::Accepted && ceremony.confirmations.is_complete() {
            let group_public_key = confirmation_key(&ceremony)?;
            let metadata = ShareMetadata {
                target: ceremony.info.target.clone(),
                ceremony_id: ceremony.info.ceremony_id,
                group_public_key,
                address: ethereum_address(&group_public_key.0),
                threshold: ceremony.info.threshold,
                participants: ceremony.info.participants.clone(),
                updated_at: Utc::now(),
            };
            if let Err(e) = self.registry.record_metadata(metadata) {
                return Err(ceremony.fail(e.to_string()));
            }
            info!(ceremony = %ceremony_id, "All key shares confirmed");
        }

        admitted(admission, &ceremony.confirmations, participant_id, ceremony.phase)
    }

    /// A recipient rejected a sender's share; the ceremony cannot finish
    ///
    /// Only a recipient that has not confirmed may report, and only while
    /// confirmations are still outstanding.
    #[instrument(skip(self, report))]
    pub fn report_dkg_failure(
        &self,
        ceremony_id: &CeremonyId,
        reporter: &str,
        report: DkgFailureReport,
    ) -> Result<CeremonyView> {
        self.admit(reporter)?;
        let mut ceremony = self
            .registry
            .ceremonies
            .get_mut(ceremony_id)
            .ok_or(CeremonyError::CeremonyNotFound(*ceremony_id))?;

        if !ceremony.is_member(reporter) {
            return Err(ceremony.non_member(reporter));
        }
        if !ceremony.is_member(&report.accused) {
            return Err(CeremonyError::InvalidRequest(format!(
                "{} is not a participant",
                report.accused
            )));
        }
        match ceremony.phase {
            Phase::DkgComplete => {}
            Phase::Aborted => {
                return Err(CeremonyError::RoundClosed(
                    ceremony.abort_reason.clone().unwrap_or_default(),
                ))
            }
            _ => {
                return Err(CeremonyError::QuorumNotYetReached {
                    progress: ceremony.submissions.progress(),
                })
            }
        }
        if ceremony.confirmations.is_complete() {
            return Err(CeremonyError::RoundClosed(format!(
                "every key share of ceremony {} is confirmed",
                ceremony_id
            )));
        }
        if ceremony.confirmations.entries().contains_key(reporter) {
            return Err(CeremonyError::RoundClosed(format!(
                "{} already confirmed its key share",
                reporter
            )));
        }

        warn!(
            reporter,
            accused = %report.accused,
            reason = %report.reason,
            "DKG share rejected by recipient"
        );
        ceremony.abort(&format!(
            "{} rejected the share from {}: {}",
            reporter, report.accused, report.reason
        ));
        Ok(ceremony.view())
    }
}

fn confirmation_key(ceremony: &Ceremony) -> Result<Point> {
    ceremony
        .group_public_key
        .ok_or_else(|| CeremonyError::NotInitialized("Group key not derived".into()))
}

/// Commitments of length t and exactly one sealed share per participant
fn check_shape(info: &CeremonyInfo, submission: &DkgSubmission) -> Result<()> {
    if submission.commitments.len() != info.threshold {
        return Err(CeremonyError::InvalidRequest(format!(
            "Expected {} commitments, got {}",
            info.threshold,
            submission.commitments.len()
        )));
    }
    let recipients: BTreeSet<&ParticipantId> = submission.shares.keys().collect();
    let participants: BTreeSet<&ParticipantId> = info.participants.keys().collect();
    if recipients != participants {
        return Err(CeremonyError::InvalidRequest(
            "Shares must address every participant exactly once".into(),
        ));
    }
    Ok(())
}
