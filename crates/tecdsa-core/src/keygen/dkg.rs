//! Participant side of the DKG
//!
//! [`contribute`] deals this participant's polynomial to every participant,
//! sealing each share to its recipient. [`finalize`] opens the shares
//! addressed to this participant, checks each against its sender's Feldman
//! commitments and sums them into the key share.

use chrono::Utc;
use k256::{ProjectivePoint, Scalar};
use rand_core::CryptoRngCore;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroize;

use super::vss::{self, SecretPolynomial};
use super::{CeremonyInfo, DkgBundle, DkgSubmission};
use crate::channel::{seal, share_aad, ChannelSecret};
use crate::{Error, GroupKeyMaterial, ParticipantId, Point, Result, ShareIndex};

/// State kept between contributing and finalizing
pub struct PendingDkg {
    info: CeremonyInfo,
    participant_id: ParticipantId,
    secret_coefficient: Scalar,
    commitments: Vec<Point>,
}

impl PendingDkg {
    /// Ceremony this contribution belongs to
    pub fn info(&self) -> &CeremonyInfo {
        &self.info
    }
}

impl Drop for PendingDkg {
    fn drop(&mut self) {
        self.secret_coefficient.zeroize();
    }
}

/// Deal a fresh polynomial (reusing `existing_secret` as coefficient[0] if given)
#[instrument(skip(channel_keys, existing_secret, rng), fields(ceremony = %info.ceremony_id))]
pub fn contribute<R: CryptoRngCore>(
    info: &CeremonyInfo,
    participant_id: &str,
    channel_keys: &BTreeMap<ParticipantId, [u8; 32]>,
    existing_secret: Option<Scalar>,
    rng: &mut R,
) -> Result<(DkgSubmission, PendingDkg)> {
    if info.index_of(participant_id).is_none() {
        return Err(Error::MissingState(format!(
            "{} is not a participant of ceremony {}",
            participant_id, info.ceremony_id
        )));
    }

    let indices: Vec<ShareIndex> = info.participants.values().copied().collect();
    let reused = existing_secret.is_some();
    let poly = match existing_secret {
        Some(secret) => SecretPolynomial::with_secret(secret, info.threshold, rng),
        None => SecretPolynomial::random(info.threshold, rng),
    };
    if poly.threshold() < 1 || poly.threshold() > indices.len() {
        return Err(Error::InvalidThreshold {
            threshold: info.threshold,
            total: indices.len(),
        });
    }

    let dealing = vss::deal(&poly, &indices);

    let mut shares = BTreeMap::new();
    for (recipient, index) in &info.participants {
        let recipient_key = channel_keys
            .get(recipient)
            .ok_or_else(|| Error::MissingState(format!("No channel key for {}", recipient)))?;
        let share = dealing
            .shares
            .get(index)
            .ok_or(Error::InvalidShareIndex(*index))?;
        let aad = share_aad(&info.ceremony_id, participant_id, recipient);
        shares.insert(recipient.clone(), seal(share, recipient_key, &aad)?);
    }

    debug!(
        participant = participant_id,
        threshold = info.threshold,
        reused,
        "DKG contribution dealt"
    );

    let pending = PendingDkg {
        info: info.clone(),
        participant_id: participant_id.to_string(),
        secret_coefficient: poly.secret(),
        commitments: dealing.commitments.clone(),
    };

    Ok((
        DkgSubmission {
            commitments: dealing.commitments.clone(),
            shares,
        },
        pending,
    ))
}

/// Open, verify and sum the shares in `bundle`
#[instrument(skip_all, fields(ceremony = %pending.info.ceremony_id, participant = %pending.participant_id))]
pub fn finalize(
    pending: &PendingDkg,
    channel: &ChannelSecret,
    bundle: &DkgBundle,
    existing: Option<&GroupKeyMaterial>,
) -> Result<GroupKeyMaterial> {
    let info = &pending.info;
    let me = &pending.participant_id;

    if bundle.info != *info || bundle.recipient != *me {
        return Err(Error::VerificationFailed(
            "Bundle does not match the pending ceremony".into(),
        ));
    }
    if bundle.contributions.len() != info.participants.len()
        || !info
            .participants
            .keys()
            .all(|id| bundle.contributions.contains_key(id))
    {
        return Err(Error::VerificationFailed(format!(
            "Expected {} contributions, got {}",
            info.participants.len(),
            bundle.contributions.len()
        )));
    }

    let own = bundle
        .contributions
        .get(me)
        .ok_or_else(|| Error::MissingState("Own contribution missing".into()))?;
    if own.commitments != pending.commitments {
        return Err(Error::VerificationFailed(
            "Relayed commitments differ from ours".into(),
        ));
    }

    let my_index = info
        .index_of(me)
        .ok_or_else(|| Error::MissingState(format!("{} has no share index", me)))?;

    let mut secret_share = Scalar::ZERO;
    for (sender, contribution) in &bundle.contributions {
        if contribution.commitments.len() != info.threshold {
            warn!(sender = %sender, "Commitment vector has the wrong length");
            return Err(Error::ShareVerificationFailed {
                sender: sender.clone(),
            });
        }

        let aad = share_aad(&info.ceremony_id, sender, me);
        let mut share = channel
            .open(&contribution.share, &aad)
            .map_err(|_| Error::ShareVerificationFailed {
                sender: sender.clone(),
            })?;

        if !vss::verify_share(&share, &contribution.commitments, my_index) {
            share.zeroize();
            warn!(sender = %sender, "Share failed Feldman verification");
            return Err(Error::ShareVerificationFailed {
                sender: sender.clone(),
            });
        }

        secret_share += share;
        share.zeroize();
    }

    let all_commitments: Vec<&Vec<Point>> = bundle
        .contributions
        .values()
        .map(|c| &c.commitments)
        .collect();
    let group_public_key = vss::group_public_key(all_commitments.iter().copied())?;

    if let Some(previous) = existing {
        if previous.group_public_key.0 != group_public_key {
            return Err(Error::GroupKeyMismatch(info.target.clone()));
        }
    }

    let public_shares: BTreeMap<ParticipantId, Point> = info
        .participants
        .iter()
        .map(|(id, index)| {
            (
                id.clone(),
                Point(vss::public_share(all_commitments.iter().copied(), *index)),
            )
        })
        .collect();

    let own_public = ProjectivePoint::GENERATOR * secret_share;
    if public_shares.get(me).map(|p| p.0) != Some(own_public) {
        return Err(Error::VerificationFailed(
            "Key share does not match the public share".into(),
        ));
    }

    let material = GroupKeyMaterial {
        participant_id: me.clone(),
        target: info.target.clone(),
        ceremony_id: info.ceremony_id,
        share_index: my_index,
        threshold: info.threshold,
        participants: info.participants.clone(),
        secret_coefficient: pending.secret_coefficient,
        secret_share,
        group_public_key: Point(group_public_key),
        public_shares,
        created_at: existing.map(|e| e.created_at).unwrap_or_else(Utc::now),
    };

    info!(address = %material.address(), "DKG share verified");
    Ok(material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::DkgContribution;
    use rand::rngs::OsRng;

    struct Device {
        id: ParticipantId,
        channel: ChannelSecret,
    }

    fn setup(n: u32, t: usize) -> (CeremonyInfo, Vec<Device>, BTreeMap<ParticipantId, [u8; 32]>) {
        let devices: Vec<Device> = (1..=n)
            .map(|i| Device {
                id: format!("device_{}", i),
                channel: ChannelSecret::random(),
            })
            .collect();
        let info = CeremonyInfo {
            ceremony_id: uuid::Uuid::new_v4(),
            target: "treasury".into(),
            threshold: t,
            participants: (1..=n).map(|i| (format!("device_{}", i), i)).collect(),
        };
        let keys = devices
            .iter()
            .map(|d| (d.id.clone(), d.channel.public_key()))
            .collect();
        (info, devices, keys)
    }

    fn bundle_for(
        info: &CeremonyInfo,
        recipient: &str,
        submissions: &BTreeMap<ParticipantId, DkgSubmission>,
    ) -> DkgBundle {
        DkgBundle {
            info: info.clone(),
            recipient: recipient.to_string(),
            contributions: submissions
                .iter()
                .map(|(sender, sub)| {
                    (
                        sender.clone(),
                        DkgContribution {
                            commitments: sub.commitments.clone(),
                            share: sub.shares[recipient].clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_full_dkg_agrees_on_group_key() {
        let (info, devices, keys) = setup(5, 3);
        let mut submissions = BTreeMap::new();
        let mut pendings = BTreeMap::new();
        for d in &devices {
            let (sub, pending) = contribute(&info, &d.id, &keys, None, &mut OsRng).unwrap();
            assert_eq!(sub.commitments.len(), 3);
            assert_eq!(sub.shares.len(), 5);
            submissions.insert(d.id.clone(), sub);
            pendings.insert(d.id.clone(), pending);
        }

        let materials: Vec<GroupKeyMaterial> = devices
            .iter()
            .map(|d| {
                let bundle = bundle_for(&info, &d.id, &submissions);
                finalize(&pendings[&d.id], &d.channel, &bundle, None).unwrap()
            })
            .collect();

        let group_key = materials[0].group_public_key;
        assert!(materials.iter().all(|m| m.group_public_key == group_key));

        // Any three shares reconstruct the key behind the group public key
        let picked: BTreeMap<ShareIndex, Scalar> = materials[1..4]
            .iter()
            .map(|m| (m.share_index, m.secret_share))
            .collect();
        let secret = vss::interpolate(&picked).unwrap();
        assert_eq!(ProjectivePoint::GENERATOR * secret, group_key.0);
    }

    #[test]
    fn test_rejects_share_that_fails_feldman() {
        let (info, devices, keys) = setup(3, 2);
        let mut submissions = BTreeMap::new();
        let mut pendings = BTreeMap::new();
        for d in &devices {
            let (sub, pending) = contribute(&info, &d.id, &keys, None, &mut OsRng).unwrap();
            submissions.insert(d.id.clone(), sub);
            pendings.insert(d.id.clone(), pending);
        }

        // device_2 seals a share that does not match its commitments
        let bogus = Scalar::from(99u64);
        let aad = share_aad(&info.ceremony_id, "device_2", "device_1");
        let resealed = seal(&bogus, &keys["device_1"], &aad).unwrap();
        submissions
            .get_mut("device_2")
            .unwrap()
            .shares
            .insert("device_1".into(), resealed);

        let bundle = bundle_for(&info, "device_1", &submissions);
        let result = finalize(&pendings["device_1"], &devices[0].channel, &bundle, None);
        assert!(matches!(
            result,
            Err(Error::ShareVerificationFailed { sender }) if sender == "device_2"
        ));
    }

    #[test]
    fn test_reshare_keeps_group_key() {
        let (info, devices, keys) = setup(3, 2);
        let run = |info: &CeremonyInfo, previous: Option<&Vec<GroupKeyMaterial>>| {
            let mut submissions = BTreeMap::new();
            let mut pendings = BTreeMap::new();
            for (i, d) in devices.iter().enumerate() {
                let secret = previous.map(|p| p[i].secret_coefficient);
                let (sub, pending) = contribute(info, &d.id, &keys, secret, &mut OsRng).unwrap();
                submissions.insert(d.id.clone(), sub);
                pendings.insert(d.id.clone(), pending);
            }
            devices
                .iter()
                .enumerate()
                .map(|(i, d)| {
                    let bundle = bundle_for(info, &d.id, &submissions);
                    finalize(&pendings[&d.id], &d.channel, &bundle, previous.map(|p| &p[i]))
                })
                .collect::<Result<Vec<_>>>()
        };

        let first = run(&info, None).unwrap();
        let second_info = CeremonyInfo {
            ceremony_id: uuid::Uuid::new_v4(),
            ..info.clone()
        };
        let second = run(&second_info, Some(&first)).unwrap();
        assert_eq!(first[0].group_public_key, second[0].group_public_key);
        assert_ne!(first[0].secret_share, second[0].secret_share);

        // Fresh polynomials for an existing target are refused
        let third_info = CeremonyInfo {
            ceremony_id: uuid::Uuid::new_v4(),
            ..info
        };
        let mut submissions = BTreeMap::new();
        let mut pendings = BTreeMap::new();
        for d in &devices {
            let (sub, pending) = contribute(&third_info, &d.id, &keys, None, &mut OsRng).unwrap();
            submissions.insert(d.id.clone(), sub);
            pendings.insert(d.id.clone(), pending);
        }
        let bundle = bundle_for(&third_info, "device_1", &submissions);
        assert!(matches!(
            finalize(&pendings["device_1"], &devices[0].channel, &bundle, Some(&first[0])),
            Err(Error::GroupKeyMismatch(_))
        ));
    }
}
