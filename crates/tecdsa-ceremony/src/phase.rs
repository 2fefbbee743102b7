//! Phases and per-round submission tracking

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{DuplicatePolicy, Progress};

/// Lifecycle phase of a ceremony or signing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Ceremony built, participants not yet admitted
    Created,
    /// Waiting for DKG submissions from every participant
    DkgCollecting,
    /// Group key derived; key shares are being confirmed
    DkgComplete,
    /// Waiting for (R_i, Gamma_i) from every signer
    SigningCollectingCommitments,
    /// Relaying MtA requests and responses
    SigningCollectingMta,
    /// Waiting for delta shares
    SigningCollectingDeltas,
    /// Waiting for signature shares
    SigningCollectingShares,
    /// Signature released
    Completed,
    /// Stopped; see the abort reason
    Aborted,
}

impl Phase {
    /// No further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Aborted)
    }

    /// A round with a deadline is open
    pub fn is_collecting(&self) -> bool {
        matches!(
            self,
            Phase::DkgCollecting
                | Phase::SigningCollectingCommitments
                | Phase::SigningCollectingMta
                | Phase::SigningCollectingDeltas
                | Phase::SigningCollectingShares
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Created => "created",
            Phase::DkgCollecting => "dkg_collecting",
            Phase::DkgComplete => "dkg_complete",
            Phase::SigningCollectingCommitments => "signing_collecting_commitments",
            Phase::SigningCollectingMta => "signing_collecting_mta",
            Phase::SigningCollectingDeltas => "signing_collecting_deltas",
            Phase::SigningCollectingShares => "signing_collecting_shares",
            Phase::Completed => "completed",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Result of offering a submission to a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stored; the count went up
    Accepted,
    /// Identical to what is stored; nothing changed
    Duplicate,
    /// Refused; nothing changed
    Conflict,
}

/// Submissions of one round, keyed by submitter
///
/// Stored entries are never overwritten.
#[derive(Debug, Clone)]
pub struct Round<K, V> {
    entries: BTreeMap<K, V>,
    required: usize,
}

impl<K: Ord, V: PartialEq> Round<K, V> {
    /// Round closing at `required` submissions
    pub fn new(required: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            required,
        }
    }

    /// Offer a submission under `policy`
    pub fn submit(&mut self, key: K, value: V, policy: DuplicatePolicy) -> Admission {
        match self.entries.get(&key) {
            None => {
                self.entries.insert(key, value);
                Admission::Accepted
            }
            Some(existing) => match policy {
                DuplicatePolicy::IgnoreIdentical if *existing == value => Admission::Duplicate,
                _ => Admission::Conflict,
            },
        }
    }

    /// Compare a resubmission against a closed round without storing it
    pub fn recheck(&self, key: &K, value: &V, policy: DuplicatePolicy) -> Admission {
        match (self.entries.get(key), policy) {
            (Some(existing), DuplicatePolicy::IgnoreIdentical) if existing == value => {
                Admission::Duplicate
            }
            _ => Admission::Conflict,
        }
    }

    /// Quorum reached
    pub fn is_complete(&self) -> bool {
        self.entries.len() >= self.required
    }

    /// Counters for status replies
    pub fn progress(&self) -> Progress {
        Progress {
            received: self.entries.len(),
            required: self.required,
        }
    }

    /// Stored submission of `key`
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Whether `key` submitted
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// All submissions in key order
    pub fn entries(&self) -> &BTreeMap<K, V> {
        &self.entries
    }
}
