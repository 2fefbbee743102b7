//! Distributed Key Generation (DKG) module
//!
//! Every participant deals a Shamir sharing of its own secret with Feldman
//! commitments; the group key is the sum of the dealt secrets and each key
//! share is the sum of the shares received.

mod dkg;
mod messages;
pub mod vss;

pub use dkg::{contribute, finalize, PendingDkg};
pub use messages::*;
