//! # tecdsa-core
//!
//! Cryptographic building blocks for (t,n) threshold ECDSA ceremonies over
//! secp256k1.
//!
//! This crate provides:
//! - Distributed Key Generation with Shamir sharing and Feldman commitments
//! - Paillier-based multiplicative-to-additive conversion with range proofs
//! - Signature share aggregation with a mandatory self-check
//! - The device side of a ceremony ([`Participant`])
//!
//! ## Protocol Overview
//!
//! Every device deals a sharing of its own secret to all devices; the group
//! key is the sum of the dealt secrets. To sign, each signer samples `k_i`
//! and `gamma_i`, runs MtA with every other signer to obtain shares of
//! `k·gamma` and `gamma·x`, and publishes `sigma_i = delta⁻¹(m·gamma_i +
//! r·chi_i)`. The shares sum to `s = k⁻¹(m + r·x)`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tecdsa_core::{Participant, store::MemoryKeyStore};
//!
//! let device = Participant::new("device_1", MemoryKeyStore::new(), 2048)?;
//! let submission = device.dkg_contribution(&ceremony_info, &channel_keys)?;
//! ```

pub mod auth;
pub mod channel;
pub mod error;
pub mod keygen;
pub mod mta;
pub mod participant;
pub mod sign;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use participant::{DeviceIdentity, Participant};
pub use types::{
    ethereum_address, CeremonyId, GroupKeyMaterial, MessageDigest, ParticipantId, Point,
    SessionId, ShareIndex, Signature, TargetId,
};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default threshold
pub const DEFAULT_THRESHOLD: usize = 3;

/// Default number of devices
pub const DEFAULT_SIGNERS: usize = 5;
