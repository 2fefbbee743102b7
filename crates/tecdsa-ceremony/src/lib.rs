//! Threshold ECDSA ceremony coordinator
//!
//! This crate gates the rounds of a (t,n) threshold ECDSA deployment:
//!
//! - **DKG ceremonies**: every participant deals commitments and sealed
//!   shares; once all n are in, the group key is derived and each recipient
//!   confirms its key share.
//! - **Signing sessions**: ephemeral commitments, the MtA relay, delta
//!   shares and signature shares, each round advancing exactly at quorum.
//!
//! The [`Coordinator`] never holds a secret scalar. Devices run the
//! participant side from `tecdsa_core::Participant` and exchange its
//! outputs through the coordinator.
//!
//! # Example
//!
//! ```ignore
//! use tecdsa_ceremony::{Coordinator, CoordinatorConfig};
//!
//! let coordinator = Coordinator::new(CoordinatorConfig::default())?;
//! for device in &devices {
//!     coordinator.enroll(None, &device.identity())?;
//! }
//! let ceremony = coordinator.start_dkg(Some("treasury"))?;
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod phase;
pub mod registry;
pub mod state;

pub use config::{CoordinatorConfig, DuplicatePolicy};
pub use coordinator::{Clock, Coordinator, SystemClock};
pub use error::{CeremonyError, ErrorKind, Progress, Result};
pub use phase::{Admission, Phase, Round};
pub use registry::{DeviceRecord, Enrollment, Registry, ShareMetadata};
pub use state::{CeremonyView, MtaInbox, SessionView, SubmitOutcome, SubmitStatus};
