//! Distributed signature generation
//!
//! Signer-side session state lives in [`SigningState`]; combining the
//! published shares into a verified signature is in [`aggregate`].

pub mod aggregate;
mod dsg;
mod messages;

pub use aggregate::{
    aggregate, combine_deltas, combine_nonce_points, message_scalar, recover_address,
    AggregateOptions, NoncePoint,
};
pub use dsg::SigningState;
pub use messages::*;
