//! Wire types for the beads bridge daemon protocol.
//!
//! This crate defines the JSON envelope, the closed sum of client request
//! and server event variants, the normalized `Issue` shape, and the
//! subscription key derivation that the rest of the daemon is built on.

pub mod envelope;
pub mod error;
pub mod issue;
pub mod key;
pub mod paths;
pub mod subscription;

pub use envelope::{ClientFrame, Envelope, ErrorBody, ServerEvent};
pub use error::ErrorCode;
pub use issue::Issue;
pub use key::SubscriptionKey;
pub use subscription::{SubscriptionParams, SubscriptionType};
