//! Error taxonomy on the wire (§7). Not to be confused with the internal
//! `thiserror` error types in `beads-cli`/`beads-core`: those carry Rust-level
//! context and get mapped down to one of these codes at the dispatch
//! boundary before being serialized.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// Incoming frame is not valid JSON.
    BadJson,
    /// Frame is JSON but fails envelope or payload validation.
    BadRequest,
    /// Envelope is valid but `type` is not recognized.
    UnknownType,
    /// A lookup (e.g. `show-issue`) returned no entity.
    NotFound,
    /// The tracker CLI exited non-zero, or produced non-JSON for a JSON
    /// command.
    TrackerFailed,
}
