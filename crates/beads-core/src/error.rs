//! Internal dispatch-level errors (§7). Distinct from `beads_proto::ErrorCode`
//! (the serializable wire taxonomy) and from `beads_cli::adapter::CliError`
//! (the lower-level CLI failure) — this is the error type `dispatch`/
//! `mutation` hand back to the caller, which then maps it to a wire
//! `ErrorBody` right before sending.

use beads_proto::error::ErrorCode;
use serde_json::Value;
use thiserror::Error;

use beads_cli::adapter::CliError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unrecognized message type `{0}`")]
    UnknownType(String),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Tracker(#[from] CliError),
}

impl DispatchError {
    /// Maps to the wire taxonomy's `(code, message, details)`.
    pub fn into_wire(self) -> (ErrorCode, String, Option<Value>) {
        let code = match &self {
            DispatchError::BadRequest(_) => ErrorCode::BadRequest,
            DispatchError::UnknownType(_) => ErrorCode::UnknownType,
            DispatchError::NotFound => ErrorCode::NotFound,
            DispatchError::Tracker(_) => ErrorCode::TrackerFailed,
        };
        let details = match &self {
            DispatchError::Tracker(err) => err
                .exit_code()
                .map(|code| serde_json::json!({ "exit_code": code })),
            _ => None,
        };
        (code, self.to_string(), details)
    }
}
