//! The JSON wire envelope (§6.1) and the closed sum of client request /
//! server event variants (§9 redesign flag: "model as a closed sum of
//! request variants... the dispatcher becomes exhaustive").

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;
use crate::issue::Issue;
use crate::subscription::{SubscriptionParams, SubscriptionType};

/// The envelope as it appears on the wire, before its `type` has been
/// matched against the closed request set. Parsing this from raw text is
/// the `bad-json` boundary; matching `kind` and `payload` against a known
/// variant is the `bad-request`/`unknown-type` boundary.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFrame {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

/// An outgoing envelope: a reply or a server-originated event.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    /// A successful reply to a client request.
    pub fn ok_reply(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            ok: Some(true),
            payload: Some(payload),
            error: None,
        }
    }

    /// A failed reply. `id` is `"unknown"` for frames that could not be
    /// correlated (malformed JSON, missing `id`/`type`).
    pub fn err_reply(
        id: impl Into<String>,
        kind: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            ok: Some(false),
            payload: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
                details,
            }),
        }
    }

    /// A server-initiated event; `ok: true`, server-chosen correlation id.
    pub fn event(kind: impl Into<String>, payload: Value, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            ok: Some(true),
            payload: Some(payload),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// A successfully parsed client frame: correlation id plus the matched
/// request variant.
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub id: String,
    pub request: ClientRequest,
}

/// The closed sum of requests a client may send (§6.1).
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Ping,
    SubscribeUpdates,
    SubscribeList(SubscribeListPayload),
    UnsubscribeList(UnsubscribeListPayload),
    ShowIssue(ShowIssuePayload),
    ListIssues(ListIssuesPayload),
    EpicStatus,
    UpdateStatus(UpdateStatusPayload),
    UpdatePriority(UpdatePriorityPayload),
    UpdateAssignee(UpdateAssigneePayload),
    EditText(EditTextPayload),
    CreateIssue(CreateIssuePayload),
    DepAdd(DepPayload),
    DepRemove(DepPayload),
    LabelAdd(LabelPayload),
    LabelRemove(LabelPayload),
}

impl ClientRequest {
    /// The wire type tag this request was (or would be) sent under, used to
    /// echo back the same `type` on the reply.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ClientRequest::Ping => "ping",
            ClientRequest::SubscribeUpdates => "subscribe-updates",
            ClientRequest::SubscribeList(_) => "subscribe-list",
            ClientRequest::UnsubscribeList(_) => "unsubscribe-list",
            ClientRequest::ShowIssue(_) => "show-issue",
            ClientRequest::ListIssues(_) => "list-issues",
            ClientRequest::EpicStatus => "epic-status",
            ClientRequest::UpdateStatus(_) => "update-status",
            ClientRequest::UpdatePriority(_) => "update-priority",
            ClientRequest::UpdateAssignee(_) => "update-assignee",
            ClientRequest::EditText(_) => "edit-text",
            ClientRequest::CreateIssue(_) => "create-issue",
            ClientRequest::DepAdd(_) => "dep-add",
            ClientRequest::DepRemove(_) => "dep-remove",
            ClientRequest::LabelAdd(_) => "label-add",
            ClientRequest::LabelRemove(_) => "label-remove",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeListPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SubscriptionType,
    #[serde(default)]
    pub params: Option<SubscriptionParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribeListPayload {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShowIssuePayload {
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListIssuesPayload {
    pub status: Option<String>,
    pub priority: Option<i64>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub blocked: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStatusPayload {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePriorityPayload {
    pub id: String,
    pub priority: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateAssigneePayload {
    pub id: String,
    pub assignee: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditTextPayload {
    pub id: String,
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateIssuePayload {
    pub title: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub priority: Option<i64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepPayload {
    pub a: String,
    pub b: String,
    pub view_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelPayload {
    pub id: String,
    pub label: String,
}

/// Server event payloads (§4.4, §4.8).
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ServerEvent {
    ListDelta {
        key: String,
        delta: Delta,
    },
    IssuesChanged {
        ts: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<ChangeHint>,
    },
}

impl ServerEvent {
    pub fn type_tag(&self) -> &'static str {
        match self {
            ServerEvent::ListDelta { .. } => "list-delta",
            ServerEvent::IssuesChanged { .. } => "issues-changed",
        }
    }

    pub fn into_payload(self) -> Value {
        serde_json::to_value(&self).expect("server event payloads are always serializable")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Delta {
    pub added: Vec<Issue>,
    pub updated: Vec<Issue>,
    pub removed: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeHint {
    pub ids: Vec<String>,
}
