//! C7: frame parsing and the exhaustive request router.
//!
//! The dispatcher is a plain async function matched exhaustively over the
//! closed `ClientRequest` sum (§9 redesign flag: no generic RPC-framework
//! indirection). Validation lives here for simple request shapes (§4.7);
//! mutation-specific validation and fan-out live in `mutation.rs` (C8).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use beads_cli::adapter::CliRunner;
use beads_cli::config::TrackerConfig;
use beads_cli::{adapter, mapper};
use beads_proto::envelope::{
    ClientFrame, ClientRequest, Envelope, ListIssuesPayload, RawFrame, ShowIssuePayload,
    SubscribeListPayload, UnsubscribeListPayload,
};
use beads_proto::key::SubscriptionKey;
use beads_proto::subscription::SubscriptionSpec;
use serde_json::Value;

use crate::error::DispatchError;
use crate::ids::now_ms;
use crate::registry::RegistryHandle;
use crate::scheduler::SchedulerHandle;
use crate::session::{ConnectionId, ListFilters, SessionHandle, SessionSnapshot};

/// Everything a connection's read loop needs to route requests and publish
/// replies/events. `list_subs` and `detail_id` are read/written only by the
/// owning connection task (never shared); `snapshot` is the published copy
/// other tasks read for fan-out (§3, §9).
pub struct ConnectionCtx {
    pub id: ConnectionId,
    pub list_subs: HashMap<String, SubscriptionKey>,
    pub detail_id: Option<String>,
    pub snapshot: Arc<Mutex<SessionSnapshot>>,
    pub registry: RegistryHandle,
    pub scheduler: SchedulerHandle,
    pub sessions: SessionHandle,
    pub cli: Arc<dyn CliRunner>,
    pub config: TrackerConfig,
    /// §9 Open Question 3: also schedule an immediate best-effort refresh
    /// right after a successful mutation, in addition to the debounced path.
    pub immediate_refresh_on_mutation: bool,
}

impl ConnectionCtx {
    fn publish_snapshot(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        let mut snap = self.snapshot.lock().unwrap();
        f(&mut snap);
    }
}

/// Parses a raw wire frame into a typed request. `raw.id` is always present
/// (required field on `RawFrame`); a frame that fails to deserialize as JSON
/// at all never reaches this function (that's `bad-json`, caught by the
/// caller before `RawFrame` exists).
pub fn parse_frame(raw: RawFrame) -> Result<ClientFrame, (String, DispatchError)> {
    let request = match raw.kind.as_str() {
        "ping" => ClientRequest::Ping,
        "subscribe-updates" => ClientRequest::SubscribeUpdates,
        "subscribe-list" => ClientRequest::SubscribeList(parse_payload(&raw)?),
        "unsubscribe-list" => ClientRequest::UnsubscribeList(parse_payload(&raw)?),
        "show-issue" => ClientRequest::ShowIssue(parse_payload(&raw)?),
        "list-issues" => ClientRequest::ListIssues(parse_payload(&raw)?),
        "epic-status" => ClientRequest::EpicStatus,
        "update-status" => ClientRequest::UpdateStatus(parse_payload(&raw)?),
        "update-priority" => ClientRequest::UpdatePriority(parse_payload(&raw)?),
        "update-assignee" => ClientRequest::UpdateAssignee(parse_payload(&raw)?),
        "edit-text" => ClientRequest::EditText(parse_payload(&raw)?),
        "create-issue" => ClientRequest::CreateIssue(parse_payload(&raw)?),
        "dep-add" => ClientRequest::DepAdd(parse_payload(&raw)?),
        "dep-remove" => ClientRequest::DepRemove(parse_payload(&raw)?),
        "label-add" => ClientRequest::LabelAdd(parse_payload(&raw)?),
        "label-remove" => ClientRequest::LabelRemove(parse_payload(&raw)?),
        other => return Err((raw.id, DispatchError::UnknownType(other.to_string()))),
    };
    Ok(ClientFrame { id: raw.id, request })
}

fn parse_payload<T: serde::de::DeserializeOwned>(raw: &RawFrame) -> Result<T, (String, DispatchError)> {
    serde_json::from_value(raw.payload.clone())
        .map_err(|e| (raw.id.clone(), DispatchError::BadRequest(format!("invalid payload: {e}"))))
}

/// Routes one parsed request, sending its reply (and any resulting events)
/// through the session sink. Never returns a value to the caller: the reply
/// going out *through the sink* (rather than being handed back) is what
/// guarantees replies and server events for this connection stay in the
/// order they were produced (§5 "per-connection serialization of sends",
/// §8 invariant 6).
///
/// Handlers that trigger background work whose result also lands on this
/// connection's sink (an initial list refresh, a mutation's fan-out) must
/// send their own reply *before* triggering that work, then report back
/// `Ok(None)` so this function doesn't send a second time — see
/// `subscribe_list` and `mutation::mutate`.
pub async fn dispatch(ctx: &mut ConnectionCtx, id: String, request: ClientRequest) {
    let type_tag = request.type_tag();
    match handle(ctx, &id, type_tag, request).await {
        Ok(Some(payload)) => {
            ctx.sessions.send(ctx.id, Envelope::ok_reply(id, type_tag, payload)).await;
        }
        Ok(None) => {}
        Err(err) => {
            let (code, message, details) = err.into_wire();
            ctx.sessions.send(ctx.id, Envelope::err_reply(id, type_tag, code, message, details)).await;
        }
    }
}

async fn handle(
    ctx: &mut ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    request: ClientRequest,
) -> Result<Option<Value>, DispatchError> {
    match request {
        ClientRequest::Ping => Ok(Some(serde_json::json!({ "ts": now_ms() }))),
        ClientRequest::SubscribeUpdates => {
            ctx.publish_snapshot(|s| s.events_subscribed = true);
            Ok(Some(serde_json::json!({})))
        }
        ClientRequest::SubscribeList(payload) => subscribe_list(ctx, id, type_tag, payload).await,
        ClientRequest::UnsubscribeList(payload) => unsubscribe_list(ctx, payload).await.map(Some),
        ClientRequest::ShowIssue(payload) => show_issue(ctx, payload).await.map(Some),
        ClientRequest::ListIssues(payload) => list_issues(ctx, payload).await.map(Some),
        ClientRequest::EpicStatus => epic_status(ctx).await.map(Some),
        ClientRequest::UpdateStatus(payload) => crate::mutation::update_status(ctx, id, type_tag, payload).await,
        ClientRequest::UpdatePriority(payload) => crate::mutation::update_priority(ctx, id, type_tag, payload).await,
        ClientRequest::UpdateAssignee(payload) => crate::mutation::update_assignee(ctx, id, type_tag, payload).await,
        ClientRequest::EditText(payload) => crate::mutation::edit_text(ctx, id, type_tag, payload).await,
        ClientRequest::CreateIssue(payload) => crate::mutation::create_issue(ctx, id, type_tag, payload).await,
        ClientRequest::DepAdd(payload) => crate::mutation::dep_add(ctx, id, type_tag, payload).await,
        ClientRequest::DepRemove(payload) => crate::mutation::dep_remove(ctx, id, type_tag, payload).await,
        ClientRequest::LabelAdd(payload) => crate::mutation::label_add(ctx, id, type_tag, payload).await,
        ClientRequest::LabelRemove(payload) => crate::mutation::label_remove(ctx, id, type_tag, payload).await,
    }
    .map_err(|e| {
        tracing::debug!(request_id = %id, %e, "request failed");
        e
    })
}

async fn subscribe_list(
    ctx: &mut ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    payload: SubscribeListPayload,
) -> Result<Option<Value>, DispatchError> {
    if payload.id.is_empty() {
        return Err(DispatchError::BadRequest("subscribe-list requires a non-empty client label".to_string()));
    }
    let spec = SubscriptionSpec::new(payload.kind, payload.params.unwrap_or_default());
    let key = ctx.registry.attach(spec.clone(), ctx.id).await;
    ctx.list_subs.insert(payload.id.clone(), key.clone());

    if let Some(filters) = filters_for_kind(&spec) {
        ctx.publish_snapshot(|s| s.last_list_filters = Some(filters));
    }

    let reply = serde_json::json!({ "id": payload.id, "key": key.as_str() });
    ctx.sessions.send(ctx.id, Envelope::ok_reply(id.to_string(), type_tag, reply)).await;

    // Only spawned after the reply above is enqueued on this connection's
    // sink, so the initial refresh's delta (enqueued through the same
    // session actor) can never beat the reply it followed from (§8
    // invariant 6) no matter which worker thread runs it.
    let scheduler = ctx.scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = scheduler.refresh(&spec).await {
            tracing::warn!(%e, "initial refresh for new subscription failed");
        }
    });

    Ok(None)
}

/// `subscribe-list`'s params don't carry `ready`/`blocked`/`status` directly
/// (those are `list-issues` concepts) — list subscriptions map to the same
/// fan-out scopes their equivalent `list-issues` query would, so a
/// `ready-issues`/`blocked-issues` subscription is tracked as a ready/blocked
/// scope for mutation fan-out purposes too.
fn filters_for_kind(spec: &SubscriptionSpec) -> Option<ListFilters> {
    use beads_proto::subscription::SubscriptionType;
    match spec.kind {
        SubscriptionType::ReadyIssues => Some(ListFilters { ready: true, ..Default::default() }),
        SubscriptionType::BlockedIssues => Some(ListFilters { blocked: true, ..Default::default() }),
        SubscriptionType::InProgressIssues => Some(ListFilters { status: Some("in_progress".to_string()), ..Default::default() }),
        SubscriptionType::ClosedIssues => Some(ListFilters { status: Some("closed".to_string()), ..Default::default() }),
        _ => None,
    }
}

async fn unsubscribe_list(ctx: &mut ConnectionCtx, payload: UnsubscribeListPayload) -> Result<Value, DispatchError> {
    let unsubscribed = match ctx.list_subs.remove(&payload.id) {
        Some(key) => ctx.registry.detach(key, ctx.id).await,
        None => false,
    };
    Ok(serde_json::json!({ "id": payload.id, "unsubscribed": unsubscribed }))
}

async fn show_issue(ctx: &mut ConnectionCtx, payload: ShowIssuePayload) -> Result<Value, DispatchError> {
    if payload.id.is_empty() {
        return Err(DispatchError::BadRequest("show-issue requires a non-empty id".to_string()));
    }
    let args = ctx.config.inject_db_arg(vec!["show".to_string(), payload.id.clone(), "--json".to_string()]);
    let raw = adapter::run_json(ctx.cli.as_ref(), &ctx.config.binary, args, Default::default()).await?;
    let issue = mapper::normalize_one(raw).ok_or(DispatchError::NotFound)?;
    ctx.detail_id = Some(issue.id.clone());
    ctx.publish_snapshot(|s| s.detail_id = Some(issue.id.clone()));
    Ok(serde_json::to_value(&issue).expect("issue is always serializable"))
}

async fn list_issues(ctx: &mut ConnectionCtx, payload: ListIssuesPayload) -> Result<Value, DispatchError> {
    let mut args = if payload.ready {
        vec!["ready".to_string(), "--json".to_string()]
    } else if payload.blocked {
        vec!["blocked".to_string(), "--json".to_string()]
    } else {
        let mut a = vec!["list".to_string(), "--json".to_string()];
        if let Some(status) = &payload.status {
            a.push("--status".to_string());
            a.push(status.clone());
        }
        if let Some(priority) = payload.priority {
            a.push("--priority".to_string());
            a.push(priority.to_string());
        }
        if let Some(limit) = payload.limit {
            a.push("--limit".to_string());
            a.push(limit.to_string());
        }
        a
    };
    args = ctx.config.inject_db_arg(args);

    let filters = ListFilters {
        status: payload.status.clone(),
        ready: payload.ready,
        blocked: payload.blocked,
    };
    ctx.publish_snapshot(|s| s.last_list_filters = Some(filters));

    let raw = adapter::run_json(ctx.cli.as_ref(), &ctx.config.binary, args, Default::default()).await?;
    Ok(raw)
}

async fn epic_status(ctx: &mut ConnectionCtx) -> Result<Value, DispatchError> {
    let args = ctx.config.inject_db_arg(vec!["epic".to_string(), "status".to_string(), "--json".to_string()]);
    let raw = adapter::run_json(ctx.cli.as_ref(), &ctx.config.binary, args, Default::default()).await?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_frame_rejects_unknown_type() {
        let raw = RawFrame {
            id: "1".to_string(),
            kind: "not-a-real-type".to_string(),
            payload: Value::Null,
        };
        let (id, err) = parse_frame(raw).unwrap_err();
        assert_eq!(id, "1");
        assert!(matches!(err, DispatchError::UnknownType(_)));
    }

    #[test]
    fn parse_frame_accepts_ping_with_no_payload() {
        let raw = RawFrame {
            id: "1".to_string(),
            kind: "ping".to_string(),
            payload: Value::Null,
        };
        let frame = parse_frame(raw).unwrap();
        assert!(matches!(frame.request, ClientRequest::Ping));
    }

    #[test]
    fn parse_frame_rejects_malformed_payload_as_bad_request() {
        let raw = RawFrame {
            id: "1".to_string(),
            kind: "subscribe-list".to_string(),
            payload: serde_json::json!({ "id": 5 }),
        };
        let (_, err) = parse_frame(raw).unwrap_err();
        assert!(matches!(err, DispatchError::BadRequest(_)));
    }
}
