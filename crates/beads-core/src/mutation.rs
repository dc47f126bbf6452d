//! C8: mutation handlers and their targeted fan-out (§4.8).
//!
//! Each handler validates its payload, runs the CLI mutation, re-reads
//! authoritative state with `show <id> --json` (the same invocation
//! `show-issue` uses, so §8 invariant 7 — "mutation reply equals what
//! show-issue would return" — holds by construction), then fans a targeted
//! `issues-changed` event out to the sessions the change is likely to
//! matter to.
//!
//! Grounded on the teacher's `set_server_status`/`LspProxyService::forward`
//! shape: build the event, hand it to the session layer, never touch a
//! socket directly; fan-out failures for one connection are collected and
//! cleaned up by the session service itself, never blocking delivery to the
//! others (§7).

use beads_cli::adapter::{self, RunOpts};
use beads_cli::mapper;
use beads_proto::envelope::{
    ChangeHint, CreateIssuePayload, DepPayload, EditTextPayload, Envelope, LabelPayload,
    ServerEvent, UpdateAssigneePayload, UpdatePriorityPayload, UpdateStatusPayload,
};
use beads_proto::issue::Issue;
use serde_json::Value;

use crate::dispatch::ConnectionCtx;
use crate::error::DispatchError;
use crate::ids::{next_event_id, now_ms};
use crate::session::ConnectionId;

const ALLOWED_STATUSES: [&str; 3] = ["open", "in_progress", "closed"];
const EDITABLE_FIELDS: [(&str, &str); 5] = [
    ("title", "--title"),
    ("description", "--description"),
    ("design", "--design"),
    ("acceptance", "--acceptance-criteria"),
    ("notes", "--notes"),
];

pub async fn update_status(
    ctx: &ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    payload: UpdateStatusPayload,
) -> Result<Option<Value>, DispatchError> {
    if !ALLOWED_STATUSES.contains(&payload.status.as_str()) {
        return Err(DispatchError::BadRequest(format!(
            "status must be one of {ALLOWED_STATUSES:?}, got `{}`",
            payload.status
        )));
    }
    let args = vec![
        "update".to_string(),
        payload.id.clone(),
        "--status".to_string(),
        payload.status,
    ];
    mutate(ctx, id, type_tag, args, &payload.id, vec![payload.id.clone()]).await
}

pub async fn update_priority(
    ctx: &ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    payload: UpdatePriorityPayload,
) -> Result<Option<Value>, DispatchError> {
    if !(0..=4).contains(&payload.priority) {
        return Err(DispatchError::BadRequest(format!(
            "priority must be in 0..=4, got {}",
            payload.priority
        )));
    }
    let args = vec![
        "update".to_string(),
        payload.id.clone(),
        "--priority".to_string(),
        payload.priority.to_string(),
    ];
    mutate(ctx, id, type_tag, args, &payload.id, vec![payload.id.clone()]).await
}

pub async fn update_assignee(
    ctx: &ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    payload: UpdateAssigneePayload,
) -> Result<Option<Value>, DispatchError> {
    let args = vec![
        "update".to_string(),
        payload.id.clone(),
        "--assignee".to_string(),
        payload.assignee,
    ];
    mutate(ctx, id, type_tag, args, &payload.id, vec![payload.id.clone()]).await
}

pub async fn edit_text(
    ctx: &ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    payload: EditTextPayload,
) -> Result<Option<Value>, DispatchError> {
    let flag = EDITABLE_FIELDS
        .iter()
        .find(|(name, _)| *name == payload.field)
        .map(|(_, flag)| *flag)
        .ok_or_else(|| {
            DispatchError::BadRequest(format!(
                "field must be one of {:?}, got `{}`",
                EDITABLE_FIELDS.map(|(name, _)| name),
                payload.field
            ))
        })?;
    let args = vec![
        "update".to_string(),
        payload.id.clone(),
        flag.to_string(),
        payload.value,
    ];
    mutate(ctx, id, type_tag, args, &payload.id, vec![payload.id.clone()]).await
}

pub async fn create_issue(
    ctx: &ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    payload: CreateIssuePayload,
) -> Result<Option<Value>, DispatchError> {
    if payload.title.is_empty() {
        return Err(DispatchError::BadRequest("create-issue requires a non-empty title".to_string()));
    }
    let mut args = vec!["create".to_string(), payload.title.clone()];
    if let Some(kind) = &payload.kind {
        args.push("-t".to_string());
        args.push(kind.clone());
    }
    if let Some(priority) = payload.priority {
        args.push("-p".to_string());
        args.push(priority.to_string());
    }
    if let Some(description) = &payload.description {
        args.push("-d".to_string());
        args.push(description.clone());
    }

    let args = ctx.config.inject_db_arg(args);
    let raw = adapter::run_json(ctx.cli.as_ref(), &ctx.config.binary, args, RunOpts::default()).await?;
    let created = mapper::normalize_one(raw).ok_or(DispatchError::NotFound)?;
    let reply = serde_json::to_value(&created).expect("issue is always serializable");

    // Reply first: fan_out's broadcast is enqueued on the same per-connection
    // sink this reply goes through, so sending the reply before fan_out runs
    // guarantees the reply reaches the wire first even when this connection
    // is itself one of fan_out's recipients (§5, §8 invariant 6).
    ctx.sessions.send(ctx.id, Envelope::ok_reply(id.to_string(), type_tag, reply)).await;
    fan_out(ctx, &created, vec![created.id.clone()]).await;
    maybe_schedule_refresh(ctx);
    Ok(None)
}

pub async fn dep_add(
    ctx: &ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    payload: DepPayload,
) -> Result<Option<Value>, DispatchError> {
    let args = vec!["dep".to_string(), "add".to_string(), payload.a.clone(), payload.b.clone()];
    mutate(ctx, id, type_tag, args, &payload.a, vec![payload.a.clone(), payload.b.clone()]).await
}

pub async fn dep_remove(
    ctx: &ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    payload: DepPayload,
) -> Result<Option<Value>, DispatchError> {
    let args = vec!["dep".to_string(), "remove".to_string(), payload.a.clone(), payload.b.clone()];
    mutate(ctx, id, type_tag, args, &payload.a, vec![payload.a.clone(), payload.b.clone()]).await
}

pub async fn label_add(
    ctx: &ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    payload: LabelPayload,
) -> Result<Option<Value>, DispatchError> {
    if payload.label.is_empty() {
        return Err(DispatchError::BadRequest("label must be non-empty".to_string()));
    }
    let args = vec!["label".to_string(), "add".to_string(), payload.id.clone(), payload.label];
    mutate(ctx, id, type_tag, args, &payload.id, vec![payload.id.clone()]).await
}

pub async fn label_remove(
    ctx: &ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    payload: LabelPayload,
) -> Result<Option<Value>, DispatchError> {
    if payload.label.is_empty() {
        return Err(DispatchError::BadRequest("label must be non-empty".to_string()));
    }
    let args = vec!["label".to_string(), "remove".to_string(), payload.id.clone(), payload.label];
    mutate(ctx, id, type_tag, args, &payload.id, vec![payload.id.clone()]).await
}

/// Shared shape for every mutation: run the argv, re-read authoritative
/// state, reply, then fan that state out. Sends the reply itself (instead of
/// returning it to `dispatch`) so it can do so before `fan_out` runs — see
/// `fan_out`'s doc comment.
async fn mutate(
    ctx: &ConnectionCtx,
    id: &str,
    type_tag: &'static str,
    args: Vec<String>,
    show_id: &str,
    hint_ids: Vec<String>,
) -> Result<Option<Value>, DispatchError> {
    let args = ctx.config.inject_db_arg(args);
    let out = ctx.cli.run(&args, RunOpts::default()).await;
    if !out.success() {
        return Err(beads_cli::adapter::CliError::NonZeroExit {
            binary: ctx.config.binary.clone(),
            code: out.code,
            stderr: out.stderr,
        }
        .into());
    }

    let show_args = ctx
        .config
        .inject_db_arg(vec!["show".to_string(), show_id.to_string(), "--json".to_string()]);
    let raw = adapter::run_json(ctx.cli.as_ref(), &ctx.config.binary, show_args, RunOpts::default()).await?;
    let issue = mapper::normalize_one(raw).ok_or(DispatchError::NotFound)?;
    let reply = serde_json::to_value(&issue).expect("issue is always serializable");

    ctx.sessions.send(ctx.id, Envelope::ok_reply(id.to_string(), type_tag, reply)).await;
    fan_out(ctx, &issue, hint_ids).await;
    maybe_schedule_refresh(ctx);
    Ok(None)
}

fn maybe_schedule_refresh(ctx: &ConnectionCtx) {
    if ctx.immediate_refresh_on_mutation {
        ctx.scheduler.schedule_list_refresh();
    }
}

/// The 4-tier recipient selection (§4.8). `mutate`/`create_issue` send this
/// request's reply before calling this function, so even if this connection
/// ends up in `tier` (it mutated something it's itself viewing or
/// list-subscribed to), its own event is enqueued on the shared session
/// actor's channel strictly after its reply, and FIFO delivery keeps that
/// order on the wire (§5, §8 invariant 6).
async fn fan_out(ctx: &ConnectionCtx, issue: &Issue, hint_ids: Vec<String>) {
    let snapshots = ctx.sessions.all_snapshots().await;
    let status = issue.extra.get("status").and_then(Value::as_str);

    let mut tier: Vec<ConnectionId> = snapshots
        .iter()
        .filter(|(_, snap)| {
            let detail_match = snap.detail_id.as_deref() == Some(issue.id.as_str());
            let list_match = snap
                .last_list_filters
                .as_ref()
                .is_some_and(|f| f.ready || f.blocked || f.status.as_deref() == status);
            detail_match || list_match
        })
        .map(|(id, _)| *id)
        .collect();

    if tier.is_empty() && !hint_ids.is_empty() {
        tier = snapshots
            .iter()
            .filter(|(_, snap)| {
                snap.detail_id
                    .as_deref()
                    .is_some_and(|d| hint_ids.iter().any(|h| h == d))
            })
            .map(|(id, _)| *id)
            .collect();
    }

    if tier.is_empty() {
        tier = snapshots
            .iter()
            .filter(|(_, snap)| snap.events_subscribed)
            .map(|(id, _)| *id)
            .collect();
    }

    if tier.is_empty() {
        return;
    }

    let event = ServerEvent::IssuesChanged {
        ts: now_ms(),
        hint: if hint_ids.is_empty() {
            None
        } else {
            Some(ChangeHint { ids: hint_ids })
        },
    };
    let envelope = Envelope::event(event.type_tag(), event.into_payload(), next_event_id());
    ctx.sessions.broadcast(tier, envelope).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beads_cli::adapter::{CliOutput, CliRunner};
    use beads_cli::config::TrackerConfig;
    use crate::registry::RegistryService;
    use crate::scheduler::SchedulerHandle;
    use crate::session::{ConnectionSink, SessionService, SessionSnapshot};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    struct ScriptedCli {
        responses: Mutex<Vec<CliOutput>>,
    }

    #[async_trait]
    impl CliRunner for ScriptedCli {
        async fn run(&self, _args: &[String], _opts: RunOpts) -> CliOutput {
            self.responses.lock().unwrap().remove(0)
        }
    }

    async fn test_ctx(cli: Arc<ScriptedCli>) -> (ConnectionCtx, tokio::sync::mpsc::UnboundedReceiver<Envelope>) {
        let cli: Arc<dyn CliRunner> = cli;
        let (sessions, registry_tx) = SessionService::start();
        let registry = RegistryService::start(sessions.clone());
        let _ = registry_tx.send(registry.clone()).await;
        let scheduler = SchedulerHandle::new(
            cli.clone(),
            TrackerConfig { binary: "bd".to_string(), db_path: None },
            registry.clone(),
        );

        let id = ConnectionId::next();
        let snapshot = Arc::new(Mutex::new(SessionSnapshot::default()));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        sessions.register(id, ConnectionSink::new(tx), snapshot.clone()).await;

        let ctx = ConnectionCtx {
            id,
            list_subs: HashMap::new(),
            detail_id: None,
            snapshot,
            registry,
            scheduler,
            sessions,
            cli,
            config: TrackerConfig { binary: "bd".to_string(), db_path: None },
            immediate_refresh_on_mutation: false,
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn update_status_rejects_unknown_status() {
        let cli = Arc::new(ScriptedCli { responses: Mutex::new(Vec::new()) });
        let (ctx, _rx) = test_ctx(cli).await;
        let err = update_status(
            &ctx,
            "req-1",
            "update-status",
            UpdateStatusPayload { id: "ISS-1".to_string(), status: "frobnicated".to_string() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::BadRequest(_)));
    }

    #[tokio::test]
    async fn update_priority_rejects_out_of_range() {
        let cli = Arc::new(ScriptedCli { responses: Mutex::new(Vec::new()) });
        let (ctx, _rx) = test_ctx(cli).await;
        let err = update_priority(
            &ctx,
            "req-1",
            "update-priority",
            UpdatePriorityPayload { id: "ISS-1".to_string(), priority: 9 },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::BadRequest(_)));
    }

    #[tokio::test]
    async fn successful_mutation_sends_authoritative_show_state_as_its_own_reply() {
        let cli = Arc::new(ScriptedCli {
            responses: Mutex::new(vec![
                CliOutput { code: 0, stdout: String::new(), stderr: String::new() },
                CliOutput {
                    code: 0,
                    stdout: r#"{"id":"ISS-1","updated_at":5,"status":"closed"}"#.to_string(),
                    stderr: String::new(),
                },
            ]),
        });
        let (ctx, mut rx) = test_ctx(cli).await;
        let handled = update_status(
            &ctx,
            "req-1",
            "update-status",
            UpdateStatusPayload { id: "ISS-1".to_string(), status: "closed".to_string() },
        )
        .await
        .unwrap();
        assert!(handled.is_none());

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.id, "req-1");
        assert_eq!(envelope.kind, "update-status");
        let payload = envelope.payload.unwrap();
        assert_eq!(payload["id"], "ISS-1");
        assert_eq!(payload["status"], "closed");
    }

    #[tokio::test]
    async fn cli_failure_on_mutation_surfaces_as_tracker_failed() {
        let cli = Arc::new(ScriptedCli {
            responses: Mutex::new(vec![CliOutput {
                code: 1,
                stdout: String::new(),
                stderr: "db locked".to_string(),
            }]),
        });
        let (ctx, _rx) = test_ctx(cli).await;
        let err = update_status(
            &ctx,
            "req-1",
            "update-status",
            UpdateStatusPayload { id: "ISS-1".to_string(), status: "closed".to_string() },
        )
        .await
        .unwrap_err();
        let (code, message, _) = err.into_wire();
        assert_eq!(code, beads_proto::error::ErrorCode::TrackerFailed);
        assert!(message.contains("db locked"));
    }

    #[tokio::test]
    async fn reply_precedes_fan_out_event_on_the_mutating_connections_own_sink() {
        let cli = Arc::new(ScriptedCli {
            responses: Mutex::new(vec![
                CliOutput { code: 0, stdout: String::new(), stderr: String::new() },
                CliOutput {
                    code: 0,
                    stdout: r#"{"id":"ISS-1","updated_at":5,"status":"closed"}"#.to_string(),
                    stderr: String::new(),
                },
            ]),
        });
        let (ctx, mut rx) = test_ctx(cli).await;

        // The mutating connection is itself a fan-out recipient (viewing the
        // issue it's about to mutate), so its own sink receives both the
        // reply and the issues-changed event — the reply must come first.
        ctx.snapshot.lock().unwrap().detail_id = Some("ISS-1".to_string());

        update_status(
            &ctx,
            "req-1",
            "update-status",
            UpdateStatusPayload { id: "ISS-1".to_string(), status: "closed".to_string() },
        )
        .await
        .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, "req-1");
        assert_eq!(first.kind, "update-status");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, "issues-changed");
    }

    #[tokio::test]
    async fn fan_out_reaches_matching_detail_session_and_drops_others() {
        let cli = Arc::new(ScriptedCli {
            responses: Mutex::new(vec![
                CliOutput { code: 0, stdout: String::new(), stderr: String::new() },
                CliOutput {
                    code: 0,
                    stdout: r#"{"id":"ISS-1","updated_at":5,"status":"closed"}"#.to_string(),
                    stderr: String::new(),
                },
            ]),
        });
        let (ctx, _rx) = test_ctx(cli).await;

        let watcher_id = ConnectionId::next();
        let watcher_snapshot = Arc::new(Mutex::new(SessionSnapshot {
            detail_id: Some("ISS-1".to_string()),
            ..Default::default()
        }));
        let (watcher_tx, mut watcher_rx) = tokio::sync::mpsc::unbounded_channel();
        ctx.sessions
            .register(watcher_id, ConnectionSink::new(watcher_tx), watcher_snapshot)
            .await;

        update_status(
            &ctx,
            "req-1",
            "update-status",
            UpdateStatusPayload { id: "ISS-1".to_string(), status: "closed".to_string() },
        )
        .await
        .unwrap();

        let event = watcher_rx.recv().await.unwrap();
        assert_eq!(event.kind, "issues-changed");
    }
}
