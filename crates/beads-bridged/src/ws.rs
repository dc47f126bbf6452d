//! C7's transport binding: a single `GET /ws` axum route upgrading to a
//! WebSocket, a per-connection task running the parse/dispatch/write loop,
//! and a heartbeat. Grounded on `ipc::handle_connection`'s per-connection
//! `tokio::spawn` loop (adapted from a Unix-socket accept loop to an axum
//! upgrade handler) and on the split-sender/receiver/heartbeat task shape in
//! `examples/other_examples/.../server-src-realtime-websocket.rs.rs`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use beads_cli::adapter::CliRunner;
use beads_cli::config::TrackerConfig;
use beads_core::{
    ConnectionCtx, ConnectionId, ConnectionSink, RegistryHandle, SchedulerHandle, SessionHandle,
    SessionSnapshot,
};
use beads_proto::envelope::{Envelope, RawFrame};
use beads_proto::error::ErrorCode;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

/// Heartbeat interval (§4.9: "every 30s (configurable)").
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Everything a new connection needs to build its own `ConnectionCtx`.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionHandle,
    pub registry: RegistryHandle,
    pub scheduler: SchedulerHandle,
    pub cli: Arc<dyn CliRunner>,
    pub config: TrackerConfig,
    pub immediate_refresh_on_mutation: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/ws", get(ws_handler)).with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let id = ConnectionId::next();
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(tokio::sync::Mutex::new(sender));

    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    let snapshot = Arc::new(Mutex::new(SessionSnapshot::default()));
    state
        .sessions
        .register(id, ConnectionSink::new(tx), snapshot.clone())
        .await;

    let mut ctx = ConnectionCtx {
        id,
        list_subs: Default::default(),
        detail_id: None,
        snapshot,
        registry: state.registry.clone(),
        scheduler: state.scheduler.clone(),
        sessions: state.sessions.clone(),
        cli: state.cli.clone(),
        config: state.config.clone(),
        immediate_refresh_on_mutation: state.immediate_refresh_on_mutation,
    };

    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let write_sender = sender.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            let mut guard = write_sender.lock().await;
            if guard.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let heartbeat_sender = sender.clone();
    let heartbeat_last_pong = last_pong.clone();
    let mut heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let since = heartbeat_last_pong.lock().unwrap().elapsed();
            if since > HEARTBEAT_INTERVAL {
                tracing::debug!(%id, "heartbeat unanswered, closing connection");
                break;
            }
            let mut guard = heartbeat_sender.lock().await;
            if guard.send(Message::Ping(Vec::new().into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => handle_frame(&mut ctx, &text).await,
                Message::Pong(_) => {
                    *last_pong.lock().unwrap() = Instant::now();
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
            heartbeat_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
            heartbeat_task.abort();
        }
        _ = (&mut heartbeat_task) => {
            send_task.abort();
            recv_task.abort();
        }
    }

    state.sessions.unregister(id).await;
    tracing::info!(%id, "connection closed");
}

/// Parses one text frame and routes it, replying with a synthetic `bad-json`
/// or `bad-request` envelope (correlation id `"unknown"` when the frame
/// couldn't even be correlated) for anything that doesn't make it to
/// `dispatch` (§6, §7).
async fn handle_frame(ctx: &mut ConnectionCtx, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            reply_protocol_error(ctx, "unknown", ErrorCode::BadJson, format!("invalid JSON: {e}")).await;
            return;
        }
    };

    let raw: RawFrame = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            reply_protocol_error(ctx, "unknown", ErrorCode::BadRequest, format!("malformed envelope: {e}")).await;
            return;
        }
    };

    match beads_core::parse_frame(raw) {
        Ok(frame) => beads_core::dispatch(ctx, frame.id, frame.request).await,
        Err((id, err)) => {
            let (code, message, _details) = err.into_wire();
            reply_protocol_error(ctx, id, code, message).await;
        }
    }
}

async fn reply_protocol_error(
    ctx: &mut ConnectionCtx,
    id: impl Into<String>,
    code: ErrorCode,
    message: impl Into<String>,
) {
    let envelope = Envelope::err_reply(id, "unknown", code, message, None);
    ctx.sessions.send(ctx.id, envelope).await;
}
