//! C6: connection session state and the sink/cleanup actor.
//!
//! Ported from the teacher's `services/sessions.rs`
//! (`SessionCmd::{Register,Unregister,Send,Broadcast}`, send-failure triggers
//! async cleanup fan-out). Per §3/§9, the fields a connection needs for its
//! *own* bookkeeping (`list_subs`, `detail_id`) are owned by the connection's
//! task directly, never by this actor — this actor only owns the outbound
//! sink and the small `SessionSnapshot` other tasks need to read for
//! mutation fan-out (§4.8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use beads_proto::envelope::Envelope;
use tokio::sync::mpsc;

use crate::registry::RegistryHandle;

/// Identity assigned to a connection on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The scope a legacy `list-issues` request asked for, recorded so mutation
/// fan-out (§4.8 tier 2) can decide whether this session is affected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListFilters {
    pub status: Option<String>,
    pub ready: bool,
    pub blocked: bool,
}

/// The three fan-out-relevant fields of a session (§3), published by the
/// owning connection task after every state change it makes. Everything
/// else about session state (the label→key map) never leaves the connection
/// task, so it isn't here.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub events_subscribed: bool,
    pub detail_id: Option<String>,
    pub last_list_filters: Option<ListFilters>,
}

/// A connection's outbound half: a cheap, cloneable, synchronous sink over
/// an unbounded channel, matching the teacher's `SessionSink`/`PeerSocket` —
/// sends never suspend the caller, so registry/session fan-out never blocks
/// on a slow or wedged client.
#[derive(Clone)]
pub struct ConnectionSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionSink {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx }
    }

    /// Best-effort send; `false` means the connection is already gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

struct Record {
    sink: ConnectionSink,
    snapshot: Arc<Mutex<SessionSnapshot>>,
}

enum SessionCmd {
    Register {
        id: ConnectionId,
        sink: ConnectionSink,
        snapshot: Arc<Mutex<SessionSnapshot>>,
    },
    Unregister {
        id: ConnectionId,
    },
    Send {
        id: ConnectionId,
        envelope: Envelope,
    },
    Broadcast {
        ids: Vec<ConnectionId>,
        envelope: Envelope,
    },
    AllSnapshots {
        reply: tokio::sync::oneshot::Sender<Vec<(ConnectionId, SessionSnapshot)>>,
    },
}

/// Handle for communicating with the `SessionService` actor.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCmd>,
}

impl SessionHandle {
    /// Registers a connection's sink and its snapshot handle.
    pub async fn register(
        &self,
        id: ConnectionId,
        sink: ConnectionSink,
        snapshot: Arc<Mutex<SessionSnapshot>>,
    ) {
        let _ = self
            .tx
            .send(SessionCmd::Register { id, sink, snapshot })
            .await;
    }

    /// Unregisters a connection. Triggers registry cleanup fan-out.
    pub async fn unregister(&self, id: ConnectionId) {
        let _ = self.tx.send(SessionCmd::Unregister { id }).await;
    }

    /// Sends an envelope best-effort.
    pub async fn send(&self, id: ConnectionId, envelope: Envelope) {
        let _ = self.tx.send(SessionCmd::Send { id, envelope }).await;
    }

    /// Sends the same envelope to several connections; per-connection send
    /// failures never affect delivery to the others (§7).
    pub async fn broadcast(&self, ids: Vec<ConnectionId>, envelope: Envelope) {
        if ids.is_empty() {
            return;
        }
        let _ = self.tx.send(SessionCmd::Broadcast { ids, envelope }).await;
    }

    /// Snapshot of every connected session's fan-out-relevant state, used by
    /// mutation handlers to compute `issues-changed` recipients (§4.8).
    pub async fn all_snapshots(&self) -> Vec<(ConnectionId, SessionSnapshot)> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self.tx.send(SessionCmd::AllSnapshots { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Actor owning every connected sink. The single source of truth for
/// delivery and send-failure detection; a failed send spawns non-blocking
/// registry cleanup for the dead connection rather than propagating an error
/// to the caller (§7: "a failure in fan-out to one connection MUST NOT
/// affect delivery to other connections").
pub struct SessionService {
    rx: mpsc::Receiver<SessionCmd>,
    sessions: HashMap<ConnectionId, Record>,
    registry: Option<RegistryHandle>,
}

impl SessionService {
    /// Spawns the session service actor. Returns the handle plus a one-shot
    /// channel for injecting the registry handle once it exists, resolving
    /// the cyclic dependency between the two services (sessions needs the
    /// registry for disconnect cleanup; the registry needs sessions to
    /// publish deltas) the same way the teacher's `BrokerRuntime::new` does.
    pub fn start() -> (SessionHandle, mpsc::Sender<RegistryHandle>) {
        let (tx, rx) = mpsc::channel(256);
        let (registry_tx, registry_rx) = mpsc::channel(1);
        let service = Self {
            rx,
            sessions: HashMap::new(),
            registry: None,
        };
        tokio::spawn(service.run(registry_rx));
        (SessionHandle { tx }, registry_tx)
    }

    async fn run(mut self, mut registry_rx: mpsc::Receiver<RegistryHandle>) {
        if let Some(r) = registry_rx.recv().await {
            self.registry = Some(r);
        }

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                SessionCmd::Register { id, sink, snapshot } => {
                    self.sessions.insert(id, Record { sink, snapshot });
                }
                SessionCmd::Unregister { id } => {
                    self.sessions.remove(&id);
                    self.spawn_cleanup(id);
                }
                SessionCmd::Send { id, envelope } => {
                    if !self.do_send(id, envelope) {
                        self.spawn_cleanup(id);
                    }
                }
                SessionCmd::Broadcast { ids, envelope } => {
                    let mut failed = Vec::new();
                    for id in ids {
                        if !self.do_send(id, envelope.clone()) {
                            failed.push(id);
                        }
                    }
                    for id in failed {
                        self.spawn_cleanup(id);
                    }
                }
                SessionCmd::AllSnapshots { reply } => {
                    let snapshots = self
                        .sessions
                        .iter()
                        .map(|(id, record)| (*id, record.snapshot.lock().unwrap().clone()))
                        .collect();
                    let _ = reply.send(snapshots);
                }
            }
        }
    }

    fn do_send(&mut self, id: ConnectionId, envelope: Envelope) -> bool {
        let Some(record) = self.sessions.get(&id) else {
            return false;
        };
        if record.sink.send(envelope) {
            return true;
        }
        self.sessions.remove(&id);
        false
    }

    fn spawn_cleanup(&self, id: ConnectionId) {
        if let Some(registry) = self.registry.clone() {
            tokio::spawn(async move {
                registry.on_disconnect(id).await;
            });
        }
    }
}
