//! C3: the subscription registry — per-key materialized item sets, their
//! subscribers, and the added/updated/removed delta computation (§4.4, §8).
//!
//! Modeled as an actor (`RegistryService` owning `HashMap<Key, Entry>`, a
//! cloneable `RegistryHandle` front) the same way the teacher shapes
//! `SessionService`/`SharedStateService`: a command enum processed by a
//! single task. Since every command here does nothing but mutate in-memory
//! maps (§5: "registry mutations must be non-suspending... operate on
//! in-memory maps only"), processing them one at a time on one task *is*
//! the per-key critical section the spec requires — no separate mutex is
//! needed for `apply_items`/`publish_delta`. Per-key serialization of
//! *refreshes* (CLI-invoke → apply_items, so two concurrent refreshes of the
//! same key can't interleave) is a different lock, owned by the scheduler
//! (`beads_core::scheduler`), not this actor.

use std::collections::HashMap;

use beads_proto::envelope::{Delta, Envelope, ServerEvent};
use beads_proto::issue::Issue;
use beads_proto::key::{self, SubscriptionKey};
use beads_proto::subscription::SubscriptionSpec;
use tokio::sync::{mpsc, oneshot};

use crate::ids::next_event_id;
use crate::session::{ConnectionId, SessionHandle};

struct Entry {
    spec: SubscriptionSpec,
    items_by_id: HashMap<String, Issue>,
    subscribers: std::collections::HashSet<ConnectionId>,
    last_refreshed_at: Option<std::time::Instant>,
}

impl Entry {
    fn new(spec: SubscriptionSpec) -> Self {
        Self {
            spec,
            items_by_id: HashMap::new(),
            subscribers: std::collections::HashSet::new(),
            last_refreshed_at: None,
        }
    }
}

enum RegistryCmd {
    Attach {
        spec: SubscriptionSpec,
        connection: ConnectionId,
        reply: oneshot::Sender<SubscriptionKey>,
    },
    Detach {
        key: SubscriptionKey,
        connection: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    OnDisconnect {
        connection: ConnectionId,
        reply: oneshot::Sender<()>,
    },
    ApplyItems {
        key: SubscriptionKey,
        items: Vec<Issue>,
        reply: oneshot::Sender<Delta>,
    },
    PublishDelta {
        key: SubscriptionKey,
        delta: Delta,
        reply: oneshot::Sender<()>,
    },
    ActiveSpecs {
        reply: oneshot::Sender<Vec<SubscriptionSpec>>,
    },
}

/// Handle for communicating with the `RegistryService` actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCmd>,
}

impl RegistryHandle {
    /// Derives the key, creates the entry if absent, adds `connection` to
    /// its subscribers (idempotent: attaching twice leaves one occurrence),
    /// returns the key.
    pub async fn attach(&self, spec: SubscriptionSpec, connection: ConnectionId) -> SubscriptionKey {
        let (reply, rx) = oneshot::channel();
        let fallback = key::key_of(&spec);
        let _ = self
            .tx
            .send(RegistryCmd::Attach { spec, connection, reply })
            .await;
        rx.await.unwrap_or(fallback)
    }

    /// Removes `connection` from `key`'s subscribers; destroys the entry if
    /// it becomes empty. Returns whether the connection had been a
    /// subscriber.
    pub async fn detach(&self, key: SubscriptionKey, connection: ConnectionId) -> bool {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RegistryCmd::Detach { key, connection, reply })
            .await;
        rx.await.unwrap_or(false)
    }

    /// Removes `connection` from every entry's subscribers, destroying any
    /// entry that becomes empty (§8 invariant 5).
    pub async fn on_disconnect(&self, connection: ConnectionId) {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RegistryCmd::OnDisconnect { connection, reply })
            .await;
        let _ = rx.await;
    }

    /// Replaces `key`'s stored items with `items`, returning the delta
    /// against the previous set (§4.4's diff law). Does not publish.
    pub async fn apply_items(&self, key: SubscriptionKey, items: Vec<Issue>) -> Delta {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RegistryCmd::ApplyItems { key, items, reply })
            .await;
        rx.await.unwrap_or(Delta {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
        })
    }

    /// Sends a `list-delta` server event to every current subscriber of
    /// `key`. A no-op if the entry no longer has subscribers (e.g. the last
    /// one unsubscribed while the refresh that produced this delta was
    /// in flight).
    pub async fn publish_delta(&self, key: SubscriptionKey, delta: Delta) {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .tx
            .send(RegistryCmd::PublishDelta { key, delta, reply })
            .await;
        let _ = rx.await;
    }

    /// The spec of every currently active (subscribed-to) key, used by the
    /// debounced refresh loop (§4.5) to know what to re-materialize.
    pub async fn active_specs(&self) -> Vec<SubscriptionSpec> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(RegistryCmd::ActiveSpecs { reply }).await;
        rx.await.unwrap_or_default()
    }
}

pub struct RegistryService {
    rx: mpsc::Receiver<RegistryCmd>,
    entries: HashMap<SubscriptionKey, Entry>,
    sessions: SessionHandle,
}

impl RegistryService {
    pub fn start(sessions: SessionHandle) -> RegistryHandle {
        let (tx, rx) = mpsc::channel(256);
        let service = Self {
            rx,
            entries: HashMap::new(),
            sessions,
        };
        tokio::spawn(service.run());
        RegistryHandle { tx }
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                RegistryCmd::Attach { spec, connection, reply } => {
                    let key = key::key_of(&spec);
                    let entry = self
                        .entries
                        .entry(key.clone())
                        .or_insert_with(|| Entry::new(spec));
                    entry.subscribers.insert(connection);
                    let _ = reply.send(key);
                }
                RegistryCmd::Detach { key, connection, reply } => {
                    let removed = self.detach_one(&key, connection);
                    let _ = reply.send(removed);
                }
                RegistryCmd::OnDisconnect { connection, reply } => {
                    self.entries.retain(|_, entry| {
                        entry.subscribers.remove(&connection);
                        !entry.subscribers.is_empty()
                    });
                    let _ = reply.send(());
                }
                RegistryCmd::ApplyItems { key, items, reply } => {
                    // A missing entry means every subscriber detached while
                    // this refresh was in flight (it was evicted). There is
                    // nobody to diff for or publish to, so this is a no-op.
                    let delta = match self.entries.get_mut(&key) {
                        Some(entry) => {
                            let delta = diff(&entry.items_by_id, &items);
                            entry.items_by_id = items.into_iter().map(|i| (i.id.clone(), i)).collect();
                            entry.last_refreshed_at = Some(std::time::Instant::now());
                            delta
                        }
                        None => Delta {
                            added: Vec::new(),
                            updated: Vec::new(),
                            removed: Vec::new(),
                        },
                    };
                    let _ = reply.send(delta);
                }
                RegistryCmd::PublishDelta { key, delta, reply } => {
                    if let Some(entry) = self.entries.get(&key) {
                        if !delta.is_empty() && !entry.subscribers.is_empty() {
                            let subscribers: Vec<ConnectionId> =
                                entry.subscribers.iter().copied().collect();
                            let event = ServerEvent::ListDelta {
                                key: key.into_string(),
                                delta,
                            };
                            let envelope = Envelope::event(
                                event.type_tag(),
                                event.into_payload(),
                                next_event_id(),
                            );
                            self.sessions.broadcast(subscribers, envelope).await;
                        }
                    }
                    let _ = reply.send(());
                }
                RegistryCmd::ActiveSpecs { reply } => {
                    let specs = self.entries.values().map(|e| e.spec.clone()).collect();
                    let _ = reply.send(specs);
                }
            }
        }
    }

    fn detach_one(&mut self, key: &SubscriptionKey, connection: ConnectionId) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let removed = entry.subscribers.remove(&connection);
        if entry.subscribers.is_empty() {
            self.entries.remove(key);
        }
        removed
    }
}

/// The diff law (§4.4, §8 invariant 2): added = new-only ids; removed =
/// old-only ids; updated = ids in both whose `updated_at` strictly
/// increased. Ties are not updates (idempotence under retransmit, invariant
/// 3); decreases are not updates either (staleness gating, invariant 4) —
/// the core defensively ignores regressions rather than treating them as
/// fresh changes.
fn diff(old: &HashMap<String, Issue>, new_items: &[Issue]) -> Delta {
    let mut added = Vec::new();
    let mut updated = Vec::new();
    let mut seen_ids = std::collections::HashSet::with_capacity(new_items.len());

    for issue in new_items {
        seen_ids.insert(issue.id.as_str());
        match old.get(&issue.id) {
            None => added.push(issue.clone()),
            Some(prev) if issue.updated_at > prev.updated_at => updated.push(issue.clone()),
            Some(_) => {}
        }
    }

    let removed = old
        .keys()
        .filter(|id| !seen_ids.contains(id.as_str()))
        .cloned()
        .collect();

    Delta {
        added,
        updated,
        removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beads_proto::subscription::SubscriptionType;
    use serde_json::Map;

    fn issue(id: &str, updated_at: i64) -> Issue {
        Issue {
            id: id.to_string(),
            updated_at,
            closed_at: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn diff_roundtrip_s2() {
        let mut old = HashMap::new();
        old.insert("A".to_string(), issue("A", 1));
        old.insert("B".to_string(), issue("B", 2));

        let next = vec![issue("B", 3), issue("C", 1)];
        let delta = diff(&old, &next);

        assert_eq!(delta.added.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["C"]);
        assert_eq!(delta.updated.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["B"]);
        assert_eq!(delta.removed, vec!["A".to_string()]);
    }

    #[test]
    fn diff_is_idempotent_on_retransmit() {
        let mut old = HashMap::new();
        old.insert("A".to_string(), issue("A", 5));
        let same = vec![issue("A", 5)];
        let delta = diff(&old, &same);
        assert!(delta.is_empty());
    }

    #[test]
    fn diff_ignores_updated_at_decreases() {
        let mut old = HashMap::new();
        old.insert("A".to_string(), issue("A", 10));
        let regressed = vec![issue("A", 3)];
        let delta = diff(&old, &regressed);
        assert!(delta.updated.is_empty());
        assert!(delta.is_empty());
    }

    #[tokio::test]
    async fn attach_is_idempotent_per_connection() {
        let (sessions, registry_tx) = crate::session::SessionService::start();
        let registry = RegistryService::start(sessions.clone());
        let _ = registry_tx.send(registry.clone()).await;

        let spec = SubscriptionSpec::bare(SubscriptionType::AllIssues);
        let conn = ConnectionId::next();
        let key1 = registry.attach(spec.clone(), conn).await;
        let key2 = registry.attach(spec, conn).await;
        assert_eq!(key1, key2);
    }

    #[tokio::test]
    async fn on_disconnect_evicts_and_destroys_empty_entries() {
        let (sessions, registry_tx) = crate::session::SessionService::start();
        let registry = RegistryService::start(sessions.clone());
        let _ = registry_tx.send(registry.clone()).await;

        let spec = SubscriptionSpec::bare(SubscriptionType::AllIssues);
        let conn = ConnectionId::next();
        registry.attach(spec, conn).await;
        registry.on_disconnect(conn).await;

        let specs = registry.active_specs().await;
        assert!(specs.is_empty());
    }

    #[tokio::test]
    async fn publish_delta_is_a_noop_with_no_subscribers() {
        let (sessions, registry_tx) = crate::session::SessionService::start();
        let registry = RegistryService::start(sessions.clone());
        let _ = registry_tx.send(registry.clone()).await;

        let key = key::key_of(&SubscriptionSpec::bare(SubscriptionType::AllIssues));
        registry
            .publish_delta(
                key,
                Delta {
                    added: vec![issue("A", 1)],
                    updated: Vec::new(),
                    removed: Vec::new(),
                },
            )
            .await;
    }
}
