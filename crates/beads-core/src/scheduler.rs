//! C4: per-key refresh (§4.5 steps 1-7) and the debounced, coalesced global
//! refresh driven by the change watcher (C5).
//!
//! Per-key serialization is a `HashMap<SubscriptionKey, Arc<Mutex<()>>>` held
//! here, not in the registry actor — the registry stays free to serve
//! `attach`/`detach` for other keys while one key's refresh is mid-flight
//! (§4.5: "execute sequentially per key but concurrently across keys").
//!
//! The debounce timer is the teacher's lease-expiry shape from
//! `core/server.rs::detach_session`: a generation counter bumped on every
//! arm, and a single sleeping task that only fires the refresh if its own
//! generation is still current when it wakes, so a burst of arms inside the
//! window coalesces into exactly one fire (§8 S6).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beads_cli::adapter::{self, CliError, CliRunner, RunOpts};
use beads_cli::config::TrackerConfig;
use beads_cli::mapper;
use beads_proto::envelope::Delta;
use beads_proto::key::{self, SubscriptionKey};
use beads_proto::subscription::{ParamValue, SubscriptionSpec};

use crate::registry::RegistryHandle;

/// Default debounce window (§4.5: "250 ms (configurable)").
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

struct DebounceState {
    generation: u64,
    armed: bool,
}

/// Owns per-key refresh locks and the debounce generation counter. Cloned
/// freely; the locks and counter live behind `Arc`/`Mutex` so every clone
/// shares the same coalescing state.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<Inner>,
}

struct Inner {
    runner: Arc<dyn CliRunner>,
    config: TrackerConfig,
    registry: RegistryHandle,
    debounce_window: Duration,
    key_locks: Mutex<HashMap<SubscriptionKey, Arc<tokio::sync::Mutex<()>>>>,
    debounce: Mutex<DebounceState>,
}

impl SchedulerHandle {
    pub fn new(runner: Arc<dyn CliRunner>, config: TrackerConfig, registry: RegistryHandle) -> Self {
        Self::with_debounce_window(runner, config, registry, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce_window(
        runner: Arc<dyn CliRunner>,
        config: TrackerConfig,
        registry: RegistryHandle,
        debounce_window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                config,
                registry,
                debounce_window,
                key_locks: Mutex::new(HashMap::new()),
                debounce: Mutex::new(DebounceState {
                    generation: 0,
                    armed: false,
                }),
            }),
        }
    }

    fn lock_for(&self, key: &SubscriptionKey) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .key_locks
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Single-key refresh (§4.5 steps 1-7). Returns `Ok(delta)` on success
    /// (already published if non-empty); `Err` surfaces the CLI failure so
    /// the initial-subscribe caller can turn it into a `tracker-failed`
    /// reply, while a background caller just logs it (§4.5).
    pub async fn refresh(&self, spec: &SubscriptionSpec) -> Result<Delta, CliError> {
        let key = key::key_of(spec);
        let guard = self.lock_for(&key);
        let _permit = guard.lock().await;

        let argv = match mapper::argv_for(spec) {
            Ok(argv) => argv,
            Err(e) => {
                tracing::warn!(?key, %e, "cannot build argv for subscription, skipping refresh");
                return Ok(Delta {
                    added: Vec::new(),
                    updated: Vec::new(),
                    removed: Vec::new(),
                });
            }
        };
        let argv = self.inner.config.inject_db_arg(argv);

        let raw = adapter::run_json(
            self.inner.runner.as_ref(),
            &self.inner.config.binary,
            argv,
            RunOpts::default(),
        )
        .await?;

        let items = mapper::normalize(raw);
        let items = mapper::filter_closed_since(items, closed_since(spec));

        let delta = self.inner.registry.apply_items(key.clone(), items).await;
        if !delta.is_empty() {
            self.inner.registry.publish_delta(key, delta.clone()).await;
        }
        Ok(delta)
    }

    /// Arms (or re-arms) the debounce window; coalesces bursts of calls
    /// within `debounce_window` into exactly one fire (§8 S6).
    pub fn schedule_list_refresh(&self) {
        let generation = {
            let mut state = self.inner.debounce.lock().unwrap();
            state.generation += 1;
            state.armed = true;
            state.generation
        };

        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(scheduler.inner.debounce_window).await;
            let should_fire = {
                let mut state = scheduler.inner.debounce.lock().unwrap();
                if state.generation == generation {
                    state.armed = false;
                    true
                } else {
                    false
                }
            };
            if should_fire {
                scheduler.fire_debounced_refresh().await;
            }
        });
    }

    async fn fire_debounced_refresh(&self) {
        let specs = self.inner.registry.active_specs().await;
        for spec in specs {
            let scheduler = self.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.refresh(&spec).await {
                    tracing::warn!(%e, "scheduled refresh failed, retaining previous state");
                }
            });
        }
    }
}

/// Extracts the `since` param for a `closed-issues` subscription, if present
/// and numeric (§4.2).
fn closed_since(spec: &SubscriptionSpec) -> Option<f64> {
    match spec.params.get("since")? {
        ParamValue::Number(n) => Some(*n),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beads_cli::adapter::CliOutput;
    use beads_proto::subscription::SubscriptionType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct ScriptedCli {
        responses: StdMutex<Vec<CliOutput>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CliRunner for ScriptedCli {
        async fn run(&self, _args: &[String], _opts: RunOpts) -> CliOutput {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn config() -> TrackerConfig {
        TrackerConfig {
            binary: "bd".to_string(),
            db_path: None,
        }
    }

    #[tokio::test]
    async fn refresh_publishes_delta_on_first_run() {
        let (sessions, registry_tx) = crate::session::SessionService::start();
        let registry = crate::registry::RegistryService::start(sessions.clone());
        let _ = registry_tx.send(registry.clone()).await;

        let spec = SubscriptionSpec::bare(SubscriptionType::AllIssues);
        let conn = crate::session::ConnectionId::next();
        registry.attach(spec.clone(), conn).await;

        let cli = Arc::new(ScriptedCli {
            responses: StdMutex::new(vec![CliOutput {
                code: 0,
                stdout: r#"[{"id":"A","updated_at":1}]"#.to_string(),
                stderr: String::new(),
            }]),
            calls: AtomicUsize::new(0),
        });
        let scheduler = SchedulerHandle::new(cli.clone(), config(), registry.clone());

        let delta = scheduler.refresh(&spec).await.unwrap();
        assert_eq!(delta.added.len(), 1);
        assert_eq!(cli.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_failure_retains_previous_state() {
        let (sessions, registry_tx) = crate::session::SessionService::start();
        let registry = crate::registry::RegistryService::start(sessions.clone());
        let _ = registry_tx.send(registry.clone()).await;

        let spec = SubscriptionSpec::bare(SubscriptionType::AllIssues);
        let conn = crate::session::ConnectionId::next();
        registry.attach(spec.clone(), conn).await;

        let cli = Arc::new(ScriptedCli {
            responses: StdMutex::new(vec![CliOutput {
                code: 1,
                stdout: String::new(),
                stderr: "db locked".to_string(),
            }]),
            calls: AtomicUsize::new(0),
        });
        let scheduler = SchedulerHandle::new(cli, config(), registry.clone());

        let err = scheduler.refresh(&spec).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn missing_param_skips_refresh_without_error() {
        let (sessions, registry_tx) = crate::session::SessionService::start();
        let registry = crate::registry::RegistryService::start(sessions.clone());
        let _ = registry_tx.send(registry.clone()).await;

        let spec = SubscriptionSpec::bare(SubscriptionType::IssuesForEpic);
        let cli = Arc::new(ScriptedCli {
            responses: StdMutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        let scheduler = SchedulerHandle::new(cli.clone(), config(), registry);

        let delta = scheduler.refresh(&spec).await.unwrap();
        assert!(delta.is_empty());
        assert_eq!(cli.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn debounce_coalesces_bursts_into_one_fire() {
        let (sessions, registry_tx) = crate::session::SessionService::start();
        let registry = crate::registry::RegistryService::start(sessions.clone());
        let _ = registry_tx.send(registry.clone()).await;

        let spec = SubscriptionSpec::bare(SubscriptionType::AllIssues);
        let conn = crate::session::ConnectionId::next();
        registry.attach(spec, conn).await;

        let cli = Arc::new(ScriptedCli {
            responses: StdMutex::new(vec![CliOutput {
                code: 0,
                stdout: r#"[{"id":"A","updated_at":1}]"#.to_string(),
                stderr: String::new(),
            }]),
            calls: AtomicUsize::new(0),
        });
        let scheduler = SchedulerHandle::with_debounce_window(
            cli.clone(),
            config(),
            registry,
            Duration::from_millis(40),
        );

        scheduler.schedule_list_refresh();
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.schedule_list_refresh();
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.schedule_list_refresh();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cli.calls.load(Ordering::SeqCst), 1);
    }
}
