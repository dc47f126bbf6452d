//! C5: watches the tracker's append log for changes and arms the debounce
//! timer in C4.
//!
//! Grounded directly on `ConfigWatcher` (own a `RecommendedWatcher` for RAII,
//! receive over a channel, classify by filename, best-effort — log and carry
//! on if the directory can't be watched). Unlike `ConfigWatcher`, which is
//! polled by a caller, this one is push-based: the watcher owns a background
//! thread that calls straight into `SchedulerHandle::schedule_list_refresh()`
//! as events arrive, since it holds a scheduler handle to call into rather
//! than a caller that polls it. No coalescing happens here; that's C4's job.

use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::scheduler::SchedulerHandle;

/// Owns the underlying OS watch (if one could be established) for RAII.
pub struct ChangeWatcher {
    watcher: Option<RecommendedWatcher>,
}

impl ChangeWatcher {
    /// Starts watching `log_file`'s parent directory. Any create/modify/
    /// remove event whose filename matches `log_file`'s arms `scheduler`'s
    /// debounce timer; other filenames in the same directory are ignored
    /// (§4.6). If the directory cannot be watched, this logs a warning and
    /// returns a watcher that does nothing further — subscribe-time and
    /// post-mutation refreshes still work without it.
    pub fn spawn(log_file: impl Into<PathBuf>, scheduler: SchedulerHandle) -> Self {
        let log_file = log_file.into();
        let Some(dir) = log_file.parent().map(Path::to_path_buf) else {
            tracing::warn!(path = %log_file.display(), "change log path has no parent, watcher disabled");
            return Self { watcher: None };
        };
        let Some(file_name) = log_file.file_name().map(|n| n.to_owned()) else {
            tracing::warn!(path = %log_file.display(), "change log path has no file name, watcher disabled");
            return Self { watcher: None };
        };

        let (tx, rx) = std_mpsc::channel::<notify::Result<Event>>();
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        );
        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(%e, "failed to create change watcher, disabling");
                return Self { watcher: None };
            }
        };

        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            tracing::warn!(%e, dir = %dir.display(), "failed to watch directory, disabling change watcher");
            return Self { watcher: None };
        }

        // notify's callback runs on its own thread and is not async-aware;
        // bridge back into the runtime by entering the caller's handle
        // before calling the (synchronous) scheduler method.
        let runtime = tokio::runtime::Handle::current();
        std::thread::spawn(move || {
            while let Ok(Ok(event)) = rx.recv() {
                if !matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                let matches_log = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == Some(file_name.as_os_str()));
                if matches_log {
                    let _guard = runtime.enter();
                    scheduler.schedule_list_refresh();
                }
            }
        });

        Self { watcher: Some(watcher) }
    }

    /// Whether the underlying OS watch was established successfully.
    pub fn is_active(&self) -> bool {
        self.watcher.is_some()
    }
}
