//! Small id helpers shared by the session/registry/mutation modules.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Server-chosen correlation id for server-originated events (§6.1:
/// `"evt-<timestamp>"`). A counter is appended so two events emitted within
/// the same millisecond still get distinct ids.
pub fn next_event_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("evt-{}-{n}", epoch_ms())
}

/// Current time as epoch ms, used for `issues-changed`'s `ts` field.
pub fn now_ms() -> i64 {
    epoch_ms()
}
