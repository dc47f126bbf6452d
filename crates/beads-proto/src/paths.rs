//! Path and address resolution shared between the bridge binary and the
//! CLI adapter. Mirrors the teacher's `default_socket_path` fallback chain
//! (env var, then a writable runtime directory, then a temp fallback), here
//! adapted to resolve a loopback bind address instead of a Unix socket,
//! since this daemon's one well-known endpoint (§6.3) is reached over
//! loopback HTTP rather than a filesystem socket.

use std::path::PathBuf;

/// Default loopback bind address when `BEADS_BRIDGE_ADDR` is unset.
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7246";

/// Resolves the address the bridge daemon should bind its HTTP/WebSocket
/// listener on.
///
/// # Resolution order
/// 1. `BEADS_BRIDGE_ADDR` environment variable.
/// 2. `127.0.0.1:7246`.
#[must_use]
pub fn default_bind_addr() -> String {
    std::env::var("BEADS_BRIDGE_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
}

/// Resolves the runtime directory used for the daemon's PID file and logs
/// (§6.4: "runtime directory for PID/log"), owned by the surrounding
/// process-supervision CLI but resolved the same way here for diagnostics.
///
/// # Resolution order
/// 1. `BEADS_RUNTIME_DIR` environment variable.
/// 2. System runtime directory (e.g. `$XDG_RUNTIME_DIR`), if writable.
/// 3. System temp directory.
#[must_use]
pub fn runtime_dir() -> PathBuf {
    if let Ok(p) = std::env::var("BEADS_RUNTIME_DIR") {
        return PathBuf::from(p);
    }
    dirs::runtime_dir()
        .filter(|p| std::fs::create_dir_all(p).is_ok())
        .unwrap_or_else(std::env::temp_dir)
}
