//! Tracker binary / database path resolution (§4.1, §6.4).
//!
//! Grounded on `xeno-broker-proto::paths::default_socket_path`'s fallback
//! chain, adapted here from "resolve a socket path" to "resolve the database
//! argument to inject into every `bd` invocation".

/// Environment variable overriding the tracker binary name/path. Falls back
/// to `"bd"` on `PATH`.
pub const TRACKER_BIN_ENV: &str = "BEADS_BIN";

/// Environment variable overriding the database path injected into every
/// invocation.
pub const TRACKER_DB_ENV: &str = "BEADS_DB";

/// The flag `bd` uses for an explicit database path, used both to inject it
/// and to detect that a caller already supplied one.
pub const DB_FLAG: &str = "--db";

/// Resolved tracker configuration: which binary to run, and which database
/// path (if any) to inject into invocations that didn't already specify one.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub binary: String,
    pub db_path: Option<String>,
}

impl TrackerConfig {
    /// Resolution order for the binary: `BEADS_BIN` env var, else `"bd"`.
    /// Resolution order for the database path: env var `BEADS_DB`, else
    /// none — in which case `bd` falls back to its own project-working-
    /// directory discovery, which this daemon never re-implements.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            binary: std::env::var(TRACKER_BIN_ENV).unwrap_or_else(|_| "bd".to_string()),
            db_path: std::env::var(TRACKER_DB_ENV).ok(),
        }
    }

    /// Injects `--db <path>` into `args` unless the caller already supplied
    /// an explicit database argument or no path was resolved at all. This is
    /// implemented once, at the boundary, so no other component worries
    /// about database-path resolution (§4.1).
    pub fn inject_db_arg(&self, mut args: Vec<String>) -> Vec<String> {
        let already_explicit = args.iter().any(|a| a == DB_FLAG);
        if !already_explicit {
            if let Some(db) = &self.db_path {
                args.push(DB_FLAG.to_string());
                args.push(db.clone());
            }
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_db_path_when_resolved_and_absent() {
        let cfg = TrackerConfig {
            binary: "bd".to_string(),
            db_path: Some("/tmp/beads.db".to_string()),
        };
        let args = cfg.inject_db_arg(vec!["list".to_string(), "--json".to_string()]);
        assert_eq!(args, vec!["list", "--json", "--db", "/tmp/beads.db"]);
    }

    #[test]
    fn does_not_override_explicit_db_arg() {
        let cfg = TrackerConfig {
            binary: "bd".to_string(),
            db_path: Some("/tmp/beads.db".to_string()),
        };
        let args = cfg.inject_db_arg(vec!["list".to_string(), "--db".to_string(), "/other.db".to_string()]);
        assert_eq!(args, vec!["list", "--db", "/other.db"]);
    }

    #[test]
    fn leaves_args_untouched_when_no_path_resolved() {
        let cfg = TrackerConfig {
            binary: "bd".to_string(),
            db_path: None,
        };
        let args = cfg.inject_db_arg(vec!["list".to_string(), "--json".to_string()]);
        assert_eq!(args, vec!["list", "--json"]);
    }
}
