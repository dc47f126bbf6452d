//! C1: shell-free invocation of the `bd` tracker binary.
//!
//! Mirrors `ProcessLauncher::launch` in the teacher's `launcher.rs`, adapted
//! from "spawn a long-lived server and keep a duplex pipe open" to "spawn,
//! wait, capture, exit" — `bd` is a conventional argv-in/JSON-out CLI, not a
//! persistent JSON-RPC peer.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Exit code synthesized when the child process could not be spawned at all
/// (binary missing, permission denied, etc.) — the contract's "spawn-failure
/// surfaces as `code=127`".
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Exit code synthesized when a timeout killed the child before it exited.
pub const TIMEOUT_CODE: i32 = 124;

/// Options for one invocation, beyond the argv itself.
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    pub cwd: Option<std::path::PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

/// The raw result of one invocation: always populated, never an `Err` on its
/// own — spawn failure and timeout are folded into `code`/`stderr` per the
/// adapter's contract.
#[derive(Debug, Clone)]
pub struct CliOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CliOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    fn from_output(out: std::process::Output) -> Self {
        Self {
            code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        }
    }
}

/// Errors surfaced by `run_json` once a `CliOutput` has been interpreted as a
/// JSON command's result. Distinct from `beads_proto::ErrorCode`: this is the
/// internal, Rust-level error; the dispatcher maps it down to `tracker-failed`
/// at the wire boundary.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("`{binary}` exited with status {code}: {stderr}")]
    NonZeroExit {
        binary: String,
        code: i32,
        stderr: String,
    },
    #[error("`{binary}` produced invalid JSON: {source}")]
    InvalidJson {
        binary: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CliError {
    /// `details.exit_code` for the wire `tracker-failed` error (§7). Absent
    /// for the invalid-JSON case, since the exit code there is zero and not
    /// informative.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CliError::NonZeroExit { code, .. } => Some(*code),
            CliError::InvalidJson { .. } => None,
        }
    }
}

/// Abstracts process spawning so registry/scheduler tests can swap in a fake
/// without touching a real `bd` binary — the same split the teacher draws
/// between `ProcessLauncher` and `TestLauncher`.
#[async_trait]
pub trait CliRunner: Send + Sync + 'static {
    async fn run(&self, args: &[String], opts: RunOpts) -> CliOutput;
}

/// Production runner: spawns the configured tracker binary as a child
/// process with piped stdout/stderr and a null stdin (`bd` is never
/// interactive from this daemon).
#[derive(Debug, Clone)]
pub struct ProcessCliRunner {
    binary: String,
}

impl ProcessCliRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

#[async_trait]
impl CliRunner for ProcessCliRunner {
    async fn run(&self, args: &[String], opts: RunOpts) -> CliOutput {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out child must die hard (§4.1); kill_on_drop ensures
            // that dropping the in-flight future on timeout actually kills it.
            .kill_on_drop(true);

        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CliOutput {
                    code: SPAWN_FAILURE_CODE,
                    stdout: String::new(),
                    stderr: format!("failed to spawn `{}`: {e}", self.binary),
                };
            }
        };

        let wait = child.wait_with_output();
        match opts.timeout {
            Some(d) => match tokio::time::timeout(d, wait).await {
                Ok(Ok(out)) => CliOutput::from_output(out),
                Ok(Err(e)) => CliOutput {
                    code: -1,
                    stdout: String::new(),
                    stderr: format!("io error waiting for `{}`: {e}", self.binary),
                },
                Err(_) => CliOutput {
                    code: TIMEOUT_CODE,
                    stdout: String::new(),
                    stderr: format!("`{}` timed out after {:?}", self.binary, d),
                },
            },
            None => match wait.await {
                Ok(out) => CliOutput::from_output(out),
                Err(e) => CliOutput {
                    code: -1,
                    stdout: String::new(),
                    stderr: format!("io error waiting for `{}`: {e}", self.binary),
                },
            },
        }
    }
}

/// `run_json`: runs the command, then on a zero exit parses stdout as JSON;
/// on a non-zero exit the captured stderr becomes the error (never parsed).
/// The adapter never retries on its own.
pub async fn run_json(
    runner: &dyn CliRunner,
    binary: &str,
    args: Vec<String>,
    opts: RunOpts,
) -> Result<Value, CliError> {
    let out = runner.run(&args, opts).await;
    if out.code != 0 {
        return Err(CliError::NonZeroExit {
            binary: binary.to_string(),
            code: out.code,
            stderr: out.stderr,
        });
    }
    serde_json::from_str(&out.stdout).map_err(|source| CliError::InvalidJson {
        binary: binary.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeCli {
        pub calls: Mutex<Vec<Vec<String>>>,
        pub next: Mutex<Vec<CliOutput>>,
    }

    impl FakeCli {
        pub fn push(&self, output: CliOutput) {
            self.next.lock().unwrap().push(output);
        }
    }

    #[async_trait]
    impl CliRunner for FakeCli {
        async fn run(&self, args: &[String], _opts: RunOpts) -> CliOutput {
            self.calls.lock().unwrap().push(args.to_vec());
            self.next.lock().unwrap().remove(0)
        }
    }

    #[tokio::test]
    async fn run_json_parses_stdout_on_success() {
        let fake = FakeCli::default();
        fake.push(CliOutput {
            code: 0,
            stdout: r#"[{"id":"A"}]"#.to_string(),
            stderr: String::new(),
        });
        let value = run_json(&fake, "bd", vec!["list".into(), "--json".into()], RunOpts::default())
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!([{"id": "A"}]));
    }

    #[tokio::test]
    async fn run_json_surfaces_non_zero_exit_as_error() {
        let fake = FakeCli::default();
        fake.push(CliOutput {
            code: 2,
            stdout: String::new(),
            stderr: "db locked".to_string(),
        });
        let err = run_json(&fake, "bd", vec!["list".into()], RunOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(2));
        assert!(err.to_string().contains("db locked"));
    }

    #[tokio::test]
    async fn run_json_reports_invalid_json_with_zero_exit() {
        let fake = FakeCli::default();
        fake.push(CliOutput {
            code: 0,
            stdout: "not json".to_string(),
            stderr: String::new(),
        });
        let err = run_json(&fake, "bd", vec!["list".into()], RunOpts::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::InvalidJson { .. }));
        assert_eq!(err.exit_code(), None);
    }

    #[tokio::test]
    async fn process_runner_surfaces_spawn_failure_as_code_127() {
        let runner = ProcessCliRunner::new("this-binary-does-not-exist-surely-not");
        let out = runner.run(&["--json".to_string()], RunOpts::default()).await;
        assert_eq!(out.code, SPAWN_FAILURE_CODE);
        assert!(out.stderr.contains("failed to spawn"));
    }
}
