//! Parent-side supervision of the isolated loader process.
//!
//! Spawns one worker per attempt, feeds it the spec, enforces a hard deadline
//! and classifies the exit into a [`LoaderOutcome`]. Nothing the child does can
//! take the parent down.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::protocol::{LoadResult, LoadSpec, LoaderFailure, LoaderOutcome};
use crate::error::ErrorCode;

/// Grace period between SIGTERM and SIGKILL after a timeout.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// How to launch the worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-invoke the running binary with `args` (normally `loader-worker`).
    pub fn current_exe(args: Vec<String>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    pub fn from_config(config: &lmx_core::LoaderConfig) -> std::io::Result<Self> {
        match &config.worker_program {
            Some(program) => Ok(Self::new(program.clone(), config.worker_args.clone())),
            None => Self::current_exe(config.worker_args.clone()),
        }
    }
}

/// Runs one load attempt and classifies the outcome.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn run(&self, spec: &LoadSpec, timeout: Duration) -> LoaderOutcome;
}

/// Spawns a fresh child process per attempt.
pub struct LoaderSupervisor {
    command: WorkerCommand,
}

impl LoaderSupervisor {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

#[async_trait]
impl ModelLoader for LoaderSupervisor {
    async fn run(&self, spec: &LoadSpec, timeout: Duration) -> LoaderOutcome {
        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(e) => {
                return LoaderOutcome::Failed(
                    LoaderFailure::new(
                        ErrorCode::ModelProbeFailed,
                        format!(
                            "Failed to spawn loader worker {}: {e}",
                            self.command.program.display()
                        ),
                    )
                    .with_metadata("model_id", spec.model_id.as_str()),
                );
            }
        };
        debug!(
            model_id = %spec.model_id,
            backend = %spec.backend,
            pid = child.id(),
            "loader_spawned"
        );

        let payload = match serde_json::to_vec(spec) {
            Ok(p) => p,
            Err(e) => {
                let _ = child.kill().await;
                return LoaderOutcome::Failed(LoaderFailure::new(
                    ErrorCode::ModelProbeFailed,
                    format!("Failed to encode load spec: {e}"),
                ));
            }
        };

        let mut stdin = child.stdin.take();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let exchange = async {
            if let Some(mut input) = stdin.take() {
                // A child that exits before reading leaves a broken pipe; its
                // exit status still decides the outcome.
                let _ = input.write_all(&payload).await;
                let _ = input.shutdown().await;
            }
            let mut out = Vec::new();
            let mut err = Vec::new();
            let read_out = async {
                if let Some(s) = stdout.as_mut() {
                    let _ = s.read_to_end(&mut out).await;
                }
            };
            let read_err = async {
                if let Some(s) = stderr.as_mut() {
                    let _ = s.read_to_end(&mut err).await;
                }
            };
            tokio::join!(read_out, read_err);
            let status = child.wait().await;
            (status, out, err)
        };

        let finished = tokio::time::timeout(timeout, exchange).await;
        match finished {
            Ok((Ok(status), out, err)) => classify_exit(status, &out, &err),
            Ok((Err(e), _, _)) => LoaderOutcome::Failed(LoaderFailure::new(
                ErrorCode::ModelProbeFailed,
                format!("Failed to wait for loader worker: {e}"),
            )),
            Err(_) => {
                terminate(&mut child).await;
                warn!(
                    model_id = %spec.model_id,
                    timeout_sec = timeout.as_secs_f64(),
                    "loader_timeout"
                );
                LoaderOutcome::Timeout(
                    LoaderFailure::new(
                        ErrorCode::ModelLoadTimeout,
                        format!("Loader timed out after {}s", timeout.as_secs_f64()),
                    )
                    .with_metadata("timeout_sec", timeout.as_secs_f64())
                    .with_metadata("model_id", spec.model_id.as_str()),
                )
            }
        }
    }
}

/// SIGTERM, short grace, then SIGKILL. Always reaps the child.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain signal delivery to a pid we own and have not reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(TERMINATE_GRACE, child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }
    // `kill` sends SIGKILL and waits, so no zombie is left behind.
    let _ = child.kill().await;
}

fn first_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Map an exited child onto success, crash or structured failure.
pub fn classify_exit(status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> LoaderOutcome {
    if let Some(signal) = exit_signal(&status) {
        return LoaderOutcome::Crashed(LoaderFailure {
            signal: Some(signal),
            ..LoaderFailure::new(
                ErrorCode::ModelLoaderCrashed,
                format!("Child loader crashed with signal {signal}"),
            )
        });
    }

    let code = status.code().unwrap_or(1);
    if code == 0 {
        let Some(line) = first_line(stdout) else {
            return LoaderOutcome::Failed(LoaderFailure::new(
                ErrorCode::ModelProbeFailed,
                "Worker produced no stdout payload",
            ));
        };
        return match serde_json::from_str::<LoadResult>(&line) {
            Ok(result) if result.ok => LoaderOutcome::Success(result),
            Ok(result) => {
                let message = result
                    .reason
                    .unwrap_or_else(|| "Worker reported ok=false".to_string());
                LoaderOutcome::Failed(LoaderFailure {
                    exit_code: Some(0),
                    ..LoaderFailure::new(ErrorCode::ModelProbeFailed, message)
                        .with_metadata("backend", result.backend)
                })
            }
            Err(e) => LoaderOutcome::Failed(LoaderFailure::new(
                ErrorCode::ModelProbeFailed,
                format!("Invalid worker stdout payload: {e}"),
            )),
        };
    }

    let mut failure = match first_line(stderr) {
        Some(line) => serde_json::from_str::<LoaderFailure>(&line)
            .unwrap_or_else(|_| LoaderFailure::new(ErrorCode::ModelProbeFailed, line)),
        None => LoaderFailure::new(
            ErrorCode::ModelProbeFailed,
            ErrorCode::ModelProbeFailed.as_str(),
        ),
    };
    if failure.exit_code.is_none() {
        failure.exit_code = Some(code);
    }
    LoaderOutcome::Failed(failure)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> LoaderSupervisor {
        LoaderSupervisor::new(WorkerCommand::new(
            "/bin/sh",
            vec!["-c".into(), script.into()],
        ))
    }

    fn spec() -> LoadSpec {
        LoadSpec::new("mlx-community/test", "mlx-lm")
    }

    #[tokio::test]
    async fn test_success_parses_first_stdout_line() {
        let loader = sh(
            r#"cat >/dev/null; echo '{"ok":true,"backend":"mlx-lm","telemetry":{"probe":"ok"}}'; echo trailing"#,
        );
        let outcome = loader.run(&spec(), Duration::from_secs(10)).await;
        match outcome {
            LoaderOutcome::Success(result) => {
                assert!(result.ok);
                assert_eq!(result.backend, "mlx-lm");
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let loader = sh("exec sleep 30");
        let started = Instant::now();
        let outcome = loader.run(&spec(), Duration::from_millis(300)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        match outcome {
            LoaderOutcome::Timeout(failure) => {
                assert_eq!(failure.code, ErrorCode::ModelLoadTimeout);
                assert_eq!(failure.metadata["model_id"], "mlx-community/test");
                assert!(failure.metadata.contains_key("timeout_sec"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_signal_6_is_crash() {
        let loader = sh("kill -ABRT $$");
        let outcome = loader.run(&spec(), Duration::from_secs(10)).await;
        match outcome {
            LoaderOutcome::Crashed(failure) => {
                assert_eq!(failure.code, ErrorCode::ModelLoaderCrashed);
                assert_eq!(failure.signal, Some(6));
            }
            other => panic!("expected crash, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_structured_failure_gets_exit_code() {
        let loader = sh(
            r#"cat >/dev/null; echo '{"code":"model_incomplete","message":"missing shards"}' >&2; exit 1"#,
        );
        let outcome = loader.run(&spec(), Duration::from_secs(10)).await;
        match outcome {
            LoaderOutcome::Failed(failure) => {
                assert_eq!(failure.code, ErrorCode::ModelIncomplete);
                assert_eq!(failure.message, "missing shards");
                assert_eq!(failure.exit_code, Some(1));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_stderr_synthesizes_probe_failed() {
        let loader = sh("echo 'Segmentation in metal kernel' >&2; exit 3");
        let outcome = loader.run(&spec(), Duration::from_secs(10)).await;
        let failure = outcome.failure().cloned().unwrap();
        assert_eq!(failure.code, ErrorCode::ModelProbeFailed);
        assert_eq!(failure.message, "Segmentation in metal kernel");
        assert_eq!(failure.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_silent_nonzero_exit() {
        let outcome = sh("exit 2").run(&spec(), Duration::from_secs(10)).await;
        let failure = outcome.failure().cloned().unwrap();
        assert_eq!(failure.code, ErrorCode::ModelProbeFailed);
        assert_eq!(failure.message, "model_probe_failed");
        assert_eq!(failure.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_empty_stdout_on_success_is_probe_failed() {
        let outcome = sh("exit 0").run(&spec(), Duration::from_secs(10)).await;
        let failure = outcome.failure().cloned().unwrap();
        assert_eq!(failure.code, ErrorCode::ModelProbeFailed);
        assert_eq!(failure.message, "Worker produced no stdout payload");
    }

    #[tokio::test]
    async fn test_clean_exit_with_not_ok_payload_is_failure() {
        let loader = sh(
            r#"cat >/dev/null; echo '{"ok":false,"backend":"mlx-lm","reason":"weights unreadable"}'"#,
        );
        let outcome = loader.run(&spec(), Duration::from_secs(10)).await;
        match outcome {
            LoaderOutcome::Failed(failure) => {
                assert_eq!(failure.code, ErrorCode::ModelProbeFailed);
                assert_eq!(failure.message, "weights unreadable");
                assert_eq!(failure.exit_code, Some(0));
                assert_eq!(failure.metadata["backend"], "mlx-lm");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let bare = classify_exit(
            <ExitStatus as std::os::unix::process::ExitStatusExt>::from_raw(0),
            br#"{"ok":false,"backend":"gguf"}"#,
            b"",
        );
        assert_eq!(
            bare.failure().map(|f| f.message.as_str()),
            Some("Worker reported ok=false")
        );
    }

    #[tokio::test]
    async fn test_child_receives_spec_on_stdin() {
        // Echo the model id back through the telemetry map.
        let loader = sh(
            r#"id=$(cat | sed -n 's/.*"model_id":"\([^"]*\)".*/\1/p'); printf '{"ok":true,"backend":"gguf","telemetry":{"seen":"%s"}}\n' "$id""#,
        );
        let outcome = loader.run(&spec(), Duration::from_secs(10)).await;
        let result = outcome.into_result().unwrap();
        assert_eq!(result.telemetry["seen"], "mlx-community/test");
    }

    #[tokio::test]
    async fn test_missing_program_is_failure_not_panic() {
        let loader = LoaderSupervisor::new(WorkerCommand::new(
            "/definitely/not/a/binary",
            Vec::new(),
        ));
        let outcome = loader.run(&spec(), Duration::from_secs(1)).await;
        assert_eq!(
            outcome.failure().map(|f| f.code),
            Some(ErrorCode::ModelProbeFailed)
        );
    }
}
