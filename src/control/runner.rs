// External command execution

use crate::control::models::CommandOutput;
use crate::error::RunnerError;
use futures::future::BoxFuture;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// Default cap on captured stdout/stderr per stream
pub const DEFAULT_CAPTURE_LIMIT: usize = 1024 * 1024;

/// How long to wait for output pipes after the process itself has exited.
/// Daemonized grandchildren can hold them open indefinitely.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Starts external commands
pub trait CommandRunner: Send + Sync {
    fn spawn(&self, argv: &[String]) -> Result<Box<dyn RunningCommand>, RunnerError>;
}

/// A started command that can be awaited or terminated
pub trait RunningCommand: Send {
    /// Wait for the command to exit and collect its output. Must be cancel safe:
    /// calling it again after cancellation resumes where it left off.
    fn wait(&mut self) -> BoxFuture<'_, Result<CommandOutput, RunnerError>>;

    /// Whether the process itself has exited, even if its output is still
    /// being collected
    fn has_exited(&mut self) -> bool;

    /// Stop the command, allowing `grace` per escalation step.
    /// Ok means the process is known to be gone.
    fn terminate(&mut self, grace: Duration) -> BoxFuture<'_, Result<(), RunnerError>>;
}

/// Runs commands as local child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    capture_limit: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            capture_limit: DEFAULT_CAPTURE_LIMIT,
        }
    }
}

impl ProcessRunner {
    pub fn new(capture_limit: usize) -> Self {
        Self { capture_limit }
    }
}

impl CommandRunner for ProcessRunner {
    fn spawn(&self, argv: &[String]) -> Result<Box<dyn RunningCommand>, RunnerError> {
        let (program, args) = argv.split_first().ok_or(RunnerError::EmptyCommand)?;

        tracing::debug!("Spawning {:?}", argv);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunnerError::Spawn {
                program: program.clone(),
                source: e,
            })?;

        let stdout = child.stdout.take().map(|s| spawn_capture(s, self.capture_limit));
        let stderr = child.stderr.take().map(|s| spawn_capture(s, self.capture_limit));

        Ok(Box::new(ProcessHandle {
            program: program.clone(),
            child,
            status: None,
            stdout,
            stderr,
        }))
    }
}

struct ProcessHandle {
    program: String,
    child: Child,
    /// Set once the child has been reaped
    status: Option<ExitStatus>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl ProcessHandle {
    async fn wait_for_exit(&mut self, grace: Duration) -> Result<bool, RunnerError> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.status = Some(status);
                Ok(true)
            }
            Ok(Err(e)) => Err(RunnerError::Io(e)),
            Err(_) => Ok(false),
        }
    }
}

impl RunningCommand for ProcessHandle {
    fn wait(&mut self) -> BoxFuture<'_, Result<CommandOutput, RunnerError>> {
        Box::pin(async move {
            let status = match self.status {
                Some(status) => status,
                None => {
                    let status = self.child.wait().await?;
                    self.status = Some(status);
                    status
                }
            };
            let stdout = drain(&mut self.stdout).await;
            let stderr = drain(&mut self.stderr).await;

            tracing::debug!("'{}' exited with {}", self.program, status);
            Ok(CommandOutput {
                exit_code: exit_code(status),
                stdout,
                stderr,
            })
        })
    }

    fn has_exited(&mut self) -> bool {
        if self.status.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.status = Some(status);
            }
        }
        self.status.is_some()
    }

    fn terminate(&mut self, grace: Duration) -> BoxFuture<'_, Result<(), RunnerError>> {
        Box::pin(async move {
            if self.has_exited() {
                return Ok(());
            }
            // id() is None once the child has been reaped
            let Some(pid) = self.child.id() else {
                return Ok(());
            };

            tracing::info!("Sending SIGTERM to '{}' (pid {})", self.program, pid);
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(RunnerError::Signal {
                        pid,
                        message: e.to_string(),
                    })
                }
            }
            if self.wait_for_exit(grace).await? {
                return Ok(());
            }

            tracing::warn!("'{}' (pid {}) ignored SIGTERM, sending SIGKILL", self.program, pid);
            self.child.start_kill()?;
            if self.wait_for_exit(grace).await? {
                return Ok(());
            }

            Err(RunnerError::NotTerminated(format!("SIGKILL (pid {})", pid)))
        })
    }
}

/// Exit code, or 128 + signal number for signal deaths
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

fn spawn_capture<R>(mut reader: R, limit: usize) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut captured = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    captured.extend_from_slice(&chunk[..n]);
                    // Keep only the newest bytes once the cap is exceeded
                    if captured.len() > limit {
                        let excess = captured.len() - limit;
                        captured.drain(..excess);
                    }
                }
            }
        }
        captured
    })
}

/// Collect a capture task's bytes. The handle stays in place until the task
/// finishes or is abandoned, so a cancelled drain can be resumed.
async fn drain(slot: &mut Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    let Some(handle) = slot.as_mut() else {
        return Vec::new();
    };
    let bytes = match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut *handle).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            tracing::debug!("Output pipe still open after exit, discarding");
            handle.abort();
            Vec::new()
        }
    };
    *slot = None;
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let runner = ProcessRunner::default();
        let mut cmd = runner
            .spawn(&argv(&["sh", "-c", "echo out; echo err >&2; exit 3"]))
            .unwrap();
        let output = cmd.wait().await.unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let runner = ProcessRunner::default();
        assert!(matches!(runner.spawn(&[]), Err(RunnerError::EmptyCommand)));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = ProcessRunner::default();
        let err = runner
            .spawn(&argv(&["/nonexistent/unitpanel-test-binary"]))
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_capture_keeps_newest_bytes() {
        let runner = ProcessRunner::new(4);
        let mut cmd = runner.spawn(&argv(&["printf", "abcdefgh"])).unwrap();
        let output = cmd.wait().await.unwrap();
        assert_eq!(output.stdout, b"efgh");
    }

    #[tokio::test]
    async fn test_terminate_after_timeout() {
        let runner = ProcessRunner::default();
        let mut cmd = runner.spawn(&argv(&["sleep", "30"])).unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(200), cmd.wait()).await;
        assert!(waited.is_err());

        cmd.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let runner = ProcessRunner::default();
        let mut cmd = runner
            .spawn(&argv(&["sh", "-c", "trap '' TERM; sleep 30"]))
            .unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        cmd.terminate(Duration::from_millis(300)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_is_kept_when_wait_is_cancelled_during_drain() {
        let runner = ProcessRunner::default();
        // The background sleep inherits stdout and keeps the pipe open
        let mut cmd = runner
            .spawn(&argv(&["sh", "-c", "echo ready; sleep 5 & exit 0"]))
            .unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(500), cmd.wait()).await;
        assert!(waited.is_err());
        assert!(cmd.has_exited());

        let output = cmd.wait().await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_running_command_has_not_exited() {
        let runner = ProcessRunner::default();
        let mut cmd = runner.spawn(&argv(&["sleep", "30"])).unwrap();
        assert!(!cmd.has_exited());
        cmd.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(cmd.has_exited());
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_noop() {
        let runner = ProcessRunner::default();
        let mut cmd = runner.spawn(&argv(&["true"])).unwrap();
        cmd.wait().await.unwrap();
        cmd.terminate(Duration::from_millis(100)).await.unwrap();
    }
}
