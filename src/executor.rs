//! Running task commands in a shell

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::models::{Task, TaskStatus};

/// How long to wait for output pipes to close after the child is gone
const PIPE_GRACE: Duration = Duration::from_secs(2);

/// Outcome of running one task attempt
#[derive(Debug, Clone)]
pub struct Execution {
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    /// Set when the command could not be run at all
    pub error: Option<String>,
}

/// Runs commands with `sh -c` (or `cmd /C` on Windows)
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    shell: Option<String>,
}

impl ShellExecutor {
    /// Create an executor; `shell` overrides the platform shell
    pub fn new(shell: Option<String>) -> Self {
        Self { shell }
    }

    fn command(&self, line: &str) -> Command {
        match self.shell.as_deref() {
            Some(shell) => {
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(line);
                cmd
            }
            None if cfg!(windows) => {
                let mut cmd = Command::new("cmd");
                cmd.arg("/C").arg(line);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        }
    }

    /// Run a task attempt in `workdir`, killing it when its timeout passes
    pub async fn run(&self, task: &Task, workdir: &Path) -> Execution {
        tracing::info!(task_id = %task.id, attempt = task.attempt, command = %task.command, "Executing task");

        let started_at = Utc::now();
        let clock = Instant::now();

        let mut cmd = self.command(&task.command);
        cmd.current_dir(workdir)
            .envs(&task.env)
            .env("TURBINE_JOB", &task.job)
            .env("TURBINE_TASK_ID", &task.id)
            .env("TURBINE_TASK_INDEX", task.index.to_string())
            .env("TURBINE_ATTEMPT", task.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // the task gets its own process group so a timeout reaches its children
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Could not start task");
                let finished_at = Utc::now();
                return Execution {
                    status: TaskStatus::Failed,
                    exit_code: None,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                    started_at,
                    finished_at,
                    duration: clock.elapsed(),
                    error: Some(format!("could not start command: {}", e)),
                };
            }
        };

        let group = child.id();
        let stdout = Capture::spawn(child.stdout.take());
        let stderr = Capture::spawn(child.stderr.take());

        let waited = tokio::time::timeout(task.timeout(), child.wait()).await;
        let (status, exit_code, error) = match waited {
            Ok(Ok(exit)) if exit.success() => (TaskStatus::Succeeded, exit.code(), None),
            Ok(Ok(exit)) => (TaskStatus::Failed, exit.code(), None),
            Ok(Err(e)) => (TaskStatus::Failed, None, Some(format!("wait failed: {}", e))),
            Err(_) => {
                tracing::warn!(task_id = %task.id, timeout_secs = task.timeout_secs, "Task timed out, killing");
                kill_group(group);
                if let Err(e) = child.kill().await {
                    tracing::warn!(task_id = %task.id, error = %e, "Could not kill task");
                }
                (TaskStatus::TimedOut, None, None)
            }
        };

        // background processes left behind by the command end with it
        kill_group(group);

        let stdout = stdout.collect().await;
        let stderr = stderr.collect().await;
        let duration = clock.elapsed();

        tracing::info!(
            task_id = %task.id,
            status = %status,
            exit_code = ?exit_code,
            duration_ms = duration.as_millis() as u64,
            "Task finished"
        );

        Execution {
            status,
            exit_code,
            stdout,
            stderr,
            started_at,
            finished_at: Utc::now(),
            duration,
            error,
        }
    }
}

/// Output of one pipe, kept as it is read
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    reader: Option<JoinHandle<()>>,
}

impl Capture {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let reader = pipe.map(|mut pipe| {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });
        Self { buf, reader }
    }

    /// Everything read so far, waiting briefly for the pipe to close
    async fn collect(self) -> Vec<u8> {
        if let Some(mut reader) = self.reader {
            if tokio::time::timeout(PIPE_GRACE, &mut reader).await.is_err() {
                reader.abort();
            }
        }
        let mut buf = self.buf.lock().await;
        std::mem::take(&mut *buf)
    }
}

/// SIGKILL every process in the task's group
#[cfg(unix)]
fn kill_group(group: Option<u32>) {
    let Some(pgid) = group else {
        return;
    };
    // SAFETY: killpg only sends a signal; ESRCH means the group is already gone
    unsafe {
        libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::models::JobManifest;

    fn task(command: &str, timeout_secs: u64) -> Task {
        let mut task = JobManifest::from_text("exec", command)
            .unwrap()
            .expand(&WorkerConfig::default(), Utc::now())
            .remove(0);
        task.timeout_secs = timeout_secs;
        task
    }

    #[tokio::test]
    async fn test_success_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::default();
        let result = exec
            .run(&task("echo out; echo err 1>&2", 10), dir.path())
            .await;

        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, b"out\n");
        assert_eq!(result.stderr, b"err\n");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellExecutor::default().run(&task("exit 3", 10), dir.path()).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellExecutor::default()
            .run(&task("echo started; exec sleep 30", 1), dir.path())
            .await;
        assert_eq!(result.status, TaskStatus::TimedOut);
        assert_eq!(result.exit_code, None);
        assert!(result.duration < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_kills_child_processes_and_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellExecutor::default()
            .run(&task("echo started; sleep 3; touch marker", 1), dir.path())
            .await;
        assert_eq!(result.status, TaskStatus::TimedOut);
        assert_eq!(result.stdout, b"started\n");

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_background_child_does_not_lose_output() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellExecutor::default()
            .run(&task("echo hi; sleep 5 &", 10), dir.path())
            .await;
        assert_eq!(result.status, TaskStatus::Succeeded);
        assert_eq!(result.stdout, b"hi\n");
        assert!(result.duration < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_non_utf8_output_is_kept_as_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellExecutor::default()
            .run(&task("printf '\\377\\376'", 10), dir.path())
            .await;
        assert_eq!(result.stdout, vec![0xff, 0xfe]);
    }

    #[tokio::test]
    async fn test_environment_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input.txt"), "data").unwrap();

        let mut t = task("echo $TURBINE_TASK_ID $TURBINE_ATTEMPT $SEED; cat input.txt", 10);
        t.env.insert("SEED".to_string(), "7".to_string());

        let result = ShellExecutor::default().run(&t, dir.path()).await;
        assert_eq!(String::from_utf8_lossy(&result.stdout), "exec-00000 1 7\ndata");
    }

    #[tokio::test]
    async fn test_missing_shell_is_a_failed_execution() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::new(Some("/nonexistent/shell".to_string()));
        let result = exec.run(&task("true", 10), dir.path()).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error.is_some());
    }
}
