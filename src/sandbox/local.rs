//! Host-exec workspace for development. No isolation; the blocklist is the
//! only guard, so container mode is the default everywhere else.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::{YokeError, YokeResult};

use super::{ExecOutcome, Workspace, WorkspaceStatus};

pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn execute(&self, command: &str, timeout: Duration) -> YokeResult<ExecOutcome> {
        let start = Instant::now();
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| YokeError::Sandbox(format!("failed to spawn command: {e}")))?;

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match waited {
            Ok(Ok(output)) => Ok(ExecOutcome {
                exit_code: output.status.code().unwrap_or(-1) as i64,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                duration_ms,
            }),
            Ok(Err(e)) => Err(YokeError::Sandbox(format!("command wait failed: {e}"))),
            Err(_) => Err(YokeError::Sandbox(format!(
                "command timed out after {}s: {command}",
                timeout.as_secs()
            ))),
        }
    }

    async fn stop(&self) -> YokeResult<()> {
        Ok(())
    }

    async fn remove(&self) -> YokeResult<()> {
        Ok(())
    }

    async fn status(&self) -> YokeResult<WorkspaceStatus> {
        Ok(WorkspaceStatus {
            state: "local".to_string(),
            ports: Vec::new(),
            uptime_seconds: 0,
            cpu_pct: 0.0,
            memory_bytes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_execute_captures_output_and_exit_code() {
        let dir = tempdir().unwrap();
        let workspace = LocalWorkspace::new(dir.path());

        let outcome = workspace
            .execute("echo out && echo err >&2", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.stdout.trim(), "out");
        assert_eq!(outcome.stderr.trim(), "err");
        assert!(!outcome.is_error());

        let failing = workspace
            .execute("exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(failing.exit_code, 3);
        assert!(failing.is_error());
    }

    #[tokio::test]
    async fn test_execute_runs_in_workspace_root() {
        let dir = tempdir().unwrap();
        let workspace = LocalWorkspace::new(dir.path());
        let outcome = workspace.execute("pwd", Duration::from_secs(5)).await.unwrap();
        let reported = std::fs::canonicalize(outcome.stdout.trim()).unwrap();
        let expected = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(reported, expected);
    }

    #[tokio::test]
    async fn test_execute_times_out() {
        let dir = tempdir().unwrap();
        let workspace = LocalWorkspace::new(dir.path());
        let err = workspace
            .execute("sleep 30", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "sandbox_error");
        assert!(err.to_string().contains("timed out"));
    }
}
