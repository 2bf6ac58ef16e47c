//! Per-project workspace lifecycle and command execution.
//!
//! Two implementations of the [`Workspace`] capability set: a Docker
//! container per project (the default) and a host-exec mode for
//! development. The manager owns blocklist enforcement and the
//! background-server policy; auto-recovery uses a separate privileged path
//! that skips the blocklist and is never reachable from the tool surface.

pub mod docker;
pub mod local;
pub mod security;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{SandboxConfig, SandboxKind};
use crate::errors::{YokeError, YokeResult};
use crate::store::models::{Project, SessionType};
use crate::stream::EventSender;
use security::{BLOCKED_PREFIX, CommandBlocklist, detect_server_command};

/// Outcome of one command execution inside a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecOutcome {
    pub fn is_error(&self) -> bool {
        self.exit_code != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceStatus {
    pub state: String,
    pub ports: Vec<u16>,
    pub uptime_seconds: u64,
    pub cpu_pct: f64,
    pub memory_bytes: u64,
}

/// Capability set of an acquired workspace.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Run a command with a hard timeout, capturing output.
    async fn execute(&self, command: &str, timeout: Duration) -> YokeResult<ExecOutcome>;

    /// Stop without removing; the next acquire may reuse it.
    async fn stop(&self) -> YokeResult<()>;

    /// Force-remove the workspace and its volumes.
    async fn remove(&self) -> YokeResult<()>;

    async fn status(&self) -> YokeResult<WorkspaceStatus>;
}

/// Creates, reuses, and executes into workspaces for the whole engine.
pub struct SandboxManager {
    config: SandboxConfig,
    blocklist: CommandBlocklist,
}

impl SandboxManager {
    pub fn new(config: SandboxConfig, additional_blocked: &[String]) -> Self {
        Self {
            config,
            blocklist: CommandBlocklist::new(additional_blocked),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.config.default_timeout_seconds)
    }

    /// Clamp an agent-requested timeout to the configured ceiling.
    pub fn clamp_timeout(&self, requested_seconds: Option<u64>) -> Duration {
        let seconds = requested_seconds
            .unwrap_or(self.config.default_timeout_seconds)
            .min(self.config.max_timeout_seconds);
        Duration::from_secs(seconds)
    }

    /// Acquire the workspace for a project.
    ///
    /// Initializer sessions always get a fresh container; coding and review
    /// sessions reuse a running one, start a stopped one, or create one,
    /// and get residual dev-server processes killed first.
    pub async fn acquire(
        &self,
        project: &Project,
        workspace_dir: &Path,
        session_type: SessionType,
    ) -> YokeResult<Arc<dyn Workspace>> {
        match self.config.kind {
            SandboxKind::None => Ok(Arc::new(local::LocalWorkspace::new(workspace_dir))),
            SandboxKind::Container => {
                let workspace = docker::DockerWorkspace::acquire(
                    &project.name,
                    workspace_dir,
                    session_type,
                    &self.config,
                )
                .await?;
                Ok(Arc::new(workspace))
            }
        }
    }

    /// Stop a project's workspace without removing it; called when the
    /// project completes.
    pub async fn stop_project(&self, project: &Project) -> YokeResult<()> {
        match self.config.kind {
            SandboxKind::None => Ok(()),
            SandboxKind::Container => {
                let workspace = docker::DockerWorkspace::open(&project.name).await?;
                workspace.stop().await
            }
        }
    }

    /// Force-remove a project's workspace; called before project deletion.
    pub async fn remove_project(&self, project: &Project) -> YokeResult<()> {
        match self.config.kind {
            SandboxKind::None => Ok(()),
            SandboxKind::Container => {
                let workspace = docker::DockerWorkspace::open(&project.name).await?;
                workspace.remove().await
            }
        }
    }

    /// Agent-facing execution: blocklist enforced, server starts flagged.
    pub async fn execute(
        &self,
        workspace: &dyn Workspace,
        command: &str,
        timeout: Duration,
        background: bool,
        events: Option<&EventSender>,
    ) -> YokeResult<ExecOutcome> {
        self.blocklist.check(command)?;

        // Servers started from the agent loop with a short timeout (or
        // pushed to the background) die with the exec; warn on the stream.
        if let Some(label) = detect_server_command(command) {
            if background || timeout < Duration::from_secs(300) {
                if let Some(events) = events {
                    let mut fields = serde_json::Map::new();
                    fields.insert("server".into(), label.into());
                    fields.insert("command".into(), command.into());
                    events.system("background_server_warning", fields);
                }
                tracing::warn!(server = label, "server start detected inside agent loop");
            }
        }

        workspace.execute(command, timeout).await
    }

    /// Privileged execution for intervention auto-recovery only. Skips the
    /// blocklist; callers record every use as an intervention action.
    pub async fn execute_privileged(
        &self,
        workspace: &dyn Workspace,
        command: &str,
        timeout: Duration,
    ) -> YokeResult<ExecOutcome> {
        workspace.execute(command, timeout).await
    }

    /// Render a blocklist rejection as agent-visible tool output.
    pub fn blocked_message(err: &YokeError) -> String {
        match err {
            YokeError::BlockedCommand { command, rule } => {
                format!("{BLOCKED_PREFIX} {rule}: {command}")
            }
            other => format!("{BLOCKED_PREFIX} {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::SessionEvents;
    use tempfile::tempdir;

    fn manager(kind: SandboxKind) -> SandboxManager {
        let config = SandboxConfig {
            kind,
            ..SandboxConfig::default()
        };
        SandboxManager::new(config, &[])
    }

    #[test]
    fn test_clamp_timeout() {
        let manager = manager(SandboxKind::None);
        assert_eq!(manager.clamp_timeout(None), Duration::from_secs(120));
        assert_eq!(manager.clamp_timeout(Some(30)), Duration::from_secs(30));
        assert_eq!(manager.clamp_timeout(Some(10_000)), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_execute_enforces_blocklist() {
        let dir = tempdir().unwrap();
        let manager = manager(SandboxKind::None);
        let workspace = local::LocalWorkspace::new(dir.path());

        let err = manager
            .execute(&workspace, "sudo rm -rf /etc", Duration::from_secs(5), false, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "blocked_command");
        let message = SandboxManager::blocked_message(&err);
        assert!(message.starts_with(BLOCKED_PREFIX));
        assert!(message.contains("privilege_escalation"));
    }

    #[tokio::test]
    async fn test_privileged_path_skips_blocklist() {
        let dir = tempdir().unwrap();
        let manager = manager(SandboxKind::None);
        let workspace = local::LocalWorkspace::new(dir.path());

        // A command the blocklist would reject runs on the privileged path.
        // `true` stands in for a recovery action; the point is no
        // BlockedCommand error.
        let outcome = manager
            .execute_privileged(&workspace, "true", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[tokio::test]
    async fn test_server_start_emits_warning_event() {
        let dir = tempdir().unwrap();
        let manager = manager(SandboxKind::None);
        let workspace = local::LocalWorkspace::new(dir.path());
        let mut events = SessionEvents::new();
        let sender = events.sender();

        // The command itself fails fast (npm is likely absent); only the
        // warning matters here.
        let _ = manager
            .execute(
                &workspace,
                "echo simulated && npm run dev",
                Duration::from_secs(5),
                true,
                Some(&sender),
            )
            .await;

        let event = events.drain().await.unwrap();
        match event {
            crate::stream::AgentEvent::SystemMessage { subtype, fields } => {
                assert_eq!(subtype, "background_server_warning");
                assert_eq!(fields.get("server").unwrap(), "npm dev server");
            }
            other => panic!("expected warning event, got {:?}", other),
        }
    }
}
