//! The Agent Runner boundary: spawning the external agent process and
//! bridging its stdio to the event stream and the tool surface.
//!
//! The runner contract: the child reads the prompt frame and tool-call
//! responses on stdin, and writes newline-delimited JSON on stdout — either
//! tool requests (`{id, method, params}`) or event records (`{kind, ...}`).
//! Plain text lines are treated as assistant text.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::errors::{YokeError, YokeResult};
use crate::store::models::SessionType;
use crate::stream::{AgentEvent, EventSender};
use crate::tools::{ToolSurface, rpc};

#[derive(Debug, Clone)]
pub struct RunnerRequest {
    pub prompt: String,
    pub model: String,
    pub workspace_dir: PathBuf,
    pub session_type: SessionType,
}

/// How a runner finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerExit {
    Completed,
    Crashed(String),
}

/// Handle to a spawned runner: await completion or request termination.
pub struct RunnerHandle {
    done: oneshot::Receiver<RunnerExit>,
    finished: Option<RunnerExit>,
    cancel: mpsc::Sender<()>,
}

impl RunnerHandle {
    pub fn new(done: oneshot::Receiver<RunnerExit>, cancel: mpsc::Sender<()>) -> Self {
        Self {
            done,
            finished: None,
            cancel,
        }
    }

    /// Ask the runner to terminate; it still resolves through [`Self::wait`].
    pub async fn terminate(&self) {
        let _ = self.cancel.send(()).await;
    }

    /// Await the runner by reference; safe to call again after completion
    /// (the exit is cached), which lets a select loop poll it alongside
    /// the event stream.
    pub async fn wait_mut(&mut self) -> RunnerExit {
        if let Some(exit) = &self.finished {
            return exit.clone();
        }
        let exit = (&mut self.done)
            .await
            .unwrap_or_else(|_| RunnerExit::Crashed("runner task dropped".to_string()));
        self.finished = Some(exit.clone());
        exit
    }

    pub async fn wait(mut self) -> RunnerExit {
        self.wait_mut().await
    }
}

/// Spawns one agent execution attached to a session.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn spawn(
        &self,
        request: RunnerRequest,
        surface: Arc<ToolSurface>,
        events: EventSender,
    ) -> YokeResult<RunnerHandle>;
}

/// Production runner: an external agent process on the configured command.
pub struct ProcessRunner {
    config: AgentConfig,
}

impl ProcessRunner {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentRunner for ProcessRunner {
    async fn spawn(
        &self,
        request: RunnerRequest,
        surface: Arc<ToolSurface>,
        events: EventSender,
    ) -> YokeResult<RunnerHandle> {
        let mut cmd = Command::new(&self.config.command);
        for arg in &self.config.args {
            cmd.arg(arg);
        }
        cmd.arg("--model").arg(&request.model);

        let mut child = cmd
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .current_dir(&request.workspace_dir)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| YokeError::Internal(format!("failed to spawn agent runner: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| YokeError::Internal("runner stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| YokeError::Internal("runner stdout unavailable".into()))?;

        let prompt_frame = AgentEvent::Prompt {
            text: request.prompt.clone(),
        }
        .to_frame();
        stdin
            .write_all(format!("{prompt_frame}\n").as_bytes())
            .await
            .map_err(|e| YokeError::Internal(format!("failed to write prompt: {e}")))?;

        let (done_tx, done_rx) = oneshot::channel();
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let exit = loop {
                tokio::select! {
                    _ = cancel_rx.recv() => {
                        // Graceful: close stdin, give the child a moment,
                        // then kill.
                        drop(stdin);
                        if tokio::time::timeout(Duration::from_secs(2), child.wait())
                            .await
                            .is_err()
                        {
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                        }
                        break RunnerExit::Completed;
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                handle_runner_line(&surface, &events, &mut stdin, &line).await;
                            }
                            Ok(None) => {
                                let status = child.wait().await;
                                break match status {
                                    Ok(status) if status.success() => RunnerExit::Completed,
                                    Ok(status) => RunnerExit::Crashed(format!(
                                        "agent runner exited with {status}"
                                    )),
                                    Err(e) => RunnerExit::Crashed(format!(
                                        "agent runner wait failed: {e}"
                                    )),
                                };
                            }
                            Err(e) => {
                                warn!(error = %e, "runner stdout read failed");
                                let _ = child.start_kill();
                                let _ = child.wait().await;
                                break RunnerExit::Crashed(format!("stdout read failed: {e}"));
                            }
                        }
                    }
                }
            };
            let _ = done_tx.send(exit);
        });

        Ok(RunnerHandle::new(done_rx, cancel_tx))
    }
}

/// Route one child-stdout line: tool request, event record, or plain text.
async fn handle_runner_line(
    surface: &ToolSurface,
    events: &EventSender,
    stdin: &mut tokio::process::ChildStdin,
    line: &str,
) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }

    let parsed: Option<Value> = serde_json::from_str(trimmed).ok();
    if let Some(value) = &parsed {
        if value.get("method").is_some() {
            for frame in rpc::handle_line(surface, trimmed).await {
                let mut bytes = frame.to_string().into_bytes();
                bytes.push(b'\n');
                if stdin.write_all(&bytes).await.is_err() {
                    debug!("runner stdin closed while writing tool response");
                }
            }
            return;
        }
        if let Ok(event) = AgentEvent::parse(trimmed) {
            events.send(event);
            return;
        }
    }

    events.send(AgentEvent::AssistantText {
        text: trimmed.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EpicRetestingConfig, EpicTestingConfig, SandboxConfig, SandboxKind};
    use crate::intervention::InterventionEngine;
    use crate::quality::QualityPipeline;
    use crate::sandbox::{SandboxManager, Workspace, local::LocalWorkspace};
    use crate::store::Store;
    use crate::store::models::ProjectType;
    use crate::stream::SessionEvents;
    use crate::tools::SessionContext;

    async fn surface_fixture() -> (Arc<ToolSurface>, SessionEvents, tempfile::TempDir) {
        let store = Store::in_memory().await.unwrap();
        let project = store
            .create_project("p", "spec", ProjectType::Greenfield, Default::default())
            .await
            .unwrap();
        let session = store
            .create_session(project.id, SessionType::Coding, "m", None)
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let workspace: Arc<dyn Workspace> = Arc::new(LocalWorkspace::new(dir.path()));
        let events = SessionEvents::new();
        let (pause_tx, _pause_rx) = mpsc::unbounded_channel();
        let surface = Arc::new(ToolSurface::new(
            store,
            Arc::new(SandboxManager::new(
                SandboxConfig {
                    kind: SandboxKind::None,
                    ..SandboxConfig::default()
                },
                &[],
            )),
            workspace,
            Arc::new(QualityPipeline::new(EpicRetestingConfig::default())),
            EpicTestingConfig::default(),
            SessionContext {
                project_id: project.id,
                session_id: session.id,
                session_type: SessionType::Coding,
            },
            events.sender(),
            Arc::new(tokio::sync::Mutex::new(InterventionEngine::new(
                &EpicTestingConfig::default(),
            ))),
            pause_tx,
        ));
        (surface, events, dir)
    }

    #[tokio::test]
    async fn test_process_runner_round_trip() {
        let (surface, mut events, dir) = surface_fixture().await;

        // A stand-in agent: reads the prompt frame, makes one tool call,
        // reads its response, emits an event, and exits.
        let script = r#"
read prompt_line
echo '{"id": 1, "method": "task_status", "params": {}}'
read response_line
echo '{"kind":"assistant_text","text":"progress checked"}'
echo '{"kind":"session_end","reason":"done"}'
"#;
        let runner = ProcessRunner::new(AgentConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        });

        // The extra --model flag is swallowed by `sh -c script name`.
        let handle = runner
            .spawn(
                RunnerRequest {
                    prompt: "do the work".into(),
                    model: "test-model".into(),
                    workspace_dir: dir.path().to_path_buf(),
                    session_type: SessionType::Coding,
                },
                surface,
                events.sender(),
            )
            .await
            .unwrap();

        assert_eq!(handle.wait().await, RunnerExit::Completed);

        // The dispatched tool call and the runner's own events are all on
        // the stream, in order.
        let mut saw_tool_use = false;
        let mut saw_text = false;
        let mut saw_end = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.drain()).await
        {
            match event {
                AgentEvent::ToolUse { tool, .. } => {
                    assert_eq!(tool, "task_status");
                    saw_tool_use = true;
                }
                AgentEvent::AssistantText { text } => {
                    assert_eq!(text, "progress checked");
                    saw_text = true;
                }
                AgentEvent::SessionEnd { .. } => {
                    saw_end = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_tool_use && saw_text && saw_end);
    }

    #[tokio::test]
    async fn test_process_runner_crash_reported() {
        let (surface, events, dir) = surface_fixture().await;
        let runner = ProcessRunner::new(AgentConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "read _ignored; exit 7".to_string()],
        });
        let handle = runner
            .spawn(
                RunnerRequest {
                    prompt: "p".into(),
                    model: "m".into(),
                    workspace_dir: dir.path().to_path_buf(),
                    session_type: SessionType::Coding,
                },
                surface,
                events.sender(),
            )
            .await
            .unwrap();
        match handle.wait().await {
            RunnerExit::Crashed(message) => assert!(message.contains("exited")),
            other => panic!("expected crash, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminate_resolves_handle() {
        let (surface, events, dir) = surface_fixture().await;
        let runner = ProcessRunner::new(AgentConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
        });
        let handle = runner
            .spawn(
                RunnerRequest {
                    prompt: "p".into(),
                    model: "m".into(),
                    workspace_dir: dir.path().to_path_buf(),
                    session_type: SessionType::Coding,
                },
                surface,
                events.sender(),
            )
            .await
            .unwrap();
        handle.terminate().await;
        // Termination resolves promptly rather than waiting out the sleep.
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("terminate resolves");
        assert_eq!(exit, RunnerExit::Completed);
    }

    #[tokio::test]
    async fn test_plain_text_becomes_assistant_text() {
        let (surface, mut events, dir) = surface_fixture().await;
        let runner = ProcessRunner::new(AgentConfig {
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "read _p; echo thinking out loud".to_string(),
            ],
        });
        let handle = runner
            .spawn(
                RunnerRequest {
                    prompt: "p".into(),
                    model: "m".into(),
                    workspace_dir: dir.path().to_path_buf(),
                    session_type: SessionType::Coding,
                },
                surface,
                events.sender(),
            )
            .await
            .unwrap();
        handle.wait().await;
        match events.drain().await.unwrap() {
            AgentEvent::AssistantText { text } => assert_eq!(text, "thinking out loud"),
            other => panic!("expected assistant text, got {:?}", other),
        }
    }
}
