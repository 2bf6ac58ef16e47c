//! The control plane: project and session lifecycle, the session loop,
//! checkpoints, resume, auto-continue, and completion detection.
//!
//! One drive loop per project; loops for different projects run in
//! parallel, while session creation within a project is serialized by the
//! store's project lock.

pub mod runner;
pub mod state;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::YokeConfig;
use crate::errors::{YokeError, YokeResult};
use crate::intervention::{InterventionEngine, PauseDirective};
use crate::metrics::MetricsCollector;
use crate::quality::{QualityPipeline, ReviewAgent};
use crate::sandbox::SandboxManager;
use crate::store::Store;
use crate::store::models::*;
use crate::stream::{AgentEvent, SessionEvents};
use crate::tools::{SessionContext, ToolSurface};
use runner::{AgentRunner, RunnerExit, RunnerRequest};
use state::OrchestratorState;

/// Directories never copied on brownfield import.
const IMPORT_SKIP_DIRS: &[&str] = &[".git", ".hg", ".svn", "node_modules", "target", "__pycache__"];

/// Result of driving a project until it stops.
#[derive(Debug)]
pub struct DriveOutcome {
    pub sessions_run: u32,
    pub final_status: ProjectStatus,
    pub last_session: Option<Session>,
}

pub struct Orchestrator {
    store: Store,
    config: YokeConfig,
    sandbox: Arc<SandboxManager>,
    runner: Arc<dyn AgentRunner>,
    reviewer: Option<Arc<dyn ReviewAgent>>,
    quality: Arc<QualityPipeline>,
    state: Arc<OrchestratorState>,
}

impl Orchestrator {
    pub fn new(store: Store, config: YokeConfig, runner: Arc<dyn AgentRunner>) -> Self {
        let sandbox = Arc::new(SandboxManager::new(
            config.sandbox.clone(),
            &config.security.additional_blocked_commands,
        ));
        let quality = Arc::new(QualityPipeline::new(config.epic_retesting.clone()));
        Self {
            store,
            config,
            sandbox,
            runner,
            reviewer: None,
            quality,
            state: Arc::new(OrchestratorState::new()),
        }
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn ReviewAgent>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn workspace_dir(&self, project: &Project) -> PathBuf {
        self.config.workspaces_dir().join(&project.name)
    }

    // ── Project lifecycle ─────────────────────────────────────────

    /// Create a project and its workspace. Brownfield projects copy the
    /// tree at `settings.import_path` into the workspace and record a
    /// source revision digest.
    pub async fn create_project(
        &self,
        name: &str,
        source_spec: &str,
        project_type: ProjectType,
        settings: serde_json::Map<String, Value>,
    ) -> YokeResult<Project> {
        let project = self
            .store
            .create_project(name, source_spec, project_type, settings)
            .await?;

        let dir = self.workspace_dir(&project);
        std::fs::create_dir_all(dir.join(".yokeflow"))
            .map_err(|e| YokeError::Internal(format!("failed to create workspace: {e}")))?;
        std::fs::write(dir.join(".yokeflow").join("spec.md"), source_spec)
            .map_err(|e| YokeError::Internal(format!("failed to write spec: {e}")))?;

        if project_type == ProjectType::Brownfield {
            let import_path = project
                .settings
                .get("import_path")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    YokeError::Validation(
                        "brownfield projects require settings.import_path".into(),
                    )
                })?;
            let revision = import_tree(Path::new(import_path), &dir)?;
            let mut settings = project.settings.clone();
            settings.insert("source_revision".into(), revision.into());
            self.store
                .update_project_settings(project.id, &settings)
                .await?;
            return self.store.get_project(project.id).await;
        }

        Ok(project)
    }

    /// Build the backlog with a type=initializer session. Refused once an
    /// initializer session has completed for the project.
    pub async fn initialize(&self, project_id: Uuid) -> YokeResult<Session> {
        let project = self.store.get_project(project_id).await?;
        if self
            .store
            .has_completed_session(project_id, SessionType::Initializer)
            .await?
        {
            return Err(YokeError::Conflict(format!(
                "project {} is already initialized",
                project.name
            )));
        }
        let prompt = self.initializer_prompt(&project);
        self.run_session(&project, SessionType::Initializer, prompt, None)
            .await
    }

    /// Drive coding sessions until the project completes, pauses, errors,
    /// or a stop is requested. Auto-continues between sessions.
    pub async fn start_coding(&self, project_id: Uuid) -> YokeResult<DriveOutcome> {
        let project = self.store.get_project(project_id).await?;
        if !self
            .store
            .has_completed_session(project_id, SessionType::Initializer)
            .await?
        {
            return Err(YokeError::Conflict(format!(
                "project {} has no completed initializer session",
                project.name
            )));
        }
        if let Some(running) = self.store.running_session(project_id).await? {
            return Err(YokeError::Conflict(format!(
                "session {} is already running",
                running.id
            )));
        }
        if !self.state.claim_drive(project_id) {
            return Err(YokeError::Conflict(format!(
                "project {} is already being driven",
                project.name
            )));
        }

        let result = self.drive(&project).await;
        self.state.release_drive(project_id);
        result
    }

    /// Cooperative stop: consumed at the next safe boundary of the drive
    /// loop; never kills an in-flight tool call.
    pub async fn stop_after_current(&self, project_id: Uuid) -> YokeResult<()> {
        self.store.get_project(project_id).await?;
        self.state.request_stop(project_id);
        Ok(())
    }

    pub async fn pause_session(&self, session_id: Uuid) -> YokeResult<()> {
        let session = self.store.get_session(session_id).await?;
        if session.status != SessionStatus::Running {
            return Err(YokeError::Conflict(format!(
                "session {} is {}, not running",
                session_id,
                session.status.as_str()
            )));
        }
        let directive = PauseDirective {
            pause_type: PauseType::Manual,
            reason: "manual pause requested".to_string(),
            blocker_info: BlockerInfo {
                blocker_type: "manual".to_string(),
                message: "manual pause requested".to_string(),
                ..BlockerInfo::default()
            },
        };
        if !self.state.send_pause(session_id, directive.clone()) {
            // The session is not driven by this process (stale after a
            // crash): record the pause directly.
            self.store
                .create_paused_session(
                    session_id,
                    &directive.reason,
                    directive.pause_type,
                    &directive.blocker_info,
                    &HashMap::new(),
                    false,
                )
                .await?;
        }
        Ok(())
    }

    /// Resolve the intervention and start a fresh coding session whose
    /// prompt replays the checkpoint plus the resolution notes.
    pub async fn resume_session(
        &self,
        session_id: Uuid,
        notes: Option<&str>,
    ) -> YokeResult<Session> {
        let paused = self.store.get_session(session_id).await?;
        if paused.status != SessionStatus::Paused {
            return Err(YokeError::Conflict(format!(
                "session {} is {}, not paused",
                session_id,
                paused.status.as_str()
            )));
        }
        let project = self.store.get_project(paused.project_id).await?;
        self.store.resolve_pause(session_id, notes).await?;
        let checkpoint = self.store.latest_checkpoint(session_id).await?;
        let prompt = self.resume_prompt(&project, checkpoint.as_ref(), notes);
        self.run_session(&project, SessionType::Coding, prompt, Some(paused.id))
            .await
    }

    /// Cancel any running session, remove the sandbox, then delete the
    /// project rows (cascading to its entities).
    pub async fn delete_project(&self, project_id: Uuid) -> YokeResult<()> {
        let project = self.store.get_project(project_id).await?;
        self.state.request_stop(project_id);
        if let Some(running) = self.store.running_session(project_id).await? {
            let directive = PauseDirective {
                pause_type: PauseType::Manual,
                reason: "project deleted".to_string(),
                blocker_info: BlockerInfo::default(),
            };
            self.state.send_pause(running.id, directive);
            self.store
                .update_session_status(running.id, SessionStatus::Cancelled)
                .await?;
        }
        if let Err(e) = self.sandbox.remove_project(&project).await {
            warn!(project = %project.name, error = %e, "sandbox removal failed");
        }
        self.store.delete_project(project_id).await?;
        self.state.clear_stop(project_id);
        Ok(())
    }

    pub async fn get_progress(&self, project_id: Uuid) -> YokeResult<Progress> {
        self.store.progress(project_id).await
    }

    pub async fn list_interventions(
        &self,
        project_id: Option<Uuid>,
        unresolved_only: bool,
    ) -> YokeResult<Vec<PausedSession>> {
        self.store.list_interventions(project_id, unresolved_only).await
    }

    pub async fn trigger_completion_review(
        &self,
        project_id: Uuid,
    ) -> YokeResult<CompletionReview> {
        let project = self.store.get_project(project_id).await?;
        self.quality.completion_review(&self.store, &project).await
    }

    // ── Drive loop ────────────────────────────────────────────────

    async fn drive(&self, project: &Project) -> YokeResult<DriveOutcome> {
        let mut sessions_run = 0u32;
        let mut last_session: Option<Session> = None;

        loop {
            if self.state.stop_requested(project.id) {
                self.state.clear_stop(project.id);
                break;
            }

            let progress = self.store.progress(project.id).await?;
            let pending_retests = self.store.list_pending_retests(project.id).await?;
            if progress.total_tasks == 0 {
                warn!(project = %project.name, "backlog is empty; nothing to drive");
                break;
            }
            if progress.all_tasks_done() && pending_retests.is_empty() {
                self.complete_project(project).await?;
                break;
            }

            let (session_type, prompt) = if pending_retests.is_empty() {
                (SessionType::Coding, self.coding_prompt(project, &progress))
            } else {
                (
                    SessionType::Retest,
                    self.retest_prompt(project, &pending_retests).await?,
                )
            };

            let session = self
                .run_session(project, session_type, prompt, None)
                .await?;
            sessions_run += 1;
            let status = session.status;
            last_session = Some(session);

            if status != SessionStatus::Completed {
                break;
            }
            if self.state.stop_requested(project.id) {
                self.state.clear_stop(project.id);
                break;
            }
            tokio::time::sleep(Duration::from_secs(
                self.config.timing.auto_continue_delay_seconds,
            ))
            .await;
        }

        let project = self.store.get_project(project.id).await?;
        Ok(DriveOutcome {
            sessions_run,
            final_status: project.status,
            last_session,
        })
    }

    async fn complete_project(&self, project: &Project) -> YokeResult<()> {
        info!(project = %project.name, "all tasks done; marking project completed");
        self.store
            .update_project_status(project.id, ProjectStatus::Completed)
            .await?;
        self.store
            .append_progress_note(project.id, None, NoteKind::Info, "project completed")
            .await?;
        if let Err(e) = self.sandbox.stop_project(project).await {
            warn!(project = %project.name, error = %e, "sandbox stop failed");
        }
        Ok(())
    }

    // ── Session loop ──────────────────────────────────────────────

    async fn run_session(
        &self,
        project: &Project,
        session_type: SessionType,
        prompt: String,
        parent: Option<Uuid>,
    ) -> YokeResult<Session> {
        let model = self
            .config
            .models
            .for_session_type(session_type.as_str())
            .to_string();
        let session = self
            .store
            .create_session(project.id, session_type, &model, parent)
            .await?;
        info!(
            project = %project.name,
            session = %session.id,
            number = session.session_number,
            session_type = session_type.as_str(),
            "session started"
        );

        let dir = self.workspace_dir(project);
        let workspace = match self.sandbox.acquire(project, &dir, session_type).await {
            Ok(workspace) => workspace,
            // One reacquire attempt before giving up.
            Err(first) => match self.sandbox.acquire(project, &dir, session_type).await {
                Ok(workspace) => workspace,
                Err(_) => {
                    warn!(session = %session.id, error = %first, "sandbox acquisition failed");
                    self.store
                        .finalize_session(
                            session.id,
                            SessionStatus::Error,
                            &MetricsCollector::new(session.id).finalize(),
                        )
                        .await?;
                    return self.store.get_session(session.id).await;
                }
            },
        };

        let mut events = SessionEvents::new();
        let sender = events.sender();
        let (pause_tx, mut pause_rx) = tokio::sync::mpsc::unbounded_channel();
        self.state.register_session(session.id, pause_tx.clone());

        let intervention = Arc::new(tokio::sync::Mutex::new(InterventionEngine::new(
            &self.config.epic_testing,
        )));
        let surface = Arc::new(ToolSurface::new(
            self.store.clone(),
            self.sandbox.clone(),
            workspace.clone(),
            self.quality.clone(),
            self.config.epic_testing.clone(),
            SessionContext {
                project_id: project.id,
                session_id: session.id,
                session_type,
            },
            sender.clone(),
            intervention.clone(),
            pause_tx,
        ));

        let mut metrics = MetricsCollector::new(session.id);
        sender.send(AgentEvent::Prompt {
            text: prompt.clone(),
        });

        let mut handle = match self
            .runner
            .spawn(
                RunnerRequest {
                    prompt,
                    model,
                    workspace_dir: dir,
                    session_type,
                },
                surface,
                sender.clone(),
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session = %session.id, error = %e, "runner spawn failed");
                self.state.unregister_session(session.id);
                self.store
                    .finalize_session(session.id, SessionStatus::Error, &metrics.finalize())
                    .await?;
                return self.store.get_session(session.id).await;
            }
        };

        let mut transcript = String::new();
        let mut last_task: Option<i64> = None;
        let mut pause_directive: Option<PauseDirective> = None;
        let mut runner_exit: Option<RunnerExit> = None;
        let mut checkpoint_timer = tokio::time::interval(Duration::from_secs(
            self.config.timing.checkpoint_interval_seconds.max(1),
        ));
        checkpoint_timer.tick().await; // consume the immediate tick

        loop {
            tokio::select! {
                maybe_event = events.drain() => {
                    let Some(event) = maybe_event else { break };
                    metrics.observe(&event);
                    match &event {
                        AgentEvent::AssistantText { text } => {
                            transcript.push_str(text);
                            transcript.push('\n');
                        }
                        AgentEvent::SystemMessage { subtype, fields } => {
                            let task_id = fields.get("task_id").and_then(Value::as_i64);
                            if subtype == "task_started" {
                                last_task = task_id;
                            } else if subtype == "task_completed" {
                                if let Err(e) = self
                                    .store
                                    .write_checkpoint(
                                        session.id,
                                        CheckpointType::TaskCompletion,
                                        &transcript,
                                        task_id,
                                    )
                                    .await
                                {
                                    warn!(session = %session.id, error = %e, "checkpoint write failed");
                                }
                            }
                        }
                        _ => {}
                    }
                    if let Some(directive) = intervention.lock().await.observe(&event) {
                        pause_directive = Some(directive);
                        break;
                    }
                    if event.is_session_end() {
                        break;
                    }
                }
                Some(directive) = pause_rx.recv() => {
                    pause_directive = Some(directive);
                    break;
                }
                // A runner that dies without a session_end frame must not
                // hang the loop.
                exit = handle.wait_mut() => {
                    runner_exit = Some(exit);
                    break;
                }
                _ = checkpoint_timer.tick() => {
                    if let Err(e) = self
                        .store
                        .write_checkpoint(
                            session.id,
                            CheckpointType::Periodic,
                            &transcript,
                            last_task,
                        )
                        .await
                    {
                        warn!(session = %session.id, error = %e, "checkpoint write failed");
                    }
                }
            }
        }

        // Flush events that were queued behind the exit.
        while let Some(event) = events.try_drain() {
            metrics.observe(&event);
            if let AgentEvent::AssistantText { text } = &event {
                transcript.push_str(text);
                transcript.push('\n');
            }
        }

        let final_session = if let Some(directive) = pause_directive {
            handle.terminate().await;
            let _ = handle.wait().await;

            let can_auto_resume = self
                .attempt_auto_recovery(project, &session, &directive, workspace.as_ref())
                .await;

            let engine = intervention.lock().await;
            engine
                .apply_pause(
                    &self.store,
                    &session,
                    &directive,
                    &transcript,
                    last_task,
                    can_auto_resume,
                    &sender,
                )
                .await?;
            drop(engine);

            self.store
                .finalize_session(session.id, SessionStatus::Paused, &metrics.finalize())
                .await?;
            self.store.get_session(session.id).await?
        } else {
            let exit = match runner_exit {
                Some(exit) => exit,
                None => handle.wait().await,
            };
            match exit {
                RunnerExit::Completed => {
                    let summary = metrics.finalize();
                    self.store
                        .finalize_session(session.id, SessionStatus::Completed, &summary)
                        .await?;

                    let progress = self.store.progress(project.id).await?;
                    let is_final = progress.all_tasks_done();
                    if let Err(e) = self
                        .quality
                        .on_session_end(
                            &self.store,
                            self.reviewer.as_deref(),
                            &session,
                            &summary,
                            is_final,
                        )
                        .await
                    {
                        warn!(session = %session.id, error = %e, "quality pipeline failed");
                    }
                    if session_type != SessionType::Initializer {
                        if let Err(e) = self.quality.select_retests(&self.store, project.id).await {
                            warn!(session = %session.id, error = %e, "retest selection failed");
                        }
                    }
                    self.store.get_session(session.id).await?
                }
                RunnerExit::Crashed(message) => {
                    warn!(session = %session.id, %message, "agent runner crashed");
                    self.store
                        .finalize_session(session.id, SessionStatus::Error, &metrics.finalize())
                        .await?;
                    self.store.get_session(session.id).await?
                }
            }
        };

        self.state.unregister_session(session.id);
        info!(
            session = %final_session.id,
            status = final_session.status.as_str(),
            "session finished"
        );
        Ok(final_session)
    }

    /// Try the known fix for a blocker once, on the privileged path, and
    /// record the attempt.
    async fn attempt_auto_recovery(
        &self,
        project: &Project,
        session: &Session,
        directive: &PauseDirective,
        workspace: &dyn crate::sandbox::Workspace,
    ) -> bool {
        let Some(plan) = InterventionEngine::recovery_plan(&directive.blocker_info, project)
        else {
            return false;
        };
        info!(session = %session.id, action = %plan.action, "attempting auto-recovery");
        let (succeeded, output) = match self
            .sandbox
            .execute_privileged(workspace, &plan.command, Duration::from_secs(60))
            .await
        {
            Ok(outcome) => (!outcome.is_error(), outcome.stdout),
            Err(e) => (false, e.to_string()),
        };
        if let Err(e) = self
            .store
            .record_intervention_action(
                session.id,
                &plan.action,
                &plan.command,
                succeeded,
                &output.chars().take(500).collect::<String>(),
            )
            .await
        {
            warn!(session = %session.id, error = %e, "failed to record intervention action");
        }
        succeeded
    }

    // ── Prompts ───────────────────────────────────────────────────

    fn initializer_prompt(&self, project: &Project) -> String {
        format!(
            r#"You are planning the backlog for the project below.

## SPECIFICATION
{}

## TASK
Create the project roadmap with the planning tools:
1. create_epic for each feature area (ordered by priority; mark foundation
   and high_dependency tiers where later work depends on them).
2. create_task for each concrete work item within an epic.
3. create_test for 1-3 verifiable requirements per task, plus integration
   tests at the epic level (omit task_id).
Log a summary with log_session when the roadmap is complete."#,
            project.source_spec
        )
    }

    fn coding_prompt(&self, project: &Project, progress: &Progress) -> String {
        format!(
            r#"You are implementing the project below, one task at a time.

## SPECIFICATION
{}

## PROGRESS
{} of {} tasks done; {} of {} tests passing.

## TASK
1. Call get_next_task and start_task before working.
2. Implement in /workspace, running commands with the bash tool.
3. Verify each test with the matching method (UI work needs browser
   verification) and record outcomes with update_task_test_result.
4. Only then call update_task_status with done=true.
Repeat until get_next_task returns nothing."#,
            project.source_spec,
            progress.completed_tasks,
            progress.total_tasks,
            progress.passing_tests,
            progress.total_tests
        )
    }

    async fn retest_prompt(
        &self,
        project: &Project,
        pending: &[EpicRetest],
    ) -> YokeResult<String> {
        let mut lines = String::new();
        for retest in pending {
            let epic = self.store.get_epic(project.id, retest.epic_id).await?;
            lines.push_str(&format!(
                "- epic {} ({}): {} [{}]\n",
                epic.epic_id,
                epic.tier.as_str(),
                epic.name,
                retest.trigger_reason.as_str()
            ));
        }
        Ok(format!(
            r#"You are re-verifying previously completed epics.

## EPICS TO RETEST
{lines}
## TASK
For each epic: list its tests with list_tests, re-run each one, record
outcomes with update_epic_test_result, then call
record_epic_retest_result with the pass/fail counts."#
        ))
    }

    fn resume_prompt(
        &self,
        project: &Project,
        checkpoint: Option<&Checkpoint>,
        notes: Option<&str>,
    ) -> String {
        let history = checkpoint
            .map(|c| c.conversation_history.as_str())
            .unwrap_or("");
        format!(
            r#"You are resuming work that was paused by an intervention.

## PREVIOUS SESSION CONTEXT
{}

## RESOLUTION NOTES
{}

## SPECIFICATION
{}

## TASK
Pick up where the previous session left off: call get_next_task, verify
your work with tests, and record results before marking tasks done."#,
            history,
            notes.unwrap_or("(none)"),
            project.source_spec
        )
    }
}

/// Copy an imported tree into the workspace and digest it into a source
/// revision.
fn import_tree(source: &Path, dest: &Path) -> YokeResult<String> {
    if !source.is_dir() {
        return Err(YokeError::Validation(format!(
            "import path {} is not a directory",
            source.display()
        )));
    }

    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in walkdir::WalkDir::new(source)
        .into_iter()
        .filter_entry(|e| {
            !IMPORT_SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref())
        })
    {
        let entry = entry.map_err(|e| YokeError::Internal(format!("import walk failed: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| YokeError::Internal(e.to_string()))?;
        files.push((rel.to_string_lossy().into_owned(), entry.path().to_path_buf()));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut digest = Sha256::new();
    for (rel, path) in &files {
        let content = std::fs::read(path)
            .map_err(|e| YokeError::Internal(format!("failed to read {rel}: {e}")))?;
        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| YokeError::Internal(format!("failed to create {rel}: {e}")))?;
        }
        std::fs::write(&target, &content)
            .map_err(|e| YokeError::Internal(format!("failed to write {rel}: {e}")))?;
        digest.update(rel.as_bytes());
        digest.update([0]);
        digest.update(Sha256::digest(&content));
    }

    Ok(format!("{:x}", digest.finalize()))
}
