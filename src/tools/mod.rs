//! The typed tool surface exposed to the Agent Runner.
//!
//! Every call is bound to one session and project; agents cannot cross
//! projects. Calls log a `tool_use` event before dispatch and a
//! `tool_result` after the mutation's transaction commits, so stream
//! observers and the database agree on ordering.

pub mod rpc;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::EpicTestingConfig;
use crate::errors::{YokeError, YokeResult};
use crate::intervention::{InterventionEngine, PauseDirective};
use crate::metrics::TaskType;
use crate::quality::QualityPipeline;
use crate::sandbox::{SandboxManager, Workspace};
use crate::store::Store;
use crate::store::models::*;
use crate::stream::{AgentEvent, EventSender};

/// The session a tool surface is bound to.
#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub project_id: Uuid,
    pub session_id: Uuid,
    pub session_type: SessionType,
}

#[derive(Default)]
struct SurfaceState {
    task_types: HashMap<i64, TaskType>,
    browser_verified: HashSet<i64>,
}

pub struct ToolSurface {
    store: Store,
    sandbox: Arc<SandboxManager>,
    workspace: Arc<dyn Workspace>,
    quality: Arc<QualityPipeline>,
    epic_testing: EpicTestingConfig,
    context: SessionContext,
    events: EventSender,
    intervention: Arc<tokio::sync::Mutex<InterventionEngine>>,
    pause_notify: mpsc::UnboundedSender<PauseDirective>,
    state: std::sync::Mutex<SurfaceState>,
}

// ── Parameter shapes ──────────────────────────────────────────────

#[derive(Deserialize)]
struct EpicIdParams {
    epic_id: i64,
}

#[derive(Deserialize)]
struct TaskIdParams {
    task_id: i64,
}

#[derive(Deserialize, Default)]
struct ListTasksParams {
    #[serde(default)]
    epic_id: Option<i64>,
    #[serde(default)]
    only_pending: bool,
}

#[derive(Deserialize)]
struct ListTestsParams {
    #[serde(default)]
    task_id: Option<i64>,
    #[serde(default)]
    epic_id: Option<i64>,
}

#[derive(Deserialize, Default)]
struct SessionHistoryParams {
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Deserialize, Default)]
struct StabilityParams {
    #[serde(default)]
    epic_id: Option<i64>,
}

#[derive(Deserialize)]
struct UpdateTaskStatusParams {
    task_id: i64,
    done: bool,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Deserialize)]
struct UpdateTaskTestResultParams {
    test_id: i64,
    passed: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    execution_time_ms: Option<i64>,
    #[serde(default)]
    verification_notes: Option<String>,
}

#[derive(Deserialize)]
struct UpdateEpicTestResultParams {
    epic_test_id: i64,
    passed: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    execution_time_ms: Option<i64>,
    #[serde(default)]
    verification_notes: Option<String>,
}

#[derive(Deserialize)]
struct RecordRetestParams {
    epic_id: i64,
    passed: bool,
    failed_test_count: i64,
    total_test_count: i64,
}

#[derive(Deserialize)]
struct CreateEpicParams {
    name: String,
    #[serde(default)]
    description: String,
    priority: i64,
    #[serde(default = "default_tier")]
    tier: String,
}

fn default_tier() -> String {
    "standard".to_string()
}

#[derive(Deserialize)]
struct CreateTaskParams {
    epic_id: i64,
    description: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    metadata: Option<TaskMetadata>,
}

#[derive(Deserialize)]
struct CreateTestParams {
    epic_id: i64,
    #[serde(default)]
    task_id: Option<i64>,
    category: String,
    description: String,
    #[serde(default)]
    requirements: String,
}

#[derive(Deserialize)]
struct ExpandEpicParams {
    epic_id: i64,
    tasks: Vec<ExpandTask>,
}

#[derive(Deserialize)]
struct ExpandTask {
    description: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default)]
    tests: Vec<ExpandTest>,
}

#[derive(Deserialize)]
struct ExpandTest {
    category: String,
    description: String,
    #[serde(default)]
    requirements: String,
}

#[derive(Deserialize)]
struct LogSessionParams {
    message: String,
}

#[derive(Deserialize)]
struct BashParams {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    background: bool,
}

impl ToolSurface {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        sandbox: Arc<SandboxManager>,
        workspace: Arc<dyn Workspace>,
        quality: Arc<QualityPipeline>,
        epic_testing: EpicTestingConfig,
        context: SessionContext,
        events: EventSender,
        intervention: Arc<tokio::sync::Mutex<InterventionEngine>>,
        pause_notify: mpsc::UnboundedSender<PauseDirective>,
    ) -> Self {
        Self {
            store,
            sandbox,
            workspace,
            quality,
            epic_testing,
            context,
            events,
            intervention,
            pause_notify,
            state: std::sync::Mutex::new(SurfaceState::default()),
        }
    }

    pub fn context(&self) -> SessionContext {
        self.context
    }

    /// Dispatch one call: `tool_use` event, the operation itself, then a
    /// `tool_result` carrying the committed outcome.
    pub async fn dispatch(&self, request_id: &str, method: &str, params: Value) -> YokeResult<Value> {
        self.events.send(AgentEvent::ToolUse {
            tool: method.to_string(),
            input: params.clone(),
            request_id: request_id.to_string(),
        });

        let result = self.call(method, params).await;

        match &result {
            Ok(value) => {
                let is_error = method == "bash"
                    && value.get("exit_code").and_then(Value::as_i64).unwrap_or(0) != 0;
                let text = if method == "bash" {
                    bash_result_text(value)
                } else {
                    value.to_string()
                };
                self.events.send(AgentEvent::ToolResult {
                    request_id: request_id.to_string(),
                    is_error,
                    text,
                });
            }
            Err(err) => {
                let text = match err {
                    YokeError::BlockedCommand { .. } => SandboxManager::blocked_message(err),
                    other => other.to_string(),
                };
                self.events.send(AgentEvent::ToolResult {
                    request_id: request_id.to_string(),
                    is_error: true,
                    text,
                });
                if matches!(err, YokeError::QualityViolation(_)) {
                    let mut engine = self.intervention.lock().await;
                    if let Some(directive) = engine.record_quality_violation(&err.to_string()) {
                        let _ = self.pause_notify.send(directive);
                    }
                }
            }
        }

        result
    }

    async fn call(&self, method: &str, params: Value) -> YokeResult<Value> {
        let ctx = self.context;
        match method {
            "task_status" => {
                let progress = self.store.progress(ctx.project_id).await?;
                Ok(serde_json::to_value(progress)?)
            }
            "get_next_task" => {
                let task = self.store.next_task(ctx.project_id).await?;
                Ok(serde_json::to_value(task)?)
            }
            "list_epics" => {
                let epics = self.store.list_epics(ctx.project_id).await?;
                Ok(serde_json::to_value(epics)?)
            }
            "get_epic" => {
                let p: EpicIdParams = parse(params)?;
                let epic = self.store.get_epic(ctx.project_id, p.epic_id).await?;
                Ok(serde_json::to_value(epic)?)
            }
            "list_tasks" => {
                let p: ListTasksParams = parse_or_default(params)?;
                let tasks = self
                    .store
                    .list_tasks(ctx.project_id, p.epic_id, p.only_pending)
                    .await?;
                Ok(serde_json::to_value(tasks)?)
            }
            "get_task" => {
                let p: TaskIdParams = parse(params)?;
                let task = self.store.get_task(ctx.project_id, p.task_id).await?;
                Ok(serde_json::to_value(task)?)
            }
            "list_tests" => {
                let p: ListTestsParams = parse(params)?;
                let tests = match (p.task_id, p.epic_id) {
                    (Some(task_id), _) => self.store.list_tests_for_task(ctx.project_id, task_id).await?,
                    (None, Some(epic_id)) => {
                        self.store.list_tests_for_epic(ctx.project_id, epic_id).await?
                    }
                    (None, None) => {
                        return Err(YokeError::Validation(
                            "list_tests requires task_id or epic_id".into(),
                        ));
                    }
                };
                Ok(serde_json::to_value(tests)?)
            }
            "get_session_history" => {
                let p: SessionHistoryParams = parse_or_default(params)?;
                let sessions = self
                    .store
                    .list_sessions(ctx.project_id, p.limit.unwrap_or(10).clamp(1, 100))
                    .await?;
                Ok(serde_json::to_value(sessions)?)
            }
            "get_epic_stability_metrics" => {
                let p: StabilityParams = parse_or_default(params)?;
                self.epic_stability_metrics(p.epic_id).await
            }
            "start_task" => {
                let p: TaskIdParams = parse(params)?;
                self.start_task(p.task_id).await
            }
            "update_task_status" => {
                let p: UpdateTaskStatusParams = parse(params)?;
                self.update_task_status(p).await
            }
            "update_task_test_result" => {
                let p: UpdateTaskTestResultParams = parse(params)?;
                self.update_task_test_result(p).await
            }
            "update_epic_test_result" => {
                let p: UpdateEpicTestResultParams = parse(params)?;
                self.update_epic_test_result(p).await
            }
            "trigger_epic_retest" => {
                let retests = self.quality.select_retests(&self.store, ctx.project_id).await?;
                let mut out = Vec::with_capacity(retests.len());
                for retest in retests {
                    let epic = self.store.get_epic(ctx.project_id, retest.epic_id).await?;
                    out.push(json!({
                        "epic_id": retest.epic_id,
                        "name": epic.name,
                        "tier": retest.tier.as_str(),
                        "trigger_reason": retest.trigger_reason.as_str(),
                    }));
                }
                Ok(Value::Array(out))
            }
            "record_epic_retest_result" => {
                let p: RecordRetestParams = parse(params)?;
                let retest = self
                    .quality
                    .record_retest_result(
                        &self.store,
                        ctx.project_id,
                        p.epic_id,
                        ctx.session_id,
                        p.passed,
                        p.failed_test_count,
                        p.total_test_count,
                    )
                    .await?;
                Ok(serde_json::to_value(retest)?)
            }
            "create_epic" => {
                self.require_initializer("create_epic")?;
                let p: CreateEpicParams = parse(params)?;
                let tier = EpicTier::from_str(&p.tier).map_err(YokeError::Validation)?;
                let epic = self
                    .store
                    .create_epic(ctx.project_id, &p.name, &p.description, p.priority, tier)
                    .await?;
                Ok(serde_json::to_value(epic)?)
            }
            "create_task" => {
                self.require_initializer("create_task")?;
                let p: CreateTaskParams = parse(params)?;
                let task = self
                    .store
                    .create_task(
                        ctx.project_id,
                        p.epic_id,
                        &p.description,
                        p.action.as_deref(),
                        p.priority,
                        p.metadata.unwrap_or_default(),
                    )
                    .await?;
                Ok(serde_json::to_value(task)?)
            }
            "create_test" => {
                self.require_initializer("create_test")?;
                let p: CreateTestParams = parse(params)?;
                let category = TestCategory::from_str(&p.category).map_err(YokeError::Validation)?;
                let test = self
                    .store
                    .create_test(
                        ctx.project_id,
                        p.epic_id,
                        p.task_id,
                        category,
                        &p.description,
                        &p.requirements,
                    )
                    .await?;
                Ok(serde_json::to_value(test)?)
            }
            "expand_epic" => {
                self.require_backlog_growth("expand_epic")?;
                let p: ExpandEpicParams = parse(params)?;
                self.expand_epic(p).await
            }
            "log_session" => {
                let p: LogSessionParams = parse(params)?;
                self.store
                    .append_progress_note(
                        ctx.project_id,
                        Some(ctx.session_id),
                        NoteKind::Info,
                        &p.message,
                    )
                    .await?;
                Ok(json!({"logged": true}))
            }
            "bash" => {
                let p: BashParams = parse(params)?;
                let timeout = self.sandbox.clamp_timeout(p.timeout);
                let outcome = self
                    .sandbox
                    .execute(
                        self.workspace.as_ref(),
                        &p.command,
                        timeout,
                        p.background,
                        Some(&self.events),
                    )
                    .await?;
                Ok(serde_json::to_value(outcome)?)
            }
            other => Err(YokeError::Validation(format!("unknown method: {other}"))),
        }
    }

    fn require_initializer(&self, method: &str) -> YokeResult<()> {
        if self.context.session_type != SessionType::Initializer {
            return Err(YokeError::Validation(format!(
                "{method} is only available to initializer sessions"
            )));
        }
        Ok(())
    }

    fn require_backlog_growth(&self, method: &str) -> YokeResult<()> {
        match self.context.session_type {
            SessionType::Initializer | SessionType::Coding => Ok(()),
            _ => Err(YokeError::Validation(format!(
                "{method} is not available to {} sessions",
                self.context.session_type.as_str()
            ))),
        }
    }

    async fn start_task(&self, task_id: i64) -> YokeResult<Value> {
        let task = self.store.start_task(self.context.project_id, task_id).await?;
        let task_type = TaskType::infer(&task.description);
        self.state
            .lock()
            .expect("surface state lock")
            .task_types
            .insert(task_id, task_type);

        let mut fields = serde_json::Map::new();
        fields.insert("task_id".into(), task_id.into());
        fields.insert("description".into(), task.description.clone().into());
        self.events.system("task_started", fields);
        Ok(serde_json::to_value(task)?)
    }

    async fn update_task_status(&self, p: UpdateTaskStatusParams) -> YokeResult<Value> {
        if !p.done {
            return Err(YokeError::Validation(
                "update_task_status only supports done=true; tasks are not reopened".into(),
            ));
        }

        let (task_type, browser_verified) = {
            let state = self.state.lock().expect("surface state lock");
            (
                state.task_types.get(&p.task_id).copied(),
                state.browser_verified.contains(&p.task_id),
            )
        };
        {
            let engine = self.intervention.lock().await;
            engine.validate_task_completion(p.task_id, task_type, browser_verified)?;
        }

        let project = self.store.get_project(self.context.project_id).await?;
        let task = self
            .store
            .complete_task(
                self.context.project_id,
                p.task_id,
                project.allow_untested_tasks(),
            )
            .await?;

        let mut fields = serde_json::Map::new();
        fields.insert("task_id".into(), p.task_id.into());
        self.events.system("task_completed", fields);

        if let Some(notes) = p.notes.filter(|n| !n.is_empty()) {
            self.store
                .append_progress_note(
                    self.context.project_id,
                    Some(self.context.session_id),
                    NoteKind::Info,
                    &format!("task {} done: {}", p.task_id, notes),
                )
                .await?;
        }

        self.store
            .refresh_epic_status(self.context.project_id, task.epic_id, &self.epic_testing)
            .await?;

        Ok(serde_json::to_value(task)?)
    }

    async fn update_task_test_result(&self, p: UpdateTaskTestResultParams) -> YokeResult<Value> {
        let test = self
            .store
            .update_test_result(
                self.context.project_id,
                p.test_id,
                p.passed,
                p.error.as_deref(),
                p.execution_time_ms,
                p.verification_notes.as_deref(),
            )
            .await?;

        if let Some(task_id) = test.task_id {
            if test.category == TestCategory::Browser {
                self.state
                    .lock()
                    .expect("surface state lock")
                    .browser_verified
                    .insert(task_id);
            }
            let mut fields = serde_json::Map::new();
            fields.insert("task_id".into(), task_id.into());
            fields.insert("category".into(), test.category.as_str().into());
            fields.insert("passed".into(), p.passed.into());
            self.events.system("verification_recorded", fields);
        }

        Ok(serde_json::to_value(test)?)
    }

    async fn update_epic_test_result(&self, p: UpdateEpicTestResultParams) -> YokeResult<Value> {
        let before = self.store.get_test(self.context.project_id, p.epic_test_id).await?;
        if !before.is_epic_level() {
            return Err(YokeError::Validation(format!(
                "test {} belongs to a task; use update_task_test_result",
                p.epic_test_id
            )));
        }

        if !p.passed {
            let was_passing_before = before.passed == Some(true);
            let prior_failure = self
                .store
                .latest_failure_for_test(self.context.project_id, p.epic_test_id)
                .await?;
            // Passed after an earlier failure and failing again: flaky.
            let category = if was_passing_before && prior_failure.is_some() {
                ErrorCategory::Flaky
            } else if was_passing_before {
                ErrorCategory::TestQuality
            } else {
                ErrorCategory::ImplementationGap
            };
            self.store
                .record_epic_test_failure(
                    self.context.project_id,
                    before.epic_id,
                    p.epic_test_id,
                    self.context.session_id,
                    p.error.as_deref().unwrap_or("epic test failed"),
                    category,
                    was_passing_before,
                    before.retry_count + 1,
                )
                .await?;
        }

        let notes = p
            .verification_notes
            .or_else(|| p.passed.then(|| "verified during epic testing".to_string()));
        let test = self
            .store
            .update_test_result(
                self.context.project_id,
                p.epic_test_id,
                p.passed,
                p.error.as_deref(),
                p.execution_time_ms,
                notes.as_deref(),
            )
            .await?;

        // A newly passing epic test can be the last gate on the epic.
        self.store
            .refresh_epic_status(self.context.project_id, test.epic_id, &self.epic_testing)
            .await?;

        Ok(serde_json::to_value(test)?)
    }

    async fn expand_epic(&self, p: ExpandEpicParams) -> YokeResult<Value> {
        let epic = self.store.get_epic(self.context.project_id, p.epic_id).await?;
        // Coding sessions may only grow the epic they are working in.
        if self.context.session_type == SessionType::Coding
            && epic.status != EpicStatus::InProgress
        {
            return Err(YokeError::Conflict(format!(
                "epic {} is {}; coding sessions can only expand in-progress epics",
                p.epic_id,
                epic.status.as_str()
            )));
        }

        let mut created = Vec::with_capacity(p.tasks.len());
        for spec in p.tasks {
            let task = self
                .store
                .create_task(
                    self.context.project_id,
                    p.epic_id,
                    &spec.description,
                    spec.action.as_deref(),
                    spec.priority,
                    TaskMetadata::default(),
                )
                .await?;
            for test in spec.tests {
                let category =
                    TestCategory::from_str(&test.category).map_err(YokeError::Validation)?;
                self.store
                    .create_test(
                        self.context.project_id,
                        p.epic_id,
                        Some(task.task_id),
                        category,
                        &test.description,
                        &test.requirements,
                    )
                    .await?;
            }
            created.push(task.task_id);
        }
        Ok(json!({"epic_id": p.epic_id, "created_tasks": created}))
    }

    async fn epic_stability_metrics(&self, epic_id: Option<i64>) -> YokeResult<Value> {
        let epics = match epic_id {
            Some(id) => vec![self.store.get_epic(self.context.project_id, id).await?],
            None => self.store.list_epics(self.context.project_id).await?,
        };

        let mut out = Vec::with_capacity(epics.len());
        for epic in epics {
            let retests = self
                .store
                .completed_retests(self.context.project_id, epic.epic_id)
                .await?;
            let passes = retests.iter().filter(|r| r.passed == Some(true)).count();
            let failures = retests.len() - passes;
            let regressions = retests.iter().filter(|r| r.regression_detected).count();
            let stability = retests.last().and_then(|r| r.stability_score);
            out.push(json!({
                "epic_id": epic.epic_id,
                "name": epic.name,
                "tier": epic.tier.as_str(),
                "retests": retests.len(),
                "passes": passes,
                "failures": failures,
                "regressions_detected": regressions,
                "stability_score": stability,
            }));
        }
        Ok(Value::Array(out))
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> YokeResult<T> {
    serde_json::from_value(params)
        .map_err(|e| YokeError::Validation(format!("invalid parameters: {e}")))
}

fn parse_or_default<T: serde::de::DeserializeOwned + Default>(params: Value) -> YokeResult<T> {
    if params.is_null() {
        Ok(T::default())
    } else {
        parse(params)
    }
}

/// Agent-visible text for a bash outcome, with the duration tag metrics
/// extracts.
fn bash_result_text(value: &Value) -> String {
    let exit_code = value.get("exit_code").and_then(Value::as_i64).unwrap_or(-1);
    let stdout = value.get("stdout").and_then(Value::as_str).unwrap_or("");
    let stderr = value.get("stderr").and_then(Value::as_str).unwrap_or("");
    let duration = value.get("duration_ms").and_then(Value::as_u64).unwrap_or(0);
    format!("exit {exit_code}\n{stdout}{stderr}\n[duration_ms={duration}]")
}
