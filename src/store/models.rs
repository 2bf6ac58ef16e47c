//! Persistent entity types for the YokeFlow data model.
//!
//! Status enums carry `as_str`/`from_str` pairs matching the TEXT columns in
//! the schema; known JSON payload shapes (blocker info, checkpoints, review
//! recommendations) are typed structs, with only user-provided project
//! `settings` kept as an opaque map.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{YokeError, YokeResult};
use crate::metrics::MetricsSummary;

static PROJECT_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,100}$").unwrap());

/// Validate a project name against the accepted pattern.
pub fn validate_project_name(name: &str) -> YokeResult<()> {
    if PROJECT_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(YokeError::Validation(format!(
            "project name must match [A-Za-z0-9._-]{{1,100}}, got {:?}",
            name
        )))
    }
}

// ── Project ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Paused,
    Completed,
    Archived,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectType {
    Greenfield,
    Brownfield,
}

impl ProjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greenfield => "greenfield",
            Self::Brownfield => "brownfield",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "greenfield" => Ok(Self::Greenfield),
            "brownfield" => Ok(Self::Brownfield),
            _ => Err(format!("Invalid project type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub source_spec: String,
    pub status: ProjectStatus,
    pub project_type: ProjectType,
    /// User-provided settings; opaque except for the keys read below.
    pub settings: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    /// Whether `update_task_status(done=true)` is allowed for zero-test tasks.
    pub fn allow_untested_tasks(&self) -> bool {
        self.settings
            .get("allow_untested_tasks")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Brownfield source revision recorded at import, if any.
    pub fn source_revision(&self) -> Option<&str> {
        self.settings.get("source_revision").and_then(Value::as_str)
    }

    /// Restart command for a named service, used by auto-recovery.
    pub fn service_start_command(&self, service: &str) -> Option<String> {
        self.settings
            .get("services")
            .and_then(Value::as_object)
            .and_then(|m| m.get(service))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

// ── Epic ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl EpicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid epic status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicTier {
    Foundation,
    HighDependency,
    Standard,
}

impl EpicTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foundation => "foundation",
            Self::HighDependency => "high_dependency",
            Self::Standard => "standard",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "foundation" => Ok(Self::Foundation),
            "high_dependency" => Ok(Self::HighDependency),
            "standard" => Ok(Self::Standard),
            _ => Err(format!("Invalid epic tier: {}", s)),
        }
    }

    /// Retest priority weight; foundation epics are retested first.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Foundation => 3.0,
            Self::HighDependency => 2.0,
            Self::Standard => 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub project_id: Uuid,
    pub epic_id: i64,
    pub name: String,
    pub description: String,
    /// Lower runs earlier.
    pub priority: i64,
    pub status: EpicStatus,
    pub tier: EpicTier,
    pub completed_at: Option<DateTime<Utc>>,
}

// ── Task ──────────────────────────────────────────────────────────

/// Structured slice of task metadata; unknown keys pass through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_to_modify: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub project_id: Uuid,
    pub epic_id: i64,
    pub task_id: i64,
    pub description: String,
    /// Implementation hint for the agent.
    pub action: Option<String>,
    pub priority: i64,
    pub done: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: TaskMetadata,
}

// ── Test ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestCategory {
    Unit,
    Api,
    Browser,
    Build,
    Database,
    Integration,
    E2e,
}

impl TestCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Api => "api",
            Self::Browser => "browser",
            Self::Build => "build",
            Self::Database => "database",
            Self::Integration => "integration",
            Self::E2e => "e2e",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "unit" => Ok(Self::Unit),
            "api" => Ok(Self::Api),
            "browser" => Ok(Self::Browser),
            "build" => Ok(Self::Build),
            "database" => Ok(Self::Database),
            "integration" => Ok(Self::Integration),
            "e2e" => Ok(Self::E2e),
            _ => Err(format!("Invalid test category: {}", s)),
        }
    }
}

/// A verifiable requirement. Task-level tests carry `task_id`; epic-level
/// integration tests leave it empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Test {
    pub project_id: Uuid,
    pub test_id: i64,
    pub epic_id: i64,
    pub task_id: Option<i64>,
    pub category: TestCategory,
    pub description: String,
    /// What must hold for the test to pass; a spec, not code.
    pub requirements: String,
    pub passed: Option<bool>,
    pub last_error: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub retry_count: i64,
    pub verification_notes: Option<String>,
}

impl Test {
    pub fn is_epic_level(&self) -> bool {
        self.task_id.is_none()
    }
}

// ── Session ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Initializer,
    Coding,
    Review,
    Retest,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializer => "initializer",
            Self::Coding => "coding",
            Self::Review => "review",
            Self::Retest => "retest",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "initializer" => Ok(Self::Initializer),
            "coding" => Ok(Self::Coding),
            "review" => Ok(Self::Review),
            "retest" => Ok(Self::Retest),
            _ => Err(format!("Invalid session type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Paused,
    Completed,
    Error,
    Blocked,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "blocked" => Ok(Self::Blocked),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid session status: {}", s)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Strictly increasing per project.
    pub session_number: i64,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub model: String,
    pub metrics: Option<MetricsSummary>,
    /// Set on sessions created by resuming a paused one.
    pub parent_session_id: Option<Uuid>,
}

// ── Checkpoint ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    TaskCompletion,
    Periodic,
    PreBlocker,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCompletion => "task_completion",
            Self::Periodic => "periodic",
            Self::PreBlocker => "pre_blocker",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "task_completion" => Ok(Self::TaskCompletion),
            "periodic" => Ok(Self::Periodic),
            "pre_blocker" => Ok(Self::PreBlocker),
            _ => Err(format!("Invalid checkpoint type: {}", s)),
        }
    }
}

/// Serialized session state; the most recent row per session is the resume
/// point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: i64,
    pub session_id: Uuid,
    pub checkpoint_type: CheckpointType,
    pub conversation_history: String,
    pub last_task_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// ── Intervention records ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseType {
    RetryLimit,
    CriticalError,
    QualityViolation,
    Manual,
}

impl PauseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryLimit => "retry_limit",
            Self::CriticalError => "critical_error",
            Self::QualityViolation => "quality_violation",
            Self::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "retry_limit" => Ok(Self::RetryLimit),
            "critical_error" => Ok(Self::CriticalError),
            "quality_violation" => Ok(Self::QualityViolation),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Invalid pause type: {}", s)),
        }
    }
}

/// Typed blocker payload stored with a paused session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockerInfo {
    pub blocker_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausedSession {
    pub id: i64,
    pub session_id: Uuid,
    pub pause_reason: String,
    pub pause_type: PauseType,
    pub blocker_info: BlockerInfo,
    /// Failed-invocation counts keyed by normalized command.
    pub retry_stats: HashMap<String, u32>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub can_auto_resume: bool,
}

/// Append-only audit row for an auto-recovery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionAction {
    pub id: i64,
    pub session_id: Uuid,
    pub action: String,
    pub command: String,
    pub succeeded: bool,
    pub output_snippet: String,
    pub created_at: DateTime<Utc>,
}

// ── Epic testing history ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    TestQuality,
    ImplementationGap,
    Flaky,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TestQuality => "test_quality",
            Self::ImplementationGap => "implementation_gap",
            Self::Flaky => "flaky",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "test_quality" => Ok(Self::TestQuality),
            "implementation_gap" => Ok(Self::ImplementationGap),
            "flaky" => Ok(Self::Flaky),
            _ => Err(format!("Invalid error category: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicTestFailure {
    pub id: i64,
    pub project_id: Uuid,
    pub epic_id: i64,
    pub epic_test_id: i64,
    pub session_id: Uuid,
    pub failed_at: DateTime<Utc>,
    pub error_message: String,
    pub error_category: ErrorCategory,
    pub was_passing_before: bool,
    pub retry_count_at_failure: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetestTrigger {
    EpicInterval,
    FoundationStale,
    Manual,
}

impl RetestTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EpicInterval => "epic_interval",
            Self::FoundationStale => "foundation_stale",
            Self::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "epic_interval" => Ok(Self::EpicInterval),
            "foundation_stale" => Ok(Self::FoundationStale),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Invalid retest trigger: {}", s)),
        }
    }
}

/// A scheduled or completed re-test of a previously completed epic.
/// Outcome fields are immutable once `tested_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicRetest {
    pub id: i64,
    pub project_id: Uuid,
    pub epic_id: i64,
    pub trigger_reason: RetestTrigger,
    pub tier: EpicTier,
    pub selected_at: DateTime<Utc>,
    pub tested_at: Option<DateTime<Utc>>,
    pub passed: Option<bool>,
    pub failed_test_count: i64,
    pub total_test_count: i64,
    pub regression_detected: bool,
    /// EMA of recent outcomes in [0,1]; NULL until the first completed retest.
    pub stability_score: Option<f64>,
}

// ── Quality records ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRating {
    Good,
    Acceptable,
    Poor,
}

impl QualityRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Acceptable => "acceptable",
            Self::Poor => "poor",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "good" => Ok(Self::Good),
            "acceptable" => Ok(Self::Acceptable),
            "poor" => Ok(Self::Poor),
            _ => Err(format!("Invalid quality rating: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionQualityCheck {
    pub id: i64,
    pub session_id: Uuid,
    pub quality_score: i64,
    pub error_count: i64,
    pub error_rate: f64,
    pub rating: QualityRating,
    pub summary: MetricsSummary,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRecommendation {
    pub title: String,
    pub priority: String,
    pub theme: String,
    pub problem: String,
    pub proposed_change: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepReview {
    pub id: i64,
    pub session_id: Uuid,
    pub trigger_reasons: Vec<String>,
    pub report_markdown: String,
    pub recommendations: Vec<ReviewRecommendation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionRecommendation {
    Complete,
    NeedsWork,
    Failed,
}

impl CompletionRecommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::NeedsWork => "needs_work",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "complete" => Ok(Self::Complete),
            "needs_work" => Ok(Self::NeedsWork),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid completion recommendation: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    Covered,
    Partial,
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementCoverage {
    pub text: String,
    pub priority: i64,
    pub status: RequirementStatus,
    pub matched_epics: Vec<i64>,
    pub matched_tasks: Vec<i64>,
    pub coverage_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReview {
    pub id: i64,
    pub project_id: Uuid,
    pub overall_score: i64,
    pub coverage_percentage: f64,
    pub recommendation: CompletionRecommendation,
    pub requirements: Vec<RequirementCoverage>,
    pub created_at: DateTime<Utc>,
}

// ── Progress notes ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteKind {
    Blocker,
    Info,
}

impl NoteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocker => "blocker",
            Self::Info => "info",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "blocker" => Ok(Self::Blocker),
            "info" => Ok(Self::Info),
            _ => Err(format!("Invalid note kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressNote {
    pub id: i64,
    pub project_id: Uuid,
    pub session_id: Option<Uuid>,
    pub kind: NoteKind,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ── Aggregates ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total_epics: i64,
    pub completed_epics: i64,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub total_tests: i64,
    pub passing_tests: i64,
}

impl Progress {
    pub fn all_tasks_done(&self) -> bool {
        self.total_tasks > 0 && self.completed_tasks == self.total_tasks
    }
}
