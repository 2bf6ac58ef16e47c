//! Per-session metrics accumulated from the event stream.
//!
//! The collector is pure computation: it observes events in stream order and
//! folds them into counters. At session end [`MetricsCollector::finalize`]
//! produces the summary stored atomically with the session's final state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::sandbox::security::BLOCKED_PREFIX;
use crate::store::models::TestCategory;
use crate::stream::AgentEvent;

pub const METRICS_VERSION: u32 = 2;

/// Inferred work type of a task, used to judge verification appropriateness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Ui,
    Api,
    Database,
    Config,
    Integration,
    General,
}

impl TaskType {
    /// Keyword inference over the task description.
    pub fn infer(description: &str) -> Self {
        let text = description.to_lowercase();
        let hit = |words: &[&str]| words.iter().any(|w| text.contains(w));

        if hit(&["integration", "end-to-end", "e2e", "workflow"]) {
            Self::Integration
        } else if hit(&["ui", "page", "button", "form", "component", "frontend", "css", "style", "render"]) {
            Self::Ui
        } else if hit(&["database", "migration", "schema", "sql", "table", "index"]) {
            Self::Database
        } else if hit(&["api", "endpoint", "route", "rest", "http", "request handler"]) {
            Self::Api
        } else if hit(&["config", "setup", "environment", "env var", "build", "deploy", "ci"]) {
            Self::Config
        } else {
            Self::General
        }
    }

    /// The verification category a task of this type should use.
    pub fn expected_verification(&self) -> Option<TestCategory> {
        match self {
            Self::Ui => Some(TestCategory::Browser),
            Self::Api => Some(TestCategory::Api),
            Self::Database => Some(TestCategory::Database),
            Self::Config => Some(TestCategory::Build),
            Self::Integration => Some(TestCategory::E2e),
            Self::General => None,
        }
    }
}

/// Enumerated prompt-adherence violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdherenceViolation {
    WrongBashCommand,
    WorkspacePrefixMissing,
    UsedBashForFilesystem,
    UiTaskWithoutBrowser,
    SkippedVerification,
}

impl AdherenceViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WrongBashCommand => "wrong_bash_command",
            Self::WorkspacePrefixMissing => "workspace_prefix_missing",
            Self::UsedBashForFilesystem => "used_bash_for_filesystem",
            Self::UiTaskWithoutBrowser => "ui_task_without_browser",
            Self::SkippedVerification => "skipped_verification",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ErrorPatternStats {
    pub count: u64,
    pub last_seen: Option<DateTime<Utc>>,
    /// Mean number of tool calls between repeats of this fingerprint.
    pub avg_recovery_attempts: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HourBucket {
    pub hour: u32,
    pub tasks_completed: u64,
    pub errors: u64,
}

/// The summary stored in `session.metrics` at session end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub metrics_version: u32,
    pub session_id: Uuid,
    pub quality_score: i64,
    pub tool_calls: u64,
    pub tool_errors: u64,
    pub error_rate: f64,
    pub tool_counts: HashMap<String, u64>,
    pub total_tool_duration_ms: u64,
    pub tasks_started: u64,
    pub tasks_completed: u64,
    pub inappropriate_verifications: u64,
    pub ui_tasks: u64,
    pub ui_tasks_browser_verified: u64,
    /// Completed tasks that recorded at least one test result.
    pub verification_rate: f64,
    pub adherence_violations: HashMap<String, u64>,
    pub adherence_violation_total: u64,
    pub error_patterns: HashMap<String, ErrorPatternStats>,
    pub hourly_progression: Vec<HourBucket>,
}

impl MetricsSummary {
    /// Fingerprints seen at least three times this session.
    pub fn repeated_errors(&self) -> Vec<(&str, u64)> {
        let mut repeated: Vec<(&str, u64)> = self
            .error_patterns
            .iter()
            .filter(|(_, stats)| stats.count >= 3)
            .map(|(fp, stats)| (fp.as_str(), stats.count))
            .collect();
        repeated.sort_by(|a, b| b.1.cmp(&a.1));
        repeated
    }
}

/// Collapse an error text into a stable fingerprint: first line, lowercased,
/// digit runs replaced, truncated.
pub fn fingerprint(text: &str) -> String {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let mut out = String::with_capacity(first_line.len().min(120));
    let mut last_was_digit = false;
    for c in first_line.trim().chars() {
        if c.is_ascii_digit() {
            if !last_was_digit {
                out.push('#');
            }
            last_was_digit = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_was_digit = false;
        }
        if out.len() >= 120 {
            break;
        }
    }
    out
}

pub struct MetricsCollector {
    session_id: Uuid,
    started_at: DateTime<Utc>,
    tool_calls: u64,
    tool_errors: u64,
    tool_counts: HashMap<String, u64>,
    total_tool_duration_ms: u64,
    pending_tools: HashMap<String, String>,
    tasks_started: u64,
    tasks_completed: u64,
    current_task: Option<i64>,
    task_types: HashMap<i64, TaskType>,
    verified_tasks: HashSet<i64>,
    browser_verified_tasks: HashSet<i64>,
    completed_tasks: HashSet<i64>,
    inappropriate_verifications: u64,
    adherence: HashMap<AdherenceViolation, u64>,
    error_patterns: HashMap<String, PatternState>,
    hourly: Vec<HourBucket>,
}

#[derive(Default)]
struct PatternState {
    count: u64,
    last_seen: Option<DateTime<Utc>>,
    calls_at_last_hit: u64,
    gap_sum: u64,
}

impl MetricsCollector {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            started_at: Utc::now(),
            tool_calls: 0,
            tool_errors: 0,
            tool_counts: HashMap::new(),
            total_tool_duration_ms: 0,
            pending_tools: HashMap::new(),
            tasks_started: 0,
            tasks_completed: 0,
            current_task: None,
            task_types: HashMap::new(),
            verified_tasks: HashSet::new(),
            browser_verified_tasks: HashSet::new(),
            completed_tasks: HashSet::new(),
            inappropriate_verifications: 0,
            adherence: HashMap::new(),
            error_patterns: HashMap::new(),
            hourly: Vec::new(),
        }
    }

    /// Whether browser verification was recorded for a task since it
    /// started; the intervention engine consults this for the UI gate.
    pub fn browser_verified(&self, task_id: i64) -> bool {
        self.browser_verified_tasks.contains(&task_id)
    }

    pub fn task_type(&self, task_id: i64) -> Option<TaskType> {
        self.task_types.get(&task_id).copied()
    }

    /// Fold one event, in stream order.
    pub fn observe(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::ToolUse {
                tool,
                input,
                request_id,
            } => {
                self.tool_calls += 1;
                *self.tool_counts.entry(tool.clone()).or_insert(0) += 1;
                self.pending_tools.insert(request_id.clone(), tool.clone());
                if tool == "bash" {
                    self.inspect_bash(input);
                }
            }
            AgentEvent::ToolResult {
                request_id,
                is_error,
                text,
            } => {
                self.pending_tools.remove(request_id);
                if let Some(duration) = extract_duration_ms(text) {
                    self.total_tool_duration_ms += duration;
                }
                if *is_error {
                    self.tool_errors += 1;
                    self.bucket_mut().errors += 1;
                    self.record_error_pattern(text);
                    if text.starts_with(BLOCKED_PREFIX) {
                        self.record_violation(AdherenceViolation::WrongBashCommand);
                    }
                }
            }
            AgentEvent::SystemMessage { subtype, fields } => {
                self.observe_system(subtype, fields);
            }
            AgentEvent::Error { message } => {
                self.tool_errors += 1;
                self.bucket_mut().errors += 1;
                self.record_error_pattern(message);
            }
            AgentEvent::Prompt { .. }
            | AgentEvent::AssistantText { .. }
            | AgentEvent::SessionEnd { .. } => {}
        }
    }

    fn observe_system(&mut self, subtype: &str, fields: &serde_json::Map<String, Value>) {
        let task_id = fields.get("task_id").and_then(Value::as_i64);
        match subtype {
            "task_started" => {
                self.tasks_started += 1;
                if let Some(task_id) = task_id {
                    self.current_task = Some(task_id);
                    let description = fields
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    self.task_types.insert(task_id, TaskType::infer(description));
                }
            }
            "verification_recorded" => {
                let Some(task_id) = task_id else { return };
                self.verified_tasks.insert(task_id);
                let category = fields
                    .get("category")
                    .and_then(Value::as_str)
                    .and_then(|s| TestCategory::from_str(s).ok());
                if category == Some(TestCategory::Browser) {
                    self.browser_verified_tasks.insert(task_id);
                }
                if let (Some(task_type), Some(category)) =
                    (task_id_type(&self.task_types, task_id), category)
                {
                    if let Some(expected) = task_type.expected_verification() {
                        if category != expected && category != TestCategory::Unit {
                            self.inappropriate_verifications += 1;
                        }
                    }
                }
            }
            "task_completed" => {
                self.tasks_completed += 1;
                self.bucket_mut().tasks_completed += 1;
                if let Some(task_id) = task_id {
                    self.completed_tasks.insert(task_id);
                    if !self.verified_tasks.contains(&task_id) {
                        self.record_violation(AdherenceViolation::SkippedVerification);
                    }
                    if task_id_type(&self.task_types, task_id) == Some(TaskType::Ui)
                        && !self.browser_verified_tasks.contains(&task_id)
                    {
                        self.record_violation(AdherenceViolation::UiTaskWithoutBrowser);
                    }
                    if self.current_task == Some(task_id) {
                        self.current_task = None;
                    }
                }
            }
            _ => {}
        }
    }

    fn inspect_bash(&mut self, input: &Value) {
        let Some(command) = input.get("command").and_then(Value::as_str) else {
            return;
        };
        let mut tokens = command.split_whitespace();
        if let Some(program) = tokens.next() {
            let program = program.rsplit('/').next().unwrap_or(program);
            if matches!(
                program,
                "cat" | "ls" | "find" | "grep" | "head" | "tail" | "touch" | "mkdir" | "cp" | "mv"
            ) {
                self.record_violation(AdherenceViolation::UsedBashForFilesystem);
            }
        }
        let escapes_workspace = command.split_whitespace().any(|t| {
            t.starts_with('/')
                && !t.starts_with("/workspace")
                && !t.starts_with("/tmp")
                && t != "/dev/null"
        });
        if escapes_workspace {
            self.record_violation(AdherenceViolation::WorkspacePrefixMissing);
        }
    }

    fn record_violation(&mut self, violation: AdherenceViolation) {
        *self.adherence.entry(violation).or_insert(0) += 1;
    }

    fn record_error_pattern(&mut self, text: &str) {
        let fp = fingerprint(text);
        if fp.is_empty() {
            return;
        }
        let calls = self.tool_calls;
        let state = self.error_patterns.entry(fp).or_default();
        if state.count > 0 {
            state.gap_sum += calls.saturating_sub(state.calls_at_last_hit);
        }
        state.count += 1;
        state.last_seen = Some(Utc::now());
        state.calls_at_last_hit = calls;
    }

    fn bucket_mut(&mut self) -> &mut HourBucket {
        let hour = (Utc::now() - self.started_at).num_hours().max(0) as u32;
        if self.hourly.last().map(|b| b.hour) != Some(hour) {
            self.hourly.push(HourBucket {
                hour,
                ..HourBucket::default()
            });
        }
        self.hourly.last_mut().unwrap()
    }

    pub fn error_rate(&self) -> f64 {
        if self.tool_calls == 0 {
            0.0
        } else {
            self.tool_errors as f64 / self.tool_calls as f64
        }
    }

    /// Produce the final summary with the 1–10 quality score.
    pub fn finalize(&self) -> MetricsSummary {
        let error_rate = self.error_rate();
        let adherence_total: u64 = self.adherence.values().sum();

        let verified_completed = self
            .completed_tasks
            .iter()
            .filter(|t| self.verified_tasks.contains(t))
            .count() as u64;
        let verification_rate = if self.tasks_completed == 0 {
            1.0
        } else {
            verified_completed as f64 / self.tasks_completed as f64
        };

        let ui_tasks: Vec<i64> = self
            .task_types
            .iter()
            .filter(|(_, t)| **t == TaskType::Ui)
            .map(|(id, _)| *id)
            .collect();
        let ui_browser_verified = ui_tasks
            .iter()
            .filter(|t| self.browser_verified_tasks.contains(t))
            .count() as u64;

        let mut score: i64 = 10;
        score -= match error_rate {
            r if r > 0.10 => 5,
            r if r > 0.05 => 3,
            r if r > 0.02 => 1,
            _ => 0,
        };
        score -= match self.inappropriate_verifications {
            n if n >= 5 => 3,
            n if n >= 3 => 2,
            n if n >= 1 => 1,
            _ => 0,
        };
        if !ui_tasks.is_empty()
            && (ui_browser_verified as f64) < 0.5 * ui_tasks.len() as f64
        {
            score -= 2;
        }
        score -= match adherence_total {
            n if n >= 5 => 2,
            n if n >= 3 => 1,
            _ => 0,
        };
        let quality_score = score.clamp(1, 10);

        MetricsSummary {
            metrics_version: METRICS_VERSION,
            session_id: self.session_id,
            quality_score,
            tool_calls: self.tool_calls,
            tool_errors: self.tool_errors,
            error_rate,
            tool_counts: self.tool_counts.clone(),
            total_tool_duration_ms: self.total_tool_duration_ms,
            tasks_started: self.tasks_started,
            tasks_completed: self.tasks_completed,
            inappropriate_verifications: self.inappropriate_verifications,
            ui_tasks: ui_tasks.len() as u64,
            ui_tasks_browser_verified: ui_browser_verified,
            verification_rate,
            adherence_violations: self
                .adherence
                .iter()
                .map(|(v, count)| (v.as_str().to_string(), *count))
                .collect(),
            adherence_violation_total: adherence_total,
            error_patterns: self
                .error_patterns
                .iter()
                .map(|(fp, state)| {
                    let avg = if state.count > 1 {
                        state.gap_sum as f64 / (state.count - 1) as f64
                    } else {
                        0.0
                    };
                    (
                        fp.clone(),
                        ErrorPatternStats {
                            count: state.count,
                            last_seen: state.last_seen,
                            avg_recovery_attempts: avg,
                        },
                    )
                })
                .collect(),
            hourly_progression: self.hourly.clone(),
        }
    }
}

fn task_id_type(types: &HashMap<i64, TaskType>, task_id: i64) -> Option<TaskType> {
    types.get(&task_id).copied()
}

/// Tool results embed their duration as `[duration_ms=N]` when available.
fn extract_duration_ms(text: &str) -> Option<u64> {
    let start = text.find("[duration_ms=")? + "[duration_ms=".len();
    let rest = &text[start..];
    let end = rest.find(']')?;
    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_use(tool: &str, input: Value, id: &str) -> AgentEvent {
        AgentEvent::ToolUse {
            tool: tool.into(),
            input,
            request_id: id.into(),
        }
    }

    fn tool_result(id: &str, is_error: bool, text: &str) -> AgentEvent {
        AgentEvent::ToolResult {
            request_id: id.into(),
            is_error,
            text: text.into(),
        }
    }

    fn system(subtype: &str, fields: Value) -> AgentEvent {
        AgentEvent::SystemMessage {
            subtype: subtype.into(),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_task_type_inference() {
        assert_eq!(TaskType::infer("Add login button to the page"), TaskType::Ui);
        assert_eq!(TaskType::infer("Add POST /todos endpoint"), TaskType::Api);
        assert_eq!(TaskType::infer("Write migration for users table"), TaskType::Database);
        assert_eq!(TaskType::infer("Configure CI build"), TaskType::Config);
        assert_eq!(TaskType::infer("End-to-end checkout workflow"), TaskType::Integration);
        assert_eq!(TaskType::infer("Refactor helper"), TaskType::General);
    }

    #[test]
    fn test_fingerprint_collapses_digits_and_case() {
        assert_eq!(
            fingerprint("Error 404 at line 123\nstack trace..."),
            "error # at line #"
        );
        assert_eq!(fingerprint("Error 404"), fingerprint("ERROR 505"));
        assert_ne!(fingerprint("timeout"), fingerprint("refused"));
    }

    #[test]
    fn test_clean_session_scores_ten() {
        let mut collector = MetricsCollector::new(Uuid::new_v4());
        collector.observe(&system(
            "task_started",
            serde_json::json!({"task_id": 1, "description": "Add POST /todos endpoint"}),
        ));
        collector.observe(&tool_use("bash", serde_json::json!({"command": "npm test"}), "r1"));
        collector.observe(&tool_result("r1", false, "ok"));
        collector.observe(&system(
            "verification_recorded",
            serde_json::json!({"task_id": 1, "category": "api", "passed": true}),
        ));
        collector.observe(&system("task_completed", serde_json::json!({"task_id": 1})));

        let summary = collector.finalize();
        assert_eq!(summary.quality_score, 10);
        assert_eq!(summary.tasks_completed, 1);
        assert_eq!(summary.verification_rate, 1.0);
        assert_eq!(summary.metrics_version, METRICS_VERSION);
    }

    #[test]
    fn test_error_rate_deductions() {
        // 2 errors out of 10 calls = 20% -> -5.
        let mut collector = MetricsCollector::new(Uuid::new_v4());
        for i in 0..10 {
            let id = format!("r{i}");
            collector.observe(&tool_use("bash", serde_json::json!({"command": "npm test"}), &id));
            collector.observe(&tool_result(&id, i < 2, if i < 2 { "failed" } else { "ok" }));
        }
        let summary = collector.finalize();
        assert!(summary.error_rate > 0.10);
        assert_eq!(summary.quality_score, 5);
    }

    #[test]
    fn test_inappropriate_verification_counted() {
        let mut collector = MetricsCollector::new(Uuid::new_v4());
        collector.observe(&system(
            "task_started",
            serde_json::json!({"task_id": 2, "description": "Style the login form component"}),
        ));
        // UI task verified via api instead of browser.
        collector.observe(&system(
            "verification_recorded",
            serde_json::json!({"task_id": 2, "category": "api", "passed": true}),
        ));
        collector.observe(&system("task_completed", serde_json::json!({"task_id": 2})));

        let summary = collector.finalize();
        assert_eq!(summary.inappropriate_verifications, 1);
        assert_eq!(summary.ui_tasks, 1);
        assert_eq!(summary.ui_tasks_browser_verified, 0);
        // -1 inappropriate, -2 ui-without-browser ratio, adherence has
        // ui_task_without_browser (1 violation, below the >=3 step).
        assert_eq!(summary.quality_score, 7);
        assert_eq!(
            summary.adherence_violations.get("ui_task_without_browser"),
            Some(&1)
        );
    }

    #[test]
    fn test_unit_verification_never_inappropriate() {
        let mut collector = MetricsCollector::new(Uuid::new_v4());
        collector.observe(&system(
            "task_started",
            serde_json::json!({"task_id": 3, "description": "Add POST /todos endpoint"}),
        ));
        collector.observe(&system(
            "verification_recorded",
            serde_json::json!({"task_id": 3, "category": "unit", "passed": true}),
        ));
        let summary = collector.finalize();
        assert_eq!(summary.inappropriate_verifications, 0);
    }

    #[test]
    fn test_repeated_error_fingerprints() {
        let mut collector = MetricsCollector::new(Uuid::new_v4());
        for i in 0..3 {
            let id = format!("r{i}");
            collector.observe(&tool_use("bash", serde_json::json!({"command": "npm test"}), &id));
            collector.observe(&tool_result(&id, true, "Error: connect ECONNREFUSED 5432"));
        }
        let summary = collector.finalize();
        let repeated = summary.repeated_errors();
        assert_eq!(repeated.len(), 1);
        assert_eq!(repeated[0].1, 3);
    }

    #[test]
    fn test_blocked_command_counts_adherence() {
        let mut collector = MetricsCollector::new(Uuid::new_v4());
        collector.observe(&tool_use(
            "bash",
            serde_json::json!({"command": "sudo rm -rf /etc"}),
            "r1",
        ));
        collector.observe(&tool_result(
            "r1",
            true,
            &format!("{BLOCKED_PREFIX} privilege_escalation: sudo rm -rf /etc"),
        ));
        let summary = collector.finalize();
        assert_eq!(
            summary.adherence_violations.get("wrong_bash_command"),
            Some(&1)
        );
    }

    #[test]
    fn test_bash_filesystem_and_workspace_violations() {
        let mut collector = MetricsCollector::new(Uuid::new_v4());
        collector.observe(&tool_use(
            "bash",
            serde_json::json!({"command": "cat /etc/hosts"}),
            "r1",
        ));
        collector.observe(&tool_result("r1", false, "127.0.0.1"));
        let summary = collector.finalize();
        assert_eq!(
            summary.adherence_violations.get("used_bash_for_filesystem"),
            Some(&1)
        );
        assert_eq!(
            summary.adherence_violations.get("workspace_prefix_missing"),
            Some(&1)
        );
    }

    #[test]
    fn test_skipped_verification_on_unverified_completion() {
        let mut collector = MetricsCollector::new(Uuid::new_v4());
        collector.observe(&system(
            "task_started",
            serde_json::json!({"task_id": 4, "description": "general work"}),
        ));
        collector.observe(&system("task_completed", serde_json::json!({"task_id": 4})));
        let summary = collector.finalize();
        assert_eq!(
            summary.adherence_violations.get("skipped_verification"),
            Some(&1)
        );
        assert_eq!(summary.verification_rate, 0.0);
    }

    #[test]
    fn test_hourly_bucket_accumulates() {
        let mut collector = MetricsCollector::new(Uuid::new_v4());
        collector.observe(&system(
            "task_started",
            serde_json::json!({"task_id": 1, "description": "x"}),
        ));
        collector.observe(&system("task_completed", serde_json::json!({"task_id": 1})));
        collector.observe(&AgentEvent::Error {
            message: "boom".into(),
        });
        let summary = collector.finalize();
        assert_eq!(summary.hourly_progression.len(), 1);
        assert_eq!(summary.hourly_progression[0].hour, 0);
        assert_eq!(summary.hourly_progression[0].tasks_completed, 1);
        assert_eq!(summary.hourly_progression[0].errors, 1);
    }

    #[test]
    fn test_duration_extraction() {
        assert_eq!(extract_duration_ms("ok [duration_ms=250]"), Some(250));
        assert_eq!(extract_duration_ms("no duration"), None);
    }

    #[test]
    fn test_score_floor_is_one() {
        let mut collector = MetricsCollector::new(Uuid::new_v4());
        // High error rate, many inappropriate verifications, many
        // violations: the floor holds at 1.
        for i in 0..10 {
            let id = format!("r{i}");
            collector.observe(&tool_use("bash", serde_json::json!({"command": "cat /etc/x"}), &id));
            collector.observe(&tool_result(&id, true, "Error: failed"));
        }
        for task in 0..5 {
            collector.observe(&system(
                "task_started",
                serde_json::json!({"task_id": task, "description": "ui page button"}),
            ));
            collector.observe(&system(
                "verification_recorded",
                serde_json::json!({"task_id": task, "category": "api", "passed": true}),
            ));
        }
        let summary = collector.finalize();
        assert_eq!(summary.quality_score, 1);
    }
}
