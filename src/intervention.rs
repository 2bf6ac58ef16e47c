//! Intervention engine: retry tracking, critical-error detection, the
//! quality gate on task completion, and the pause flow.
//!
//! Detection is pure computation over the session event stream; applying a
//! pause writes the checkpoint, the paused-session row, and the blocker
//! note in one pass, then the orchestrator terminates the runner.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::EpicTestingConfig;
use crate::errors::{YokeError, YokeResult};
use crate::metrics::TaskType;
use crate::store::models::{
    BlockerInfo, CheckpointType, NoteKind, PauseType, PausedSession, Project, Session,
};
use crate::store::Store;
use crate::stream::{AgentEvent, EventSender};

/// Instruction to pause the running session.
#[derive(Debug, Clone)]
pub struct PauseDirective {
    pub pause_type: PauseType,
    pub reason: String,
    pub blocker_info: BlockerInfo,
}

/// A fix the engine may attempt once before pausing.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryAction {
    pub action: String,
    pub command: String,
}

struct CriticalPattern {
    regex: Regex,
    blocker_type: &'static str,
    reason: &'static str,
}

static CRITICAL_PATTERNS: LazyLock<Vec<CriticalPattern>> = LazyLock::new(|| {
    [
        (
            r"(?i)(connection refused|could not connect|econnrefused).{0,80}(postgres|database|5432|3306)",
            "database_unreachable",
            "database is unreachable",
        ),
        (
            r"(?i)(database|postgres|mysql).{0,40}(connection refused|not running|unreachable)",
            "database_unreachable",
            "database is unreachable",
        ),
        (
            r"(?i)schema (validation|mismatch|verification) fail|relation .{1,60} does not exist",
            "schema_validation",
            "schema validation failed",
        ),
        (
            r"(?i)modulenotfounderror|cannot find module|importerror: no module named",
            "missing_module",
            "a required module is missing",
        ),
        (
            r"(?i)eaddrinuse|address already in use|port \d+ (is )?(already )?in use",
            "port_in_use",
            "a required port is already in use",
        ),
    ]
    .into_iter()
    .map(|(pattern, blocker_type, reason)| CriticalPattern {
        regex: Regex::new(pattern).unwrap(),
        blocker_type,
        reason,
    })
    .collect()
});

static PORT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:port\s*|:)(\d{2,5})\b").unwrap());

static MODULE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)(?:cannot find module|no module named)\s*['"]?([A-Za-z0-9_@./-]+)"#).unwrap()
});

/// Match text against the critical patterns.
pub fn critical_match(text: &str) -> Option<BlockerInfo> {
    let pattern = CRITICAL_PATTERNS.iter().find(|p| p.regex.is_match(text))?;
    let first_line = text.lines().next().unwrap_or(text);
    Some(BlockerInfo {
        blocker_type: pattern.blocker_type.to_string(),
        message: format!("{}: {}", pattern.reason, first_line.trim()),
        port: PORT_REGEX
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok()),
        ..BlockerInfo::default()
    })
}

pub struct InterventionEngine {
    tolerance: u32,
    violation_threshold: u32,
    retry_counts: HashMap<String, u32>,
    pending: HashMap<String, String>,
    quality_violations: u32,
    paused: bool,
}

impl InterventionEngine {
    pub fn new(config: &EpicTestingConfig) -> Self {
        Self {
            tolerance: config.auto_failure_tolerance,
            violation_threshold: config.quality_violation_threshold,
            retry_counts: HashMap::new(),
            pending: HashMap::new(),
            quality_violations: 0,
            paused: false,
        }
    }

    /// Failed-invocation counts keyed by normalized command.
    pub fn retry_stats(&self) -> HashMap<String, u32> {
        self.retry_counts.clone()
    }

    /// Observe one event in stream order; a directive means the session
    /// must pause now.
    pub fn observe(&mut self, event: &AgentEvent) -> Option<PauseDirective> {
        if self.paused {
            return None;
        }
        match event {
            AgentEvent::ToolUse {
                tool,
                input,
                request_id,
            } => {
                self.pending
                    .insert(request_id.clone(), invocation_key(tool, input));
                None
            }
            AgentEvent::ToolResult {
                request_id,
                is_error,
                text,
            } => {
                let key = self.pending.remove(request_id);
                if !*is_error {
                    if let Some(key) = key {
                        // A success resets the retry streak for that command.
                        self.retry_counts.remove(&key);
                    }
                    return None;
                }
                if let Some(blocker) = critical_match(text) {
                    return Some(self.pause(PauseDirective {
                        pause_type: PauseType::CriticalError,
                        reason: blocker.message.clone(),
                        blocker_info: blocker,
                    }));
                }
                if let Some(key) = key {
                    let count = self.retry_counts.entry(key.clone()).or_insert(0);
                    *count += 1;
                    if *count > self.tolerance {
                        let blocker = BlockerInfo {
                            blocker_type: "retry_limit".to_string(),
                            message: format!(
                                "command failed {} times: {}",
                                count, key
                            ),
                            command: Some(key.clone()),
                            ..BlockerInfo::default()
                        };
                        return Some(self.pause(PauseDirective {
                            pause_type: PauseType::RetryLimit,
                            reason: blocker.message.clone(),
                            blocker_info: blocker,
                        }));
                    }
                }
                None
            }
            AgentEvent::Error { message } => critical_match(message).map(|blocker| {
                self.pause(PauseDirective {
                    pause_type: PauseType::CriticalError,
                    reason: blocker.message.clone(),
                    blocker_info: blocker,
                })
            }),
            _ => None,
        }
    }

    fn pause(&mut self, directive: PauseDirective) -> PauseDirective {
        self.paused = true;
        directive
    }

    /// Gate for `update_task_status(done=true)`: a UI task must have seen
    /// browser verification since it started. Store-level rules (tests
    /// resolved and passing) run separately inside the completion
    /// transaction.
    pub fn validate_task_completion(
        &self,
        task_id: i64,
        task_type: Option<TaskType>,
        browser_verified: bool,
    ) -> YokeResult<()> {
        if task_type == Some(TaskType::Ui) && !browser_verified {
            return Err(YokeError::QualityViolation(format!(
                "task {} is UI work but no browser verification was recorded",
                task_id
            )));
        }
        Ok(())
    }

    /// Count a rejected mutation; past the threshold the session pauses.
    pub fn record_quality_violation(&mut self, detail: &str) -> Option<PauseDirective> {
        self.quality_violations += 1;
        if self.paused || self.quality_violations <= self.violation_threshold {
            return None;
        }
        let blocker = BlockerInfo {
            blocker_type: "quality_violation".to_string(),
            message: format!(
                "{} quality violations this session; last: {}",
                self.quality_violations, detail
            ),
            ..BlockerInfo::default()
        };
        Some(self.pause(PauseDirective {
            pause_type: PauseType::QualityViolation,
            reason: blocker.message.clone(),
            blocker_info: blocker,
        }))
    }

    /// External pause request from the orchestrator.
    pub fn manual_pause(&mut self, reason: &str) -> PauseDirective {
        self.pause(PauseDirective {
            pause_type: PauseType::Manual,
            reason: reason.to_string(),
            blocker_info: BlockerInfo {
                blocker_type: "manual".to_string(),
                message: reason.to_string(),
                ..BlockerInfo::default()
            },
        })
    }

    /// Known fix for a blocker, if any. The caller runs it once on the
    /// privileged path and records the attempt.
    pub fn recovery_plan(blocker: &BlockerInfo, project: &Project) -> Option<RecoveryAction> {
        match blocker.blocker_type.as_str() {
            "port_in_use" => {
                let port = blocker.port?;
                Some(RecoveryAction {
                    action: "kill_port_process".to_string(),
                    command: format!("fuser -k {port}/tcp 2>/dev/null || true"),
                })
            }
            "database_unreachable" => {
                let command = project.service_start_command("database")?;
                Some(RecoveryAction {
                    action: "restart_service".to_string(),
                    command,
                })
            }
            "missing_module" => {
                let module = MODULE_REGEX
                    .captures(&blocker.message)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string())?;
                let command = if blocker.message.to_lowercase().contains("no module named") {
                    format!("pip install {module}")
                } else {
                    format!("npm install {module}")
                };
                Some(RecoveryAction {
                    action: "install_module".to_string(),
                    command,
                })
            }
            _ => None,
        }
    }

    /// Persist the pause: pre-blocker checkpoint, paused-session row
    /// (flipping session status), BLOCKER note, and a notification event
    /// for external dispatchers.
    pub async fn apply_pause(
        &self,
        store: &Store,
        session: &Session,
        directive: &PauseDirective,
        conversation_history: &str,
        last_task_id: Option<i64>,
        can_auto_resume: bool,
        events: &EventSender,
    ) -> YokeResult<PausedSession> {
        store
            .write_checkpoint(
                session.id,
                CheckpointType::PreBlocker,
                conversation_history,
                last_task_id,
            )
            .await?;

        let paused = store
            .create_paused_session(
                session.id,
                &directive.reason,
                directive.pause_type,
                &directive.blocker_info,
                &self.retry_stats(),
                can_auto_resume,
            )
            .await?;

        store
            .append_progress_note(
                session.project_id,
                Some(session.id),
                NoteKind::Blocker,
                &format!(
                    "BLOCKER [{}] {}",
                    directive.pause_type.as_str(),
                    directive.reason
                ),
            )
            .await?;

        let mut fields = serde_json::Map::new();
        fields.insert("project".into(), session.project_id.to_string().into());
        fields.insert("session".into(), session.id.to_string().into());
        fields.insert(
            "blocker_type".into(),
            directive.blocker_info.blocker_type.clone().into(),
        );
        fields.insert("message".into(), directive.reason.clone().into());
        fields.insert(
            "retry_stats".into(),
            serde_json::to_value(self.retry_stats())?,
        );
        events.system("intervention_notification", fields);

        Ok(paused)
    }
}

fn invocation_key(tool: &str, input: &serde_json::Value) -> String {
    match input.get("command").and_then(serde_json::Value::as_str) {
        Some(command) => {
            let normalized = command.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("{tool}:{normalized}")
        }
        None => format!("{tool}:{input}"),
    }
}
