//! Quality pipeline: per-session quick checks, deep-review triggering,
//! epic re-test scheduling with stability scoring, and the completion
//! review of a finished project against its spec.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EpicRetestingConfig;
use crate::errors::YokeResult;
use crate::metrics::MetricsSummary;
use crate::store::Store;
use crate::store::models::*;

/// Smoothing factor for the stability EMA.
const EMA_ALPHA: f64 = 0.3;

/// Exponential moving average of retest outcomes (pass=1, fail=0) over the
/// last `window` entries, oldest first. None with no history; exactly 1.0
/// or 0.0 with a single entry.
pub fn stability_ema(outcomes: &[bool], window: usize) -> Option<f64> {
    if outcomes.is_empty() || window == 0 {
        return None;
    }
    let start = outcomes.len().saturating_sub(window);
    let recent = &outcomes[start..];
    let mut ema = if recent[0] { 1.0 } else { 0.0 };
    for outcome in &recent[1..] {
        let x = if *outcome { 1.0 } else { 0.0 };
        ema = EMA_ALPHA * x + (1.0 - EMA_ALPHA) * ema;
    }
    Some(ema)
}

/// Stable reasons a finished session earns a deep review.
pub fn deep_review_triggers(summary: &MetricsSummary, is_final_session: bool) -> Vec<String> {
    let mut reasons = Vec::new();
    if summary.quality_score < 7 {
        reasons.push("low_quality_score".to_string());
    }
    if summary.error_rate > 0.10 {
        reasons.push("high_error_rate".to_string());
    }
    if summary.tool_errors >= 30 {
        reasons.push("high_error_count".to_string());
    }
    if summary.quality_score >= 8 && summary.tool_errors >= 20 {
        reasons.push("score_error_inconsistency".to_string());
    }
    if summary.adherence_violation_total >= 5 {
        reasons.push("adherence_violations".to_string());
    }
    if summary.verification_rate < 0.5 {
        reasons.push("low_verification_rate".to_string());
    }
    if !summary.repeated_errors().is_empty() {
        reasons.push("repeated_error_pattern".to_string());
    }
    if is_final_session {
        reasons.push("final_session_review".to_string());
    }
    reasons
}

fn rating_for(summary: &MetricsSummary) -> QualityRating {
    match summary.quality_score {
        s if s >= 8 => QualityRating::Good,
        s if s >= 5 => QualityRating::Acceptable,
        _ => QualityRating::Poor,
    }
}

/// Out-of-band request to a reviewing agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepReviewRequest {
    pub project_id: Uuid,
    pub session_id: Uuid,
    pub trigger_reasons: Vec<String>,
    pub summary: MetricsSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepReviewReport {
    pub report_markdown: String,
    pub recommendations: Vec<ReviewRecommendation>,
}

/// The reviewing agent the pipeline calls for deep reviews; external to the
/// core.
#[async_trait]
pub trait ReviewAgent: Send + Sync {
    async fn review(&self, request: DeepReviewRequest) -> YokeResult<DeepReviewReport>;
}

/// Outcome of the end-of-session quality pass.
#[derive(Debug, Clone)]
pub struct SessionQualityOutcome {
    pub rating: QualityRating,
    pub deep_review_triggers: Vec<String>,
    pub deep_review_id: Option<i64>,
}

pub struct QualityPipeline {
    retesting: EpicRetestingConfig,
}

impl QualityPipeline {
    pub fn new(retesting: EpicRetestingConfig) -> Self {
        Self { retesting }
    }

    /// Zero-cost quick check for every session, plus a deep review when any
    /// trigger fires and a reviewer is wired up.
    pub async fn on_session_end(
        &self,
        store: &Store,
        reviewer: Option<&dyn ReviewAgent>,
        session: &Session,
        summary: &MetricsSummary,
        is_final_session: bool,
    ) -> YokeResult<SessionQualityOutcome> {
        let check = SessionQualityCheck {
            id: 0,
            session_id: session.id,
            quality_score: summary.quality_score,
            error_count: summary.tool_errors as i64,
            error_rate: summary.error_rate,
            rating: rating_for(summary),
            summary: summary.clone(),
            created_at: Utc::now(),
        };
        store.insert_quality_check(&check).await?;

        let triggers = deep_review_triggers(summary, is_final_session);
        let mut deep_review_id = None;
        if !triggers.is_empty() {
            info!(session = %session.id, reasons = ?triggers, "deep review triggered");
            if let Some(reviewer) = reviewer {
                let request = DeepReviewRequest {
                    project_id: session.project_id,
                    session_id: session.id,
                    trigger_reasons: triggers.clone(),
                    summary: summary.clone(),
                };
                match reviewer.review(request).await {
                    Ok(report) => {
                        let id = store
                            .insert_deep_review(
                                session.id,
                                &triggers,
                                &report.report_markdown,
                                &report.recommendations,
                            )
                            .await?;
                        deep_review_id = Some(id);
                    }
                    Err(e) => warn!(session = %session.id, error = %e, "deep review failed"),
                }
            } else {
                // Record the trigger even when no reviewer is attached so
                // the backlog of due reviews is queryable.
                let id = store
                    .insert_deep_review(session.id, &triggers, "", &[])
                    .await?;
                deep_review_id = Some(id);
            }
        }

        Ok(SessionQualityOutcome {
            rating: check.rating,
            deep_review_triggers: triggers,
            deep_review_id,
        })
    }

    /// Select up to `max_retests_per_trigger` completed epics to re-test,
    /// ranked by tier, staleness, and dependent count. Fires after every
    /// `trigger_frequency` completed epics, or whenever a foundation epic
    /// has gone stale.
    pub async fn select_retests(
        &self,
        store: &Store,
        project_id: Uuid,
    ) -> YokeResult<Vec<EpicRetest>> {
        if !self.retesting.enabled {
            return Ok(Vec::new());
        }

        let epics = store.list_epics(project_id).await?;
        let completed: Vec<&Epic> = epics
            .iter()
            .filter(|e| e.status == EpicStatus::Completed)
            .collect();
        if completed.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut candidates = Vec::new();
        let mut any_stale_foundation = false;

        for epic in &completed {
            let retests = store.completed_retests(project_id, epic.epic_id).await?;
            let last_checked = retests
                .last()
                .and_then(|r| r.tested_at)
                .or(epic.completed_at)
                .unwrap_or(now);
            let staleness_days = (now - last_checked).num_days().max(0);
            let stale_foundation = epic.tier == EpicTier::Foundation
                && staleness_days > self.retesting.foundation_retest_days;
            if stale_foundation {
                any_stale_foundation = true;
            }

            let dependents = epics
                .iter()
                .filter(|other| other.priority > epic.priority)
                .count() as f64;

            let mut score = epic.tier.weight() + staleness_days as f64 * 0.1 + 0.5 * dependents;
            if stale_foundation {
                score += 2.0;
            }
            candidates.push((epic, score, stale_foundation));
        }

        let completed_since = store.epics_completed_since_last_retest(project_id).await?;
        if completed_since < i64::from(self.retesting.trigger_frequency) && !any_stale_foundation {
            return Ok(Vec::new());
        }

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected = Vec::new();
        for (epic, _, stale_foundation) in candidates
            .into_iter()
            .take(self.retesting.max_retests_per_trigger)
        {
            let reason = if stale_foundation {
                RetestTrigger::FoundationStale
            } else {
                RetestTrigger::EpicInterval
            };
            let retest = store
                .create_epic_retest(project_id, epic.epic_id, reason, epic.tier)
                .await?;
            selected.push(retest);
        }
        Ok(selected)
    }

    /// Record a retest outcome: stability EMA over the recent window,
    /// regression detection, and reopening the epic when it regressed.
    /// A regression also queues a deep review against the recording
    /// session.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_retest_result(
        &self,
        store: &Store,
        project_id: Uuid,
        epic_id: i64,
        session_id: Uuid,
        passed: bool,
        failed_test_count: i64,
        total_test_count: i64,
    ) -> YokeResult<EpicRetest> {
        let mut outcomes: Vec<bool> = store
            .completed_retests(project_id, epic_id)
            .await?
            .iter()
            .filter_map(|r| r.passed)
            .collect();
        outcomes.push(passed);
        let stability = stability_ema(&outcomes, self.retesting.stability_window)
            .unwrap_or(if passed { 1.0 } else { 0.0 });

        let retest = store
            .complete_epic_retest(
                project_id,
                epic_id,
                passed,
                failed_test_count,
                total_test_count,
                stability,
            )
            .await?;

        if retest.regression_detected {
            warn!(project = %project_id, epic = epic_id, "epic retest regression");
            store.reopen_epic(project_id, epic_id).await?;
            store
                .append_progress_note(
                    project_id,
                    Some(session_id),
                    NoteKind::Blocker,
                    &format!(
                        "BLOCKER [regression] epic {} failed retest after previously passing ({}/{} tests failing)",
                        epic_id, failed_test_count, total_test_count
                    ),
                )
                .await?;
            store
                .insert_deep_review(
                    session_id,
                    &["epic_retest_regression".to_string()],
                    "",
                    &[],
                )
                .await?;
        }
        Ok(retest)
    }

    /// Score a finished project against its source spec.
    pub async fn completion_review(
        &self,
        store: &Store,
        project: &Project,
    ) -> YokeResult<CompletionReview> {
        let epics = store.list_epics(project.id).await?;
        let tasks = store.list_tasks(project.id, None, false).await?;

        let requirements = extract_requirements(&project.source_spec);
        let mut coverages = Vec::with_capacity(requirements.len());

        for (text, priority) in &requirements {
            let req_tokens = tokenize(text);
            let mut best: f64 = 0.0;
            let mut matched_epics = Vec::new();
            let mut matched_tasks = Vec::new();

            for epic in &epics {
                let score = overlap(&req_tokens, &format!("{} {}", epic.name, epic.description));
                if score >= 30.0 {
                    matched_epics.push(epic.epic_id);
                }
                best = best.max(score);
            }
            for task in &tasks {
                let score = overlap(&req_tokens, &task.description);
                if score >= 30.0 {
                    matched_tasks.push(task.task_id);
                }
                best = best.max(score);
            }

            let status = match best {
                s if s >= 70.0 => RequirementStatus::Covered,
                s if s >= 30.0 => RequirementStatus::Partial,
                _ => RequirementStatus::Missing,
            };
            coverages.push(RequirementCoverage {
                text: text.clone(),
                priority: *priority,
                status,
                matched_epics,
                matched_tasks,
                coverage_score: best,
            });
        }

        let (overall, coverage_pct) = if coverages.is_empty() {
            (100, 100.0)
        } else {
            let weight = |priority: i64| if priority == 1 { 2.0 } else { 1.0 };
            let weighted_sum: f64 = coverages
                .iter()
                .map(|c| c.coverage_score * weight(c.priority))
                .sum();
            let weights: f64 = coverages.iter().map(|c| weight(c.priority)).sum();
            let overall = (weighted_sum / weights).round().clamp(1.0, 100.0) as i64;
            let covered = coverages
                .iter()
                .filter(|c| c.status != RequirementStatus::Missing)
                .count();
            (overall, covered as f64 / coverages.len() as f64 * 100.0)
        };

        let recommendation = match overall {
            s if s >= 80 => CompletionRecommendation::Complete,
            s if s >= 50 => CompletionRecommendation::NeedsWork,
            _ => CompletionRecommendation::Failed,
        };

        store
            .insert_completion_review(project.id, overall, coverage_pct, recommendation, &coverages)
            .await
    }
}

/// Pull requirement lines out of a spec: bullets, numbered items, and
/// MUST/SHOULD sentences.
fn extract_requirements(spec: &str) -> Vec<(String, i64)> {
    let mut out = Vec::new();
    for line in spec.lines() {
        let trimmed = line.trim();
        if trimmed.len() < 8 {
            continue;
        }
        let is_bullet = trimmed.starts_with("- ")
            || trimmed.starts_with("* ")
            || trimmed
                .split_once('.')
                .is_some_and(|(n, _)| n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty());
        let upper = trimmed.to_uppercase();
        let is_normative = upper.contains("MUST") || upper.contains("SHOULD");
        if !is_bullet && !is_normative {
            continue;
        }
        let text = trimmed
            .trim_start_matches(['-', '*', ' '])
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.')
            .trim()
            .to_string();
        if text.len() < 8 {
            continue;
        }
        let priority = if upper.contains("MUST") { 1 } else { 2 };
        out.push((text, priority));
    }
    // A spec with no bullets still yields something to score against.
    if out.is_empty() {
        for sentence in spec.split(['.', '\n']) {
            let sentence = sentence.trim();
            if sentence.len() >= 16 {
                out.push((sentence.to_string(), 2));
            }
        }
    }
    out.truncate(100);
    out
}

fn tokenize(text: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "the", "and", "with", "for", "that", "this", "from", "into", "must", "should", "have",
        "has", "are", "can", "will", "when", "each", "all", "any",
    ];
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| w.len() >= 3 && !STOPWORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Percentage of requirement tokens present in the entity text.
fn overlap(req_tokens: &[String], entity_text: &str) -> f64 {
    if req_tokens.is_empty() {
        return 0.0;
    }
    let entity_tokens = tokenize(entity_text);
    let hits = req_tokens
        .iter()
        .filter(|t| entity_tokens.contains(t))
        .count();
    hits as f64 / req_tokens.len() as f64 * 100.0
}
