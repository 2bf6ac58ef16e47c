//! Epic re-testing history, failure records, and quality/review rows.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::errors::YokeResult;

use super::models::*;
use super::{Store, bad_row, row_json, row_uuid};

fn failure_from_row(row: &SqliteRow) -> YokeResult<EpicTestFailure> {
    let category: String = row.try_get("error_category")?;
    Ok(EpicTestFailure {
        id: row.try_get("id")?,
        project_id: row_uuid(row, "project_id")?,
        epic_id: row.try_get("epic_id")?,
        epic_test_id: row.try_get("epic_test_id")?,
        session_id: row_uuid(row, "session_id")?,
        failed_at: row.try_get("failed_at")?,
        error_message: row.try_get("error_message")?,
        error_category: ErrorCategory::from_str(&category)
            .map_err(|e| bad_row("epic_test_failure", e))?,
        was_passing_before: row.try_get::<i64, _>("was_passing_before")? != 0,
        retry_count_at_failure: row.try_get("retry_count_at_failure")?,
    })
}

fn retest_from_row(row: &SqliteRow) -> YokeResult<EpicRetest> {
    let trigger: String = row.try_get("trigger_reason")?;
    let tier: String = row.try_get("tier")?;
    Ok(EpicRetest {
        id: row.try_get("id")?,
        project_id: row_uuid(row, "project_id")?,
        epic_id: row.try_get("epic_id")?,
        trigger_reason: RetestTrigger::from_str(&trigger).map_err(|e| bad_row("epic_retest", e))?,
        tier: EpicTier::from_str(&tier).map_err(|e| bad_row("epic_retest", e))?,
        selected_at: row.try_get("selected_at")?,
        tested_at: row.try_get("tested_at")?,
        passed: row.try_get::<Option<i64>, _>("passed")?.map(|v| v != 0),
        failed_test_count: row.try_get("failed_test_count")?,
        total_test_count: row.try_get("total_test_count")?,
        regression_detected: row.try_get::<i64, _>("regression_detected")? != 0,
        stability_score: row.try_get("stability_score")?,
    })
}

impl Store {
    // ── Epic test failures (append-only) ──────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn record_epic_test_failure(
        &self,
        project_id: Uuid,
        epic_id: i64,
        epic_test_id: i64,
        session_id: Uuid,
        error_message: &str,
        error_category: ErrorCategory,
        was_passing_before: bool,
        retry_count_at_failure: i64,
    ) -> YokeResult<()> {
        sqlx::query(
            "INSERT INTO epic_test_failures
                (project_id, epic_id, epic_test_id, session_id, failed_at, error_message,
                 error_category, was_passing_before, retry_count_at_failure)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(project_id.to_string())
        .bind(epic_id)
        .bind(epic_test_id)
        .bind(session_id.to_string())
        .bind(Utc::now())
        .bind(error_message)
        .bind(error_category.as_str())
        .bind(was_passing_before)
        .bind(retry_count_at_failure)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_epic_test_failures(
        &self,
        project_id: Uuid,
        epic_id: i64,
    ) -> YokeResult<Vec<EpicTestFailure>> {
        let rows = sqlx::query(
            "SELECT * FROM epic_test_failures WHERE project_id = ?1 AND epic_id = ?2
             ORDER BY failed_at, id",
        )
        .bind(project_id.to_string())
        .bind(epic_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(failure_from_row).collect()
    }

    pub async fn latest_failure_for_test(
        &self,
        project_id: Uuid,
        epic_test_id: i64,
    ) -> YokeResult<Option<EpicTestFailure>> {
        let row = sqlx::query(
            "SELECT * FROM epic_test_failures WHERE project_id = ?1 AND epic_test_id = ?2
             ORDER BY failed_at DESC, id DESC LIMIT 1",
        )
        .bind(project_id.to_string())
        .bind(epic_test_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(failure_from_row).transpose()
    }

    // ── Epic retests ──────────────────────────────────────────────

    /// Schedule a retest for an epic. One pending selection per epic.
    pub async fn create_epic_retest(
        &self,
        project_id: Uuid,
        epic_id: i64,
        trigger_reason: RetestTrigger,
        tier: EpicTier,
    ) -> YokeResult<EpicRetest> {
        if let Some(pending) = self.pending_retest(project_id, epic_id).await? {
            return Ok(pending);
        }
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO epic_retests (project_id, epic_id, trigger_reason, tier, selected_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(project_id.to_string())
        .bind(epic_id)
        .bind(trigger_reason.as_str())
        .bind(tier.as_str())
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(EpicRetest {
            id: result.last_insert_rowid(),
            project_id,
            epic_id,
            trigger_reason,
            tier,
            selected_at: now,
            tested_at: None,
            passed: None,
            failed_test_count: 0,
            total_test_count: 0,
            regression_detected: false,
            stability_score: None,
        })
    }

    pub async fn pending_retest(
        &self,
        project_id: Uuid,
        epic_id: i64,
    ) -> YokeResult<Option<EpicRetest>> {
        let row = sqlx::query(
            "SELECT * FROM epic_retests
             WHERE project_id = ?1 AND epic_id = ?2 AND tested_at IS NULL
             ORDER BY id DESC LIMIT 1",
        )
        .bind(project_id.to_string())
        .bind(epic_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(retest_from_row).transpose()
    }

    /// Scheduled-but-unexecuted retests across a project.
    pub async fn list_pending_retests(&self, project_id: Uuid) -> YokeResult<Vec<EpicRetest>> {
        let rows = sqlx::query(
            "SELECT * FROM epic_retests WHERE project_id = ?1 AND tested_at IS NULL ORDER BY id",
        )
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(retest_from_row).collect()
    }

    /// Completed retests for an epic, oldest first.
    pub async fn completed_retests(
        &self,
        project_id: Uuid,
        epic_id: i64,
    ) -> YokeResult<Vec<EpicRetest>> {
        let rows = sqlx::query(
            "SELECT * FROM epic_retests
             WHERE project_id = ?1 AND epic_id = ?2 AND tested_at IS NOT NULL
             ORDER BY tested_at, id",
        )
        .bind(project_id.to_string())
        .bind(epic_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(retest_from_row).collect()
    }

    pub async fn list_epic_retests(&self, project_id: Uuid) -> YokeResult<Vec<EpicRetest>> {
        let rows = sqlx::query(
            "SELECT * FROM epic_retests WHERE project_id = ?1 ORDER BY selected_at, id",
        )
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(retest_from_row).collect()
    }

    /// Fill in the outcome of a pending retest. Regression is detected
    /// against the previous completed retest of the same epic; outcome
    /// fields are immutable afterwards.
    pub async fn complete_epic_retest(
        &self,
        project_id: Uuid,
        epic_id: i64,
        passed: bool,
        failed_test_count: i64,
        total_test_count: i64,
        stability_score: f64,
    ) -> YokeResult<EpicRetest> {
        let epic = self.get_epic(project_id, epic_id).await?;
        let pending = match self.pending_retest(project_id, epic_id).await? {
            Some(pending) => pending,
            // Agent-initiated retest without a prior selection.
            None => {
                self.create_epic_retest(project_id, epic_id, RetestTrigger::Manual, epic.tier)
                    .await?
            }
        };

        let previous_passed = self
            .completed_retests(project_id, epic_id)
            .await?
            .last()
            .and_then(|r| r.passed);
        let regression = previous_passed == Some(true) && !passed;

        sqlx::query(
            "UPDATE epic_retests SET tested_at = ?1, passed = ?2, failed_test_count = ?3,
                total_test_count = ?4, regression_detected = ?5, stability_score = ?6
             WHERE id = ?7 AND tested_at IS NULL",
        )
        .bind(Utc::now())
        .bind(passed)
        .bind(failed_test_count)
        .bind(total_test_count)
        .bind(regression)
        .bind(stability_score)
        .bind(pending.id)
        .execute(self.pool())
        .await?;

        let row = sqlx::query("SELECT * FROM epic_retests WHERE id = ?1")
            .bind(pending.id)
            .fetch_one(self.pool())
            .await?;
        retest_from_row(&row)
    }

    /// Epics completed after the most recent retest selection; drives the
    /// every-N-completed-epics trigger.
    pub async fn epics_completed_since_last_retest(&self, project_id: Uuid) -> YokeResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM epics
             WHERE project_id = ?1 AND status = 'completed'
               AND completed_at > COALESCE(
                   (SELECT MAX(selected_at) FROM epic_retests WHERE project_id = ?1),
                   '1970-01-01T00:00:00Z')",
        )
        .bind(project_id.to_string())
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    // ── Quality / review records ──────────────────────────────────

    pub async fn insert_quality_check(&self, check: &SessionQualityCheck) -> YokeResult<i64> {
        let result = sqlx::query(
            "INSERT INTO session_quality_checks
                (session_id, quality_score, error_count, error_rate, rating, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(check.session_id.to_string())
        .bind(check.quality_score)
        .bind(check.error_count)
        .bind(check.error_rate)
        .bind(check.rating.as_str())
        .bind(serde_json::to_string(&check.summary)?)
        .bind(check.created_at)
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn insert_deep_review(
        &self,
        session_id: Uuid,
        trigger_reasons: &[String],
        report_markdown: &str,
        recommendations: &[ReviewRecommendation],
    ) -> YokeResult<i64> {
        let result = sqlx::query(
            "INSERT INTO deep_reviews (session_id, trigger_reasons, report_markdown, recommendations, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id.to_string())
        .bind(serde_json::to_string(trigger_reasons)?)
        .bind(report_markdown)
        .bind(serde_json::to_string(recommendations)?)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_deep_reviews(&self, session_id: Uuid) -> YokeResult<Vec<DeepReview>> {
        let rows = sqlx::query("SELECT * FROM deep_reviews WHERE session_id = ?1 ORDER BY id")
            .bind(session_id.to_string())
            .fetch_all(self.pool())
            .await?;
        rows.iter()
            .map(|row| {
                Ok(DeepReview {
                    id: row.try_get("id")?,
                    session_id: row_uuid(row, "session_id")?,
                    trigger_reasons: row_json(row, "trigger_reasons")?,
                    report_markdown: row.try_get("report_markdown")?,
                    recommendations: row_json(row, "recommendations")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    pub async fn insert_completion_review(
        &self,
        project_id: Uuid,
        overall_score: i64,
        coverage_percentage: f64,
        recommendation: CompletionRecommendation,
        requirements: &[RequirementCoverage],
    ) -> YokeResult<CompletionReview> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO completion_reviews
                (project_id, overall_score, coverage_percentage, recommendation, requirements, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(project_id.to_string())
        .bind(overall_score)
        .bind(coverage_percentage)
        .bind(recommendation.as_str())
        .bind(serde_json::to_string(requirements)?)
        .bind(now)
        .execute(self.pool())
        .await?;
        Ok(CompletionReview {
            id: result.last_insert_rowid(),
            project_id,
            overall_score,
            coverage_percentage,
            recommendation,
            requirements: requirements.to_vec(),
            created_at: now,
        })
    }
}
