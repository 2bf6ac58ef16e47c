//! Epic / task / test CRUD and the completion rules that tie them together.
//!
//! Task completion and test-result updates are the two mutations with
//! cross-entity invariants: a task may only become done when its tests are
//! resolved and passing, and every failed test result increments the test's
//! retry counter in the same statement.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::config::{EpicTestingConfig, EpicTestingMode};
use crate::errors::{YokeError, YokeResult};

use super::models::*;
use super::{Store, bad_row, row_json, row_uuid};

fn epic_from_row(row: &SqliteRow) -> YokeResult<Epic> {
    let status: String = row.try_get("status")?;
    let tier: String = row.try_get("tier")?;
    Ok(Epic {
        project_id: row_uuid(row, "project_id")?,
        epic_id: row.try_get("epic_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        priority: row.try_get("priority")?,
        status: EpicStatus::from_str(&status).map_err(|e| bad_row("epic", e))?,
        tier: EpicTier::from_str(&tier).map_err(|e| bad_row("epic", e))?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn task_from_row(row: &SqliteRow) -> YokeResult<Task> {
    Ok(Task {
        project_id: row_uuid(row, "project_id")?,
        epic_id: row.try_get("epic_id")?,
        task_id: row.try_get("task_id")?,
        description: row.try_get("description")?,
        action: row.try_get("action")?,
        priority: row.try_get("priority")?,
        done: row.try_get::<i64, _>("done")? != 0,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        metadata: row_json(row, "metadata")?,
    })
}

fn test_from_row(row: &SqliteRow) -> YokeResult<Test> {
    let category: String = row.try_get("category")?;
    Ok(Test {
        project_id: row_uuid(row, "project_id")?,
        test_id: row.try_get("test_id")?,
        epic_id: row.try_get("epic_id")?,
        task_id: row.try_get("task_id")?,
        category: TestCategory::from_str(&category).map_err(|e| bad_row("test", e))?,
        description: row.try_get("description")?,
        requirements: row.try_get("requirements")?,
        passed: row
            .try_get::<Option<i64>, _>("passed")?
            .map(|v| v != 0),
        last_error: row.try_get("last_error")?,
        execution_time_ms: row.try_get("execution_time_ms")?,
        retry_count: row.try_get("retry_count")?,
        verification_notes: row.try_get("verification_notes")?,
    })
}

impl Store {
    // ── Epics ─────────────────────────────────────────────────────

    pub async fn create_epic(
        &self,
        project_id: Uuid,
        name: &str,
        description: &str,
        priority: i64,
        tier: EpicTier,
    ) -> YokeResult<Epic> {
        let _guard = self.acquire_project_lock(project_id).await;
        let (next_id,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(epic_id), 0) + 1 FROM epics WHERE project_id = ?1")
                .bind(project_id.to_string())
                .fetch_one(self.pool())
                .await?;

        let epic = Epic {
            project_id,
            epic_id: next_id,
            name: name.to_string(),
            description: description.to_string(),
            priority,
            status: EpicStatus::Pending,
            tier,
            completed_at: None,
        };
        sqlx::query(
            "INSERT INTO epics (project_id, epic_id, name, description, priority, status, tier)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(project_id.to_string())
        .bind(epic.epic_id)
        .bind(&epic.name)
        .bind(&epic.description)
        .bind(epic.priority)
        .bind(epic.status.as_str())
        .bind(epic.tier.as_str())
        .execute(self.pool())
        .await?;
        Ok(epic)
    }

    pub async fn get_epic(&self, project_id: Uuid, epic_id: i64) -> YokeResult<Epic> {
        let row = sqlx::query("SELECT * FROM epics WHERE project_id = ?1 AND epic_id = ?2")
            .bind(project_id.to_string())
            .bind(epic_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref()
            .map(epic_from_row)
            .transpose()?
            .ok_or_else(|| YokeError::not_found("epic", epic_id))
    }

    pub async fn list_epics(&self, project_id: Uuid) -> YokeResult<Vec<Epic>> {
        let rows =
            sqlx::query("SELECT * FROM epics WHERE project_id = ?1 ORDER BY priority, epic_id")
                .bind(project_id.to_string())
                .fetch_all(self.pool())
                .await?;
        rows.iter().map(epic_from_row).collect()
    }

    /// Forward-only status transition; reopening goes through
    /// [`Store::reopen_epic`].
    pub async fn update_epic_status(
        &self,
        project_id: Uuid,
        epic_id: i64,
        status: EpicStatus,
    ) -> YokeResult<()> {
        let current = self.get_epic(project_id, epic_id).await?;
        let forward = matches!(
            (current.status, status),
            (EpicStatus::Pending, EpicStatus::InProgress)
                | (EpicStatus::Pending, EpicStatus::Blocked)
                | (EpicStatus::InProgress, EpicStatus::Completed)
                | (EpicStatus::InProgress, EpicStatus::Blocked)
                | (EpicStatus::Blocked, EpicStatus::InProgress)
                | (EpicStatus::Blocked, EpicStatus::Pending)
        ) || current.status == status;
        if !forward {
            return Err(YokeError::Conflict(format!(
                "epic {} cannot move {} -> {}",
                epic_id,
                current.status.as_str(),
                status.as_str()
            )));
        }
        let completed_at = (status == EpicStatus::Completed).then(Utc::now);
        sqlx::query(
            "UPDATE epics SET status = ?1, completed_at = COALESCE(?2, completed_at)
             WHERE project_id = ?3 AND epic_id = ?4",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(project_id.to_string())
        .bind(epic_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Intervention path: a completed epic whose retest regressed goes back
    /// to in_progress.
    pub async fn reopen_epic(&self, project_id: Uuid, epic_id: i64) -> YokeResult<()> {
        let current = self.get_epic(project_id, epic_id).await?;
        if current.status != EpicStatus::Completed {
            return Err(YokeError::Conflict(format!(
                "epic {} is {}, only completed epics can be reopened",
                epic_id,
                current.status.as_str()
            )));
        }
        sqlx::query(
            "UPDATE epics SET status = 'in_progress', completed_at = NULL
             WHERE project_id = ?1 AND epic_id = ?2",
        )
        .bind(project_id.to_string())
        .bind(epic_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────

    pub async fn create_task(
        &self,
        project_id: Uuid,
        epic_id: i64,
        description: &str,
        action: Option<&str>,
        priority: i64,
        metadata: TaskMetadata,
    ) -> YokeResult<Task> {
        self.get_epic(project_id, epic_id).await?;

        let _guard = self.acquire_project_lock(project_id).await;
        let (next_id,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(task_id), 0) + 1 FROM tasks WHERE project_id = ?1")
                .bind(project_id.to_string())
                .fetch_one(self.pool())
                .await?;

        let task = Task {
            project_id,
            epic_id,
            task_id: next_id,
            description: description.to_string(),
            action: action.map(str::to_string),
            priority,
            done: false,
            started_at: None,
            completed_at: None,
            metadata,
        };
        sqlx::query(
            "INSERT INTO tasks (project_id, task_id, epic_id, description, action, priority, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(project_id.to_string())
        .bind(task.task_id)
        .bind(task.epic_id)
        .bind(&task.description)
        .bind(task.action.as_deref())
        .bind(task.priority)
        .bind(serde_json::to_string(&task.metadata)?)
        .execute(self.pool())
        .await?;
        Ok(task)
    }

    pub async fn get_task(&self, project_id: Uuid, task_id: i64) -> YokeResult<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE project_id = ?1 AND task_id = ?2")
            .bind(project_id.to_string())
            .bind(task_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref()
            .map(task_from_row)
            .transpose()?
            .ok_or_else(|| YokeError::not_found("task", task_id))
    }

    pub async fn list_tasks(
        &self,
        project_id: Uuid,
        epic_id: Option<i64>,
        only_pending: bool,
    ) -> YokeResult<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM tasks WHERE project_id = ?1");
        if epic_id.is_some() {
            sql.push_str(" AND epic_id = ?2");
        }
        if only_pending {
            sql.push_str(" AND done = 0");
        }
        sql.push_str(" ORDER BY priority, task_id");

        let mut query = sqlx::query(&sql).bind(project_id.to_string());
        if let Some(epic_id) = epic_id {
            query = query.bind(epic_id);
        }
        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(task_from_row).collect()
    }

    /// Lowest (epic.priority, task.priority) pending task of a pending or
    /// in-progress epic.
    pub async fn next_task(&self, project_id: Uuid) -> YokeResult<Option<Task>> {
        let policy = self.retry_policy().clone();
        policy
            .execute(|| async {
                let row = sqlx::query(
                    "SELECT t.* FROM tasks t
                     JOIN epics e ON e.project_id = t.project_id AND e.epic_id = t.epic_id
                     WHERE t.project_id = ?1 AND t.done = 0
                       AND e.status IN ('pending', 'in_progress')
                     ORDER BY e.priority, t.priority, t.task_id
                     LIMIT 1",
                )
                .bind(project_id.to_string())
                .fetch_optional(self.pool())
                .await?;
                row.as_ref().map(task_from_row).transpose()
            })
            .await
    }

    /// Mark a task started; the owning epic moves to in_progress.
    /// Refuses when another active session already started it.
    pub async fn start_task(&self, project_id: Uuid, task_id: i64) -> YokeResult<Task> {
        let task = self.get_task(project_id, task_id).await?;
        if task.done {
            return Err(YokeError::Conflict(format!("task {} is already done", task_id)));
        }
        if task.started_at.is_some() {
            return Err(YokeError::Conflict(format!(
                "task {} was already started",
                task_id
            )));
        }

        let mut txn = self.begin().await?;
        sqlx::query("UPDATE tasks SET started_at = ?1 WHERE project_id = ?2 AND task_id = ?3")
            .bind(Utc::now())
            .bind(project_id.to_string())
            .bind(task_id)
            .execute(&mut *txn)
            .await?;
        sqlx::query(
            "UPDATE epics SET status = 'in_progress'
             WHERE project_id = ?1 AND epic_id = ?2 AND status = 'pending'",
        )
        .bind(project_id.to_string())
        .bind(task.epic_id)
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;

        self.get_task(project_id, task_id).await
    }

    /// Mark a task done inside one transaction, validating the completion
    /// rules first: every owned test resolved and passing, or no tests at
    /// all when the project allows untested tasks. Raises `QualityViolation`
    /// before anything is written.
    pub async fn complete_task(
        &self,
        project_id: Uuid,
        task_id: i64,
        allow_untested: bool,
    ) -> YokeResult<Task> {
        let task = self.get_task(project_id, task_id).await?;
        if task.done {
            return Ok(task);
        }

        let tests = self.list_tests_for_task(project_id, task_id).await?;
        if tests.is_empty() && !allow_untested {
            return Err(YokeError::QualityViolation(format!(
                "task {} has no tests; completion requires at least one verified test",
                task_id
            )));
        }
        for test in &tests {
            match test.passed {
                None => {
                    return Err(YokeError::QualityViolation(format!(
                        "test {} of task {} has no recorded result",
                        test.test_id, task_id
                    )));
                }
                Some(false) => {
                    return Err(YokeError::QualityViolation(format!(
                        "test {} of task {} is failing",
                        test.test_id, task_id
                    )));
                }
                Some(true) => {}
            }
        }

        let mut txn = self.begin().await?;
        sqlx::query(
            "UPDATE tasks SET done = 1, completed_at = ?1 WHERE project_id = ?2 AND task_id = ?3",
        )
        .bind(Utc::now())
        .bind(project_id.to_string())
        .bind(task_id)
        .execute(&mut *txn)
        .await?;
        txn.commit().await?;

        self.get_task(project_id, task_id).await
    }

    /// Promote an epic to completed when all child tasks are done and its
    /// tests pass under the configured gating mode.
    pub async fn refresh_epic_status(
        &self,
        project_id: Uuid,
        epic_id: i64,
        config: &EpicTestingConfig,
    ) -> YokeResult<EpicStatus> {
        let epic = self.get_epic(project_id, epic_id).await?;
        if epic.status == EpicStatus::Completed {
            return Ok(EpicStatus::Completed);
        }

        let pending_tasks: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND epic_id = ?2 AND done = 0",
        )
        .bind(project_id.to_string())
        .bind(epic_id)
        .fetch_one(self.pool())
        .await?;
        if pending_tasks.0 > 0 {
            return Ok(epic.status);
        }

        let epic_tests = self.list_tests_for_epic(project_id, epic_id).await?;
        let failing = epic_tests
            .iter()
            .filter(|t| t.is_epic_level() && t.passed != Some(true))
            .count() as u32;

        let critical = config
            .critical_epics
            .iter()
            .any(|needle| epic.name.contains(needle.as_str()));
        let gate_ok = match config.mode {
            EpicTestingMode::Strict => failing == 0,
            EpicTestingMode::Autonomous => {
                failing == 0 || (!critical && failing <= config.auto_failure_tolerance)
            }
        };
        if !gate_ok {
            return Ok(epic.status);
        }

        self.update_epic_status(project_id, epic_id, EpicStatus::Completed)
            .await?;
        Ok(EpicStatus::Completed)
    }

    // ── Tests ─────────────────────────────────────────────────────

    pub async fn create_test(
        &self,
        project_id: Uuid,
        epic_id: i64,
        task_id: Option<i64>,
        category: TestCategory,
        description: &str,
        requirements: &str,
    ) -> YokeResult<Test> {
        self.get_epic(project_id, epic_id).await?;
        if let Some(task_id) = task_id {
            self.get_task(project_id, task_id).await?;
        }

        let _guard = self.acquire_project_lock(project_id).await;
        let (next_id,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(test_id), 0) + 1 FROM tests WHERE project_id = ?1")
                .bind(project_id.to_string())
                .fetch_one(self.pool())
                .await?;

        let test = Test {
            project_id,
            test_id: next_id,
            epic_id,
            task_id,
            category,
            description: description.to_string(),
            requirements: requirements.to_string(),
            passed: None,
            last_error: None,
            execution_time_ms: None,
            retry_count: 0,
            verification_notes: None,
        };
        sqlx::query(
            "INSERT INTO tests (project_id, test_id, epic_id, task_id, category, description, requirements)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(project_id.to_string())
        .bind(test.test_id)
        .bind(test.epic_id)
        .bind(test.task_id)
        .bind(test.category.as_str())
        .bind(&test.description)
        .bind(&test.requirements)
        .execute(self.pool())
        .await?;
        Ok(test)
    }

    pub async fn get_test(&self, project_id: Uuid, test_id: i64) -> YokeResult<Test> {
        let row = sqlx::query("SELECT * FROM tests WHERE project_id = ?1 AND test_id = ?2")
            .bind(project_id.to_string())
            .bind(test_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref()
            .map(test_from_row)
            .transpose()?
            .ok_or_else(|| YokeError::not_found("test", test_id))
    }

    pub async fn list_tests_for_task(
        &self,
        project_id: Uuid,
        task_id: i64,
    ) -> YokeResult<Vec<Test>> {
        let rows = sqlx::query(
            "SELECT * FROM tests WHERE project_id = ?1 AND task_id = ?2 ORDER BY test_id",
        )
        .bind(project_id.to_string())
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(test_from_row).collect()
    }

    pub async fn list_tests_for_epic(
        &self,
        project_id: Uuid,
        epic_id: i64,
    ) -> YokeResult<Vec<Test>> {
        let rows = sqlx::query(
            "SELECT * FROM tests WHERE project_id = ?1 AND epic_id = ?2 ORDER BY test_id",
        )
        .bind(project_id.to_string())
        .bind(epic_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(test_from_row).collect()
    }

    /// Record a test result. Pass results require verification notes, fail
    /// results require an error message, and every failure bumps
    /// retry_count inside the same statement.
    pub async fn update_test_result(
        &self,
        project_id: Uuid,
        test_id: i64,
        passed: bool,
        error: Option<&str>,
        execution_time_ms: Option<i64>,
        verification_notes: Option<&str>,
    ) -> YokeResult<Test> {
        self.get_test(project_id, test_id).await?;
        if passed && verification_notes.map_or(true, str::is_empty) {
            return Err(YokeError::Validation(format!(
                "passing result for test {} requires verification_notes",
                test_id
            )));
        }
        if !passed && error.map_or(true, str::is_empty) {
            return Err(YokeError::Validation(format!(
                "failing result for test {} requires an error message",
                test_id
            )));
        }

        sqlx::query(
            "UPDATE tests SET
                passed = ?1,
                last_error = CASE WHEN ?1 = 0 THEN ?2 ELSE last_error END,
                execution_time_ms = COALESCE(?3, execution_time_ms),
                verification_notes = COALESCE(?4, verification_notes),
                retry_count = retry_count + CASE WHEN ?1 = 0 THEN 1 ELSE 0 END
             WHERE project_id = ?5 AND test_id = ?6",
        )
        .bind(passed)
        .bind(error)
        .bind(execution_time_ms)
        .bind(verification_notes)
        .bind(project_id.to_string())
        .bind(test_id)
        .execute(self.pool())
        .await?;

        self.get_test(project_id, test_id).await
    }
}
