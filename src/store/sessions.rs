//! Session rows, checkpoints, paused-session records, and the intervention
//! audit trail.
//!
//! Session creation runs under the project lock: the running-session check
//! and the session-number allocation must observe a stable view, which is
//! what gives invariants 1 and 2 (at most one running session, strictly
//! increasing numbers).

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::errors::{YokeError, YokeResult};
use crate::metrics::MetricsSummary;

use super::models::*;
use super::{Store, bad_row, row_json, row_json_opt, row_uuid, row_uuid_opt};

fn session_from_row(row: &SqliteRow) -> YokeResult<Session> {
    let session_type: String = row.try_get("session_type")?;
    let status: String = row.try_get("status")?;
    Ok(Session {
        id: row_uuid(row, "id")?,
        project_id: row_uuid(row, "project_id")?,
        session_number: row.try_get("session_number")?,
        session_type: SessionType::from_str(&session_type).map_err(|e| bad_row("session", e))?,
        status: SessionStatus::from_str(&status).map_err(|e| bad_row("session", e))?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        model: row.try_get("model")?,
        metrics: row_json_opt(row, "metrics")?,
        parent_session_id: row_uuid_opt(row, "parent_session_id")?,
    })
}

fn checkpoint_from_row(row: &SqliteRow) -> YokeResult<Checkpoint> {
    let checkpoint_type: String = row.try_get("checkpoint_type")?;
    Ok(Checkpoint {
        id: row.try_get("id")?,
        session_id: row_uuid(row, "session_id")?,
        checkpoint_type: CheckpointType::from_str(&checkpoint_type)
            .map_err(|e| bad_row("checkpoint", e))?,
        conversation_history: row.try_get("conversation_history")?,
        last_task_id: row.try_get("last_task_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn paused_from_row(row: &SqliteRow) -> YokeResult<PausedSession> {
    let pause_type: String = row.try_get("pause_type")?;
    Ok(PausedSession {
        id: row.try_get("id")?,
        session_id: row_uuid(row, "session_id")?,
        pause_reason: row.try_get("pause_reason")?,
        pause_type: PauseType::from_str(&pause_type).map_err(|e| bad_row("paused_session", e))?,
        blocker_info: row_json(row, "blocker_info")?,
        retry_stats: row_json(row, "retry_stats")?,
        resolved: row.try_get::<i64, _>("resolved")? != 0,
        resolved_at: row.try_get("resolved_at")?,
        resolution_notes: row.try_get("resolution_notes")?,
        can_auto_resume: row.try_get::<i64, _>("can_auto_resume")? != 0,
    })
}

impl Store {
    /// Create a session under the project lock. Refuses while another
    /// session of the project is running and allocates the next
    /// session_number.
    pub async fn create_session(
        &self,
        project_id: Uuid,
        session_type: SessionType,
        model: &str,
        parent_session_id: Option<Uuid>,
    ) -> YokeResult<Session> {
        self.get_project(project_id).await?;
        let _guard = self.acquire_project_lock(project_id).await;

        if let Some(running) = self.running_session(project_id).await? {
            return Err(YokeError::Conflict(format!(
                "session {} is already running for this project",
                running.id
            )));
        }

        let (next_number,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(session_number), 0) + 1 FROM sessions WHERE project_id = ?1",
        )
        .bind(project_id.to_string())
        .fetch_one(self.pool())
        .await?;

        let session = Session {
            id: Uuid::new_v4(),
            project_id,
            session_number: next_number,
            session_type,
            status: SessionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            model: model.to_string(),
            metrics: None,
            parent_session_id,
        };
        sqlx::query(
            "INSERT INTO sessions (id, project_id, session_number, session_type, status, started_at, model, parent_session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(session.id.to_string())
        .bind(project_id.to_string())
        .bind(session.session_number)
        .bind(session.session_type.as_str())
        .bind(session.status.as_str())
        .bind(session.started_at)
        .bind(&session.model)
        .bind(parent_session_id.map(|s| s.to_string()))
        .execute(self.pool())
        .await?;
        Ok(session)
    }

    pub async fn get_session(&self, session_id: Uuid) -> YokeResult<Session> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(session_id.to_string())
            .fetch_optional(self.pool())
            .await?;
        row.as_ref()
            .map(session_from_row)
            .transpose()?
            .ok_or_else(|| YokeError::not_found("session", session_id))
    }

    pub async fn running_session(&self, project_id: Uuid) -> YokeResult<Option<Session>> {
        let row = sqlx::query(
            "SELECT * FROM sessions WHERE project_id = ?1 AND status = 'running' LIMIT 1",
        )
        .bind(project_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Most recent sessions first.
    pub async fn list_sessions(&self, project_id: Uuid, limit: i64) -> YokeResult<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE project_id = ?1 ORDER BY session_number DESC LIMIT ?2",
        )
        .bind(project_id.to_string())
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    pub async fn has_completed_session(
        &self,
        project_id: Uuid,
        session_type: SessionType,
    ) -> YokeResult<bool> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sessions
             WHERE project_id = ?1 AND session_type = ?2 AND status = 'completed'",
        )
        .bind(project_id.to_string())
        .bind(session_type.as_str())
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    pub async fn update_session_status(
        &self,
        session_id: Uuid,
        status: SessionStatus,
    ) -> YokeResult<()> {
        let ended_at = status.is_terminal().then(Utc::now);
        let result = sqlx::query(
            "UPDATE sessions SET status = ?1, ended_at = COALESCE(?2, ended_at) WHERE id = ?3",
        )
        .bind(status.as_str())
        .bind(ended_at)
        .bind(session_id.to_string())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(YokeError::not_found("session", session_id));
        }
        Ok(())
    }

    /// Final state transition and metrics persist atomically.
    pub async fn finalize_session(
        &self,
        session_id: Uuid,
        status: SessionStatus,
        metrics: &MetricsSummary,
    ) -> YokeResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET status = ?1, ended_at = ?2, metrics = ?3 WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(serde_json::to_string(metrics)?)
        .bind(session_id.to_string())
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(YokeError::not_found("session", session_id));
        }
        Ok(())
    }

    // ── Checkpoints ───────────────────────────────────────────────

    pub async fn write_checkpoint(
        &self,
        session_id: Uuid,
        checkpoint_type: CheckpointType,
        conversation_history: &str,
        last_task_id: Option<i64>,
    ) -> YokeResult<i64> {
        let result = sqlx::query(
            "INSERT INTO checkpoints (session_id, checkpoint_type, conversation_history, last_task_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id.to_string())
        .bind(checkpoint_type.as_str())
        .bind(conversation_history)
        .bind(last_task_id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// The most recent checkpoint is the resume point.
    pub async fn latest_checkpoint(&self, session_id: Uuid) -> YokeResult<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT * FROM checkpoints WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(session_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    // ── Paused sessions ───────────────────────────────────────────

    /// Record an intervention and flip the session to paused in one
    /// transaction. At most one unresolved record may exist per session.
    pub async fn create_paused_session(
        &self,
        session_id: Uuid,
        pause_reason: &str,
        pause_type: PauseType,
        blocker_info: &BlockerInfo,
        retry_stats: &std::collections::HashMap<String, u32>,
        can_auto_resume: bool,
    ) -> YokeResult<PausedSession> {
        if self.unresolved_pause(session_id).await?.is_some() {
            return Err(YokeError::Conflict(format!(
                "session {} already has an unresolved intervention",
                session_id
            )));
        }

        let mut txn = self.begin().await?;
        let result = sqlx::query(
            "INSERT INTO paused_sessions (session_id, pause_reason, pause_type, blocker_info, retry_stats, can_auto_resume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(session_id.to_string())
        .bind(pause_reason)
        .bind(pause_type.as_str())
        .bind(serde_json::to_string(blocker_info)?)
        .bind(serde_json::to_string(retry_stats)?)
        .bind(can_auto_resume)
        .execute(&mut *txn)
        .await?;
        sqlx::query("UPDATE sessions SET status = 'paused', ended_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(session_id.to_string())
            .execute(&mut *txn)
            .await?;
        txn.commit().await?;

        let id = result.last_insert_rowid();
        Ok(PausedSession {
            id,
            session_id,
            pause_reason: pause_reason.to_string(),
            pause_type,
            blocker_info: blocker_info.clone(),
            retry_stats: retry_stats.clone(),
            resolved: false,
            resolved_at: None,
            resolution_notes: None,
            can_auto_resume,
        })
    }

    pub async fn unresolved_pause(&self, session_id: Uuid) -> YokeResult<Option<PausedSession>> {
        let row = sqlx::query(
            "SELECT * FROM paused_sessions WHERE session_id = ?1 AND resolved = 0 LIMIT 1",
        )
        .bind(session_id.to_string())
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(paused_from_row).transpose()
    }

    pub async fn resolve_pause(
        &self,
        session_id: Uuid,
        resolution_notes: Option<&str>,
    ) -> YokeResult<PausedSession> {
        let pause = self
            .unresolved_pause(session_id)
            .await?
            .ok_or_else(|| {
                YokeError::Conflict(format!("session {} has no unresolved intervention", session_id))
            })?;

        sqlx::query(
            "UPDATE paused_sessions SET resolved = 1, resolved_at = ?1, resolution_notes = ?2
             WHERE id = ?3",
        )
        .bind(Utc::now())
        .bind(resolution_notes)
        .bind(pause.id)
        .execute(self.pool())
        .await?;

        let row = sqlx::query("SELECT * FROM paused_sessions WHERE id = ?1")
            .bind(pause.id)
            .fetch_one(self.pool())
            .await?;
        paused_from_row(&row)
    }

    /// Interventions across a project (or all projects), newest first.
    pub async fn list_interventions(
        &self,
        project_id: Option<Uuid>,
        unresolved_only: bool,
    ) -> YokeResult<Vec<PausedSession>> {
        let mut sql = String::from(
            "SELECT p.* FROM paused_sessions p JOIN sessions s ON s.id = p.session_id WHERE 1=1",
        );
        if project_id.is_some() {
            sql.push_str(" AND s.project_id = ?1");
        }
        if unresolved_only {
            sql.push_str(" AND p.resolved = 0");
        }
        sql.push_str(" ORDER BY p.id DESC");

        let mut query = sqlx::query(&sql);
        if let Some(project_id) = project_id {
            query = query.bind(project_id.to_string());
        }
        let rows = query.fetch_all(self.pool()).await?;
        rows.iter().map(paused_from_row).collect()
    }

    pub async fn record_intervention_action(
        &self,
        session_id: Uuid,
        action: &str,
        command: &str,
        succeeded: bool,
        output_snippet: &str,
    ) -> YokeResult<()> {
        sqlx::query(
            "INSERT INTO intervention_actions (session_id, action, command, succeeded, output_snippet, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(session_id.to_string())
        .bind(action)
        .bind(command)
        .bind(succeeded)
        .bind(output_snippet)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
