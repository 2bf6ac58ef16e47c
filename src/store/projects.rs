//! Project CRUD, progress aggregation, and progress notes.

use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::errors::{YokeError, YokeResult};

use super::models::*;
use super::{Store, bad_row, row_json, row_uuid, row_uuid_opt};

fn project_from_row(row: &SqliteRow) -> YokeResult<Project> {
    let status: String = row.try_get("status")?;
    let project_type: String = row.try_get("project_type")?;
    Ok(Project {
        id: row_uuid(row, "id")?,
        name: row.try_get("name")?,
        source_spec: row.try_get("source_spec")?,
        status: ProjectStatus::from_str(&status).map_err(|e| bad_row("project", e))?,
        project_type: ProjectType::from_str(&project_type).map_err(|e| bad_row("project", e))?,
        settings: row_json(row, "settings")?,
        created_at: row.try_get("created_at")?,
    })
}

fn note_from_row(row: &SqliteRow) -> YokeResult<ProgressNote> {
    let kind: String = row.try_get("kind")?;
    Ok(ProgressNote {
        id: row.try_get("id")?,
        project_id: row_uuid(row, "project_id")?,
        session_id: row_uuid_opt(row, "session_id")?,
        kind: NoteKind::from_str(&kind).map_err(|e| bad_row("progress_note", e))?,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
    })
}

impl Store {
    /// Create a project. Fails with `Conflict` on a duplicate name and
    /// `Validation` when the name does not match the accepted pattern.
    pub async fn create_project(
        &self,
        name: &str,
        source_spec: &str,
        project_type: ProjectType,
        settings: serde_json::Map<String, serde_json::Value>,
    ) -> YokeResult<Project> {
        validate_project_name(name)?;

        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            source_spec: source_spec.to_string(),
            status: ProjectStatus::Active,
            project_type,
            settings,
            created_at: Utc::now(),
        };

        let result = sqlx::query(
            "INSERT INTO projects (id, name, source_spec, status, project_type, settings, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(project.id.to_string())
        .bind(&project.name)
        .bind(&project.source_spec)
        .bind(project.status.as_str())
        .bind(project.project_type.as_str())
        .bind(serde_json::to_string(&project.settings)?)
        .bind(project.created_at)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(project),
            Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => Err(
                YokeError::Conflict(format!("project name {:?} already exists", name)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_project(&self, project_id: Uuid) -> YokeResult<Project> {
        let policy = self.retry_policy().clone();
        policy
            .execute(|| async {
                let row = sqlx::query("SELECT * FROM projects WHERE id = ?1")
                    .bind(project_id.to_string())
                    .fetch_optional(self.pool())
                    .await?;
                row.as_ref()
                    .map(project_from_row)
                    .transpose()?
                    .ok_or_else(|| YokeError::not_found("project", project_id))
            })
            .await
    }

    pub async fn get_project_by_name(&self, name: &str) -> YokeResult<Project> {
        let row = sqlx::query("SELECT * FROM projects WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref()
            .map(project_from_row)
            .transpose()?
            .ok_or_else(|| YokeError::not_found("project", name))
    }

    pub async fn list_projects(&self) -> YokeResult<Vec<Project>> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(project_from_row).collect()
    }

    pub async fn update_project_status(
        &self,
        project_id: Uuid,
        status: ProjectStatus,
    ) -> YokeResult<()> {
        let result = sqlx::query("UPDATE projects SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(project_id.to_string())
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(YokeError::not_found("project", project_id));
        }
        Ok(())
    }

    pub async fn update_project_settings(
        &self,
        project_id: Uuid,
        settings: &serde_json::Map<String, serde_json::Value>,
    ) -> YokeResult<()> {
        let result = sqlx::query("UPDATE projects SET settings = ?1 WHERE id = ?2")
            .bind(serde_json::to_string(settings)?)
            .bind(project_id.to_string())
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(YokeError::not_found("project", project_id));
        }
        Ok(())
    }

    /// Delete a project; epics, tasks, tests, and sessions cascade.
    pub async fn delete_project(&self, project_id: Uuid) -> YokeResult<()> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ?1")
            .bind(project_id.to_string())
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(YokeError::not_found("project", project_id));
        }
        Ok(())
    }

    /// Completion accounting across epics, tasks, and tests.
    pub async fn progress(&self, project_id: Uuid) -> YokeResult<Progress> {
        // Verify existence first so a missing project is not an empty report.
        self.get_project(project_id).await?;

        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM epics WHERE project_id = ?1) AS total_epics,
                (SELECT COUNT(*) FROM epics WHERE project_id = ?1 AND status = 'completed') AS completed_epics,
                (SELECT COUNT(*) FROM tasks WHERE project_id = ?1) AS total_tasks,
                (SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND done = 1) AS completed_tasks,
                (SELECT COUNT(*) FROM tests WHERE project_id = ?1) AS total_tests,
                (SELECT COUNT(*) FROM tests WHERE project_id = ?1 AND passed = 1) AS passing_tests",
        )
        .bind(project_id.to_string())
        .fetch_one(self.pool())
        .await?;

        Ok(Progress {
            total_epics: row.try_get("total_epics")?,
            completed_epics: row.try_get("completed_epics")?,
            total_tasks: row.try_get("total_tasks")?,
            completed_tasks: row.try_get("completed_tasks")?,
            total_tests: row.try_get("total_tests")?,
            passing_tests: row.try_get("passing_tests")?,
        })
    }

    pub async fn append_progress_note(
        &self,
        project_id: Uuid,
        session_id: Option<Uuid>,
        kind: NoteKind,
        body: &str,
    ) -> YokeResult<()> {
        sqlx::query(
            "INSERT INTO progress_notes (project_id, session_id, kind, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(project_id.to_string())
        .bind(session_id.map(|s| s.to_string()))
        .bind(kind.as_str())
        .bind(body)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn list_progress_notes(&self, project_id: Uuid) -> YokeResult<Vec<ProgressNote>> {
        let rows = sqlx::query(
            "SELECT * FROM progress_notes WHERE project_id = ?1 ORDER BY created_at, id",
        )
        .bind(project_id.to_string())
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(note_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let created = store
            .create_project("todo-app", "Build a todo list", ProjectType::Greenfield, Default::default())
            .await
            .unwrap();

        let fetched = store.get_project(created.id).await.unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.name, "todo-app");
        assert_eq!(fetched.status, ProjectStatus::Active);
        assert_eq!(fetched.project_type, ProjectType::Greenfield);

        let by_name = store.get_project_by_name("todo-app").await.unwrap();
        assert_eq!(by_name.id, created.id);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let store = Store::in_memory().await.unwrap();
        store
            .create_project("dup", "spec", ProjectType::Greenfield, Default::default())
            .await
            .unwrap();
        let err = store
            .create_project("dup", "spec", ProjectType::Greenfield, Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn test_invalid_name_is_validation() {
        let store = Store::in_memory().await.unwrap();
        let err = store
            .create_project("bad name!", "spec", ProjectType::Greenfield, Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = store
            .create_project(&"x".repeat(101), "spec", ProjectType::Greenfield, Default::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_get_missing_project_not_found() {
        let store = Store::in_memory().await.unwrap();
        let err = store.get_project(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_update_status_and_settings() {
        let store = Store::in_memory().await.unwrap();
        let project = store
            .create_project("p", "spec", ProjectType::Greenfield, Default::default())
            .await
            .unwrap();

        store
            .update_project_status(project.id, ProjectStatus::Completed)
            .await
            .unwrap();
        let mut settings = serde_json::Map::new();
        settings.insert("allow_untested_tasks".into(), serde_json::Value::Bool(true));
        store
            .update_project_settings(project.id, &settings)
            .await
            .unwrap();

        let fetched = store.get_project(project.id).await.unwrap();
        assert_eq!(fetched.status, ProjectStatus::Completed);
        assert!(fetched.allow_untested_tasks());
    }

    #[tokio::test]
    async fn test_delete_project_cascades() {
        let store = Store::in_memory().await.unwrap();
        let project = store
            .create_project("p", "spec", ProjectType::Greenfield, Default::default())
            .await
            .unwrap();
        let epic = store
            .create_epic(project.id, "Core", "", 1, EpicTier::Foundation)
            .await
            .unwrap();
        store
            .create_task(project.id, epic.epic_id, "task", None, 1, TaskMetadata::default())
            .await
            .unwrap();

        store.delete_project(project.id).await.unwrap();
        assert_eq!(
            store.get_project(project.id).await.unwrap_err().kind(),
            "not_found"
        );
        let epics: Vec<(i64,)> = sqlx::query_as("SELECT epic_id FROM epics")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert!(epics.is_empty());
        let tasks: Vec<(i64,)> = sqlx::query_as("SELECT task_id FROM tasks")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_progress_counts() {
        let store = Store::in_memory().await.unwrap();
        let project = store
            .create_project("p", "spec", ProjectType::Greenfield, Default::default())
            .await
            .unwrap();
        let epic = store
            .create_epic(project.id, "Core", "", 1, EpicTier::Standard)
            .await
            .unwrap();
        let task = store
            .create_task(project.id, epic.epic_id, "do it", None, 1, TaskMetadata::default())
            .await
            .unwrap();
        store
            .create_test(
                project.id,
                epic.epic_id,
                Some(task.task_id),
                TestCategory::Unit,
                "unit test",
                "passes",
            )
            .await
            .unwrap();

        let progress = store.progress(project.id).await.unwrap();
        assert_eq!(progress.total_epics, 1);
        assert_eq!(progress.completed_epics, 0);
        assert_eq!(progress.total_tasks, 1);
        assert_eq!(progress.completed_tasks, 0);
        assert_eq!(progress.total_tests, 1);
        assert_eq!(progress.passing_tests, 0);
    }

    #[tokio::test]
    async fn test_progress_notes_append_and_list() {
        let store = Store::in_memory().await.unwrap();
        let project = store
            .create_project("p", "spec", ProjectType::Greenfield, Default::default())
            .await
            .unwrap();

        store
            .append_progress_note(project.id, None, NoteKind::Blocker, "BLOCKER: port 5432 in use")
            .await
            .unwrap();
        store
            .append_progress_note(project.id, None, NoteKind::Info, "session 1 complete")
            .await
            .unwrap();

        let notes = store.list_progress_notes(project.id).await.unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].kind, NoteKind::Blocker);
        assert!(notes[0].body.contains("5432"));
    }
}
