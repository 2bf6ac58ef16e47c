//! Idempotent schema batch applied at store startup.
//!
//! UUIDs are stored as hyphenated TEXT, timestamps as RFC3339 TEXT, JSON
//! payloads as TEXT. Epics, tasks, and tests use integer sequences scoped to
//! their project; allocation happens under the project lock.

pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS projects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        source_spec TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        project_type TEXT NOT NULL DEFAULT 'greenfield',
        settings TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS epics (
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        epic_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        priority INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        tier TEXT NOT NULL DEFAULT 'standard',
        completed_at TEXT,
        PRIMARY KEY (project_id, epic_id)
    );

    CREATE TABLE IF NOT EXISTS tasks (
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        task_id INTEGER NOT NULL,
        epic_id INTEGER NOT NULL,
        description TEXT NOT NULL,
        action TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        done INTEGER NOT NULL DEFAULT 0,
        started_at TEXT,
        completed_at TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (project_id, task_id)
    );

    CREATE TABLE IF NOT EXISTS tests (
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        test_id INTEGER NOT NULL,
        epic_id INTEGER NOT NULL,
        task_id INTEGER,
        category TEXT NOT NULL,
        description TEXT NOT NULL,
        requirements TEXT NOT NULL DEFAULT '',
        passed INTEGER,
        last_error TEXT,
        execution_time_ms INTEGER,
        retry_count INTEGER NOT NULL DEFAULT 0,
        verification_notes TEXT,
        PRIMARY KEY (project_id, test_id)
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        session_number INTEGER NOT NULL,
        session_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'running',
        started_at TEXT NOT NULL,
        ended_at TEXT,
        model TEXT NOT NULL DEFAULT '',
        metrics TEXT,
        parent_session_id TEXT,
        UNIQUE (project_id, session_number)
    );

    CREATE TABLE IF NOT EXISTS checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        checkpoint_type TEXT NOT NULL,
        conversation_history TEXT NOT NULL DEFAULT '',
        last_task_id INTEGER,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS paused_sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        pause_reason TEXT NOT NULL,
        pause_type TEXT NOT NULL,
        blocker_info TEXT NOT NULL DEFAULT '{}',
        retry_stats TEXT NOT NULL DEFAULT '{}',
        resolved INTEGER NOT NULL DEFAULT 0,
        resolved_at TEXT,
        resolution_notes TEXT,
        can_auto_resume INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS intervention_actions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        action TEXT NOT NULL,
        command TEXT NOT NULL,
        succeeded INTEGER NOT NULL,
        output_snippet TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS epic_test_failures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        epic_id INTEGER NOT NULL,
        epic_test_id INTEGER NOT NULL,
        session_id TEXT NOT NULL,
        failed_at TEXT NOT NULL,
        error_message TEXT NOT NULL,
        error_category TEXT NOT NULL,
        was_passing_before INTEGER NOT NULL DEFAULT 0,
        retry_count_at_failure INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS epic_retests (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        epic_id INTEGER NOT NULL,
        trigger_reason TEXT NOT NULL,
        tier TEXT NOT NULL,
        selected_at TEXT NOT NULL,
        tested_at TEXT,
        passed INTEGER,
        failed_test_count INTEGER NOT NULL DEFAULT 0,
        total_test_count INTEGER NOT NULL DEFAULT 0,
        regression_detected INTEGER NOT NULL DEFAULT 0,
        stability_score REAL
    );

    CREATE TABLE IF NOT EXISTS session_quality_checks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        quality_score INTEGER NOT NULL,
        error_count INTEGER NOT NULL,
        error_rate REAL NOT NULL,
        rating TEXT NOT NULL,
        summary TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS deep_reviews (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        trigger_reasons TEXT NOT NULL DEFAULT '[]',
        report_markdown TEXT NOT NULL DEFAULT '',
        recommendations TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS completion_reviews (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        overall_score INTEGER NOT NULL,
        coverage_percentage REAL NOT NULL,
        recommendation TEXT NOT NULL,
        requirements TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS progress_notes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
        session_id TEXT,
        kind TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_project_status ON sessions(project_id, status);
    CREATE INDEX IF NOT EXISTS idx_tasks_project_done_priority ON tasks(project_id, done, priority);
    CREATE INDEX IF NOT EXISTS idx_epic_test_failures_epic ON epic_test_failures(epic_id, failed_at);
    CREATE INDEX IF NOT EXISTS idx_epics_project_status ON epics(project_id, status);
    CREATE INDEX IF NOT EXISTS idx_epic_retests_project_epic ON epic_retests(project_id, epic_id, selected_at);
    CREATE INDEX IF NOT EXISTS idx_paused_sessions_session ON paused_sessions(session_id, resolved);
";
