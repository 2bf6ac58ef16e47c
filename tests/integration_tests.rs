//! End-to-end orchestration scenarios driven through the public
//! orchestrator API with a scripted agent runner, an in-memory store, and
//! host-exec workspaces.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use yokeflow::config::{SandboxKind, YokeConfig};
use yokeflow::orchestrator::Orchestrator;
use yokeflow::orchestrator::runner::{AgentRunner, RunnerExit, RunnerHandle, RunnerRequest};
use yokeflow::store::Store;
use yokeflow::store::models::*;
use yokeflow::stream::{AgentEvent, EventSender};
use yokeflow::tools::ToolSurface;

type Script = Box<
    dyn FnOnce(RunnerRequest, Arc<ToolSurface>, EventSender) -> BoxFuture<'static, ()> + Send,
>;

/// Agent runner double: each spawned session consumes the next queued
/// script, which talks to the real tool surface.
struct ScriptedRunner {
    scripts: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn push<F, Fut>(&self, script: F)
    where
        F: FnOnce(RunnerRequest, Arc<ToolSurface>, EventSender) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Box::new(move |request, surface, events| {
                Box::pin(script(request, surface, events)) as BoxFuture<'static, ()>
            }));
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn spawn(
        &self,
        request: RunnerRequest,
        surface: Arc<ToolSurface>,
        events: EventSender,
    ) -> yokeflow::errors::YokeResult<RunnerHandle> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let script = self.scripts.lock().unwrap().pop_front();

        let (done_tx, done_rx) = oneshot::channel();
        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            let run = async {
                if let Some(script) = script {
                    script(request, surface, events.clone()).await;
                }
                events.send(AgentEvent::SessionEnd {
                    reason: "script complete".to_string(),
                });
            };
            tokio::select! {
                _ = run => {
                    let _ = done_tx.send(RunnerExit::Completed);
                }
                _ = cancel_rx.recv() => {
                    let _ = done_tx.send(RunnerExit::Completed);
                }
            }
        });
        Ok(RunnerHandle::new(done_rx, cancel_tx))
    }
}

async fn setup() -> (Orchestrator, Arc<ScriptedRunner>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = YokeConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.sandbox.kind = SandboxKind::None;
    config.timing.auto_continue_delay_seconds = 0;
    config.ensure_directories().unwrap();

    let store = Store::in_memory().await.unwrap();
    let runner = ScriptedRunner::new();
    let orchestrator = Orchestrator::new(store, config, runner.clone());
    (orchestrator, runner, dir)
}

/// Initializer script: a small roadmap of API-flavoured epics.
fn push_roadmap(runner: &ScriptedRunner, epics: usize, tasks_per_epic: usize) {
    runner.push(move |_request, surface, _events| async move {
        for e in 0..epics {
            let tier = match e {
                0 => "foundation",
                1 => "high_dependency",
                _ => "standard",
            };
            let epic = surface
                .dispatch(
                    &format!("ce{e}"),
                    "create_epic",
                    json!({
                        "name": format!("Epic {e}"),
                        "description": format!("feature area {e}"),
                        "priority": e + 1,
                        "tier": tier,
                    }),
                )
                .await
                .unwrap();
            let epic_id = epic["epic_id"].as_i64().unwrap();
            for t in 0..tasks_per_epic {
                let task = surface
                    .dispatch(
                        &format!("ct{e}-{t}"),
                        "create_task",
                        json!({
                            "epic_id": epic_id,
                            "description": format!("Add endpoint {t} of epic {e}"),
                            "priority": t + 1,
                        }),
                    )
                    .await
                    .unwrap();
                surface
                    .dispatch(
                        &format!("cx{e}-{t}"),
                        "create_test",
                        json!({
                            "epic_id": epic_id,
                            "task_id": task["task_id"],
                            "category": "api",
                            "description": "returns 200",
                            "requirements": "endpoint responds",
                        }),
                    )
                    .await
                    .unwrap();
            }
        }
        surface
            .dispatch("log", "log_session", json!({"message": "roadmap created"}))
            .await
            .unwrap();
    });
}

/// Coding script: drain the backlog, verifying every test.
fn push_backlog_drain(runner: &ScriptedRunner) {
    runner.push(|_request, surface, _events| async move {
        let mut round = 0;
        loop {
            round += 1;
            let next = surface
                .dispatch(&format!("next{round}"), "get_next_task", json!({}))
                .await
                .unwrap();
            if next.is_null() {
                break;
            }
            let task_id = next["task_id"].as_i64().unwrap();
            surface
                .dispatch(&format!("start{round}"), "start_task", json!({"task_id": task_id}))
                .await
                .unwrap();
            let tests = surface
                .dispatch(&format!("tests{round}"), "list_tests", json!({"task_id": task_id}))
                .await
                .unwrap();
            for test in tests.as_array().unwrap() {
                surface
                    .dispatch(
                        &format!("verify{round}-{}", test["test_id"]),
                        "update_task_test_result",
                        json!({
                            "test_id": test["test_id"],
                            "passed": true,
                            "execution_time_ms": 5,
                            "verification_notes": "curl verified",
                        }),
                    )
                    .await
                    .unwrap();
            }
            surface
                .dispatch(
                    &format!("done{round}"),
                    "update_task_status",
                    json!({"task_id": task_id, "done": true}),
                )
                .await
                .unwrap();
        }
    });
}

/// Retest script: pass every epic listed in the retest prompt.
fn push_passing_retests(runner: &ScriptedRunner) {
    runner.push(|request, surface, _events| async move {
        for (i, epic_id) in epic_ids_from_prompt(&request.prompt).into_iter().enumerate() {
            surface
                .dispatch(
                    &format!("retest{i}"),
                    "record_epic_retest_result",
                    json!({
                        "epic_id": epic_id,
                        "passed": true,
                        "failed_test_count": 0,
                        "total_test_count": 4,
                    }),
                )
                .await
                .unwrap();
        }
    });
}

fn epic_ids_from_prompt(prompt: &str) -> Vec<i64> {
    prompt
        .lines()
        .filter_map(|line| line.trim().strip_prefix("- epic "))
        .filter_map(|rest| rest.split_whitespace().next()?.parse().ok())
        .collect()
}

// ── S1: greenfield happy path ─────────────────────────────────────

#[tokio::test]
async fn greenfield_happy_path_builds_roadmap_and_completes() {
    let (orchestrator, runner, _dir) = setup().await;

    let project = orchestrator
        .create_project(
            "todo-app",
            "Build a todo list with add/complete/delete",
            ProjectType::Greenfield,
            Default::default(),
        )
        .await
        .unwrap();

    push_roadmap(&runner, 3, 4);
    let init_session = orchestrator.initialize(project.id).await.unwrap();
    assert_eq!(init_session.session_number, 1);
    assert_eq!(init_session.status, SessionStatus::Completed);

    let progress = orchestrator.get_progress(project.id).await.unwrap();
    assert_eq!(progress.total_epics, 3);
    assert!(progress.total_tasks >= 10);
    assert!(progress.total_tests >= 10);
    assert_eq!(progress.completed_tasks, 0);

    // A second initialize is refused.
    let err = orchestrator.initialize(project.id).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");

    // Coding drains the backlog; the follow-up retest session passes.
    push_backlog_drain(&runner);
    push_passing_retests(&runner);
    let outcome = orchestrator.start_coding(project.id).await.unwrap();

    assert_eq!(outcome.final_status, ProjectStatus::Completed);
    let progress = orchestrator.get_progress(project.id).await.unwrap();
    assert_eq!(progress.completed_tasks, progress.total_tasks);
    assert_eq!(progress.completed_epics, 3);
    assert_eq!(progress.passing_tests, progress.total_tests);

    // Session numbers are strictly increasing: 1 init, 2 coding, 3 retest.
    let sessions = orchestrator
        .store()
        .list_sessions(project.id, 10)
        .await
        .unwrap();
    let numbers: Vec<i64> = sessions.iter().map(|s| s.session_number).collect();
    assert_eq!(numbers, vec![3, 2, 1]);
    assert_eq!(sessions[0].session_type, SessionType::Retest);
    assert!(sessions.iter().all(|s| s.status == SessionStatus::Completed));
}

// ── S2: single-session task completion ────────────────────────────

#[tokio::test]
async fn single_task_completion_marks_project_done() {
    let (orchestrator, runner, _dir) = setup().await;
    let project = orchestrator
        .create_project("single", "- Add POST /todos", ProjectType::Greenfield, Default::default())
        .await
        .unwrap();

    push_roadmap(&runner, 1, 1);
    orchestrator.initialize(project.id).await.unwrap();

    push_backlog_drain(&runner);
    let outcome = orchestrator.start_coding(project.id).await.unwrap();

    assert_eq!(outcome.final_status, ProjectStatus::Completed);
    let session = outcome.last_session.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    let metrics = session.metrics.unwrap();
    assert!(metrics.quality_score >= 7, "score {}", metrics.quality_score);
    assert_eq!(metrics.tasks_completed, 1);
    assert_eq!(metrics.verification_rate, 1.0);
}

// ── S3: retry-limit pause ─────────────────────────────────────────

#[tokio::test]
async fn repeated_failing_command_pauses_session() {
    let (orchestrator, runner, _dir) = setup().await;
    let project = orchestrator
        .create_project("stuck", "- things", ProjectType::Greenfield, Default::default())
        .await
        .unwrap();

    push_roadmap(&runner, 1, 1);
    orchestrator.initialize(project.id).await.unwrap();

    runner.push(|_request, surface, events| async move {
        events.send(AgentEvent::AssistantText {
            text: "running the test suite".to_string(),
        });
        for i in 0..4 {
            let _ = surface
                .dispatch(&format!("fail{i}"), "bash", json!({"command": "false"}))
                .await;
        }
        // The engine pauses on the fourth failure; idle until terminated.
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    });

    let outcome = orchestrator.start_coding(project.id).await.unwrap();
    let session = outcome.last_session.unwrap();
    assert_eq!(session.status, SessionStatus::Paused);
    assert_eq!(outcome.sessions_run, 1);

    // The intervention record is in place with the retry stats.
    let pause = orchestrator
        .store()
        .unresolved_pause(session.id)
        .await
        .unwrap()
        .expect("unresolved pause exists");
    assert_eq!(pause.pause_type, PauseType::RetryLimit);
    assert_eq!(pause.retry_stats.get("bash:false"), Some(&4));

    // A pre-blocker checkpoint captured the conversation.
    let checkpoint = orchestrator
        .store()
        .latest_checkpoint(session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.checkpoint_type, CheckpointType::PreBlocker);
    assert!(checkpoint.conversation_history.contains("running the test suite"));

    // The project is not completed.
    let project = orchestrator.store().get_project(project.id).await.unwrap();
    assert_eq!(project.status, ProjectStatus::Active);
}

// ── S4: blocked command ───────────────────────────────────────────

#[tokio::test]
async fn blocked_command_is_rejected_and_session_continues() {
    let (orchestrator, runner, _dir) = setup().await;
    let project = orchestrator
        .create_project("blocked", "- things", ProjectType::Greenfield, Default::default())
        .await
        .unwrap();

    push_roadmap(&runner, 1, 1);
    orchestrator.initialize(project.id).await.unwrap();

    runner.push(|_request, surface, _events| async move {
        let err = surface
            .dispatch("bad", "bash", json!({"command": "sudo rm -rf /etc"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "blocked_command");

        // The session keeps going and finishes its task normally.
        let next = surface.dispatch("n", "get_next_task", json!({})).await.unwrap();
        let task_id = next["task_id"].as_i64().unwrap();
        surface
            .dispatch("s", "start_task", json!({"task_id": task_id}))
            .await
            .unwrap();
        let tests = surface
            .dispatch("t", "list_tests", json!({"task_id": task_id}))
            .await
            .unwrap();
        surface
            .dispatch(
                "v",
                "update_task_test_result",
                json!({
                    "test_id": tests[0]["test_id"],
                    "passed": true,
                    "verification_notes": "ok",
                }),
            )
            .await
            .unwrap();
        surface
            .dispatch("d", "update_task_status", json!({"task_id": task_id, "done": true}))
            .await
            .unwrap();
    });

    let outcome = orchestrator.start_coding(project.id).await.unwrap();
    let session = outcome.last_session.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let metrics = session.metrics.unwrap();
    assert_eq!(
        metrics.adherence_violations.get("wrong_bash_command"),
        Some(&1)
    );
    assert_eq!(outcome.final_status, ProjectStatus::Completed);
}

// ── S5: epic retest regression ────────────────────────────────────

#[tokio::test]
async fn epic_retest_regression_is_detected_and_reviewed() {
    let (orchestrator, runner, _dir) = setup().await;
    let project = orchestrator
        .create_project("regressing", "- things", ProjectType::Greenfield, Default::default())
        .await
        .unwrap();

    // Roadmap with one epic-level integration test on the foundation epic.
    runner.push(|_request, surface, _events| async move {
        for e in 0..3u8 {
            let tier = match e {
                0 => "foundation",
                1 => "high_dependency",
                _ => "standard",
            };
            let epic = surface
                .dispatch(
                    &format!("ce{e}"),
                    "create_epic",
                    json!({"name": format!("Epic {e}"), "priority": e + 1, "tier": tier}),
                )
                .await
                .unwrap();
            let task = surface
                .dispatch(
                    &format!("ct{e}"),
                    "create_task",
                    json!({
                        "epic_id": epic["epic_id"],
                        "description": format!("Add endpoint for epic {e}"),
                        "priority": 1,
                    }),
                )
                .await
                .unwrap();
            surface
                .dispatch(
                    &format!("cx{e}"),
                    "create_test",
                    json!({
                        "epic_id": epic["epic_id"],
                        "task_id": task["task_id"],
                        "category": "api",
                        "description": "returns 200",
                    }),
                )
                .await
                .unwrap();
        }
        // Epic-level integration test: no task_id.
        surface
            .dispatch(
                "et",
                "create_test",
                json!({
                    "epic_id": 1,
                    "category": "integration",
                    "description": "end-to-end flow works",
                    "requirements": "all endpoints cooperate",
                }),
            )
            .await
            .unwrap();
    });
    orchestrator.initialize(project.id).await.unwrap();

    // Seed a passing retest history for the foundation epic.
    let store = orchestrator.store().clone();
    let seed_session = store
        .create_session(project.id, SessionType::Retest, "m", None)
        .await
        .unwrap();
    for _ in 0..3 {
        store
            .create_epic_retest(project.id, 1, RetestTrigger::Manual, EpicTier::Foundation)
            .await
            .unwrap();
        store
            .complete_epic_retest(project.id, 1, true, 0, 5, 1.0)
            .await
            .unwrap();
    }
    store
        .update_session_status(seed_session.id, SessionStatus::Completed)
        .await
        .unwrap();

    // Coding: drain the backlog, then pass the epic-level test so the
    // foundation epic can complete.
    runner.push(|_request, surface, _events| async move {
        let mut round = 0;
        loop {
            round += 1;
            let next = surface
                .dispatch(&format!("n{round}"), "get_next_task", json!({}))
                .await
                .unwrap();
            if next.is_null() {
                break;
            }
            let task_id = next["task_id"].as_i64().unwrap();
            surface
                .dispatch(&format!("s{round}"), "start_task", json!({"task_id": task_id}))
                .await
                .unwrap();
            let tests = surface
                .dispatch(&format!("t{round}"), "list_tests", json!({"task_id": task_id}))
                .await
                .unwrap();
            for test in tests.as_array().unwrap() {
                surface
                    .dispatch(
                        &format!("v{round}-{}", test["test_id"]),
                        "update_task_test_result",
                        json!({
                            "test_id": test["test_id"],
                            "passed": true,
                            "verification_notes": "ok",
                        }),
                    )
                    .await
                    .unwrap();
            }
            surface
                .dispatch(
                    &format!("d{round}"),
                    "update_task_status",
                    json!({"task_id": task_id, "done": true}),
                )
                .await
                .unwrap();
        }

        let epic_tests = surface
            .dispatch("el", "list_tests", json!({"epic_id": 1}))
            .await
            .unwrap();
        let epic_test = epic_tests
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["task_id"].is_null())
            .unwrap()
            .clone();
        surface
            .dispatch(
                "ep",
                "update_epic_test_result",
                json!({"epic_test_id": epic_test["test_id"], "passed": true}),
            )
            .await
            .unwrap();
    });

    // Retest session: the foundation epic now fails 2 of 5 tests.
    runner.push(|request, surface, _events| async move {
        let ids = epic_ids_from_prompt(&request.prompt);
        assert!(ids.contains(&1), "foundation epic selected, got {ids:?}");

        let epic_tests = surface
            .dispatch("el", "list_tests", json!({"epic_id": 1}))
            .await
            .unwrap();
        let epic_test = epic_tests
            .as_array()
            .unwrap()
            .iter()
            .find(|t| t["task_id"].is_null())
            .unwrap()
            .clone();
        surface
            .dispatch(
                "ef",
                "update_epic_test_result",
                json!({
                    "epic_test_id": epic_test["test_id"],
                    "passed": false,
                    "error": "end-to-end flow broke after refactor",
                }),
            )
            .await
            .unwrap();

        for (i, epic_id) in ids.into_iter().enumerate() {
            let passed = epic_id != 1;
            surface
                .dispatch(
                    &format!("r{i}"),
                    "record_epic_retest_result",
                    json!({
                        "epic_id": epic_id,
                        "passed": passed,
                        "failed_test_count": if passed { 0 } else { 2 },
                        "total_test_count": 5,
                    }),
                )
                .await
                .unwrap();
        }
    });

    let outcome = orchestrator.start_coding(project.id).await.unwrap();
    assert!(outcome.sessions_run >= 2);

    // The epic-test failure was recorded, not classified as flaky.
    let failures = store.list_epic_test_failures(project.id, 1).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].was_passing_before);
    assert_ne!(failures[0].error_category, ErrorCategory::Flaky);

    let retests = store.completed_retests(project.id, 1).await.unwrap();
    let last = retests.last().unwrap();
    assert_eq!(last.passed, Some(false));
    assert!(last.regression_detected);
    assert_eq!(last.failed_test_count, 2);
    assert!(last.stability_score.unwrap() < 1.0);

    // The epic was reopened and a deep review queued for the regression.
    let epic = store.get_epic(project.id, 1).await.unwrap();
    assert_eq!(epic.status, EpicStatus::InProgress);
    let retest_session = store
        .list_sessions(project.id, 10)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.session_type == SessionType::Retest && s.id != seed_session.id)
        .unwrap();
    let reviews = store.list_deep_reviews(retest_session.id).await.unwrap();
    assert!(
        reviews
            .iter()
            .any(|r| r.trigger_reasons.contains(&"epic_retest_regression".to_string()))
    );
}

// ── S6: resume after resolution ───────────────────────────────────

#[tokio::test]
async fn resume_replays_checkpoint_and_resolution_notes() {
    let (orchestrator, runner, _dir) = setup().await;
    let project = orchestrator
        .create_project("resumable", "- things", ProjectType::Greenfield, Default::default())
        .await
        .unwrap();

    push_roadmap(&runner, 1, 1);
    orchestrator.initialize(project.id).await.unwrap();

    // A session that hits the retry limit and pauses.
    runner.push(|_request, surface, events| async move {
        events.send(AgentEvent::AssistantText {
            text: "postgres refuses connections on 5432".to_string(),
        });
        for i in 0..4 {
            let _ = surface
                .dispatch(&format!("f{i}"), "bash", json!({"command": "false"}))
                .await;
        }
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    });
    let outcome = orchestrator.start_coding(project.id).await.unwrap();
    let paused = outcome.last_session.unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);

    // Resume with resolution notes; the new session completes the task.
    push_backlog_drain(&runner);
    let notes = "Restarted postgres on 5432";
    let resumed = orchestrator
        .resume_session(paused.id, Some(notes))
        .await
        .unwrap();

    assert_eq!(resumed.session_number, paused.session_number + 1);
    assert_eq!(resumed.session_type, SessionType::Coding);
    assert_eq!(resumed.parent_session_id, Some(paused.id));
    assert_eq!(resumed.status, SessionStatus::Completed);

    // The intervention is resolved with the notes.
    let store = orchestrator.store();
    assert!(store.unresolved_pause(paused.id).await.unwrap().is_none());
    let interventions = store
        .list_interventions(Some(project.id), false)
        .await
        .unwrap();
    assert_eq!(interventions.len(), 1);
    assert!(interventions[0].resolved);
    assert_eq!(interventions[0].resolution_notes.as_deref(), Some(notes));

    // The resume prompt replays the checkpoint history and the notes
    // verbatim.
    let prompts = runner.prompts();
    let resume_prompt = prompts.last().unwrap();
    assert!(resume_prompt.contains("postgres refuses connections on 5432"));
    assert!(resume_prompt.contains(notes));

    // The backlog was finished by the resumed session.
    let progress = orchestrator.get_progress(project.id).await.unwrap();
    assert_eq!(progress.completed_tasks, progress.total_tasks);
}

// ── Control-plane edges ───────────────────────────────────────────

#[tokio::test]
async fn start_coding_requires_initialization() {
    let (orchestrator, _runner, _dir) = setup().await;
    let project = orchestrator
        .create_project("fresh", "- things", ProjectType::Greenfield, Default::default())
        .await
        .unwrap();
    let err = orchestrator.start_coding(project.id).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn delete_project_removes_all_rows() {
    let (orchestrator, runner, _dir) = setup().await;
    let project = orchestrator
        .create_project("doomed", "- things", ProjectType::Greenfield, Default::default())
        .await
        .unwrap();
    push_roadmap(&runner, 1, 2);
    orchestrator.initialize(project.id).await.unwrap();

    orchestrator.delete_project(project.id).await.unwrap();
    let err = orchestrator.get_progress(project.id).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn stop_after_current_breaks_auto_continue() {
    let (orchestrator, runner, _dir) = setup().await;
    let project = orchestrator
        .create_project("stoppable", "- things", ProjectType::Greenfield, Default::default())
        .await
        .unwrap();
    push_roadmap(&runner, 1, 2);
    orchestrator.initialize(project.id).await.unwrap();

    // The session completes one task, requests a stop mid-session, and
    // leaves the second task for later.
    let orchestrator = Arc::new(orchestrator);
    let orch_for_script = orchestrator.clone();
    let project_id = project.id;
    runner.push(move |_request, surface, _events| async move {
        let next = surface.dispatch("n", "get_next_task", json!({})).await.unwrap();
        let task_id = next["task_id"].as_i64().unwrap();
        surface
            .dispatch("s", "start_task", json!({"task_id": task_id}))
            .await
            .unwrap();
        let tests = surface
            .dispatch("t", "list_tests", json!({"task_id": task_id}))
            .await
            .unwrap();
        surface
            .dispatch(
                "v",
                "update_task_test_result",
                json!({"test_id": tests[0]["test_id"], "passed": true, "verification_notes": "ok"}),
            )
            .await
            .unwrap();
        surface
            .dispatch("d", "update_task_status", json!({"task_id": task_id, "done": true}))
            .await
            .unwrap();
        orch_for_script
            .stop_after_current(project_id)
            .await
            .unwrap();
    });

    let outcome = orchestrator.start_coding(project.id).await.unwrap();
    assert_eq!(outcome.sessions_run, 1);
    assert_eq!(outcome.final_status, ProjectStatus::Active);

    let progress = orchestrator.get_progress(project.id).await.unwrap();
    assert_eq!(progress.completed_tasks, 1);
    assert_eq!(progress.total_tasks, 2);
}

#[tokio::test]
async fn projects_drive_in_parallel() {
    let (orchestrator, runner, _dir) = setup().await;
    let orchestrator = Arc::new(orchestrator);

    let a = orchestrator
        .create_project("alpha", "- things", ProjectType::Greenfield, Default::default())
        .await
        .unwrap();
    let b = orchestrator
        .create_project("beta", "- things", ProjectType::Greenfield, Default::default())
        .await
        .unwrap();

    push_roadmap(&runner, 1, 1);
    orchestrator.initialize(a.id).await.unwrap();
    push_roadmap(&runner, 1, 1);
    orchestrator.initialize(b.id).await.unwrap();

    push_backlog_drain(&runner);
    push_backlog_drain(&runner);

    let orch_a = orchestrator.clone();
    let orch_b = orchestrator.clone();
    let (ra, rb) = tokio::join!(
        tokio::spawn(async move { orch_a.start_coding(a.id).await }),
        tokio::spawn(async move { orch_b.start_coding(b.id).await }),
    );
    let (ra, rb) = (ra.unwrap().unwrap(), rb.unwrap().unwrap());
    assert_eq!(ra.final_status, ProjectStatus::Completed);
    assert_eq!(rb.final_status, ProjectStatus::Completed);
}
