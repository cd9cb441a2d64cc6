//! End-to-end tests: a goal plan driven through the orchestrator, the worker
//! pool and the HTTP surface against a real in-memory store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

use ai_orchestrator::admin::Admin;
use ai_orchestrator::api::{ApiState, api_routes};
use ai_orchestrator::config::{HealthThresholds, OrchestratorConfig, WorkerConfig};
use ai_orchestrator::error::LlmError;
use ai_orchestrator::graph::{GoalPlan, GoalStatus, TaskStatus};
use ai_orchestrator::llm::ChatRequest;
use ai_orchestrator::orchestrator::Orchestrator;
use ai_orchestrator::safety::SafetyLayer;
use ai_orchestrator::store::{Database, EventKind, LibSqlBackend};
use ai_orchestrator::testing::{ScriptedLlm, ScriptedReply, memory_store};
use ai_orchestrator::tools::{FallbackBackend, LocalBackend, builtin::default_registry};
use ai_orchestrator::worker::{RunnerDeps, WorkerPool};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const PLAN: &str = r#"{
    "title": "Write a report",
    "tasks": [
        { "key": "collect", "title": "Collect", "role": "researcher", "priority": 5 },
        { "key": "outline", "title": "Outline", "role": "planner" },
        { "key": "draft", "title": "Draft", "role": "writer", "depends_on": ["collect", "outline"] },
        { "key": "review", "title": "Review", "role": "reviewer", "depends_on": ["draft"] }
    ]
}"#;

/// Title of the task a request belongs to, taken from the system prompt.
fn task_title(request: &ChatRequest) -> String {
    request
        .messages
        .first()
        .and_then(|m| m.content.rsplit("Task: ").next())
        .unwrap_or_default()
        .to_string()
}

struct Harness {
    store: Arc<LibSqlBackend>,
    pool: Arc<WorkerPool>,
    orchestrator: Arc<Orchestrator>,
    _workdir: tempfile::TempDir,
}

fn harness(store: Arc<LibSqlBackend>, llm: Arc<ScriptedLlm>, max_workers: usize) -> Harness {
    let workdir = tempfile::tempdir().unwrap();
    let worker = WorkerConfig {
        working_dir: workdir.path().to_path_buf(),
        ..WorkerConfig::default()
    };
    let local = Arc::new(LocalBackend::new(workdir.path(), worker.max_output_bytes));
    let backend = Arc::new(FallbackBackend::new(None, local));
    let deps = RunnerDeps {
        store: store.clone(),
        llm,
        tools: Arc::new(default_registry(backend, &worker)),
        safety: Arc::new(SafetyLayer::standard(worker.max_output_bytes).unwrap()),
        config: worker,
    };
    let pool = Arc::new(WorkerPool::new(deps, max_workers));
    let config = OrchestratorConfig {
        tick_interval: Duration::from_millis(20),
        max_workers,
        ..OrchestratorConfig::default()
    };
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), pool.clone(), config));
    Harness {
        store,
        pool,
        orchestrator,
        _workdir: workdir,
    }
}

/// Tick until the goal settles, letting every spawned runner finish in between.
async fn run_until_settled(h: &Harness, goal_id: uuid::Uuid) -> GoalStatus {
    loop {
        h.orchestrator.tick().await;
        while h.pool.active_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let goal = h.store.get_goal(goal_id).await.unwrap().unwrap();
        if goal.status != GoalStatus::Active {
            return goal.status;
        }
    }
}

#[tokio::test]
async fn plan_runs_to_completion_in_dependency_order() {
    let store = memory_store().await;
    let llm = Arc::new(ScriptedLlm::always(|req| {
        let title = task_title(req);
        ScriptedReply::done(format!("{title} finished"))
    }));
    let h = harness(store.clone(), llm, 2);

    let (goal, tasks) = GoalPlan::from_json(PLAN).unwrap().build().unwrap();
    store.insert_plan(&goal, &tasks).await.unwrap();

    let status = timeout(TEST_TIMEOUT, run_until_settled(&h, goal.id))
        .await
        .expect("goal did not settle");
    assert_eq!(status, GoalStatus::Completed);

    let stored = store.list_tasks_for_goal(goal.id).await.unwrap();
    let by_title = |t: &str| stored.iter().find(|s| s.title == t).unwrap().clone();
    for task in &stored {
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.unwrap() >= task.started_at.unwrap());
        assert!(task.actual_cost > rust_decimal::Decimal::ZERO);
    }

    let draft = by_title("Draft");
    for dep in ["Collect", "Outline"] {
        assert!(by_title(dep).completed_at.unwrap() <= draft.started_at.unwrap());
    }
    assert!(draft.completed_at.unwrap() <= by_title("Review").started_at.unwrap());
    assert_eq!(
        draft.result.as_ref().map(|r| r.output.as_str()),
        Some("Draft finished")
    );

    let events = store.list_events_for_task(draft.id, 50).await.unwrap();
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds.first(), Some(&EventKind::Assigned));
    assert_eq!(kinds.last(), Some(&EventKind::Completed));
}

#[tokio::test]
async fn dependency_outputs_reach_dependents() {
    let store = memory_store().await;
    let llm = Arc::new(ScriptedLlm::always(|req| {
        ScriptedReply::done(format!("{} finished", task_title(req)))
    }));
    let h = harness(store.clone(), llm.clone(), 1);

    let (goal, tasks) = GoalPlan::from_json(PLAN).unwrap().build().unwrap();
    store.insert_plan(&goal, &tasks).await.unwrap();
    timeout(TEST_TIMEOUT, run_until_settled(&h, goal.id))
        .await
        .expect("goal did not settle");

    let draft_request = llm
        .requests()
        .into_iter()
        .find(|r| task_title(r) == "Draft")
        .unwrap();
    let brief = &draft_request.messages[1].content;
    assert!(brief.contains("### Collect\nCollect finished"));
    assert!(brief.contains("### Outline\nOutline finished"));

    // With one worker the higher-priority root goes first.
    let stored = store.list_tasks_for_goal(goal.id).await.unwrap();
    let collect = stored.iter().find(|t| t.title == "Collect").unwrap();
    let outline = stored.iter().find(|t| t.title == "Outline").unwrap();
    assert!(collect.completed_at.unwrap() <= outline.started_at.unwrap());
}

#[tokio::test]
async fn permanent_failure_blocks_dependents_and_fails_goal() {
    let store = memory_store().await;
    let llm = Arc::new(ScriptedLlm::always(|req| {
        if task_title(req) == "Collect" {
            ScriptedReply::Error(LlmError::AuthFailed {
                provider: "scripted".to_string(),
            })
        } else {
            ScriptedReply::done("ok")
        }
    }));
    let h = harness(store.clone(), llm, 2);

    let (goal, tasks) = GoalPlan::from_json(PLAN).unwrap().build().unwrap();
    store.insert_plan(&goal, &tasks).await.unwrap();

    let status = timeout(TEST_TIMEOUT, run_until_settled(&h, goal.id))
        .await
        .expect("goal did not settle");
    assert_eq!(status, GoalStatus::Failed);

    let stored = store.list_tasks_for_goal(goal.id).await.unwrap();
    let get = |t: &str| stored.iter().find(|s| s.title == t).unwrap();
    let collect = get("Collect");
    assert_eq!(collect.status, TaskStatus::Failed);
    assert!(collect.failure_reason.is_some());
    assert_eq!(get("Outline").status, TaskStatus::Completed);
    for blocked in ["Draft", "Review"] {
        assert_eq!(get(blocked).status, TaskStatus::Blocked);
        assert_eq!(get(blocked).blocked_by, Some(collect.id));
        assert!(get(blocked).started_at.is_none());
    }
}

#[tokio::test]
async fn background_loop_drives_goal_and_stops_on_shutdown() {
    let store = memory_store().await;
    let llm = Arc::new(ScriptedLlm::always(|_| ScriptedReply::done("ok")));
    let h = harness(store.clone(), llm, 2);
    let (goal, tasks) = GoalPlan::from_json(PLAN).unwrap().build().unwrap();
    store.insert_plan(&goal, &tasks).await.unwrap();

    let (stop, stop_rx) = watch::channel(false);
    let handle = Arc::clone(&h.orchestrator).spawn(stop_rx);

    timeout(TEST_TIMEOUT, async {
        loop {
            let g = store.get_goal(goal.id).await.unwrap().unwrap();
            if g.status == GoalStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("background loop did not complete the goal");

    stop.send(true).unwrap();
    timeout(TEST_TIMEOUT, handle)
        .await
        .expect("loop did not stop")
        .unwrap();
    assert_eq!(h.pool.shutdown(Duration::from_secs(1)).await, 0);
}

/// Start the API on a random port and return its base URL.
async fn serve(store: Arc<LibSqlBackend>, token: &str) -> String {
    let (_cycle_tx, cycle) = watch::channel(false);
    let app = api_routes(ApiState {
        store: store.clone(),
        admin: Arc::new(Admin::new(store)),
        thresholds: HealthThresholds::default(),
        cycle,
        admin_token: Some(token.to_string().into()),
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn http_surface_reports_and_intervenes() {
    let store = memory_store().await;
    let (goal, tasks) = GoalPlan::from_json(PLAN).unwrap().build().unwrap();
    store.insert_plan(&goal, &tasks).await.unwrap();
    let collect = tasks.iter().find(|t| t.title == "Collect").unwrap().clone();
    let draft = tasks.iter().find(|t| t.title == "Draft").unwrap().clone();

    let base = serve(store.clone(), "tok").await;
    let client = reqwest::Client::new();

    let diag: Value = client
        .get(format!("{base}/api/diagnostics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(diag["tasks"].as_array().unwrap().len(), 4);
    assert_eq!(diag["goals"][0]["status"], "ok");
    assert_eq!(diag["goals"][0]["counts"]["pending"], 4);

    let resp = client
        .post(format!("{base}/api/tasks/{}/fail", collect.id))
        .bearer_auth("tok")
        .json(&serde_json::json!({ "reason": "source unavailable" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["task"]["status"], "failed");
    assert_eq!(body["blocked"].as_array().unwrap().len(), 2);

    let resp = client
        .post(format!("{base}/api/tasks/{}/requeue", draft.id))
        .bearer_auth("tok")
        .json(&serde_json::json!({ "reason": "try again" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

    let events: Value = client
        .get(format!("{base}/api/tasks/{}/events", collect.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(events[0]["kind"], "admin");
    assert_eq!(events[0]["message"], "force_fail: source unavailable");

    // Outline can still run, so the goal stays open.
    let g = store.get_goal(goal.id).await.unwrap().unwrap();
    assert_eq!(g.status, GoalStatus::Active);
}
