//! Per-task runner: claim, then a bounded think/act/observe loop.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::context::ToolContext;
use crate::error::{LlmError, ToolError};
use crate::graph::{Task, TaskResult, TaskStatus, WorkerAddress};
use crate::llm::{ChatMessage, ChatRequest, LlmProvider, RetryPolicy, ToolCall, chat_with_retry};
use crate::safety::SafetyLayer;
use crate::store::{Database, EventKind, TaskEvent, TransitionOutcome};
use crate::tools::{ToolOutput, ToolRegistry};
use crate::worker::prompts;

/// Extra time a tool gets on top of its own limit before the runner gives up on it.
const TOOL_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Floor for the heartbeat period; `interval` rejects zero.
const MIN_HEARTBEAT: Duration = Duration::from_millis(50);

/// Shared dependencies of every runner.
#[derive(Clone)]
pub struct RunnerDeps {
    pub store: Arc<dyn Database>,
    pub llm: Arc<dyn LlmProvider>,
    pub tools: Arc<ToolRegistry>,
    pub safety: Arc<SafetyLayer>,
    pub config: WorkerConfig,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The claim failed; nothing was written.
    Abandoned,
    Completed,
    /// Failed with retry budget left; back to `pending`.
    Requeued,
    Failed,
    /// Returned to `pending` on shutdown.
    Released,
    /// Someone else owns the task now; nothing was written.
    LostOwnership,
}

/// How the loop finished, before the terminal write.
enum Finish {
    Done { output: String, cost: Decimal },
    LostOwnership,
}

/// A failure that ends the run.
struct RunFailure {
    reason: String,
    retryable: bool,
}

impl From<LlmError> for RunFailure {
    fn from(err: LlmError) -> Self {
        Self {
            retryable: err.is_transient(),
            reason: format!("inference failed: {err}"),
        }
    }
}

/// Executes one task as one worker. Lives exactly as long as the task attempt.
pub struct TaskRunner {
    task_id: Uuid,
    worker: WorkerAddress,
    deps: RunnerDeps,
    shutdown: watch::Receiver<bool>,
}

impl TaskRunner {
    pub fn new(
        task_id: Uuid,
        worker: WorkerAddress,
        deps: RunnerDeps,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task_id,
            worker,
            deps,
            shutdown,
        }
    }

    pub async fn run(self) -> RunOutcome {
        let store = self.deps.store.clone();

        match store.claim_task(self.task_id, &self.worker, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %self.task_id, worker = %self.worker, "Claim lost, abandoning task");
                return RunOutcome::Abandoned;
            }
            Err(e) => {
                warn!(task_id = %self.task_id, worker = %self.worker, error = %e, "Claim failed, abandoning task");
                return RunOutcome::Abandoned;
            }
        }

        let task = match store.get_task(self.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => return RunOutcome::Abandoned,
            Err(e) => {
                let failure = RunFailure {
                    reason: format!("could not load task after claim: {e}"),
                    retryable: true,
                };
                return self.fail(None, failure).await;
            }
        };

        info!(task_id = %task.id, worker = %self.worker, role = %task.agent_role, "Task claimed");
        self.event(&task, EventKind::Claimed, "claimed").await;

        let timeout = task.timeout;
        let mut shutdown = self.shutdown.clone();
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, self.drive(&task)) => result,
            _ = shutdown_signalled(&mut shutdown) => return self.release(&task).await,
            never = self.heartbeat() => match never {},
        };

        match result {
            Ok(Ok(Finish::Done { output, cost })) => self.complete(&task, output, cost).await,
            Ok(Ok(Finish::LostOwnership)) => {
                info!(task_id = %task.id, worker = %self.worker, "Ownership lost, stopping without writing");
                RunOutcome::LostOwnership
            }
            Ok(Err(failure)) => self.fail(Some(&task), failure).await,
            Err(_) => {
                let failure = RunFailure {
                    reason: format!("timed out after {}s", timeout.as_secs()),
                    retryable: true,
                };
                self.fail(Some(&task), failure).await
            }
        }
    }

    /// The think/act/observe loop.
    async fn drive(&self, task: &Task) -> Result<Finish, RunFailure> {
        let config = &self.deps.config;
        let ctx = ToolContext::for_task(task, &self.worker);
        let tools = self.deps.tools.tool_definitions();
        let policy = RetryPolicy {
            timeout: config.llm_timeout,
            retries: config.llm_retries,
        };
        let prices = self.deps.llm.cost_per_token(config.tier);

        let mut messages = vec![
            ChatMessage::system(prompts::system_prompt(task)),
            ChatMessage::user(prompts::task_brief(task, &self.dependency_outputs(task).await)),
        ];
        let mut cost = Decimal::ZERO;

        for turn in 1..=config.max_turns {
            if turn > 1 && (turn - 1) % config.liveness_every.max(1) == 0 && !self.still_owner().await {
                return Ok(Finish::LostOwnership);
            }

            let request = ChatRequest::new(config.tier, messages.clone()).with_tools(tools.clone());
            let response = chat_with_retry(self.deps.llm.as_ref(), request, policy).await?;
            cost += response.usage.cost(prices);

            if response.tool_calls.is_empty() {
                debug!(task_id = %task.id, turn, "Final answer without tool calls");
                return Ok(Finish::Done {
                    output: response.content.unwrap_or_default(),
                    cost,
                });
            }

            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                match self.execute_tool(&ctx, call).await {
                    Ok(output) if output.finishes_task => {
                        return Ok(Finish::Done {
                            output: output.content,
                            cost,
                        });
                    }
                    Ok(output) => messages.push(ChatMessage::tool_result(
                        &call.id,
                        self.deps.safety.sanitize_output(&output.content),
                    )),
                    Err(e) => {
                        debug!(task_id = %task.id, tool = %call.name, error = %e, "Tool call failed");
                        messages.push(ChatMessage::tool_result(&call.id, format!("Error: {e}")));
                    }
                }
            }
        }

        Err(RunFailure {
            reason: format!("turn limit of {} reached without completion", config.max_turns),
            retryable: false,
        })
    }

    async fn execute_tool(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolOutput, ToolError> {
        let tool = self
            .deps
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound {
                name: call.name.clone(),
            })?;

        self.deps
            .safety
            .check_tool_call(&call.name, &call.arguments, ctx)
            .await?;

        self.event_for(ctx, EventKind::ToolCall, format!("{} {}", call.name, call.arguments))
            .await;

        let limit = self.deps.config.tool_timeout + TOOL_TIMEOUT_GRACE;
        match tokio::time::timeout(limit, tool.execute(call.arguments.clone(), ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                name: call.name.clone(),
                timeout: limit,
            }),
        }
    }

    /// Keep the liveness record fresh while turns and tool calls are in flight.
    async fn heartbeat(&self) -> Infallible {
        let period = self.deps.config.heartbeat_every.max(MIN_HEARTBEAT);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.deps.store.record_liveness(&self.worker, Utc::now()).await {
                warn!(task_id = %self.task_id, worker = %self.worker, error = %e, "Heartbeat failed");
            }
        }
    }

    /// Refresh liveness and confirm the task is still ours.
    async fn still_owner(&self) -> bool {
        let store = &self.deps.store;
        if let Err(e) = store.record_liveness(&self.worker, Utc::now()).await {
            warn!(task_id = %self.task_id, worker = %self.worker, error = %e, "Liveness update failed");
        }
        match store.get_task(self.task_id).await {
            Ok(Some(task)) => task.status == TaskStatus::Running && task.is_owned_by(&self.worker),
            Ok(None) => false,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Ownership check failed, continuing");
                true
            }
        }
    }

    /// `(title, output)` of every completed dependency.
    async fn dependency_outputs(&self, task: &Task) -> Vec<(String, String)> {
        let mut outputs = Vec::new();
        for dep in &task.dependencies {
            match self.deps.store.get_task(*dep).await {
                Ok(Some(dep)) => {
                    if let Some(result) = dep.result {
                        outputs.push((dep.title, result.output));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(task_id = %task.id, dependency = %dep, error = %e, "Could not load dependency output"),
            }
        }
        outputs
    }

    async fn complete(&self, task: &Task, output: String, cost: Decimal) -> RunOutcome {
        let result = TaskResult::success(output, cost);
        match self
            .deps
            .store
            .complete_task(task.id, Some(&self.worker), &result)
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                info!(task_id = %task.id, worker = %self.worker, cost = %cost, "Task completed");
                self.event(task, EventKind::Completed, "completed").await;
                RunOutcome::Completed
            }
            Ok(other) => {
                info!(task_id = %task.id, worker = %self.worker, status = %other.task().status, "Completion ignored, task moved on");
                RunOutcome::LostOwnership
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to record completion");
                let failure = RunFailure {
                    reason: format!("could not record completion: {e}"),
                    retryable: true,
                };
                self.fail(Some(task), failure).await
            }
        }
    }

    /// Event first, then the failure write.
    async fn fail(&self, task: Option<&Task>, failure: RunFailure) -> RunOutcome {
        warn!(
            task_id = %self.task_id,
            worker = %self.worker,
            retryable = failure.retryable,
            reason = %failure.reason,
            "Task run failed"
        );
        if let Some(task) = task {
            self.event(task, EventKind::Failed, &failure.reason).await;
        }

        match self
            .deps
            .store
            .fail_task(self.task_id, Some(&self.worker), &failure.reason, failure.retryable)
            .await
        {
            Ok(TransitionOutcome::Requeued(_)) => RunOutcome::Requeued,
            Ok(TransitionOutcome::Failed { blocked, .. }) => {
                if !blocked.is_empty() {
                    info!(task_id = %self.task_id, blocked = blocked.len(), "Dependents blocked");
                }
                RunOutcome::Failed
            }
            Ok(_) => RunOutcome::LostOwnership,
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Failed to record failure; stale recovery will pick it up");
                RunOutcome::Failed
            }
        }
    }

    /// Shutdown: hand the task back without retry accounting.
    async fn release(&self, task: &Task) -> RunOutcome {
        self.event(task, EventKind::Released, "released on shutdown").await;
        match self
            .deps
            .store
            .release_task(task.id, Some(&self.worker), false)
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                info!(task_id = %task.id, worker = %self.worker, "Task released on shutdown");
                RunOutcome::Released
            }
            Ok(_) => RunOutcome::LostOwnership,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Failed to release task on shutdown");
                RunOutcome::Released
            }
        }
    }

    async fn event(&self, task: &Task, kind: EventKind, message: &str) {
        let event = TaskEvent::new(task, kind, message).with_worker(&self.worker);
        if let Err(e) = self.deps.store.record_event(&event).await {
            warn!(task_id = %task.id, kind = %kind, error = %e, "Failed to record task event");
        }
    }

    async fn event_for(&self, ctx: &ToolContext, kind: EventKind, message: String) {
        let event = TaskEvent {
            id: Uuid::new_v4(),
            task_id: ctx.task_id,
            goal_id: ctx.goal_id,
            worker: Some(self.worker.to_string()),
            kind,
            message,
            created_at: Utc::now(),
        };
        if let Err(e) = self.deps.store.record_event(&event).await {
            warn!(task_id = %ctx.task_id, kind = %kind, error = %e, "Failed to record task event");
        }
    }
}

/// Resolves once shutdown is signalled; never if the sender is gone.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Goal, GoalStatus};
    use crate::safety::SafetyLayer;
    use crate::store::LibSqlBackend;
    use crate::testing::{ScriptedLlm, ScriptedReply, memory_store};
    use crate::tools::builtin::default_registry;
    use crate::tools::local::LocalBackend;

    struct Fixture {
        store: Arc<LibSqlBackend>,
        deps: RunnerDeps,
        _dir: tempfile::TempDir,
        _shutdown: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    async fn fixture(llm: ScriptedLlm, config: WorkerConfig) -> Fixture {
        let store = memory_store().await;
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(LocalBackend::new(dir.path(), 4096));
        let tools = Arc::new(default_registry(backend, &config));
        let (tx, rx) = watch::channel(false);
        Fixture {
            deps: RunnerDeps {
                store: store.clone(),
                llm: Arc::new(llm),
                tools,
                safety: Arc::new(SafetyLayer::standard(4096).unwrap()),
                config,
            },
            store,
            _dir: dir,
            _shutdown: tx,
            shutdown_rx: rx,
        }
    }

    /// Inserts and assigns a single-task goal.
    async fn assigned(f: &Fixture, task: Task) -> (Task, WorkerAddress) {
        let goal = Goal {
            id: task.goal_id,
            ..Goal::new("g", "")
        };
        f.store.insert_plan(&goal, &[task.clone()]).await.unwrap();
        let worker = WorkerAddress::local();
        assert!(f.store.assign_task(task.id, &worker, Utc::now()).await.unwrap());
        (task, worker)
    }

    fn runner(f: &Fixture, task: &Task, worker: &WorkerAddress) -> TaskRunner {
        TaskRunner::new(task.id, worker.clone(), f.deps.clone(), f.shutdown_rx.clone())
    }

    #[tokio::test]
    async fn completes_via_task_done_and_settles_goal() {
        let llm = ScriptedLlm::new(vec![
            ScriptedReply::tool_call("write_file", serde_json::json!({"path": "out.txt", "content": "hi"})),
            ScriptedReply::done("wrote out.txt"),
        ]);
        let f = fixture(llm, WorkerConfig::default()).await;
        let (task, worker) = assigned(&f, Task::new(uuid::Uuid::new_v4(), "write")).await;

        assert_eq!(runner(&f, &task, &worker).run().await, RunOutcome::Completed);

        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        let result = stored.result.unwrap();
        assert_eq!(result.output, "wrote out.txt");
        assert!(result.cost > Decimal::ZERO);
        assert!(stored.completed_at.is_some());
        let goal = f.store.get_goal(task.goal_id).await.unwrap().unwrap();
        assert_eq!(goal.status, GoalStatus::Completed);

        let kinds: Vec<EventKind> = f
            .store
            .list_events_for_task(task.id, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Claimed,
                EventKind::ToolCall,
                EventKind::ToolCall,
                EventKind::Completed
            ]
        );
    }

    #[tokio::test]
    async fn text_without_tool_calls_is_final_output() {
        let llm = ScriptedLlm::new(vec![ScriptedReply::text("42")]);
        let f = fixture(llm, WorkerConfig::default()).await;
        let (task, worker) = assigned(&f, Task::new(uuid::Uuid::new_v4(), "answer")).await;

        assert_eq!(runner(&f, &task, &worker).run().await, RunOutcome::Completed);
        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.result.unwrap().output, "42");
    }

    #[tokio::test]
    async fn abandons_when_not_assigned_to_it() {
        let llm = ScriptedLlm::new(vec![ScriptedReply::text("never")]);
        let f = fixture(llm, WorkerConfig::default()).await;
        let (task, _) = assigned(&f, Task::new(uuid::Uuid::new_v4(), "t")).await;
        let stranger = WorkerAddress::local();

        assert_eq!(runner(&f, &task, &stranger).run().await, RunOutcome::Abandoned);
        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert!(f.store.list_events_for_task(task.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn turn_limit_fails_permanently() {
        let llm = ScriptedLlm::always(|_| ScriptedReply::tool_call("exec", serde_json::json!({"command": "true"})));
        let config = WorkerConfig {
            max_turns: 3,
            ..WorkerConfig::default()
        };
        let f = fixture(llm, config).await;
        let (task, worker) = assigned(&f, Task::new(uuid::Uuid::new_v4(), "loop")).await;

        assert_eq!(runner(&f, &task, &worker).run().await, RunOutcome::Failed);
        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.failure_reason.unwrap().contains("turn limit"));
    }

    #[tokio::test]
    async fn transient_llm_failure_requeues() {
        let llm = ScriptedLlm::always(|_| {
            ScriptedReply::Error(LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "503".into(),
            })
        });
        let config = WorkerConfig {
            llm_retries: 0,
            ..WorkerConfig::default()
        };
        let f = fixture(llm, config).await;
        let (task, worker) = assigned(&f, Task::new(uuid::Uuid::new_v4(), "flaky")).await;

        assert_eq!(runner(&f, &task, &worker).run().await, RunOutcome::Requeued);
        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.assigned_to.is_none());
        assert!(stored.started_at.is_none());
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let llm = ScriptedLlm::new(vec![ScriptedReply::Error(LlmError::AuthFailed {
            provider: "scripted".into(),
        })]);
        let f = fixture(llm, WorkerConfig::default()).await;
        let (task, worker) = assigned(&f, Task::new(uuid::Uuid::new_v4(), "t")).await;

        assert_eq!(runner(&f, &task, &worker).run().await, RunOutcome::Failed);
        let events = f.store.list_events_for_task(task.id, 10).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_timeout_is_retryable() {
        let llm = ScriptedLlm::always(|_| ScriptedReply::Hang);
        let config = WorkerConfig {
            llm_timeout: Duration::from_secs(3600),
            ..WorkerConfig::default()
        };
        let f = fixture(llm, config).await;
        let task = Task::new(uuid::Uuid::new_v4(), "slow").with_timeout(Duration::from_secs(5));
        let (task, worker) = assigned(&f, task).await;

        assert_eq!(runner(&f, &task, &worker).run().await, RunOutcome::Requeued);
        let stored = f.store.get_task(task.id).await.unwrap().unwrap();
        assert!(stored.failure_reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn stops_without_writing_after_losing_ownership() {
        let llm = ScriptedLlm::always(|_| ScriptedReply::tool_call("exec", serde_json::json!({"command": "true"})));
        let config = WorkerConfig {
            liveness_every: 1,
            max_turns: 10,
            ..WorkerConfig::default()
        };
        let f = fixture(llm, config).await;
        let (task, worker) = assigned(&f, Task::new(uuid::Uuid::new_v4(), "t")).await;

        let store = f.store.clone();
        let run = tokio::spawn(runner(&f, &task, &worker).run());
        // Operator takes the task away while the runner is working.
        loop {
            let current = store.get_task(task.id).await.unwrap().unwrap();
            if current.status == TaskStatus::Running {
                store.release_task(task.id, None, false).await.unwrap();
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(run.await.unwrap(), RunOutcome::LostOwnership);
        let stored = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn slow_tool_turns_keep_the_worker_fresh() {
        let sleep = || ScriptedReply::tool_call("exec", serde_json::json!({"command": "sleep 1"}));
        let llm = ScriptedLlm::new(vec![sleep(), sleep(), sleep(), ScriptedReply::done("rested")]);
        let config = WorkerConfig {
            heartbeat_every: Duration::from_millis(200),
            ..WorkerConfig::default()
        };
        let f = fixture(llm, config).await;
        let (task, worker) = assigned(&f, Task::new(uuid::Uuid::new_v4(), "nap")).await;

        let run = tokio::spawn(runner(&f, &task, &worker).run());
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let snapshot = crate::health::StoreSnapshot::load(f.store.as_ref()).await.unwrap();
        let running = snapshot.tasks.iter().find(|t| t.id == task.id).unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        let thresholds = crate::config::HealthThresholds {
            worker_stale: Duration::from_secs(2),
            ..Default::default()
        };
        let diag = crate::health::derive(&snapshot, Utc::now(), &thresholds, false);
        let health = diag
            .workers
            .iter()
            .find(|w| w.address == worker.to_string())
            .unwrap();
        assert!(health.silence_secs < 1, "silent for {}s", health.silence_secs);
        assert_eq!(health.state, crate::health::WorkerState::Active);

        assert_eq!(run.await.unwrap(), RunOutcome::Completed);
    }

    #[tokio::test]
    async fn blocked_tool_call_is_reported_to_the_model() {
        let llm = ScriptedLlm::new(vec![
            ScriptedReply::tool_call("exec", serde_json::json!({"command": "sudo rm -rf /"})),
            ScriptedReply::done("gave up on that"),
        ]);
        let f = fixture(llm, WorkerConfig::default()).await;
        let (task, worker) = assigned(&f, Task::new(uuid::Uuid::new_v4(), "t")).await;

        assert_eq!(runner(&f, &task, &worker).run().await, RunOutcome::Completed);
        let events = f.store.list_events_for_task(task.id, 10).await.unwrap();
        // Only task_done got through the guard.
        let calls: Vec<&str> = events
            .iter()
            .filter(|e| e.kind == EventKind::ToolCall)
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("task_done"));
    }

    #[tokio::test]
    async fn dependency_outputs_reach_the_prompt() {
        let llm = Arc::new(ScriptedLlm::always(|_| ScriptedReply::text("done")));
        let store = memory_store().await;
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig::default();
        let tools = Arc::new(default_registry(Arc::new(LocalBackend::new(dir.path(), 4096)), &config));
        let (_tx, rx) = watch::channel(false);
        let deps = RunnerDeps {
            store: store.clone(),
            llm: llm.clone(),
            tools,
            safety: Arc::new(SafetyLayer::new(4096)),
            config,
        };

        let goal = Goal::new("g", "");
        let first = Task::new(goal.id, "Collect");
        let second = Task::new(goal.id, "Summarize").with_dependencies(vec![first.id]);
        store.insert_plan(&goal, &[first.clone(), second.clone()]).await.unwrap();

        for task in [&first, &second] {
            let worker = WorkerAddress::local();
            assert!(store.assign_task(task.id, &worker, Utc::now()).await.unwrap());
            let outcome = TaskRunner::new(task.id, worker, deps.clone(), rx.clone()).run().await;
            assert_eq!(outcome, RunOutcome::Completed);
        }

        let requests = llm.requests();
        let brief = &requests[1].messages[1].content;
        assert!(brief.contains("### Collect\ndone"), "{brief}");
    }
}
