//! Plan executor - dependency-ordered, layer-parallel step execution
//!
//! The executor repeatedly selects the ready layer of a plan (pending steps
//! whose dependencies are all success or skipped). A single ready step runs
//! inline on the calling task; a wider layer is fanned out to a bounded pool
//! and joined before the next layer is selected. Runners only ever see
//! snapshots; results are applied to the plan and the [`ExecutionContext`]
//! on the calling task once each step is final.
//!
//! No error escapes [`PlanExecutor::execute`]: the plan status and each
//! step's `error_message` carry the outcome.

mod attempt;
pub mod context;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::events::{PlanEvent, PlanEventType, SharedSink, TracingSink};
use crate::plan::{Plan, PlanStatus, PlanStep, StepStatus};

pub use crate::plan::DEADLOCK_REASON;
use crate::runner::RunnerRegistry;

use attempt::{StepJob, StepOutcome, run_step};

pub use attempt::{ADVANCED_PARAM_KEYS, relax_params};
pub use context::ExecutionContext;

/// Reason recorded on steps skipped by caller cancellation
pub const CANCELLED_REASON: &str = "execution cancelled";

/// Executes plans against a runner registry
#[derive(Clone)]
pub struct PlanExecutor {
    registry: RunnerRegistry,
    config: ExecutorConfig,
    sink: SharedSink,
}

impl PlanExecutor {
    /// Create an executor with default settings
    pub fn new(registry: RunnerRegistry) -> Self {
        Self {
            registry,
            config: ExecutorConfig::default(),
            sink: Arc::new(TracingSink),
        }
    }

    /// Use the given executor settings
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Report lifecycle events to `sink`
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute a plan to a terminal status
    pub async fn execute(&self, plan: &mut Plan, state: &Value) -> PlanStatus {
        self.execute_with_cancel(plan, state, CancellationToken::new())
            .await
    }

    /// Execute a plan, stopping early once `cancel` fires.
    ///
    /// A cancelled execution lets the current layer finish (runners see the
    /// cancellation through their own tokens), skips every pending step and
    /// ends ABORTED.
    pub async fn execute_with_cancel(
        &self,
        plan: &mut Plan,
        state: &Value,
        cancel: CancellationToken,
    ) -> PlanStatus {
        if plan.status.is_terminal() {
            debug!(plan_id = %plan.id, status = %plan.status, "Plan already finished");
            return plan.status;
        }
        if plan.status == PlanStatus::Pending
            && let Err(e) = plan.transition(PlanStatus::Running)
        {
            warn!(plan_id = %plan.id, error = %e, "Could not start plan");
        }

        let started = Instant::now();
        let mut context = ExecutionContext::for_plan(plan);

        info!(plan_id = %plan.id, key = %plan.key(), steps = plan.steps.len(), "Executing plan");
        self.sink.emit(PlanEvent::new(
            plan.id.clone(),
            PlanEventType::PlanStarted,
            json!({
                "key": plan.key(),
                "steps": plan.steps.len(),
                "replan_count": plan.replan_count,
            }),
        ));

        let mut aborted = false;
        // Every iteration finalizes at least one step
        let max_iterations = plan.steps.len() + 1;
        for iteration in 0..max_iterations {
            if plan.is_complete() {
                break;
            }

            if cancel.is_cancelled() {
                warn!(plan_id = %plan.id, "Execution cancelled; skipping pending steps");
                skip_pending(plan, CANCELLED_REASON);
                aborted = true;
                break;
            }

            let ready: Vec<String> = plan.ready_steps().iter().map(|s| s.id.clone()).collect();
            if ready.is_empty() {
                let stuck: Vec<String> =
                    plan.pending_steps().iter().map(|s| s.id.clone()).collect();
                warn!(plan_id = %plan.id, steps = ?stuck, "Deadlock: {}", DEADLOCK_REASON);
                skip_pending(plan, DEADLOCK_REASON);
                break;
            }

            debug!(plan_id = %plan.id, iteration, ready = ?ready, "Dispatching ready layer");
            if ready.len() == 1 {
                self.run_inline(plan, &ready[0], &mut context, state, &cancel)
                    .await;
            } else {
                self.run_layer(plan, &ready, &mut context, state, &cancel)
                    .await;
            }
        }

        // A runner may cancel mid-layer; nothing pending must survive it
        if !plan.is_complete() {
            skip_pending(plan, if aborted { CANCELLED_REASON } else { DEADLOCK_REASON });
        }

        self.finish(plan, &context, started.elapsed(), aborted)
    }

    async fn run_inline(
        &self,
        plan: &mut Plan,
        step_id: &str,
        context: &mut ExecutionContext,
        state: &Value,
        cancel: &CancellationToken,
    ) {
        let Some(job) = self.prepare(plan, step_id, context, state) else {
            return;
        };
        let deadline = self.config.inline_timeouts.then_some(job.step.timeout);
        let outcome = run_with_deadline(job, cancel.child_token(), deadline).await;
        self.apply(plan, context, outcome);
    }

    async fn run_layer(
        &self,
        plan: &mut Plan,
        ready: &[String],
        context: &mut ExecutionContext,
        state: &Value,
        cancel: &CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut in_flight = Vec::with_capacity(ready.len());

        for step_id in ready {
            let Some(job) = self.prepare(plan, step_id, context, state) else {
                continue;
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(step_id = %step_id, error = %e, "Worker pool closed");
                    self.apply(
                        plan,
                        context,
                        StepOutcome::failed(step_id, "worker pool closed", Duration::ZERO),
                    );
                    continue;
                }
            };

            let token = cancel.child_token();
            let step = job.step.clone();
            let deadline = tokio::time::Instant::now() + step.timeout;
            let task_token = token.clone();
            let timeout = step.timeout;
            let handle = tokio::spawn(async move {
                let _permit = permit;
                run_with_deadline(job, task_token, Some(timeout)).await
            });
            in_flight.push(InFlight {
                step,
                token,
                deadline,
                started: Instant::now(),
                handle,
            });
        }

        // The wait is bounded here as well; a runner that blocks its worker
        // thread cannot hold the caller past the step deadline
        for mut task in in_flight {
            let waited = tokio::time::timeout_at(task.deadline, &mut task.handle).await;
            let outcome = match waited {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    warn!(step_id = %task.step.id, error = %e, "Step task did not complete");
                    StepOutcome::failed(
                        &task.step.id,
                        format!("Step task failed: {}", e),
                        task.started.elapsed(),
                    )
                }
                Err(_) => {
                    task.token.cancel();
                    task.handle.abort();
                    warn!(
                        step_id = %task.step.id,
                        timeout_secs = task.step.timeout_secs(),
                        "Step timed out; task abandoned"
                    );
                    StepOutcome::timed_out(&task.step, task.started.elapsed())
                }
            };
            self.apply(plan, context, outcome);
        }
    }

    /// Mark a step running and package it for dispatch
    fn prepare(
        &self,
        plan: &mut Plan,
        step_id: &str,
        context: &ExecutionContext,
        state: &Value,
    ) -> Option<StepJob> {
        let plan_id = plan.id.clone();
        let step = plan.step_mut(step_id)?;
        if let Err(e) = step.transition(StepStatus::Running) {
            warn!(plan_id = %plan_id, step_id = %step_id, error = %e, "Step not runnable");
            return None;
        }

        let inputs = context.inputs_for(step, state);
        self.sink.emit(PlanEvent::for_step(
            plan_id.clone(),
            step_id,
            PlanEventType::StepStarted,
            json!({
                "runner": step.runner,
                "params": step.params,
                "needs": step.needs,
            }),
        ));

        Some(StepJob {
            plan_id,
            step: step.clone(),
            runner: self.registry.get(step.runner),
            inputs,
            sink: self.sink.clone(),
        })
    }

    /// Apply a finished step to the plan and context
    fn apply(&self, plan: &mut Plan, context: &mut ExecutionContext, outcome: StepOutcome) {
        let StepOutcome {
            result,
            retry_count,
            used_fallback,
            ask_user,
        } = outcome;
        let step_id = result.step_id.clone();
        let plan_id = plan.id.clone();

        let Some(step) = plan.step_mut(&step_id) else {
            warn!(plan_id = %plan_id, step_id = %step_id, "Result for unknown step");
            return;
        };

        step.retry_count = retry_count;
        step.execution_time = result.execution_time;
        let next = if result.is_success() {
            step.result = Some(result.result.clone());
            StepStatus::Success
        } else {
            step.error_message = result.error_message.clone();
            StepStatus::Failed
        };
        if let Err(e) = step.transition(next) {
            warn!(plan_id = %plan_id, step_id = %step_id, error = %e, "Rejected step transition");
        }

        if result.is_success() {
            context.record_success(&result);
            info!(
                plan_id = %plan_id,
                step_id = %step_id,
                duration_ms = result.execution_time.as_millis() as u64,
                fallback = used_fallback,
                "Step succeeded"
            );
        } else {
            warn!(
                plan_id = %plan_id,
                step_id = %step_id,
                error = result.error_message.as_deref().unwrap_or("unknown error"),
                "Step failed"
            );
        }
        if let Some(message) = &ask_user {
            context.escalate(message.clone());
        }

        self.sink.emit(PlanEvent::for_step(
            plan_id,
            step_id.clone(),
            PlanEventType::StepFinished,
            json!({
                "status": result.status,
                "duration_ms": result.execution_time.as_millis() as u64,
                "output": result.result,
                "artifacts_out": result.artifacts_out,
                "error": result.error_message,
                "retry_count": retry_count,
                "fallback": used_fallback,
                "ask_user": ask_user,
            }),
        ));

        plan.execution_order.push(step_id.clone());
        plan.step_results.insert(step_id, result);
    }

    fn finish(
        &self,
        plan: &mut Plan,
        context: &ExecutionContext,
        elapsed: Duration,
        aborted: bool,
    ) -> PlanStatus {
        let status = if aborted {
            PlanStatus::Aborted
        } else {
            plan.resolve_status(context.needs_user())
        };

        plan.total_execution_time = elapsed;
        plan.artifacts_collected = context.artifacts().clone();
        let first_error = plan
            .failed_steps()
            .first()
            .and_then(|s| s.error_message.clone());
        plan.error_message = match status {
            PlanStatus::AskUser => context.ask_user_message().map(str::to_string),
            PlanStatus::Aborted => Some(CANCELLED_REASON.to_string()),
            PlanStatus::Failed | PlanStatus::Partial => first_error,
            _ => None,
        };

        if let Err(e) = plan.transition(status) {
            warn!(plan_id = %plan.id, error = %e, "Rejected plan transition");
        }

        info!(
            plan_id = %plan.id,
            status = %plan.status,
            duration_ms = elapsed.as_millis() as u64,
            "{}",
            plan.summary()
        );
        self.sink.emit(PlanEvent::new(
            plan.id.clone(),
            PlanEventType::PlanFinished,
            json!({
                "status": plan.status,
                "duration_ms": elapsed.as_millis() as u64,
                "execution_order": plan.execution_order,
                "artifacts": plan.artifacts_collected.keys().collect::<Vec<_>>(),
                "error": plan.error_message,
            }),
        ));

        plan.status
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

/// Run a job, cancelling its token and dropping the runner future once
/// `deadline` elapses
async fn run_with_deadline(
    job: StepJob,
    token: CancellationToken,
    deadline: Option<Duration>,
) -> StepOutcome {
    let Some(limit) = deadline else {
        return run_step(job, token).await;
    };

    let step = job.step.clone();
    let started = Instant::now();
    match tokio::time::timeout(limit, run_step(job, token.clone())).await {
        Ok(outcome) => outcome,
        Err(_) => {
            token.cancel();
            warn!(step_id = %step.id, timeout_secs = step.timeout_secs(), "Step timed out");
            StepOutcome::timed_out(&step, started.elapsed())
        }
    }
}

/// A dispatched step of the current layer
struct InFlight {
    step: PlanStep,
    token: CancellationToken,
    deadline: tokio::time::Instant,
    started: Instant,
    handle: JoinHandle<StepOutcome>,
}

fn skip_pending(plan: &mut Plan, reason: &str) {
    for step in plan.steps.iter_mut().filter(|s| s.status == StepStatus::Pending) {
        if let Err(e) = step.skip(reason) {
            warn!(step_id = %step.id, error = %e, "Could not skip step");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::events::MemoryEventSink;
    use crate::plan::{ErrorPolicy, PlanStep, StepResult};
    use crate::runner::{Capability, RunnerInputs};

    fn ok_runner(step: &PlanStep, _: &RunnerInputs) -> crate::error::Result<StepResult> {
        Ok(StepResult::success(&step.id, json!({"step": step.id})))
    }

    fn fail_runner(step: &PlanStep, _: &RunnerInputs) -> crate::error::Result<StepResult> {
        Err(Error::step(&step.id, "boom"))
    }

    fn executor(registry: RunnerRegistry) -> (PlanExecutor, MemoryEventSink) {
        let sink = MemoryEventSink::new();
        let executor = PlanExecutor::new(registry).with_sink(Arc::new(sink.clone()));
        (executor, sink)
    }

    #[tokio::test]
    async fn test_linear_plan_succeeds_in_order() {
        let registry = RunnerRegistry::new()
            .with_fn(Capability::FetchRepo, |step: &PlanStep, _: &RunnerInputs| {
                Ok(StepResult::success(&step.id, json!({"repo_snapshot": {"files": 3}}))
                    .with_artifact("repo_snapshot"))
            })
            .with_fn(Capability::Diagnosis, |step: &PlanStep, inputs: &RunnerInputs| {
                let files = inputs.artifact("repo_snapshot").map(|s| s["files"].clone());
                Ok(StepResult::success(&step.id, json!({"diagnosis": files}))
                    .with_artifact("diagnosis"))
            });
        let (executor, sink) = executor(registry);

        let mut plan = Plan::new(
            "analyze",
            "diagnosis",
            vec![
                PlanStep::new("fetch_repo", Capability::FetchRepo),
                PlanStep::new("diagnosis", Capability::Diagnosis).with_dependency("fetch_repo"),
            ],
        );

        let status = executor.execute(&mut plan, &Value::Null).await;
        assert_eq!(status, PlanStatus::Success);
        assert_eq!(plan.execution_order, vec!["fetch_repo", "diagnosis"]);
        assert_eq!(plan.artifacts_collected["diagnosis"], 3);
        assert!(plan.error_message.is_none());
        assert_eq!(sink.of_type(PlanEventType::StepFinished).len(), 2);
        assert_eq!(sink.of_type(PlanEventType::PlanFinished).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents() {
        let registry = RunnerRegistry::new()
            .with_fn(Capability::FetchRepo, fail_runner)
            .with_fn(Capability::Diagnosis, ok_runner)
            .with_fn(Capability::Help, ok_runner);
        let (executor, _) = executor(registry);

        let mut plan = Plan::new(
            "t",
            "t",
            vec![
                PlanStep::new("fetch_repo", Capability::FetchRepo),
                PlanStep::new("diagnosis", Capability::Diagnosis).with_dependency("fetch_repo"),
                PlanStep::new("help", Capability::Help),
            ],
        );

        let status = executor.execute(&mut plan, &Value::Null).await;
        assert_eq!(status, PlanStatus::Partial);
        assert_eq!(plan.step("fetch_repo").unwrap().status, StepStatus::Failed);
        let diagnosis = plan.step("diagnosis").unwrap();
        assert_eq!(diagnosis.status, StepStatus::Skipped);
        assert_eq!(diagnosis.error_message.as_deref(), Some(DEADLOCK_REASON));
        assert!(plan.error_message.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_unregistered_capability_fails_step() {
        let (executor, _) = executor(RunnerRegistry::new());
        let mut plan = Plan::new("chat", "general", vec![PlanStep::new("chat", Capability::Chat)]);

        let status = executor.execute(&mut plan, &Value::Null).await;
        assert_eq!(status, PlanStatus::Failed);
        assert!(
            plan.steps[0]
                .error_message
                .as_deref()
                .unwrap()
                .contains("No runner registered for capability 'chat'")
        );
    }

    #[tokio::test]
    async fn test_ask_user_overrides_success() {
        let registry = RunnerRegistry::new()
            .with_fn(Capability::Followup, |step: &PlanStep, _: &RunnerInputs| {
                Ok(StepResult::failure(&step.id, "repository does not exist"))
            })
            .with_fn(Capability::Help, ok_runner);
        let (executor, _) = executor(registry);

        let mut plan = Plan::new(
            "t",
            "t",
            vec![
                PlanStep::new("followup", Capability::Followup).with_policy(ErrorPolicy::AskUser),
                PlanStep::new("help", Capability::Help),
            ],
        );

        let status = executor.execute(&mut plan, &Value::Null).await;
        assert_eq!(status, PlanStatus::AskUser);
        assert!(plan.error_message.as_deref().unwrap().contains("couldn't find"));
        assert_eq!(plan.step("followup").unwrap().status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_terminal_plan_is_returned_untouched() {
        let (executor, sink) = executor(RunnerRegistry::new());
        let mut plan = Plan::new("t", "t", vec![]);
        plan.transition(PlanStatus::AskUser).unwrap();

        assert_eq!(executor.execute(&mut plan, &Value::Null).await, PlanStatus::AskUser);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_succeeds() {
        let (executor, _) = executor(RunnerRegistry::new());
        let mut plan = Plan::new("t", "t", vec![]);
        assert_eq!(executor.execute(&mut plan, &Value::Null).await, PlanStatus::Success);
    }

    #[tokio::test]
    async fn test_state_reaches_runner() {
        let registry = RunnerRegistry::new().with_fn(
            Capability::Chat,
            |step: &PlanStep, inputs: &RunnerInputs| {
                Ok(StepResult::success(&step.id, inputs.state.clone()))
            },
        );
        let (executor, _) = executor(registry);
        let mut plan = Plan::new("chat", "general", vec![PlanStep::new("chat", Capability::Chat)]);

        executor.execute(&mut plan, &json!({"session": "s1"})).await;
        assert_eq!(plan.steps[0].result.as_ref().unwrap()["session"], "s1");
    }
}
