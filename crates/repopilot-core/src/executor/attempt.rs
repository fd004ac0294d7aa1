//! Running one step: attempts, retries and error policies
//!
//! Everything here operates on owned copies so it can run inside a spawned
//! task. The result is a [`StepOutcome`] that the executor applies to the
//! plan on its own task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::escalation::{AskUserCategory, ask_user_message};
use crate::events::{PlanEvent, PlanEventType, SharedSink};
use crate::plan::{ErrorPolicy, PlanStep, StepResult, StepStatus};
use crate::runner::{RunnerInputs, StepRunner};

/// Parameters dropped when a step is re-run under the fallback policy
pub const ADVANCED_PARAM_KEYS: &[&str] = &[
    "include_dependencies",
    "deep_analysis",
    "include_history",
    "include_contributors",
    "max_files",
    "max_commits",
];

/// Copy of `params` with advanced keys removed and the
/// `simplified`/`fallback` flags set
pub fn relax_params(params: &Map<String, Value>) -> Map<String, Value> {
    let mut relaxed: Map<String, Value> = params
        .iter()
        .filter(|(k, _)| !ADVANCED_PARAM_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    relaxed.insert("simplified".to_string(), Value::Bool(true));
    relaxed.insert("fallback".to_string(), Value::Bool(true));
    relaxed
}

/// Everything a step needs to run away from the plan
pub(crate) struct StepJob {
    pub plan_id: String,
    pub step: PlanStep,
    pub runner: Option<Arc<dyn StepRunner>>,
    pub inputs: RunnerInputs,
    pub sink: SharedSink,
}

/// Final word on one step
#[derive(Debug, Clone)]
pub(crate) struct StepOutcome {
    pub result: StepResult,
    pub retry_count: u32,
    pub used_fallback: bool,
    /// Set when the step escalated to the user
    pub ask_user: Option<String>,
}

impl StepOutcome {
    pub fn failed(step_id: &str, error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            result: StepResult::failure(step_id, error).with_execution_time(elapsed),
            retry_count: 0,
            used_fallback: false,
            ask_user: None,
        }
    }

    /// Outcome for a step that ran out of time
    pub fn timed_out(step: &PlanStep, elapsed: Duration) -> Self {
        let error = Error::StepTimeout {
            step_id: step.id.clone(),
            secs: step.timeout_secs(),
        }
        .to_string();
        let ask_user = (step.on_error == ErrorPolicy::AskUser)
            .then(|| AskUserCategory::Timeout.message(&step.id));
        Self {
            ask_user,
            ..Self::failed(&step.id, error, elapsed)
        }
    }
}

async fn invoke(
    runner: &dyn StepRunner,
    step: &PlanStep,
    inputs: RunnerInputs,
    cancel: CancellationToken,
) -> Result<StepResult, String> {
    match runner.run(step, inputs, cancel).await {
        Ok(result) if result.is_success() => Ok(StepResult {
            step_id: step.id.clone(),
            ..result
        }),
        Ok(result) => Err(result
            .error_message
            .unwrap_or_else(|| format!("Step '{}' reported failure", step.id))),
        Err(e) => Err(e.to_string()),
    }
}

/// Run a step through its attempts and error policy
pub(crate) async fn run_step(job: StepJob, cancel: CancellationToken) -> StepOutcome {
    let StepJob {
        plan_id,
        step,
        runner,
        inputs,
        sink,
    } = job;
    let started = Instant::now();

    let Some(runner) = runner else {
        let error = Error::RunnerNotRegistered(step.runner.to_string()).to_string();
        warn!(plan_id = %plan_id, step_id = %step.id, "{}", error);
        return StepOutcome::failed(&step.id, error, started.elapsed());
    };

    let attempts = match step.on_error {
        ErrorPolicy::Retry => step.max_retries.saturating_add(1),
        _ => 1,
    };

    let mut retry_count = 0;
    let mut last_error = String::new();
    for attempt in 0..attempts {
        if attempt > 0 {
            if cancel.is_cancelled() {
                break;
            }
            retry_count += 1;
            debug!(step_id = %step.id, attempt = attempt + 1, "Retrying step");
            sink.emit(PlanEvent::for_step(
                plan_id.clone(),
                step.id.clone(),
                PlanEventType::StepRetrying,
                json!({
                    "status": StepStatus::Retrying,
                    "attempt": attempt + 1,
                    "error": last_error,
                }),
            ));
        }

        match invoke(runner.as_ref(), &step, inputs.clone(), cancel.clone()).await {
            Ok(result) => {
                return StepOutcome {
                    result: result.with_execution_time(started.elapsed()),
                    retry_count,
                    used_fallback: false,
                    ask_user: None,
                };
            }
            Err(error) => {
                debug!(
                    step_id = %step.id,
                    attempt = attempt + 1,
                    error = %error,
                    "Step attempt failed"
                );
                last_error = error;
            }
        }
    }

    let mut outcome = StepOutcome {
        retry_count,
        ..StepOutcome::failed(&step.id, last_error.clone(), Duration::ZERO)
    };

    match step.on_error {
        ErrorPolicy::Fallback if !cancel.is_cancelled() => {
            let mut relaxed = step.clone();
            relaxed.params = relax_params(&step.params);
            let relaxed_inputs = RunnerInputs {
                params: relaxed.params.clone(),
                ..inputs
            };
            debug!(step_id = %step.id, "Running fallback with simplified parameters");

            match invoke(runner.as_ref(), &relaxed, relaxed_inputs, cancel.clone()).await {
                Ok(result) => {
                    outcome.result = result;
                    outcome.used_fallback = true;
                }
                Err(fallback_error) => {
                    let category = match AskUserCategory::classify(&fallback_error) {
                        AskUserCategory::Generic => AskUserCategory::classify(&last_error),
                        category => category,
                    };
                    outcome.result.error_message =
                        Some(format!("{} (fallback: {})", last_error, fallback_error));
                    outcome.ask_user = Some(category.message(&step.id));
                }
            }
        }
        ErrorPolicy::AskUser => {
            outcome.ask_user = Some(ask_user_message(&step.id, &last_error));
        }
        _ => {}
    }

    outcome.result.execution_time = started.elapsed();
    outcome
}
