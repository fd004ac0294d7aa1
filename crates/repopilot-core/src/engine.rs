//! Plan engine - build, execute and replan in one call
//!
//! [`PlanEngine`] wires a [`PlanBuilder`], a [`PlanExecutor`] and a
//! [`Replanner`] to one event sink. A run keeps replanning while the plan
//! ends PARTIAL or FAILED and the replan budget allows it.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::builder::{PlanBuilder, PlanContext};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{JsonlEventSink, SharedSink, TracingSink};
use crate::executor::PlanExecutor;
use crate::plan::{Plan, PlanStatus};
use crate::replanner::{ReplanReason, Replanner, missing_producers, timed_out_steps};
use crate::runner::RunnerRegistry;

/// Pick the replan strategy for a finished plan
pub fn infer_reason(plan: &Plan) -> ReplanReason {
    if !timed_out_steps(plan).is_empty() {
        ReplanReason::Timeout
    } else if !missing_producers(plan).is_empty() {
        ReplanReason::MissingArtifact
    } else {
        ReplanReason::StepFailed
    }
}

/// One executed plan of a run
#[derive(Debug, Clone, PartialEq)]
pub struct Attempt {
    pub plan_id: String,
    pub status: PlanStatus,
    /// Why the next plan was made, if one was
    pub replanned_for: Option<ReplanReason>,
}

/// Final plan of a run plus the history behind it
#[derive(Debug, Clone)]
pub struct EngineOutcome {
    pub plan: Plan,
    pub attempts: Vec<Attempt>,
    /// The run stopped because no further replan was allowed
    pub exhausted: bool,
}

impl EngineOutcome {
    pub fn status(&self) -> PlanStatus {
        self.plan.status
    }

    /// Display-ready message when the user must be asked
    pub fn ask_user_message(&self) -> Option<&str> {
        match self.plan.status {
            PlanStatus::AskUser => self.plan.error_message.as_deref(),
            _ => None,
        }
    }

    /// The final plan, or an error if replanning ran out before success
    pub fn into_result(self) -> Result<Plan> {
        if self.exhausted && self.plan.status != PlanStatus::Success {
            return Err(Error::ReplanExhausted {
                plan_id: self.plan.id,
                attempts: self.plan.replan_count,
            });
        }
        Ok(self.plan)
    }
}

/// Builder, executor and replanner behind one entry point
#[derive(Debug, Clone)]
pub struct PlanEngine {
    builder: PlanBuilder,
    executor: PlanExecutor,
    replanner: Replanner,
}

impl PlanEngine {
    /// Engine with default configuration
    pub fn new(registry: RunnerRegistry) -> Self {
        Self::from_config(registry, &EngineConfig::default())
    }

    /// Engine from configuration. A configured JSONL path replaces the
    /// tracing sink.
    pub fn from_config(registry: RunnerRegistry, config: &EngineConfig) -> Self {
        let sink: SharedSink = match &config.events.jsonl_path {
            Some(path) => Arc::new(JsonlEventSink::new(path)),
            None => Arc::new(TracingSink),
        };

        Self {
            builder: PlanBuilder::new().with_default_timeout(config.executor.default_timeout()),
            executor: PlanExecutor::new(registry).with_config(config.executor.clone()),
            replanner: Replanner::new(config.replanner.clone()),
        }
        .with_sink(sink)
    }

    /// Send every component's events to `sink`
    pub fn with_sink(self, sink: SharedSink) -> Self {
        Self {
            builder: self.builder.with_sink(sink.clone()),
            executor: self.executor.with_sink(sink.clone()),
            replanner: self.replanner.with_sink(sink),
        }
    }

    pub fn builder(&self) -> &PlanBuilder {
        &self.builder
    }

    pub fn executor(&self) -> &PlanExecutor {
        &self.executor
    }

    pub fn replanner(&self) -> &Replanner {
        &self.replanner
    }

    /// Build a plan for the intent and run it to completion
    pub async fn run(
        &self,
        intent: &str,
        sub_intent: &str,
        context: &PlanContext,
        state: &Value,
    ) -> EngineOutcome {
        let plan = self.builder.build(intent, sub_intent, context);
        self.run_plan(plan, state, CancellationToken::new()).await
    }

    /// Run an existing plan, replanning on failure
    pub async fn run_plan(
        &self,
        mut plan: Plan,
        state: &Value,
        cancel: CancellationToken,
    ) -> EngineOutcome {
        let mut attempts = Vec::new();
        let mut exhausted = false;

        loop {
            let status = self
                .executor
                .execute_with_cancel(&mut plan, state, cancel.clone())
                .await;
            attempts.push(Attempt {
                plan_id: plan.id.clone(),
                status,
                replanned_for: None,
            });

            if !matches!(status, PlanStatus::Partial | PlanStatus::Failed) {
                break;
            }

            let reason = infer_reason(&plan);
            match self.replanner.replan(&plan, reason) {
                Some(next) => {
                    if let Some(last) = attempts.last_mut() {
                        last.replanned_for = Some(reason);
                    }
                    plan = next;
                }
                None => {
                    warn!(plan_id = %plan.id, status = %status, "Giving up after replanning");
                    exhausted = true;
                    break;
                }
            }
        }

        info!(
            plan_id = %plan.id,
            status = %plan.status,
            attempts = attempts.len(),
            "Run finished"
        );
        EngineOutcome {
            plan,
            attempts,
            exhausted,
        }
    }
}
