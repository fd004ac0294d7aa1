//! Per-execution context
//!
//! One [`ExecutionContext`] lives for a single `execute()` call. Only the
//! executor's calling task writes to it; runners get cloned snapshots via
//! [`RunnerInputs`].

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::plan::{Plan, PlanStep, StepResult};
use crate::runner::RunnerInputs;

/// Artifacts, step outputs and escalation state of one execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    artifacts: HashMap<String, Value>,
    step_outputs: HashMap<String, Value>,
    ask_user: bool,
    ask_user_message: Option<String>,
}

impl ExecutionContext {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with what a plan already carries (inherited artifacts
    /// and the payloads of successful results)
    pub fn for_plan(plan: &Plan) -> Self {
        let step_outputs = plan
            .step_results
            .iter()
            .filter(|(_, r)| r.is_success())
            .map(|(id, r)| (id.clone(), r.result.clone()))
            .collect();

        Self {
            artifacts: plan.artifacts_collected.clone(),
            step_outputs,
            ..Self::default()
        }
    }

    /// Snapshot handed to a runner
    pub fn inputs_for(&self, step: &PlanStep, state: &Value) -> RunnerInputs {
        RunnerInputs {
            params: step.params.clone(),
            state: state.clone(),
            artifacts: self.artifacts.clone(),
            step_outputs: self.step_outputs.clone(),
        }
    }

    /// Record a successful result. Each output and artifact key is written
    /// once; later writes are ignored.
    pub fn record_success(&mut self, result: &StepResult) {
        if self.step_outputs.contains_key(&result.step_id) {
            debug!(step_id = %result.step_id, "Step output already recorded");
        } else {
            self.step_outputs
                .insert(result.step_id.clone(), result.result.clone());
        }

        for (key, value) in result.artifact_values() {
            if self.artifacts.contains_key(&key) {
                debug!(step_id = %result.step_id, artifact = %key, "Artifact already published");
                continue;
            }
            self.artifacts.insert(key, value);
        }
    }

    /// Flag the execution for user escalation. The first message wins.
    pub fn escalate(&mut self, message: impl Into<String>) {
        self.ask_user = true;
        if self.ask_user_message.is_none() {
            self.ask_user_message = Some(message.into());
        }
    }

    pub fn artifacts(&self) -> &HashMap<String, Value> {
        &self.artifacts
    }

    pub fn step_outputs(&self) -> &HashMap<String, Value> {
        &self.step_outputs
    }

    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.step_outputs.get(step_id)
    }

    /// Whether any step escalated
    pub fn needs_user(&self) -> bool {
        self.ask_user
    }

    /// Display-ready escalation message
    pub fn ask_user_message(&self) -> Option<&str> {
        self.ask_user_message.as_deref()
    }
}
