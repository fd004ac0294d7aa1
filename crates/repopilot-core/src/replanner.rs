//! Replanner - repairs a failed plan into a fresh one
//!
//! A replanned plan is always a new [`Plan`] (`{root}_r{n}`) that inherits
//! the collected artifacts and step results of its predecessor. Steps that
//! already succeeded are carried over untouched so the executor does not run
//! them again. At most two successive plans are produced for one original
//! plan, fewer if `max_replans` says so.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::config::ReplanConfig;
use crate::escalation::{AskUserCategory, CLARIFICATION_MESSAGE, ask_user_message};
use crate::events::{PlanEvent, PlanEventType, SharedSink, TracingSink};
use crate::plan::{ErrorPolicy, Plan, PlanStatus, PlanStep, StepStatus};
use crate::runner::Capability;

/// Optional parameters dropped when a timed-out step is retried
pub const EXPENSIVE_PARAM_KEYS: &[&str] = &[
    "include_history",
    "deep_analysis",
    "include_contributors",
    "max_commits",
];

/// Why a plan is being replanned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplanReason {
    StepFailed,
    MissingArtifact,
    Timeout,
    UserRequest,
    ConfidenceLow,
}

impl std::fmt::Display for ReplanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StepFailed => write!(f, "step_failed"),
            Self::MissingArtifact => write!(f, "missing_artifact"),
            Self::Timeout => write!(f, "timeout"),
            Self::UserRequest => write!(f, "user_request"),
            Self::ConfidenceLow => write!(f, "confidence_low"),
        }
    }
}

/// Runner used in place of a failed one
pub fn fallback_runner(failed: Capability) -> Capability {
    match failed {
        Capability::Diagnosis | Capability::Onboarding => Capability::Overview,
        _ => Capability::Chat,
    }
}

/// Runner that produces an artifact kind
pub fn artifact_runner(artifact: &str) -> Option<Capability> {
    match artifact {
        "repo_snapshot" => Some(Capability::FetchRepo),
        "diagnosis" => Some(Capability::Diagnosis),
        "overview" => Some(Capability::Overview),
        "comparison" => Some(Capability::Compare),
        _ => None,
    }
}

/// Missing required artifacts that no step of the plan is bound to produce,
/// with the runner that would produce each
pub fn missing_producers(plan: &Plan) -> Vec<(String, Capability)> {
    plan.missing_artifacts()
        .into_iter()
        .filter_map(|artifact| artifact_runner(&artifact).map(|cap| (artifact, cap)))
        .filter(|(_, cap)| !plan.steps.iter().any(|s| s.runner == *cap))
        .collect()
}

/// Failed steps whose error reads as a timeout, in plan order
pub fn timed_out_steps(plan: &Plan) -> Vec<&PlanStep> {
    plan.failed_steps()
        .into_iter()
        .filter(|s| {
            s.error_message
                .as_deref()
                .is_some_and(|e| AskUserCategory::classify(e) == AskUserCategory::Timeout)
        })
        .collect()
}

/// Id of the plan a replan chain started from
pub fn root_plan_id(id: &str) -> &str {
    match id.rsplit_once("_r") {
        Some((root, n)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => root,
        _ => id,
    }
}

/// Produces repaired plans
#[derive(Clone)]
pub struct Replanner {
    config: ReplanConfig,
    sink: SharedSink,
}

impl Replanner {
    pub fn new(config: ReplanConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink),
        }
    }

    /// Report replan events to `sink`
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ReplanConfig {
        &self.config
    }

    /// Whether another replan is allowed for `plan`
    pub fn can_replan(&self, plan: &Plan) -> bool {
        plan.replan_count < self.config.replan_limit()
    }

    /// Repair `plan`, or `None` once the replan budget is spent
    pub fn replan(&self, plan: &Plan, reason: ReplanReason) -> Option<Plan> {
        if !self.can_replan(plan) {
            warn!(
                plan_id = %plan.id,
                attempts = plan.replan_count,
                "Replan budget exhausted"
            );
            self.sink.emit(PlanEvent::new(
                plan.id.clone(),
                PlanEventType::ReplanExhausted,
                json!({"reason": reason, "attempts": plan.replan_count}),
            ));
            return None;
        }

        let new_plan = match reason {
            ReplanReason::ConfidenceLow => {
                self.ask_user_plan(plan, reason, CLARIFICATION_MESSAGE.to_string())
            }
            ReplanReason::StepFailed => self.replace_failed_step(plan, reason),
            ReplanReason::MissingArtifact => self.insert_missing_producers(plan, reason),
            ReplanReason::Timeout => self.relax_timed_out_step(plan, reason),
            ReplanReason::UserRequest => self.default_strategy(plan, reason),
        };

        info!(
            from = %plan.id,
            to = %new_plan.id,
            reason = %reason,
            status = %new_plan.status,
            "Plan replanned"
        );
        self.sink.emit(PlanEvent::new(
            new_plan.id.clone(),
            PlanEventType::Replanned,
            json!({
                "from": plan.id,
                "reason": reason,
                "replan_count": new_plan.replan_count,
                "steps": new_plan.steps.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
            }),
        ));
        Some(new_plan)
    }

    /// Copy of `plan` under a new id with the runtime record inherited
    fn derive(&self, plan: &Plan, reason: ReplanReason) -> Plan {
        let replan_count = plan.replan_count + 1;
        let mut reasoning = plan.reasoning.clone();
        reasoning.push(format!("Replan {} of '{}': {}", replan_count, plan.id, reason));

        Plan {
            id: format!("{}_r{}", root_plan_id(&plan.id), replan_count),
            intent: plan.intent.clone(),
            sub_intent: plan.sub_intent.clone(),
            steps: plan.steps.clone(),
            artifacts_required: plan.artifacts_required.clone(),
            created_at: Utc::now(),
            reasoning,
            status: PlanStatus::Pending,
            step_results: plan.step_results.clone(),
            artifacts_collected: plan.artifacts_collected.clone(),
            execution_order: Vec::new(),
            total_execution_time: Default::default(),
            error_message: None,
            replan_count,
        }
    }

    /// Terminal plan that asks the user for input
    fn ask_user_plan(&self, plan: &Plan, reason: ReplanReason, message: String) -> Plan {
        let mut new_plan = self.derive(plan, reason);
        new_plan.steps.clear();
        new_plan.status = PlanStatus::AskUser;
        new_plan.error_message = Some(message);
        new_plan
    }

    fn first_failed<'a>(&self, plan: &'a Plan) -> Option<&'a PlanStep> {
        plan.failed_steps().into_iter().next()
    }

    /// Ask-user plan carrying the failed step's categorized message
    fn escalate(&self, plan: &Plan, reason: ReplanReason) -> Plan {
        let message = match self.first_failed(plan) {
            Some(step) => {
                ask_user_message(&step.id, step.error_message.as_deref().unwrap_or_default())
            }
            None => CLARIFICATION_MESSAGE.to_string(),
        };
        self.ask_user_plan(plan, reason, message)
    }

    /// USER_REQUEST and unresolvable cases
    fn default_strategy(&self, plan: &Plan, reason: ReplanReason) -> Plan {
        match self.first_failed(plan) {
            Some(step) if step.on_error == ErrorPolicy::Fallback => {
                self.replace_failed_step(plan, reason)
            }
            _ => self.escalate(plan, reason),
        }
    }

    /// Drop the failed step and everything downstream of it, then append one
    /// fallback step depending on every successful step
    fn replace_failed_step(&self, plan: &Plan, reason: ReplanReason) -> Plan {
        let Some(failed) = self.first_failed(plan) else {
            return self.escalate(plan, reason);
        };

        let mut removed: HashSet<String> =
            plan.transitive_dependents(&failed.id).into_iter().collect();
        removed.insert(failed.id.clone());

        let mut new_plan = self.derive(plan, reason);
        new_plan.steps.retain(|s| !removed.contains(&s.id));

        let mut params = carried_params(&failed.params);
        params.insert("fallback".to_string(), Value::Bool(true));
        params.insert("failed_step".to_string(), Value::from(failed.id.clone()));
        params.insert("failed_runner".to_string(), Value::from(failed.runner.as_str()));
        if let Some(error) = &failed.error_message {
            params.insert("failure".to_string(), Value::from(error.clone()));
        }

        let id = unique_id(&new_plan, &format!("{}_fallback", failed.id));
        let runner = fallback_runner(failed.runner);
        let step = PlanStep::new(id.clone(), runner)
            .with_params(params)
            .with_dependencies(new_plan.successful_step_ids())
            .with_policy(ErrorPolicy::AskUser)
            .with_timeout(failed.timeout);
        new_plan.steps.push(step);

        new_plan.reasoning.push(format!(
            "Removed {} step(s) from '{}' onwards; added '{}' ({})",
            removed.len(),
            failed.id,
            id,
            runner
        ));
        new_plan
    }

    /// Insert a producer for each missing artifact no step can provide, ahead
    /// of the failed step, and rerun the failed step after them
    fn insert_missing_producers(&self, plan: &Plan, reason: ReplanReason) -> Plan {
        let Some(failed) = self.first_failed(plan) else {
            return self.escalate(plan, reason);
        };

        let producers = missing_producers(plan);
        if producers.is_empty() {
            debug!(
                plan_id = %plan.id,
                "No missing artifact can be produced; using default strategy"
            );
            return self.default_strategy(plan, reason);
        }

        let failed_id = failed.id.clone();
        let mut new_plan = self.derive(plan, reason);
        let position = new_plan
            .steps
            .iter()
            .position(|s| s.id == failed_id)
            .unwrap_or(new_plan.steps.len());

        let mut inserted = Vec::with_capacity(producers.len());
        for (offset, (artifact, runner)) in producers.into_iter().enumerate() {
            let id = unique_id(&new_plan, &format!("provide_{}", artifact));
            let step = PlanStep::new(id.clone(), runner)
                .with_params(carried_params(&failed.params))
                .with_param("artifact", artifact)
                .with_policy(ErrorPolicy::Retry)
                .with_max_retries(1)
                .with_timeout(failed.timeout);
            new_plan.steps.insert(position + offset, step);
            inserted.push(id);
        }

        if let Some(step) = new_plan.step_mut(&failed_id) {
            step.reset();
            for id in &inserted {
                step.add_dependency(id.clone());
            }
        }
        reset_skipped_dependents(&mut new_plan, &failed_id);

        new_plan
            .reasoning
            .push(format!("Inserted {} ahead of '{}'", inserted.join(", "), failed_id));
        new_plan
    }

    /// Rerun each timed-out step with a longer timeout and lighter
    /// parameters. Without a timed-out step the first failed one is used.
    fn relax_timed_out_step(&self, plan: &Plan, reason: ReplanReason) -> Plan {
        let mut targets: Vec<&PlanStep> = timed_out_steps(plan);
        if targets.is_empty() {
            targets.extend(self.first_failed(plan));
        }
        if targets.is_empty() {
            return self.escalate(plan, reason);
        }

        let relaxed: Vec<(String, Duration)> = targets
            .iter()
            .map(|s| (s.id.clone(), (s.timeout * 2).min(self.config.max_timeout())))
            .collect();
        let mut new_plan = self.derive(plan, reason);
        for (id, timeout) in &relaxed {
            if let Some(step) = new_plan.step_mut(id) {
                step.reset();
                step.timeout = *timeout;
                step.params.retain(|k, _| !EXPENSIVE_PARAM_KEYS.contains(&k.as_str()));
                step.params.insert("simplified".to_string(), Value::Bool(true));
            }
            reset_skipped_dependents(&mut new_plan, id);
            new_plan.reasoning.push(format!(
                "Retrying '{}' simplified with a {}s timeout",
                id,
                timeout.as_secs()
            ));
        }
        new_plan
    }
}

impl Default for Replanner {
    fn default() -> Self {
        Self::new(ReplanConfig::default())
    }
}

impl std::fmt::Debug for Replanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replanner").field("config", &self.config).finish()
    }
}

/// Repository and user context carried into a new step
fn carried_params(params: &Map<String, Value>) -> Map<String, Value> {
    ["repo", "repo_a", "repo_b", "user_context"]
        .into_iter()
        .filter_map(|key| params.get(key).map(|v| (key.to_string(), v.clone())))
        .collect()
}

fn unique_id(plan: &Plan, base: &str) -> String {
    if plan.step(base).is_none() {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|id| plan.step(id).is_none())
        .unwrap_or_else(|| base.to_string())
}

/// Steps skipped only because `id` failed get another chance
fn reset_skipped_dependents(plan: &mut Plan, id: &str) {
    for dependent in plan.transitive_dependents(id) {
        if let Some(step) = plan.step_mut(&dependent)
            && step.status == StepStatus::Skipped
        {
            step.reset();
        }
    }
}
