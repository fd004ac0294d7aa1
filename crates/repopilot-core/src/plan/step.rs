//! Plan steps and their state machine

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::runner::Capability;

/// Default per-step timeout
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Reason recorded on steps whose dependencies can never complete
pub const DEADLOCK_REASON: &str = "dependencies cannot be satisfied";

/// Status of a plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for dependencies or dispatch
    #[default]
    Pending,
    /// Runner is executing
    Running,
    /// Completed successfully
    Success,
    /// Dependencies can never be satisfied
    Skipped,
    /// Failed after exhausting its error policy
    Failed,
    /// Between two attempts. Attempts run off the plan, so a plan step
    /// never rests here; the executor reports it with a `step_retrying`
    /// event instead.
    Retrying,
}

impl StepStatus {
    /// Success, skipped, or failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped | Self::Failed)
    }

    /// Whether dependents may run after this status
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    /// Forward-only transitions
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::{Failed, Pending, Retrying, Running, Skipped, Success};
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Retrying)
                | (Retrying, Running)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

/// What the executor does once a step has failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Re-run up to `max_retries` times, then fail
    Retry,
    /// Re-run once with simplified parameters
    Fallback,
    /// Escalate to the user with a categorized message
    AskUser,
    /// Fail the step with no further action
    #[default]
    Abort,
}

impl std::fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Fallback => write!(f, "fallback"),
            Self::AskUser => write!(f, "ask_user"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// A unit of work inside a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Unique within the owning plan
    pub id: String,
    /// Capability invoked for this step
    pub runner: Capability,
    /// Runner parameters
    pub params: Map<String, Value>,
    /// Ids of steps this one depends on (ordered, no duplicates)
    pub needs: Vec<String>,
    /// Error policy
    pub on_error: ErrorPolicy,
    /// Per-step timeout
    pub timeout: Duration,
    /// Extra attempts allowed under the retry policy
    pub max_retries: u32,

    // Runtime fields
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub execution_time: Duration,
}

impl PlanStep {
    /// Create a pending step with default policy and timeout
    pub fn new(id: impl Into<String>, runner: Capability) -> Self {
        Self {
            id: id.into(),
            runner,
            params: Map::new(),
            needs: Vec::new(),
            on_error: ErrorPolicy::default(),
            timeout: DEFAULT_STEP_TIMEOUT,
            max_retries: 0,
            status: StepStatus::Pending,
            result: None,
            error_message: None,
            retry_count: 0,
            execution_time: Duration::ZERO,
        }
    }

    /// Set a single parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Replace all parameters
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Add a dependency, ignoring duplicates
    pub fn with_dependency(mut self, step_id: impl Into<String>) -> Self {
        self.add_dependency(step_id);
        self
    }

    /// Add several dependencies
    pub fn with_dependencies<I, S>(mut self, step_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in step_ids {
            self.add_dependency(id);
        }
        self
    }

    /// Set the error policy
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set max retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Push a dependency if not already present
    pub fn add_dependency(&mut self, step_id: impl Into<String>) {
        let step_id = step_id.into();
        if !self.needs.contains(&step_id) {
            self.needs.push(step_id);
        }
    }

    /// Move to `next`, rejecting backward transitions
    pub fn transition(&mut self, next: StepStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Mark skipped with a reason
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(StepStatus::Skipped)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// Clear runtime fields so the step can run in a fresh plan.
    ///
    /// Only the replanner calls this, on steps it copies into a new plan.
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.result = None;
        self.error_message = None;
        self.retry_count = 0;
        self.execution_time = Duration::ZERO;
    }

    /// Skipped because its dependencies could never complete
    pub fn is_deadlocked(&self) -> bool {
        self.status == StepStatus::Skipped && self.error_message.as_deref() == Some(DEADLOCK_REASON)
    }

    /// Whether this step is terminal
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Timeout in whole seconds
    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    /// Read a boolean parameter (absent means false)
    pub fn flag(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_defaults() {
        let step = PlanStep::new("chat", Capability::Chat);
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.on_error, ErrorPolicy::Abort);
        assert_eq!(step.timeout, DEFAULT_STEP_TIMEOUT);
        assert!(step.needs.is_empty());
    }

    #[test]
    fn test_dependencies_are_an_ordered_set() {
        let step = PlanStep::new("compare", Capability::Compare)
            .with_dependency("fetch_repo_a")
            .with_dependencies(["fetch_repo_b", "fetch_repo_a"]);
        assert_eq!(step.needs, vec!["fetch_repo_a", "fetch_repo_b"]);
    }

    #[test]
    fn test_forward_transitions() {
        let mut step = PlanStep::new("a", Capability::Chat);
        step.transition(StepStatus::Running).unwrap();
        step.transition(StepStatus::Retrying).unwrap();
        step.transition(StepStatus::Running).unwrap();
        step.transition(StepStatus::Success).unwrap();
        assert!(step.is_terminal());
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut step = PlanStep::new("a", Capability::Chat);
        step.transition(StepStatus::Running).unwrap();
        step.transition(StepStatus::Failed).unwrap();

        let err = step.transition(StepStatus::Running).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[test]
    fn test_skip_only_from_pending() {
        let mut step = PlanStep::new("a", Capability::Chat);
        step.skip(DEADLOCK_REASON).unwrap();
        assert_eq!(step.status, StepStatus::Skipped);
        assert!(step.is_deadlocked());

        let mut running = PlanStep::new("b", Capability::Chat);
        running.transition(StepStatus::Running).unwrap();
        assert!(running.skip("nope").is_err());

        let mut cancelled = PlanStep::new("c", Capability::Chat);
        cancelled.skip("execution cancelled").unwrap();
        assert!(!cancelled.is_deadlocked());
    }

    #[test]
    fn test_reset_clears_runtime_fields() {
        let mut step = PlanStep::new("a", Capability::Chat);
        step.transition(StepStatus::Running).unwrap();
        step.transition(StepStatus::Failed).unwrap();
        step.error_message = Some("boom".into());
        step.retry_count = 2;

        step.reset();
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.error_message.is_none());
        assert_eq!(step.retry_count, 0);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&StepStatus::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
        let policy: ErrorPolicy = serde_json::from_str("\"ask_user\"").unwrap();
        assert_eq!(policy, ErrorPolicy::AskUser);
    }
}
