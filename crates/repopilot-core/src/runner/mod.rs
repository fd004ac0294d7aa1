//! Step runners - the capability contract between the engine and its workers
//!
//! A runner receives the step and a read-only snapshot of its inputs and
//! returns a [`StepResult`]. Runners never touch the plan or the execution
//! context directly; the executor applies their results.

pub mod registry;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::plan::{PlanStep, StepResult};

pub use registry::RunnerRegistry;

/// Capabilities a step can be bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FetchRepo,
    Diagnosis,
    Compare,
    Overview,
    Onboarding,
    Followup,
    Chat,
    Smalltalk,
    Help,
}

impl Capability {
    /// Every supported capability
    pub const ALL: [Capability; 9] = [
        Self::FetchRepo,
        Self::Diagnosis,
        Self::Compare,
        Self::Overview,
        Self::Onboarding,
        Self::Followup,
        Self::Chat,
        Self::Smalltalk,
        Self::Help,
    ];

    /// Registry name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchRepo => "fetch_repo",
            Self::Diagnosis => "diagnosis",
            Self::Compare => "compare",
            Self::Overview => "overview",
            Self::Onboarding => "onboarding",
            Self::Followup => "followup",
            Self::Chat => "chat",
            Self::Smalltalk => "smalltalk",
            Self::Help => "help",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| {
                let supported: Vec<&str> = Self::ALL.iter().map(Capability::as_str).collect();
                Error::UnknownCapability(s.to_string(), supported.join(", "))
            })
    }
}

/// Read-only bundle handed to a runner
#[derive(Debug, Clone, Default)]
pub struct RunnerInputs {
    /// The step's parameters
    pub params: Map<String, Value>,
    /// Caller-supplied external state
    pub state: Value,
    /// Artifacts published so far
    pub artifacts: HashMap<String, Value>,
    /// Payloads of steps that succeeded so far
    pub step_outputs: HashMap<String, Value>,
}

impl RunnerInputs {
    /// Look up an artifact
    pub fn artifact(&self, key: &str) -> Option<&Value> {
        self.artifacts.get(key)
    }

    /// Look up an upstream step's output
    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.step_outputs.get(step_id)
    }

    /// String parameter
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// A worker that executes one kind of step
///
/// Implementations should check `cancel` at their await points; the executor
/// cancels it when a step exceeds its timeout. Blocking work that never
/// yields can only be abandoned, not stopped.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run the step. An `Err` and a failed [`StepResult`] are treated alike.
    async fn run(
        &self,
        step: &PlanStep,
        inputs: RunnerInputs,
        cancel: CancellationToken,
    ) -> Result<StepResult>;
}

/// Adapter turning a synchronous closure into a [`StepRunner`]
///
/// The closure runs on tokio's blocking pool, so a slow closure never stalls
/// the executor's timeout. Past its deadline it is abandoned, not stopped.
pub struct FnRunner<F> {
    func: Arc<F>,
}

impl<F> FnRunner<F>
where
    F: Fn(&PlanStep, &RunnerInputs) -> Result<StepResult> + Send + Sync + 'static,
{
    /// Wrap a closure
    pub fn new(func: F) -> Self {
        Self { func: Arc::new(func) }
    }
}

#[async_trait]
impl<F> StepRunner for FnRunner<F>
where
    F: Fn(&PlanStep, &RunnerInputs) -> Result<StepResult> + Send + Sync + 'static,
{
    async fn run(
        &self,
        step: &PlanStep,
        inputs: RunnerInputs,
        cancel: CancellationToken,
    ) -> Result<StepResult> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let func = Arc::clone(&self.func);
        let step = step.clone();
        let step_id = step.id.clone();
        tokio::task::spawn_blocking(move || func(&step, &inputs))
            .await
            .map_err(|e| Error::step(&step_id, format!("Task join error: {}", e)))?
    }
}
