//! Runner registry
//!
//! An explicit, per-executor table from capability to runner. Nothing is
//! registered globally; callers build one and hand it to the executor.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Capability, FnRunner, RunnerInputs, StepRunner};
use crate::error::Result;
use crate::plan::{PlanStep, StepResult};

/// Capability → runner table
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<Capability, Arc<dyn StepRunner>>,
}

impl RunnerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner, replacing any previous one for the capability
    pub fn register(
        &mut self,
        capability: Capability,
        runner: impl StepRunner + 'static,
    ) -> &mut Self {
        self.runners.insert(capability, Arc::new(runner));
        self
    }

    /// Register a shared runner
    pub fn register_arc(
        &mut self,
        capability: Capability,
        runner: Arc<dyn StepRunner>,
    ) -> &mut Self {
        self.runners.insert(capability, runner);
        self
    }

    /// Register a synchronous closure
    pub fn register_fn<F>(&mut self, capability: Capability, func: F) -> &mut Self
    where
        F: Fn(&PlanStep, &RunnerInputs) -> Result<StepResult> + Send + Sync + 'static,
    {
        self.register(capability, FnRunner::new(func))
    }

    /// Builder-style registration
    pub fn with(mut self, capability: Capability, runner: impl StepRunner + 'static) -> Self {
        self.register(capability, runner);
        self
    }

    /// Builder-style closure registration
    pub fn with_fn<F>(mut self, capability: Capability, func: F) -> Self
    where
        F: Fn(&PlanStep, &RunnerInputs) -> Result<StepResult> + Send + Sync + 'static,
    {
        self.register_fn(capability, func);
        self
    }

    /// Runner for a capability
    pub fn get(&self, capability: Capability) -> Option<Arc<dyn StepRunner>> {
        self.runners.get(&capability).cloned()
    }

    /// Whether a runner is registered
    pub fn contains(&self, capability: Capability) -> bool {
        self.runners.contains_key(&capability)
    }

    /// Registered capabilities, in declaration order
    pub fn capabilities(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| self.runners.contains_key(c))
            .collect()
    }

    /// Number of registered runners
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    /// Whether no runner is registered
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerRegistry")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}
