//! Repopilot Core Library
//!
//! This crate provides the plan engine behind Repopilot's repository
//! analysis assistant, including:
//! - Plan model (steps, results, status state machines)
//! - Plan builder (intent templates and parameter injection)
//! - Plan executor (dependency ordering, bounded parallelism, error policies)
//! - Replanner (reason-specific repair with a bounded budget)
//! - Runner registry (pluggable step capabilities)
//! - Lifecycle events and configuration

pub mod plan;
pub mod runner;
pub mod builder;
pub mod executor;
pub mod replanner;
pub mod escalation;
pub mod engine;
pub mod events;
pub mod config;
pub mod error;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::builder::{PlanBuilder, PlanContext};
    pub use crate::config::EngineConfig;
    pub use crate::engine::{EngineOutcome, PlanEngine};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventSink, MemoryEventSink, PlanEvent, PlanEventType};
    pub use crate::executor::PlanExecutor;
    pub use crate::plan::{ErrorPolicy, Plan, PlanStatus, PlanStep, StepResult, StepStatus};
    pub use crate::replanner::{ReplanReason, Replanner};
    pub use crate::runner::{Capability, RunnerInputs, RunnerRegistry, StepRunner};
}
