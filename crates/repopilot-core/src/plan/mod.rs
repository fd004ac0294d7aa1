//! Plan model
//!
//! Pure data: steps, step results, and the plan that owns them, together
//! with their forward-only state machines.

pub mod entity;
pub mod result;
pub mod step;

pub use entity::{Plan, PlanStatus, generate_plan_id};
pub use result::StepResult;
pub use step::{DEADLOCK_REASON, DEFAULT_STEP_TIMEOUT, ErrorPolicy, PlanStep, StepStatus};
