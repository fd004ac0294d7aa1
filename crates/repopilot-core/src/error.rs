//! Error types for Repopilot

use thiserror::Error;

/// Result type alias using Repopilot's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Repopilot error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Runner errors (E001-E099)
    #[error("Unknown runner capability '{0}'. Supported: {1}")]
    UnknownCapability(String, String),

    #[error("No runner registered for capability '{0}'")]
    RunnerNotRegistered(String),

    #[error("Step '{step_id}' failed: {message}")]
    StepExecution { step_id: String, message: String },

    #[error("Step '{step_id}' timed out after {secs} seconds")]
    StepTimeout { step_id: String, secs: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    // Plan graph errors (E100-E199)
    #[error("Duplicate step id '{0}' in plan")]
    DuplicateStepId(String),

    #[error("Step '{step_id}' depends on unknown step '{dependency}'")]
    UnknownDependency { step_id: String, dependency: String },

    #[error("Dependency cycle detected between steps: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Invalid status transition for '{id}': {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    // Planning errors (E200-E299)
    #[error("Replanning exhausted for plan '{plan_id}' after {attempts} attempts")]
    ReplanExhausted { plan_id: String, attempts: u32 },

    #[error("No plan template for '{0}'")]
    TemplateNotFound(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a step execution error
    pub fn step(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step_id: step_id.into(),
            message: message.into(),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownCapability(..) => "E001",
            Self::RunnerNotRegistered(_) => "E002",
            Self::StepExecution { .. } => "E003",
            Self::StepTimeout { .. } => "E004",
            Self::Cancelled => "E005",
            Self::DuplicateStepId(_) => "E100",
            Self::UnknownDependency { .. } => "E101",
            Self::CyclicDependency(_) => "E102",
            Self::InvalidTransition { .. } => "E103",
            Self::ReplanExhausted { .. } => "E200",
            Self::TemplateNotFound(_) => "E201",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E800",
            Self::Serialization(_) => "E900",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::RunnerNotRegistered(name) => {
                Some(format!("Register a runner for '{}' with RunnerRegistry::register", name))
            }
            Self::StepTimeout { secs, .. } => {
                Some(format!("Raise the step timeout above {} seconds", secs))
            }
            Self::CyclicDependency(_) => {
                Some("Remove one of the `needs` edges in the cycle".to_string())
            }
            Self::UnknownDependency { dependency, .. } => {
                Some(format!("Add a step with id '{}' or drop the dependency", dependency))
            }
            Self::TemplateNotFound(_) => Some("PlanBuilder::supported_keys()".to_string()),
            _ => None,
        }
    }

    /// Whether this error represents a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::StepTimeout { .. })
    }
}
