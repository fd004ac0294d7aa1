//! Step results returned by runners

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::step::StepStatus;

/// Outcome of running one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step this result belongs to
    pub step_id: String,
    /// Success or failed
    pub status: StepStatus,
    /// Runner payload
    pub result: Value,
    /// Keys of `result` this step publishes as artifacts
    pub artifacts_out: Vec<String>,
    /// Error text when failed
    pub error_message: Option<String>,
    /// Wall time, filled in by the executor
    pub execution_time: Duration,
}

impl StepResult {
    /// Create a successful result with a payload
    pub fn success(step_id: impl Into<String>, result: Value) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Success,
            result,
            artifacts_out: Vec::new(),
            error_message: None,
            execution_time: Duration::ZERO,
        }
    }

    /// Create a failed result with an error message
    pub fn failure(step_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            result: Value::Null,
            artifacts_out: Vec::new(),
            error_message: Some(error.into()),
            execution_time: Duration::ZERO,
        }
    }

    /// Publish one payload key as an artifact
    pub fn with_artifact(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.artifacts_out.contains(&key) {
            self.artifacts_out.push(key);
        }
        self
    }

    /// Publish several payload keys as artifacts
    pub fn with_artifacts<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            self = self.with_artifact(key);
        }
        self
    }

    /// Set the measured execution time
    pub fn with_execution_time(mut self, elapsed: Duration) -> Self {
        self.execution_time = elapsed;
        self
    }

    /// Whether the runner reported success
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    /// Artifact values named in `artifacts_out` that are present in the payload
    pub fn artifact_values(&self) -> Vec<(String, Value)> {
        self.artifacts_out
            .iter()
            .filter_map(|key| self.result.get(key).map(|v| (key.clone(), v.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_result() {
        let result = StepResult::success("fetch_repo", json!({"repo_snapshot": {"stars": 3}}))
            .with_artifact("repo_snapshot");
        assert!(result.is_success());
        assert_eq!(result.artifacts_out, vec!["repo_snapshot"]);
        assert!(result.error_message.is_none());
    }

    #[test]
    fn test_failure_result() {
        let result = StepResult::failure("fetch_repo", "404 Not Found");
        assert!(!result.is_success());
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("404 Not Found"));
    }

    #[test]
    fn test_artifact_values_skip_missing_keys() {
        let result = StepResult::success("diagnosis", json!({"diagnosis": "ok", "score": 7}))
            .with_artifacts(["diagnosis", "not_there", "diagnosis"]);
        assert_eq!(result.artifacts_out.len(), 2);

        let values = result.artifact_values();
        assert_eq!(values, vec![("diagnosis".to_string(), json!("ok"))]);
    }
}
