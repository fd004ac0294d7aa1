//! Plan entity: an owned DAG of steps plus its runtime record

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::result::StepResult;
use super::step::{PlanStep, StepStatus};
use crate::error::{Error, Result};

/// Length of the hex plan id
const PLAN_ID_LEN: usize = 12;

/// Status of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    Running,
    Success,
    Partial,
    Failed,
    Aborted,
    AskUser,
}

impl PlanStatus {
    /// Whether the plan has finished
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Forward-only transitions. A plan may be created directly in a
    /// terminal ask-user or aborted state.
    pub fn can_transition_to(&self, next: PlanStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::AskUser | Self::Aborted),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
            Self::AskUser => write!(f, "ask_user"),
        }
    }
}

/// Short hash of intent, sub-intent and a timestamp
pub fn generate_plan_id(intent: &str, sub_intent: &str, at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(intent.as_bytes());
    hasher.update(b".");
    hasher.update(sub_intent.as_bytes());
    hasher.update(b"@");
    hasher.update(at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..PLAN_ID_LEN].to_string()
}

/// A directed acyclic graph of steps built for one intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub intent: String,
    pub sub_intent: String,
    /// Steps in template order
    pub steps: Vec<PlanStep>,
    /// Artifacts the plan is expected to produce
    pub artifacts_required: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Builder reasoning, for display only
    #[serde(default)]
    pub reasoning: Vec<String>,

    // Runtime fields
    #[serde(default)]
    pub status: PlanStatus,
    #[serde(default)]
    pub step_results: HashMap<String, StepResult>,
    #[serde(default)]
    pub artifacts_collected: HashMap<String, Value>,
    #[serde(default)]
    pub execution_order: Vec<String>,
    #[serde(default)]
    pub total_execution_time: Duration,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub replan_count: u32,
}

impl Plan {
    /// Create a pending plan with a generated id
    pub fn new(
        intent: impl Into<String>,
        sub_intent: impl Into<String>,
        steps: Vec<PlanStep>,
    ) -> Self {
        let intent = intent.into();
        let sub_intent = sub_intent.into();
        let created_at = Utc::now();
        Self {
            id: generate_plan_id(&intent, &sub_intent, created_at),
            intent,
            sub_intent,
            steps,
            artifacts_required: Vec::new(),
            created_at,
            reasoning: Vec::new(),
            status: PlanStatus::Pending,
            step_results: HashMap::new(),
            artifacts_collected: HashMap::new(),
            execution_order: Vec::new(),
            total_execution_time: Duration::ZERO,
            error_message: None,
            replan_count: 0,
        }
    }

    /// Declare required artifacts
    pub fn with_artifacts_required<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts_required.extend(keys.into_iter().map(Into::into));
        self
    }

    /// `intent.sub_intent`
    pub fn key(&self) -> String {
        format!("{}.{}", self.intent, self.sub_intent)
    }

    /// Get step by id
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Get mutable step by id
    pub fn step_mut(&mut self, id: &str) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Move the plan to `next`, rejecting backward transitions
    pub fn transition(&mut self, next: PlanStatus) -> Result<()> {
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

    fn status_of(&self, id: &str) -> Option<StepStatus> {
        self.step(id).map(|s| s.status)
    }

    /// Pending steps whose dependencies are all success or skipped
    pub fn ready_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .filter(|s| {
                s.needs.iter().all(|dep| {
                    self.status_of(dep)
                        .map(|st| st.satisfies_dependents())
                        .unwrap_or(false)
                })
            })
            .collect()
    }

    /// All pending steps
    pub fn pending_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .collect()
    }

    /// All failed steps
    pub fn failed_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .collect()
    }

    /// Ids of successful steps, in plan order
    pub fn successful_step_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Success)
            .map(|s| s.id.clone())
            .collect()
    }

    /// True once every step is success, skipped or failed
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(PlanStep::is_terminal)
    }

    /// Terminal status implied by the step outcomes.
    ///
    /// A step skipped by deadlock never did its work, so it keeps the plan
    /// from succeeding.
    pub fn resolve_status(&self, ask_user: bool) -> PlanStatus {
        if ask_user {
            PlanStatus::AskUser
        } else if self
            .steps
            .iter()
            .all(|s| s.status.satisfies_dependents() && !s.is_deadlocked())
        {
            PlanStatus::Success
        } else if self.steps.iter().any(|s| s.status == StepStatus::Success) {
            PlanStatus::Partial
        } else {
            PlanStatus::Failed
        }
    }

    /// Steps that depend on `id`, directly or transitively, in plan order
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            for dep in &step.needs {
                reverse.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            for &child in reverse.get(current).map(Vec::as_slice).unwrap_or_default() {
                if child != id && seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }

        self.steps
            .iter()
            .filter(|s| seen.contains(s.id.as_str()))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Required artifacts not collected yet
    pub fn missing_artifacts(&self) -> Vec<String> {
        self.artifacts_required
            .iter()
            .filter(|key| !self.artifacts_collected.contains_key(*key))
            .cloned()
            .collect()
    }

    /// Check ids are unique, dependencies exist, and the graph is acyclic
    pub fn validate(&self) -> Result<()> {
        let mut ids: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(Error::DuplicateStepId(step.id.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.needs {
                if !ids.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        match self.find_cycle() {
            Some(cycle) => Err(Error::CyclicDependency(cycle)),
            None => Ok(()),
        }
    }

    /// Depth-first search for a back edge; returns the cycle path
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let index: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let mut marks = vec![Mark::Unvisited; self.steps.len()];
        let mut path: Vec<usize> = Vec::new();

        fn visit(
            node: usize,
            plan: &Plan,
            index: &HashMap<&str, usize>,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<String>> {
            marks[node] = Mark::InProgress;
            path.push(node);
            for dep in &plan.steps[node].needs {
                let Some(&next) = index.get(dep.as_str()) else {
                    continue;
                };
                match marks[next] {
                    Mark::InProgress => {
                        let start = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..]
                            .iter()
                            .map(|&n| plan.steps[n].id.clone())
                            .collect();
                        cycle.push(plan.steps[next].id.clone());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        if let Some(cycle) = visit(next, plan, index, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[node] = Mark::Done;
            None
        }

        for start in 0..self.steps.len() {
            if marks[start] == Mark::Unvisited
                && let Some(cycle) = visit(start, self, &index, &mut marks, &mut path)
            {
                return Some(cycle);
            }
        }
        None
    }

    /// One-line description for logs
    pub fn summary(&self) -> String {
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();
        format!(
            "plan {} [{}] {}: {} steps ({} success, {} failed, {} skipped, {} pending)",
            self.id,
            self.key(),
            self.status,
            self.steps.len(),
            count(StepStatus::Success),
            count(StepStatus::Failed),
            count(StepStatus::Skipped),
            count(StepStatus::Pending),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::DEADLOCK_REASON;
    use crate::runner::Capability;

    fn compare_plan() -> Plan {
        Plan::new(
            "analyze",
            "compare",
            vec![
                PlanStep::new("fetch_repo_a", Capability::FetchRepo),
                PlanStep::new("fetch_repo_b", Capability::FetchRepo),
                PlanStep::new("compare", Capability::Compare)
                    .with_dependencies(["fetch_repo_a", "fetch_repo_b"]),
                PlanStep::new("summary", Capability::Chat).with_dependency("compare"),
            ],
        )
    }

    fn set_status(plan: &mut Plan, id: &str, status: StepStatus) {
        plan.step_mut(id).unwrap().status = status;
    }

    #[test]
    fn test_plan_id_is_short_hex() {
        let plan = compare_plan();
        assert_eq!(plan.id.len(), PLAN_ID_LEN);
        assert!(plan.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_plan_id_is_deterministic_for_same_instant() {
        let at = Utc::now();
        assert_eq!(
            generate_plan_id("analyze", "compare", at),
            generate_plan_id("analyze", "compare", at)
        );
        assert_ne!(
            generate_plan_id("analyze", "compare", at),
            generate_plan_id("analyze", "overview", at)
        );
    }

    #[test]
    fn test_ready_steps_follow_dependencies() {
        let mut plan = compare_plan();
        let ready: Vec<&str> = plan.ready_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["fetch_repo_a", "fetch_repo_b"]);

        set_status(&mut plan, "fetch_repo_a", StepStatus::Success);
        set_status(&mut plan, "fetch_repo_b", StepStatus::Skipped);
        let ready: Vec<&str> = plan.ready_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["compare"]);
    }

    #[test]
    fn test_failed_dependency_blocks_readiness() {
        let mut plan = compare_plan();
        set_status(&mut plan, "fetch_repo_a", StepStatus::Success);
        set_status(&mut plan, "fetch_repo_b", StepStatus::Failed);
        assert!(plan.ready_steps().is_empty());
        assert!(!plan.is_complete());
    }

    #[test]
    fn test_resolve_status() {
        let mut plan = compare_plan();
        for id in ["fetch_repo_a", "fetch_repo_b", "compare", "summary"] {
            set_status(&mut plan, id, StepStatus::Success);
        }
        assert_eq!(plan.resolve_status(false), PlanStatus::Success);
        assert_eq!(plan.resolve_status(true), PlanStatus::AskUser);

        set_status(&mut plan, "summary", StepStatus::Failed);
        assert_eq!(plan.resolve_status(false), PlanStatus::Partial);

        for id in ["fetch_repo_a", "fetch_repo_b", "compare"] {
            set_status(&mut plan, id, StepStatus::Skipped);
        }
        assert_eq!(plan.resolve_status(false), PlanStatus::Failed);
    }

    #[test]
    fn test_deadlocked_step_prevents_success() {
        let mut plan = compare_plan();
        for id in ["fetch_repo_a", "fetch_repo_b", "compare"] {
            set_status(&mut plan, id, StepStatus::Success);
        }
        plan.step_mut("summary").unwrap().skip(DEADLOCK_REASON).unwrap();
        assert_eq!(plan.resolve_status(false), PlanStatus::Partial);

        let mut orphan = Plan::new(
            "chat",
            "general",
            vec![PlanStep::new("orphan", Capability::Chat).with_dependency("missing_id")],
        );
        orphan.steps[0].skip(DEADLOCK_REASON).unwrap();
        assert_eq!(orphan.resolve_status(false), PlanStatus::Failed);
    }

    #[test]
    fn test_transitive_dependents() {
        let plan = compare_plan();
        assert_eq!(plan.transitive_dependents("fetch_repo_b"), vec!["compare", "summary"]);
        assert_eq!(plan.transitive_dependents("compare"), vec!["summary"]);
        assert!(plan.transitive_dependents("summary").is_empty());
    }

    #[test]
    fn test_validate_accepts_dag() {
        assert!(compare_plan().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let plan = Plan::new(
            "t",
            "t",
            vec![PlanStep::new("a", Capability::Chat).with_dependency("missing_id")],
        );
        assert!(matches!(plan.validate(), Err(Error::UnknownDependency { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let plan = Plan::new(
            "t",
            "t",
            vec![
                PlanStep::new("a", Capability::Chat),
                PlanStep::new("a", Capability::Help),
            ],
        );
        assert!(matches!(plan.validate(), Err(Error::DuplicateStepId(id)) if id == "a"));
    }

    #[test]
    fn test_validate_reports_cycle_path() {
        let plan = Plan::new(
            "t",
            "t",
            vec![
                PlanStep::new("a", Capability::Chat).with_dependency("c"),
                PlanStep::new("b", Capability::Chat).with_dependency("a"),
                PlanStep::new("c", Capability::Chat).with_dependency("b"),
            ],
        );
        match plan.validate() {
            Err(Error::CyclicDependency(cycle)) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_transitions() {
        let mut plan = compare_plan();
        plan.transition(PlanStatus::Running).unwrap();
        plan.transition(PlanStatus::Partial).unwrap();
        assert!(plan.transition(PlanStatus::Running).is_err());
    }

    #[test]
    fn test_missing_artifacts() {
        let mut plan = compare_plan().with_artifacts_required(["comparison", "repo_snapshot"]);
        plan.artifacts_collected
            .insert("repo_snapshot".into(), serde_json::json!({}));
        assert_eq!(plan.missing_artifacts(), vec!["comparison"]);
    }

    #[test]
    fn test_summary_mentions_counts() {
        let plan = compare_plan();
        let summary = plan.summary();
        assert!(summary.contains("analyze.compare"));
        assert!(summary.contains("4 steps"));
        assert!(summary.contains("4 pending"));
    }
}
