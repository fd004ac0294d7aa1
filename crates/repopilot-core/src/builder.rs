//! Plan builder - turns an intent into a pending plan
//!
//! Plans come from a closed, compile-time table of templates keyed by
//! `intent.sub_intent`. The builder clones the matching template, injects
//! the repository and user context into every step, validates the graph and
//! records a short reasoning trace. It never fails: an unknown key or an
//! invalid template yields a single generic chat step.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::events::{PlanEvent, PlanEventType, SharedSink, TracingSink};
use crate::plan::{ErrorPolicy, Plan, PlanStep};
use crate::runner::Capability;

/// Step id used by the generic fallback plan
pub const FALLBACK_STEP_ID: &str = "respond";

/// Default parameter value in a template
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Str(&'static str),
}

impl From<ParamValue> for Value {
    fn from(value: ParamValue) -> Self {
        match value {
            ParamValue::Bool(b) => Value::Bool(b),
            ParamValue::Int(i) => Value::from(i),
            ParamValue::Str(s) => Value::from(s),
        }
    }
}

/// Which repository a templated step is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoBinding {
    /// `repo` is the primary repository
    Primary,
    /// `repo` is the comparison repository
    Compare,
    /// `repo` plus `repo_a`/`repo_b` for both sides of a comparison
    Both,
}

/// One step of a template
#[derive(Debug, Clone, Copy)]
pub struct StepTemplate {
    pub id: &'static str,
    pub runner: Capability,
    pub params: &'static [(&'static str, ParamValue)],
    pub needs: &'static [&'static str],
    pub on_error: ErrorPolicy,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub repo: RepoBinding,
}

/// A plan template
#[derive(Debug, Clone, Copy)]
pub struct PlanTemplate {
    /// `intent.sub_intent`
    pub key: &'static str,
    pub steps: &'static [StepTemplate],
    pub artifacts_required: &'static [&'static str],
}

const fn step(id: &'static str, runner: Capability) -> StepTemplate {
    StepTemplate {
        id,
        runner,
        params: &[],
        needs: &[],
        on_error: ErrorPolicy::Abort,
        timeout_secs: 30,
        max_retries: 0,
        repo: RepoBinding::Primary,
    }
}

static TEMPLATES: &[PlanTemplate] = &[
    PlanTemplate {
        key: "analyze.diagnosis",
        steps: &[
            StepTemplate {
                on_error: ErrorPolicy::Retry,
                max_retries: 2,
                params: &[("include_dependencies", ParamValue::Bool(true))],
                ..step("fetch_repo", Capability::FetchRepo)
            },
            StepTemplate {
                needs: &["fetch_repo"],
                on_error: ErrorPolicy::Fallback,
                timeout_secs: 60,
                params: &[
                    ("deep_analysis", ParamValue::Bool(true)),
                    ("include_history", ParamValue::Bool(true)),
                    ("max_commits", ParamValue::Int(200)),
                ],
                ..step("diagnosis", Capability::Diagnosis)
            },
        ],
        artifacts_required: &["repo_snapshot", "diagnosis"],
    },
    PlanTemplate {
        key: "analyze.compare",
        steps: &[
            StepTemplate {
                on_error: ErrorPolicy::Fallback,
                params: &[("include_contributors", ParamValue::Bool(true))],
                ..step("fetch_repo_a", Capability::FetchRepo)
            },
            StepTemplate {
                on_error: ErrorPolicy::Fallback,
                params: &[("include_contributors", ParamValue::Bool(true))],
                repo: RepoBinding::Compare,
                ..step("fetch_repo_b", Capability::FetchRepo)
            },
            StepTemplate {
                needs: &["fetch_repo_a", "fetch_repo_b"],
                on_error: ErrorPolicy::AskUser,
                timeout_secs: 60,
                repo: RepoBinding::Both,
                ..step("compare", Capability::Compare)
            },
        ],
        artifacts_required: &["comparison"],
    },
    PlanTemplate {
        key: "analyze.overview",
        steps: &[
            StepTemplate {
                on_error: ErrorPolicy::Retry,
                max_retries: 1,
                ..step("fetch_repo", Capability::FetchRepo)
            },
            StepTemplate {
                needs: &["fetch_repo"],
                on_error: ErrorPolicy::Fallback,
                params: &[("max_files", ParamValue::Int(50))],
                ..step("overview", Capability::Overview)
            },
        ],
        artifacts_required: &["repo_snapshot", "overview"],
    },
    PlanTemplate {
        key: "analyze.onboarding",
        steps: &[
            StepTemplate {
                on_error: ErrorPolicy::Retry,
                max_retries: 1,
                ..step("fetch_repo", Capability::FetchRepo)
            },
            StepTemplate {
                needs: &["fetch_repo"],
                on_error: ErrorPolicy::Fallback,
                timeout_secs: 60,
                ..step("diagnosis", Capability::Diagnosis)
            },
            StepTemplate {
                needs: &["diagnosis"],
                on_error: ErrorPolicy::Fallback,
                params: &[("experience_level", ParamValue::Str("beginner"))],
                ..step("onboarding", Capability::Onboarding)
            },
        ],
        artifacts_required: &["repo_snapshot", "diagnosis"],
    },
    PlanTemplate {
        key: "followup.explain",
        steps: &[StepTemplate {
            on_error: ErrorPolicy::AskUser,
            ..step("followup", Capability::Followup)
        }],
        artifacts_required: &[],
    },
    PlanTemplate {
        key: "chat.general",
        steps: &[StepTemplate {
            on_error: ErrorPolicy::Retry,
            max_retries: 1,
            ..step("chat", Capability::Chat)
        }],
        artifacts_required: &[],
    },
    PlanTemplate {
        key: "chat.smalltalk",
        steps: &[StepTemplate {
            timeout_secs: 10,
            ..step("smalltalk", Capability::Smalltalk)
        }],
        artifacts_required: &[],
    },
    PlanTemplate {
        key: "meta.help",
        steps: &[StepTemplate {
            timeout_secs: 10,
            ..step("help", Capability::Help)
        }],
        artifacts_required: &[],
    },
];

/// Caller-supplied values injected into a plan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanContext {
    /// Primary repository, `owner/name`
    pub repo: Option<String>,
    /// Free-form user context
    pub user_context: Option<Value>,
    /// Second repository for comparisons
    pub compare_repo: Option<String>,
}

impl PlanContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn with_compare_repo(mut self, repo: impl Into<String>) -> Self {
        self.compare_repo = Some(repo.into());
        self
    }

    pub fn with_user_context(mut self, context: Value) -> Self {
        self.user_context = Some(context);
        self
    }

    fn repo_value(&self) -> Value {
        self.repo.clone().map(Value::String).unwrap_or(Value::Null)
    }

    fn compare_repo_value(&self) -> Value {
        self.compare_repo.clone().map(Value::String).unwrap_or(Value::Null)
    }
}

/// Builds plans from the template table
#[derive(Clone)]
pub struct PlanBuilder {
    sink: SharedSink,
    default_timeout: Duration,
}

impl PlanBuilder {
    /// Builder reporting to the tracing sink
    pub fn new() -> Self {
        Self {
            sink: Arc::new(TracingSink),
            default_timeout: crate::plan::DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Report plan-built events to `sink`
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Timeout of the generic fallback step
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Keys of every known template
    pub fn supported_keys() -> Vec<&'static str> {
        TEMPLATES.iter().map(|t| t.key).collect()
    }

    /// Template for `intent.sub_intent`
    pub fn template(key: &str) -> Option<&'static PlanTemplate> {
        TEMPLATES.iter().find(|t| t.key == key)
    }

    /// Build a pending plan for an intent
    pub fn build(&self, intent: &str, sub_intent: &str, context: &PlanContext) -> Plan {
        let key = format!("{}.{}", intent, sub_intent);
        let plan = match Self::template(&key) {
            Some(template) => self.from_template(intent, sub_intent, template, context),
            None => {
                debug!(key = %key, "No plan template matched");
                let mut plan = self.fallback_plan(intent, sub_intent, context);
                plan.reasoning.insert(
                    0,
                    format!("No template for '{}'; using a single generic step", key),
                );
                plan
            }
        };

        info!(
            plan_id = %plan.id,
            key = %key,
            steps = plan.steps.len(),
            "Plan built"
        );
        self.sink.emit(PlanEvent::new(
            plan.id.clone(),
            PlanEventType::PlanBuilt,
            json!({
                "key": key,
                "steps": plan.steps.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
                "artifacts_required": plan.artifacts_required,
                "reasoning": plan.reasoning,
            }),
        ));
        plan
    }

    pub(crate) fn from_template(
        &self,
        intent: &str,
        sub_intent: &str,
        template: &PlanTemplate,
        context: &PlanContext,
    ) -> Plan {
        let mut reasoning = vec![format!(
            "Matched template '{}' with {} steps",
            template.key,
            template.steps.len()
        )];

        let steps: Vec<PlanStep> = template
            .steps
            .iter()
            .map(|t| instantiate(t, context))
            .collect();

        match &context.repo {
            Some(repo) => reasoning.push(format!("Injected repo '{}' into every step", repo)),
            None => reasoning.push("No repository in context".to_string()),
        }
        if let Some(compare) = &context.compare_repo {
            let bound: Vec<&str> = template
                .steps
                .iter()
                .filter(|t| t.repo != RepoBinding::Primary)
                .map(|t| t.id)
                .collect();
            if !bound.is_empty() {
                reasoning.push(format!(
                    "Bound comparison repo '{}' to {}",
                    compare,
                    bound.join(", ")
                ));
            }
        }
        if context.user_context.is_some() {
            reasoning.push("Attached user context".to_string());
        }

        let mut plan = Plan::new(intent, sub_intent, steps)
            .with_artifacts_required(template.artifacts_required.iter().copied());

        if let Err(e) = plan.validate() {
            warn!(key = %template.key, error = %e, "Template produced an invalid plan");
            let mut fallback = self.fallback_plan(intent, sub_intent, context);
            fallback.reasoning.insert(
                0,
                format!("Template '{}' rejected: {}; using a single generic step", template.key, e),
            );
            return fallback;
        }

        plan.reasoning = reasoning;
        plan
    }

    /// Single generic chat step that aborts on failure
    pub fn fallback_plan(&self, intent: &str, sub_intent: &str, context: &PlanContext) -> Plan {
        let mut params = Map::new();
        params.insert("repo".to_string(), context.repo_value());
        params.insert(
            "user_context".to_string(),
            context.user_context.clone().unwrap_or(Value::Null),
        );
        params.insert("intent".to_string(), Value::from(format!("{}.{}", intent, sub_intent)));

        let step = PlanStep::new(FALLBACK_STEP_ID, Capability::Chat)
            .with_params(params)
            .with_policy(ErrorPolicy::Abort)
            .with_timeout(self.default_timeout);

        let mut plan = Plan::new(intent, sub_intent, vec![step]);
        plan.reasoning.push("Generic step aborts on failure".to_string());
        plan
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PlanBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanBuilder")
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

fn instantiate(template: &StepTemplate, context: &PlanContext) -> PlanStep {
    let mut params: Map<String, Value> = template
        .params
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect();

    let repo = match template.repo {
        RepoBinding::Compare => context.compare_repo_value(),
        RepoBinding::Primary | RepoBinding::Both => context.repo_value(),
    };
    params.insert("repo".to_string(), repo);
    if template.repo == RepoBinding::Both {
        params.insert("repo_a".to_string(), context.repo_value());
        params.insert("repo_b".to_string(), context.compare_repo_value());
    }
    params.insert(
        "user_context".to_string(),
        context.user_context.clone().unwrap_or(Value::Null),
    );

    PlanStep::new(template.id, template.runner)
        .with_params(params)
        .with_dependencies(template.needs.iter().copied())
        .with_policy(template.on_error)
        .with_timeout(Duration::from_secs(template.timeout_secs))
        .with_max_retries(template.max_retries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::plan::{PlanStatus, StepStatus};

    fn compare_context() -> PlanContext {
        PlanContext::new().with_repo("a/b").with_compare_repo("c/d")
    }

    #[test]
    fn test_all_templates_validate() {
        let builder = PlanBuilder::new();
        for key in PlanBuilder::supported_keys() {
            let (intent, sub) = key.split_once('.').unwrap();
            let plan = builder.build(intent, sub, &compare_context());
            assert!(plan.validate().is_ok(), "{} invalid", key);
            assert_ne!(plan.steps[0].id, FALLBACK_STEP_ID, "{} fell back", key);
        }
    }

    #[test]
    fn test_compare_plan_shape() {
        let plan = PlanBuilder::new().build("analyze", "compare", &compare_context());
        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["fetch_repo_a", "fetch_repo_b", "compare"]);

        let a = plan.step("fetch_repo_a").unwrap();
        let b = plan.step("fetch_repo_b").unwrap();
        let compare = plan.step("compare").unwrap();
        assert!(a.needs.is_empty() && b.needs.is_empty());
        assert_eq!(compare.needs, vec!["fetch_repo_a", "fetch_repo_b"]);
        assert_eq!(compare.on_error, ErrorPolicy::AskUser);

        assert_eq!(a.params["repo"], "a/b");
        assert_eq!(b.params["repo"], "c/d");
        assert_eq!(compare.params["repo_a"], "a/b");
        assert_eq!(compare.params["repo_b"], "c/d");
        assert_eq!(plan.artifacts_required, vec!["comparison"]);
        assert_eq!(plan.status, PlanStatus::Pending);
        assert!(plan.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[test]
    fn test_user_context_injected_everywhere() {
        let ctx = PlanContext::new()
            .with_repo("a/b")
            .with_user_context(json!({"lang": "en"}));
        let plan = PlanBuilder::new().build("analyze", "onboarding", &ctx);
        for step in &plan.steps {
            assert_eq!(step.params["repo"], "a/b");
            assert_eq!(step.params["user_context"]["lang"], "en");
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = PlanBuilder::new();
        let ctx = compare_context();
        let first = builder.build("analyze", "compare", &ctx);
        let second = builder.build("analyze", "compare", &ctx);
        assert_eq!(first.steps, second.steps);
        assert_eq!(first.artifacts_required, second.artifacts_required);
    }

    #[test]
    fn test_unknown_key_gives_fallback_plan() {
        let plan = PlanBuilder::new().build("weather", "forecast", &PlanContext::new());
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].id, FALLBACK_STEP_ID);
        assert_eq!(plan.steps[0].runner, Capability::Chat);
        assert_eq!(plan.steps[0].on_error, ErrorPolicy::Abort);
        assert!(plan.reasoning[0].contains("weather.forecast"));
    }

    #[test]
    fn test_invalid_template_gives_fallback_plan() {
        static BROKEN: PlanTemplate = PlanTemplate {
            key: "broken.cycle",
            steps: &[
                StepTemplate {
                    needs: &["b"],
                    ..step("a", Capability::Chat)
                },
                StepTemplate {
                    needs: &["a"],
                    ..step("b", Capability::Chat)
                },
            ],
            artifacts_required: &[],
        };

        let plan =
            PlanBuilder::new().from_template("broken", "cycle", &BROKEN, &PlanContext::new());
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.reasoning[0].contains("cycle"));
    }

    #[test]
    fn test_reasoning_trace() {
        let plan = PlanBuilder::new().build("analyze", "compare", &compare_context());
        assert!(plan.reasoning[0].contains("analyze.compare"));
        assert!(plan.reasoning.iter().any(|r| r.contains("c/d")));
    }

    #[test]
    fn test_plan_built_event_emitted() {
        let sink = MemoryEventSink::new();
        let builder = PlanBuilder::new().with_sink(Arc::new(sink.clone()));
        let plan = builder.build("meta", "help", &PlanContext::new());

        let events = sink.of_type(PlanEventType::PlanBuilt);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].plan_id, plan.id);
        assert_eq!(events[0].data["key"], "meta.help");
    }

    #[test]
    fn test_fallback_timeout_is_configurable() {
        let plan = PlanBuilder::new()
            .with_default_timeout(Duration::from_secs(5))
            .build("x", "y", &PlanContext::new());
        assert_eq!(plan.steps[0].timeout, Duration::from_secs(5));
    }
}
