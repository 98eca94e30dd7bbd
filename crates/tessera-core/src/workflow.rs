use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Immutable workflow template.
///
/// Steps are declared in order; control-flow constructs refer to steps by id.
/// A step referenced by a branch, loop, or parallel group is driven by that
/// construct rather than by the top-level dependency walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub conditional_branches: Vec<ConditionalBranch>,
    #[serde(default)]
    pub loops: Vec<LoopDefinition>,
    #[serde(default)]
    pub parallel_groups: Vec<ParallelGroup>,
    #[serde(default)]
    pub approvals: Vec<ApprovalRule>,
    #[serde(default)]
    pub scheduling: Vec<ScheduleRule>,
    #[serde(default)]
    pub variables: Vec<VariableDefinition>,
    /// Overall execution timeout. Falls back to the engine default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub priority: Priority,
    /// Recipients alerted when an execution reaches a terminal state.
    #[serde(default)]
    pub notify_on_completion: Vec<String>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            description: None,
            steps: vec![],
            conditional_branches: vec![],
            loops: vec![],
            parallel_groups: vec![],
            approvals: vec![],
            scheduling: vec![],
            variables: vec![],
            timeout_secs: None,
            priority: Priority::default(),
            notify_on_completion: vec![],
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_branch(mut self, branch: ConditionalBranch) -> Self {
        self.conditional_branches.push(branch);
        self
    }

    pub fn with_loop(mut self, lp: LoopDefinition) -> Self {
        self.loops.push(lp);
        self
    }

    pub fn with_parallel_group(mut self, group: ParallelGroup) -> Self {
        self.parallel_groups.push(group);
        self
    }

    pub fn with_approval(mut self, rule: ApprovalRule) -> Self {
        self.approvals.push(rule);
        self
    }

    pub fn with_schedule(mut self, rule: ScheduleRule) -> Self {
        self.scheduling.push(rule);
        self
    }

    pub fn with_variable(mut self, var: VariableDefinition) -> Self {
        self.variables.push(var);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Load a definition from a `.toml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TesseraError::ConfigNotFound(path.display().to_string()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => toml::from_str(&content).map_err(|e| TesseraError::Config(e.to_string())),
        }
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn approval_for(&self, step_id: &str) -> Option<&ApprovalRule> {
        self.approvals.iter().find(|a| a.step_id == step_id)
    }

    pub fn schedule_for(&self, step_id: &str) -> Option<&ScheduleRule> {
        self.scheduling.iter().find(|s| s.step_id == step_id)
    }

    /// Map of step id to the construct that drives it.
    pub fn construct_owners(&self) -> HashMap<String, ConstructRef> {
        let mut owners = HashMap::new();
        for branch in &self.conditional_branches {
            for step in branch.all_steps() {
                owners.insert(step.clone(), ConstructRef::Branch(branch.id.clone()));
            }
        }
        for lp in &self.loops {
            for step in &lp.steps {
                owners.insert(step.clone(), ConstructRef::Loop(lp.id.clone()));
            }
        }
        for group in &self.parallel_groups {
            for step in &group.steps {
                owners.insert(step.clone(), ConstructRef::Parallel(group.id.clone()));
            }
        }
        owners
    }
}

/// Reference to a control-flow construct by kind and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConstructRef {
    Branch(String),
    Loop(String),
    Parallel(String),
}

impl std::fmt::Display for ConstructRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Branch(id) => write!(f, "branch:{}", id),
            Self::Loop(id) => write!(f, "loop:{}", id),
            Self::Parallel(id) => write!(f, "parallel:{}", id),
        }
    }
}

/// One unit of work dispatched to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    /// Agent name override. Defaults to whichever agent serves `action`.
    #[serde(default)]
    pub agent: Option<String>,
    /// Extra variable name the step's result is bound to.
    #[serde(default)]
    pub output_variable: Option<String>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            action: action.into(),
            parameters: serde_json::Map::new(),
            dependencies: vec![],
            timeout_ms: None,
            retry_count: 0,
            agent: None,
            output_variable: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_output(mut self, var: impl Into<String>) -> Self {
        self.output_variable = Some(var.into());
        self
    }
}

/// How a construct reacts to an unrecovered member failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    #[default]
    FailFast,
    Continue,
    Retry,
}

/// If / else-if / else over step lists. Exactly one path runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalBranch {
    pub id: String,
    pub condition: String,
    #[serde(default)]
    pub true_steps: Vec<String>,
    #[serde(default)]
    pub else_if_branches: Vec<ElseIfBranch>,
    #[serde(default)]
    pub false_steps: Vec<String>,
    #[serde(default)]
    pub default_branch: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElseIfBranch {
    pub condition: String,
    #[serde(default)]
    pub steps: Vec<String>,
}

impl ConditionalBranch {
    pub fn new(id: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            condition: condition.into(),
            true_steps: vec![],
            else_if_branches: vec![],
            false_steps: vec![],
            default_branch: vec![],
            depends_on: vec![],
            failure_strategy: FailureStrategy::default(),
        }
    }

    pub fn when_true(mut self, steps: &[&str]) -> Self {
        self.true_steps = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn else_if(mut self, condition: impl Into<String>, steps: &[&str]) -> Self {
        self.else_if_branches.push(ElseIfBranch {
            condition: condition.into(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn when_false(mut self, steps: &[&str]) -> Self {
        self.false_steps = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn otherwise(mut self, steps: &[&str]) -> Self {
        self.default_branch = steps.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    /// Every step referenced on any path, first occurrence order.
    pub fn all_steps(&self) -> Vec<&String> {
        let mut out: Vec<&String> = Vec::new();
        let paths = std::iter::once(&self.true_steps)
            .chain(self.else_if_branches.iter().map(|b| &b.steps))
            .chain(std::iter::once(&self.false_steps))
            .chain(std::iter::once(&self.default_branch));
        for path in paths {
            for step in path {
                if !out.contains(&step) {
                    out.push(step);
                }
            }
        }
        out
    }
}

/// Bounded loop over a sequential list of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDefinition {
    pub id: String,
    /// Loop while this holds. Absent means always.
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub iteration_variable: Option<String>,
    #[serde(default)]
    pub break_condition: Option<String>,
    /// When true after a step, the rest of the iteration is skipped.
    #[serde(default)]
    pub continue_condition: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
}

fn default_max_iterations() -> u32 {
    10
}

impl LoopDefinition {
    pub fn new(id: impl Into<String>, steps: &[&str]) -> Self {
        Self {
            id: id.into(),
            condition: None,
            max_iterations: default_max_iterations(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            iteration_variable: None,
            break_condition: None,
            continue_condition: None,
            depends_on: vec![],
            failure_strategy: FailureStrategy::default(),
        }
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.condition = Some(expr.into());
        self
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_iteration_variable(mut self, name: impl Into<String>) -> Self {
        self.iteration_variable = Some(name.into());
        self
    }

    pub fn break_when(mut self, expr: impl Into<String>) -> Self {
        self.break_condition = Some(expr.into());
        self
    }

    pub fn continue_when(mut self, expr: impl Into<String>) -> Self {
        self.continue_condition = Some(expr.into());
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }
}

/// Steps that run concurrently under a concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub id: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    /// Resubmissions per failed step under the `retry` strategy.
    #[serde(default = "default_group_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_group_retries() -> u32 {
    1
}

impl ParallelGroup {
    pub fn new(id: impl Into<String>, steps: &[&str]) -> Self {
        Self {
            id: id.into(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            max_concurrency: default_max_concurrency(),
            failure_strategy: FailureStrategy::default(),
            max_retries: default_group_retries(),
            depends_on: vec![],
        }
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// What happens to the gated step when an approval times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Skip,
    Fail,
}

/// Human-approval gate in front of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub id: String,
    pub step_id: String,
    /// Empty means anyone may vote.
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default = "default_required_approvals")]
    pub required_approvals: u32,
    #[serde(default)]
    pub auto_approval_condition: Option<String>,
    #[serde(default = "default_approval_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub escalation_chain: Vec<EscalationTier>,
    #[serde(default)]
    pub on_timeout: TimeoutAction,
    #[serde(default = "default_approval_channel")]
    pub channel: String,
    #[serde(default = "default_approval_template")]
    pub template: String,
}

fn default_required_approvals() -> u32 {
    1
}

/// Half of the default workflow timeout, so an untouched gate can still
/// reach `timeout` before the run itself is cut off.
fn default_approval_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_approval_channel() -> String {
    "email".into()
}

fn default_approval_template() -> String {
    "approval_request".into()
}

impl ApprovalRule {
    pub fn new(id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_id: step_id.into(),
            approvers: vec![],
            required_approvals: default_required_approvals(),
            auto_approval_condition: None,
            timeout_ms: default_approval_timeout_ms(),
            escalation_chain: vec![],
            on_timeout: TimeoutAction::default(),
            channel: default_approval_channel(),
            template: default_approval_template(),
        }
    }

    pub fn with_approvers(mut self, approvers: &[&str]) -> Self {
        self.approvers = approvers.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_required_approvals(mut self, n: u32) -> Self {
        self.required_approvals = n;
        self
    }

    pub fn auto_approve_when(mut self, expr: impl Into<String>) -> Self {
        self.auto_approval_condition = Some(expr.into());
        self
    }

    pub fn escalate_to(mut self, approvers: &[&str], timeout_ms: Option<u64>) -> Self {
        self.escalation_chain.push(EscalationTier {
            approvers: approvers.iter().map(|a| a.to_string()).collect(),
            timeout_ms,
        });
        self
    }

    pub fn on_timeout(mut self, action: TimeoutAction) -> Self {
        self.on_timeout = action;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationTier {
    pub approvers: Vec<String>,
    /// Deadline for this tier. Defaults to the rule's timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Deferred execution of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRule {
    pub id: String,
    pub step_id: String,
    pub trigger: ScheduleTrigger,
}

impl ScheduleRule {
    pub fn new(id: impl Into<String>, step_id: impl Into<String>, trigger: ScheduleTrigger) -> Self {
        Self {
            id: id.into(),
            step_id: step_id.into(),
            trigger,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleTrigger {
    Delay { delay_ms: u64 },
    Time { at: DateTime<Utc> },
    /// Seconds-resolution cron expression (`sec min hour dom mon dow [year]`).
    Cron { expression: String },
    Condition {
        expression: String,
        #[serde(default)]
        poll_interval_ms: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Declared input variable with validation rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub validation: ValidationRules,
    #[serde(default)]
    pub description: Option<String>,
}

impl VariableDefinition {
    pub fn new(name: impl Into<String>, var_type: VariableType) -> Self {
        Self {
            name: name.into(),
            var_type,
            required: false,
            default: None,
            validation: ValidationRules::default(),
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_rules(mut self, rules: ValidationRules) -> Self {
        self.validation = rules;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    #[default]
    Any,
}

impl std::fmt::Display for VariableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationRules {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub one_of: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml_definition() {
        let toml_str = r#"
name = "lead-intake"
priority = "high"

[[steps]]
id = "fetch"
action = "crm.fetch_lead"
retry_count = 2

[[steps]]
id = "score"
action = "crm.score"
dependencies = ["fetch"]
timeout_ms = 5000

[[conditional_branches]]
id = "hot"
condition = "score.value > 80"
true_steps = ["score"]

[[scheduling]]
id = "later"
step_id = "fetch"
trigger = { type = "delay", delay_ms = 250 }
"#;
        let def: WorkflowDefinition = toml::from_str(toml_str).unwrap();
        assert_eq!(def.name, "lead-intake");
        assert_eq!(def.priority, Priority::High);
        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].retry_count, 2);
        assert_eq!(def.steps[1].dependencies, vec!["fetch"]);
        assert_eq!(def.steps[1].timeout_ms, Some(5000));
        assert_eq!(
            def.scheduling[0].trigger,
            ScheduleTrigger::Delay { delay_ms: 250 }
        );
    }

    #[test]
    fn test_construct_owners() {
        let def = WorkflowDefinition::new("w")
            .with_step(WorkflowStep::new("a", "x"))
            .with_step(WorkflowStep::new("b", "x"))
            .with_step(WorkflowStep::new("c", "x"))
            .with_branch(ConditionalBranch::new("br", "true").when_true(&["a"]))
            .with_parallel_group(ParallelGroup::new("pg", &["b"]));

        let owners = def.construct_owners();
        assert_eq!(owners.get("a"), Some(&ConstructRef::Branch("br".into())));
        assert_eq!(owners.get("b"), Some(&ConstructRef::Parallel("pg".into())));
        assert!(owners.get("c").is_none());
    }

    #[test]
    fn test_branch_all_steps_dedup() {
        let branch = ConditionalBranch::new("b", "x > 1")
            .when_true(&["a", "b"])
            .else_if("x > 0", &["b", "c"])
            .otherwise(&["d"]);
        let steps: Vec<&str> = branch.all_steps().iter().map(|s| s.as_str()).collect();
        assert_eq!(steps, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_defaults() {
        let rule: ApprovalRule =
            serde_json::from_value(serde_json::json!({"id": "a", "step_id": "s"})).unwrap();
        assert_eq!(rule.required_approvals, 1);
        assert_eq!(rule.on_timeout, TimeoutAction::Skip);
        assert_eq!(rule.channel, "email");

        // An untouched gate must be able to time out inside an untouched run.
        let engine = crate::config::EngineConfig::default().engine;
        assert!(rule.timeout_ms < engine.workflow_timeout_secs * 1000);
        assert!(rule.timeout_ms < engine.dependency_wait_timeout_secs * 1000);

        let group: ParallelGroup =
            serde_json::from_value(serde_json::json!({"id": "g"})).unwrap();
        assert_eq!(group.max_concurrency, 4);
        assert_eq!(group.failure_strategy, FailureStrategy::FailFast);
    }
}
