//! Definition checks and the execution plan.
//!
//! A definition is compiled once, at `create_workflow` time. Compilation
//! rejects anything the coordinator could trip over later: unknown step
//! references, cycles (between steps and between constructs), overlapping
//! construct membership, bad expressions or cron strings, and malformed
//! variable declarations. The result is shared read-only by every execution.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use serde_json::Value;

use tessera_core::error::{Result, TesseraError};
use tessera_core::expr::Expression;
use tessera_core::workflow::{
    ApprovalRule, ConditionalBranch, ConstructRef, LoopDefinition, ParallelGroup, ScheduleRule,
    ScheduleTrigger, WorkflowDefinition, WorkflowStep,
};

use crate::resolver::{resolve_order, resolve_steps};
use crate::variables::check_definition;

/// Something the coordinator schedules as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    /// A step not owned by any construct.
    Step(String),
    Construct(ConstructRef),
}

#[derive(Debug, Clone)]
pub struct UnitPlan {
    pub key: String,
    pub unit: Unit,
    /// Steps that must be completed or skipped before the unit may start.
    pub requires: Vec<String>,
    /// Steps driven by this unit.
    pub members: Vec<String>,
}

/// A validated definition plus everything derived from it.
#[derive(Debug)]
pub struct CompiledWorkflow {
    pub def: WorkflowDefinition,
    /// Topological step order.
    pub step_order: Vec<String>,
    /// Units in topological order.
    pub plan: Vec<UnitPlan>,
    owners: HashMap<String, ConstructRef>,
    expressions: HashMap<String, Expression>,
}

impl CompiledWorkflow {
    pub fn compile(def: WorkflowDefinition) -> Result<Self> {
        if def.name.trim().is_empty() {
            return Err(TesseraError::Validation("workflow name is empty".into()));
        }
        if def.steps.is_empty() {
            return Err(TesseraError::Validation(format!(
                "workflow {} has no steps",
                def.name
            )));
        }

        check_steps(&def)?;
        let step_order = resolve_steps(&def.steps)?;
        let owners = collect_owners(&def)?;
        check_construct_paths(&def)?;
        check_gates(&def, &owners)?;
        for var in &def.variables {
            check_definition(var)?;
        }
        let mut seen = HashSet::new();
        for var in &def.variables {
            if !seen.insert(var.name.as_str()) {
                return Err(TesseraError::Validation(format!(
                    "duplicate variable: {}",
                    var.name
                )));
            }
        }
        let expressions = parse_expressions(&def)?;
        let plan = build_plan(&def, &owners)?;

        Ok(Self {
            def,
            step_order,
            plan,
            owners,
            expressions,
        })
    }

    pub fn id(&self) -> &str {
        &self.def.id
    }

    pub fn step(&self, id: &str) -> Result<&WorkflowStep> {
        self.def
            .step(id)
            .ok_or_else(|| TesseraError::Validation(format!("unknown step: {}", id)))
    }

    pub fn owner(&self, step_id: &str) -> Option<&ConstructRef> {
        self.owners.get(step_id)
    }

    pub fn branch(&self, id: &str) -> Result<&ConditionalBranch> {
        self.def
            .conditional_branches
            .iter()
            .find(|b| b.id == id)
            .ok_or_else(|| TesseraError::Validation(format!("unknown branch: {}", id)))
    }

    pub fn loop_def(&self, id: &str) -> Result<&LoopDefinition> {
        self.def
            .loops
            .iter()
            .find(|l| l.id == id)
            .ok_or_else(|| TesseraError::Validation(format!("unknown loop: {}", id)))
    }

    pub fn parallel_group(&self, id: &str) -> Result<&ParallelGroup> {
        self.def
            .parallel_groups
            .iter()
            .find(|g| g.id == id)
            .ok_or_else(|| TesseraError::Validation(format!("unknown parallel group: {}", id)))
    }

    pub fn approval_for(&self, step_id: &str) -> Option<&ApprovalRule> {
        self.def.approval_for(step_id)
    }

    pub fn schedule_for(&self, step_id: &str) -> Option<&ScheduleRule> {
        self.def.schedule_for(step_id)
    }

    /// Evaluate a condition that appears in this definition.
    pub fn condition(&self, source: &str, vars: &HashMap<String, Value>) -> Result<bool> {
        match self.expressions.get(source) {
            Some(expr) => expr.is_true(vars),
            None => Expression::parse(source)?.is_true(vars),
        }
    }
}

fn check_steps(def: &WorkflowDefinition) -> Result<()> {
    let mut ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(TesseraError::Validation("step with empty id".into()));
        }
        if step.action.trim().is_empty() {
            return Err(TesseraError::Validation(format!(
                "step {} has no action",
                step.id
            )));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(TesseraError::Validation(format!(
                "duplicate step id: {}",
                step.id
            )));
        }
    }
    for step in &def.steps {
        for dep in &step.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(TesseraError::Validation(format!(
                    "step {} depends on unknown step {}",
                    step.id, dep
                )));
            }
        }
    }
    Ok(())
}

fn collect_owners(def: &WorkflowDefinition) -> Result<HashMap<String, ConstructRef>> {
    let mut owners: HashMap<String, ConstructRef> = HashMap::new();
    let mut construct_ids = HashSet::new();

    let mut claim = |step: &str, owner: ConstructRef| -> Result<()> {
        if def.step(step).is_none() {
            return Err(TesseraError::Validation(format!(
                "{} references unknown step {}",
                owner, step
            )));
        }
        if let Some(existing) = owners.get(step) {
            if *existing != owner {
                return Err(TesseraError::Validation(format!(
                    "step {} is claimed by both {} and {}",
                    step, existing, owner
                )));
            }
        }
        owners.insert(step.to_string(), owner);
        Ok(())
    };

    for branch in &def.conditional_branches {
        let r = ConstructRef::Branch(branch.id.clone());
        if branch.id.is_empty() || !construct_ids.insert(r.to_string()) {
            return Err(TesseraError::Validation(format!("bad or duplicate id: {}", r)));
        }
        for step in branch.all_steps() {
            claim(step.as_str(), r.clone())?;
        }
    }
    for lp in &def.loops {
        let r = ConstructRef::Loop(lp.id.clone());
        if lp.id.is_empty() || !construct_ids.insert(r.to_string()) {
            return Err(TesseraError::Validation(format!("bad or duplicate id: {}", r)));
        }
        let mut seen = HashSet::new();
        for step in &lp.steps {
            if !seen.insert(step) {
                return Err(TesseraError::Validation(format!(
                    "{} lists step {} twice",
                    r, step
                )));
            }
            claim(step.as_str(), r.clone())?;
        }
    }
    for group in &def.parallel_groups {
        let r = ConstructRef::Parallel(group.id.clone());
        if group.id.is_empty() || !construct_ids.insert(r.to_string()) {
            return Err(TesseraError::Validation(format!("bad or duplicate id: {}", r)));
        }
        if group.max_concurrency == 0 {
            return Err(TesseraError::Validation(format!(
                "{} has max_concurrency 0",
                r
            )));
        }
        let mut seen = HashSet::new();
        for step in &group.steps {
            if !seen.insert(step) {
                return Err(TesseraError::Validation(format!(
                    "{} lists step {} twice",
                    r, step
                )));
            }
            claim(step.as_str(), r.clone())?;
        }
    }

    let construct_deps = def
        .conditional_branches
        .iter()
        .map(|b| (ConstructRef::Branch(b.id.clone()), &b.depends_on))
        .chain(
            def.loops
                .iter()
                .map(|l| (ConstructRef::Loop(l.id.clone()), &l.depends_on)),
        )
        .chain(
            def.parallel_groups
                .iter()
                .map(|g| (ConstructRef::Parallel(g.id.clone()), &g.depends_on)),
        );
    for (r, deps) in construct_deps {
        for dep in deps {
            if def.step(dep).is_none() {
                return Err(TesseraError::Validation(format!(
                    "{} depends on unknown step {}",
                    r, dep
                )));
            }
        }
    }

    Ok(owners)
}

/// Sequential paths run in list order, so a member may only depend on
/// members listed before it. Parallel members may not depend on each other.
fn check_construct_paths(def: &WorkflowDefinition) -> Result<()> {
    let check_sequence = |label: String, steps: &[String]| -> Result<()> {
        for (i, id) in steps.iter().enumerate() {
            let Some(step) = def.step(id) else { continue };
            for dep in &step.dependencies {
                if steps[i..].contains(dep) {
                    return Err(TesseraError::Validation(format!(
                        "{}: step {} depends on {}, which runs after it",
                        label, id, dep
                    )));
                }
            }
        }
        Ok(())
    };

    for branch in &def.conditional_branches {
        let label = ConstructRef::Branch(branch.id.clone()).to_string();
        check_sequence(label.clone(), &branch.true_steps)?;
        for b in &branch.else_if_branches {
            check_sequence(label.clone(), &b.steps)?;
        }
        check_sequence(label.clone(), &branch.false_steps)?;
        check_sequence(label, &branch.default_branch)?;
    }
    for lp in &def.loops {
        check_sequence(ConstructRef::Loop(lp.id.clone()).to_string(), &lp.steps)?;
    }
    for group in &def.parallel_groups {
        for id in &group.steps {
            let Some(step) = def.step(id) else { continue };
            if let Some(dep) = step.dependencies.iter().find(|d| group.steps.contains(d)) {
                return Err(TesseraError::Validation(format!(
                    "parallel:{}: member {} depends on member {}",
                    group.id, id, dep
                )));
            }
        }
    }
    Ok(())
}

/// Approvals and schedules gate top-level steps only, one gate per step.
fn check_gates(def: &WorkflowDefinition, owners: &HashMap<String, ConstructRef>) -> Result<()> {
    let mut rule_ids = HashSet::new();
    let mut gated = HashSet::new();

    let targets = def
        .approvals
        .iter()
        .map(|a| (&a.id, &a.step_id, "approval"))
        .chain(def.scheduling.iter().map(|s| (&s.id, &s.step_id, "schedule")));

    for (id, step_id, kind) in targets {
        if id.is_empty() || !rule_ids.insert(format!("{}:{}", kind, id)) {
            return Err(TesseraError::Validation(format!(
                "bad or duplicate {} id: {}",
                kind, id
            )));
        }
        if def.step(step_id).is_none() {
            return Err(TesseraError::Validation(format!(
                "{} {} targets unknown step {}",
                kind, id, step_id
            )));
        }
        if let Some(owner) = owners.get(step_id) {
            return Err(TesseraError::Validation(format!(
                "{} {} targets step {} inside {}",
                kind, id, step_id, owner
            )));
        }
        if !gated.insert(step_id.as_str()) {
            return Err(TesseraError::Validation(format!(
                "step {} has more than one approval or schedule",
                step_id
            )));
        }
    }

    for rule in &def.approvals {
        if rule.timeout_ms == 0 {
            return Err(TesseraError::Validation(format!(
                "approval {} has a zero timeout",
                rule.id
            )));
        }
    }
    for rule in &def.scheduling {
        if let ScheduleTrigger::Cron { expression } = &rule.trigger {
            cron::Schedule::from_str(expression).map_err(|e| {
                TesseraError::Validation(format!(
                    "schedule {}: invalid cron `{}`: {}",
                    rule.id, expression, e
                ))
            })?;
        }
    }
    Ok(())
}

fn parse_expressions(def: &WorkflowDefinition) -> Result<HashMap<String, Expression>> {
    let mut sources: Vec<&String> = Vec::new();
    for branch in &def.conditional_branches {
        sources.push(&branch.condition);
        sources.extend(branch.else_if_branches.iter().map(|b| &b.condition));
    }
    for lp in &def.loops {
        sources.extend(lp.condition.iter());
        sources.extend(lp.break_condition.iter());
        sources.extend(lp.continue_condition.iter());
    }
    for rule in &def.approvals {
        sources.extend(rule.auto_approval_condition.iter());
    }
    for rule in &def.scheduling {
        if let ScheduleTrigger::Condition { expression, .. } = &rule.trigger {
            sources.push(expression);
        }
    }

    let mut out = HashMap::new();
    for src in sources {
        if out.contains_key(src) {
            continue;
        }
        let expr = Expression::parse(src).map_err(|e| {
            TesseraError::Validation(format!("invalid expression `{}`: {}", src, e))
        })?;
        out.insert(src.clone(), expr);
    }
    Ok(out)
}

fn build_plan(
    def: &WorkflowDefinition,
    owners: &HashMap<String, ConstructRef>,
) -> Result<Vec<UnitPlan>> {
    let key_of = |step: &str| -> String {
        owners
            .get(step)
            .map(|o| o.to_string())
            .unwrap_or_else(|| step.to_string())
    };

    let mut units: Vec<UnitPlan> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for step in &def.steps {
        let key = key_of(&step.id);
        if let Some(&i) = index.get(&key) {
            units[i].members.push(step.id.clone());
            continue;
        }
        let unit = match owners.get(&step.id) {
            Some(owner) => Unit::Construct(owner.clone()),
            None => Unit::Step(step.id.clone()),
        };
        index.insert(key.clone(), units.len());
        units.push(UnitPlan {
            key,
            unit,
            requires: vec![],
            members: vec![step.id.clone()],
        });
    }

    for unit in &mut units {
        let mut requires: Vec<String> = Vec::new();
        if let Unit::Construct(r) = &unit.unit {
            let declared = match r {
                ConstructRef::Branch(id) => def
                    .conditional_branches
                    .iter()
                    .find(|b| &b.id == id)
                    .map(|b| &b.depends_on),
                ConstructRef::Loop(id) => def.loops.iter().find(|l| &l.id == id).map(|l| &l.depends_on),
                ConstructRef::Parallel(id) => def
                    .parallel_groups
                    .iter()
                    .find(|g| &g.id == id)
                    .map(|g| &g.depends_on),
            };
            requires.extend(declared.into_iter().flatten().cloned());
        }
        for member in &unit.members {
            if let Some(step) = def.step(member) {
                for dep in &step.dependencies {
                    if !unit.members.contains(dep) {
                        requires.push(dep.clone());
                    }
                }
            }
        }
        let mut seen = HashSet::new();
        requires.retain(|d| seen.insert(d.clone()));
        unit.requires = requires;
    }

    let nodes: Vec<(String, Vec<String>)> = units
        .iter()
        .map(|u| {
            let mut deps: Vec<String> = u
                .requires
                .iter()
                .map(|d| key_of(d))
                .collect();
            let mut seen = HashSet::new();
            deps.retain(|d| seen.insert(d.clone()));
            // Depending on your own member collapses to a self edge; only
            // declared `depends_on` can produce one, and that is a cycle.
            (u.key.clone(), deps)
        })
        .collect();
    let order = resolve_order(&nodes)?;

    let mut by_key: HashMap<String, UnitPlan> =
        units.into_iter().map(|u| (u.key.clone(), u)).collect();
    Ok(order
        .into_iter()
        .filter_map(|k| by_key.remove(&k))
        .collect())
}
