use std::sync::Arc;

use tracing::info;

use tessera_core::error::Result;

use super::FlowProcessor;
use crate::run::ExecutionHandle;

impl FlowProcessor {
    /// Evaluate a conditional branch and run exactly one path.
    ///
    /// Paths are tried in order: `true`, each `else_if:<n>`, `false`, then
    /// `default`. The chosen path is appended to the branch history before
    /// it runs; members on other paths are skipped.
    pub(crate) async fn run_branch(&self, run: &Arc<ExecutionHandle>, branch_id: &str) -> Result<()> {
        if run
            .read(|exec| exec.context.branch_taken(branch_id).is_some())
            .await
        {
            return Ok(());
        }

        let branch = run.workflow.branch(branch_id)?;
        let vars = run.variables().await;

        let none: &[String] = &[];
        let (path, steps): (String, &[String]) = if run.workflow.condition(&branch.condition, &vars)? {
            ("true".into(), branch.true_steps.as_slice())
        } else {
            let mut chosen = None;
            for (i, alt) in branch.else_if_branches.iter().enumerate() {
                if run.workflow.condition(&alt.condition, &vars)? {
                    chosen = Some((format!("else_if:{}", i), alt.steps.as_slice()));
                    break;
                }
            }
            match chosen {
                Some(c) => c,
                None if !branch.false_steps.is_empty() => {
                    ("false".into(), branch.false_steps.as_slice())
                }
                None if !branch.default_branch.is_empty() => {
                    ("default".into(), branch.default_branch.as_slice())
                }
                None => ("none".into(), none),
            }
        };

        info!(execution_id = %run.id, branch_id, path = %path, "Branch path chosen");
        run.update(|exec| {
            exec.context
                .branch_history
                .push(format!("{}:{}", branch_id, path))
        })
        .await;

        for member in branch.all_steps() {
            if !steps.contains(member) {
                run.skip_step(member, "branch_not_taken").await;
            }
        }

        self.run_sequence(run, steps, branch.failure_strategy, None, None)
            .await
            .map(|_| ())
    }
}
