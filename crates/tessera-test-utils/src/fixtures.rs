use std::path::PathBuf;

use tempfile::TempDir;
use tessera_core::workflow::{WorkflowDefinition, WorkflowStep};

/// Steps chained in order, each depending on the one before. Every step's
/// action equals its id.
pub fn linear_workflow(name: &str, ids: &[&str]) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(name);
    let mut prev: Option<&str> = None;
    for id in ids {
        let mut step = WorkflowStep::new(*id, *id);
        if let Some(p) = prev {
            step = step.depends_on(&[p]);
        }
        def = def.with_step(step);
        prev = Some(*id);
    }
    def
}

/// Write `contents` to `tessera.toml` in a fresh temp dir. Keep the `TempDir`
/// alive for as long as the file is needed.
pub fn write_config(contents: &str) -> (TempDir, PathBuf) {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("tempdir: {e}"),
    };
    let path = dir.path().join("tessera.toml");
    if let Err(e) = std::fs::write(&path, contents) {
        panic!("write {}: {e}", path.display());
    }
    (dir, path)
}
