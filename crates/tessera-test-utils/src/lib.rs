mod agent;
mod fixtures;
mod notifier;

pub use agent::ScriptedAgent;
pub use fixtures::{linear_workflow, write_config};
pub use notifier::RecordingNotifier;
