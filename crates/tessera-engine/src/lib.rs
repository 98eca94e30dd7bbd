pub mod agents;
pub mod approval;
pub mod compile;
pub mod coordinator;
pub mod executor;
pub mod flow;
pub mod limiter;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod resolver;
pub mod run;
pub mod scheduler;
pub mod variables;

pub use agents::{DelayAgent, EchoAgent};
pub use approval::ApprovalBroker;
pub use compile::CompiledWorkflow;
pub use coordinator::{Engine, EngineBuilder};
pub use executor::StepExecutor;
pub use flow::FlowProcessor;
pub use limiter::ConcurrencyLimiter;
pub use metrics::MetricsRecorder;
pub use notify::{LogNotifier, WebhookNotifier};
pub use registry::AgentRegistry;
pub use resolver::resolve_steps;
pub use scheduler::TaskScheduler;
pub use variables::validate_inputs;
