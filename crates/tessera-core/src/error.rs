use thiserror::Error;

#[derive(Debug, Error)]
pub enum TesseraError {
    // Definition errors
    #[error("Cyclic dependency detected at step: {step}")]
    CyclicDependency { step: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Expression error: {0}")]
    Expression(String),

    // Step errors
    #[error("Step timeout after {timeout_ms}ms: {step}")]
    StepTimeout { step: String, timeout_ms: u64 },

    #[error("Step failed: {step}: {message}")]
    StepFailure { step: String, message: String },

    #[error("Dependencies not satisfied after {waited_secs}s")]
    DependencyWaitTimeout { waited_secs: u64 },

    #[error("Parallel group {group} failed: {failures}")]
    ConcurrencyGroupFailure { group: String, failures: String },

    // Agent errors
    #[error("No agent registered for action: {0}")]
    AgentNotFound(String),

    #[error("Agent error: {0}")]
    Agent(String),

    // Approval errors
    #[error("Approval timeout: {approval}")]
    ApprovalTimeout { approval: String },

    #[error("Approval rejected: {approval}")]
    ApprovalRejected { approval: String },

    #[error("Approval already closed: {0}")]
    ApprovalClosed(String),

    #[error("Approver {approver} is not allowed to vote on {approval}")]
    NotAnApprover { approval: String, approver: String },

    // Lookup errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    // Execution errors
    #[error("Workflow exceeded timeout ({0}s)")]
    WorkflowTimeout(u64),

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    // Notification errors
    #[error("Notification error: {0}")]
    Notification(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TesseraError {
    /// Short machine-readable kind, recorded alongside error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::Validation(_) => "validation_error",
            Self::Expression(_) => "expression_error",
            Self::StepTimeout { .. } => "step_timeout",
            Self::StepFailure { .. } => "step_failure",
            Self::DependencyWaitTimeout { .. } => "dependency_wait_timeout",
            Self::ConcurrencyGroupFailure { .. } => "concurrency_group_failure",
            Self::AgentNotFound(_) => "agent_not_found",
            Self::Agent(_) => "agent_error",
            Self::ApprovalTimeout { .. } => "approval_timeout",
            Self::ApprovalRejected { .. } => "approval_rejected",
            Self::ApprovalClosed(_) => "approval_closed",
            Self::NotAnApprover { .. } => "not_an_approver",
            Self::WorkflowNotFound(_) => "workflow_not_found",
            Self::ExecutionNotFound(_) => "execution_not_found",
            Self::ApprovalNotFound(_) => "approval_not_found",
            Self::WorkflowTimeout(_) => "workflow_timeout",
            Self::Cancelled => "cancelled",
            Self::Config(_) => "config_error",
            Self::ConfigNotFound(_) => "config_not_found",
            Self::Store(_) => "store_error",
            Self::Notification(_) => "notification_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, TesseraError>;
