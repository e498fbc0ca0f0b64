use thiserror::Error;

/// Top-level error type for controller-core operations.
///
/// Components recover what they own and surface what they cannot. Only
/// programming-contract violations and genuinely fatal conditions should
/// ever reach a caller as this type — admission refusals and transient
/// recoveries are returned as typed results, not errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("priority analysis error: {0}")]
    Priority(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("pool error: {0}")]
    Pool(String),

    #[error("health monitor error: {0}")]
    Health(String),

    #[error("stuck-worker handler error: {0}")]
    Stuck(String),

    #[error("checkpoint store error: {0}")]
    Checkpoint(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ControllerError {
    /// Fatal conditions: restart attempts exhausted, critical escalation
    /// with `pause_on_critical`, a cycle-only graph with no ready node.
    /// Surfaced as events and, to callers, as error results.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Health(_) | Self::Stuck(_) | Self::Priority(_))
    }

    /// Whether the failed operation is safe to retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Queue(_) | Self::Pool(_))
    }
}

/// Result type alias for controller-core operations.
pub type Result<T> = std::result::Result<T, ControllerError>;
