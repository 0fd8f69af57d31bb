use thiserror::Error;

/// Core error type for the RouteMaster engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A pipeline was built with a zero time-to-live
    #[error("Invalid ttl: {0}")]
    InvalidTtl(String),

    /// The same step was registered twice on one route
    #[error("Duplicate step registration: {0}")]
    DuplicateRegistration(String),

    /// A step was referenced as a continuation without being registered on the route
    #[error("Unregistered step reference: {0}")]
    UnregisteredStepReference(String),

    /// No state exists for the correlation id
    #[error("State not found: {0}")]
    StateNotFound(String),

    /// A step handler failed; the instance no longer progresses
    #[error("Instance {correlation_id} faulted: {reason}")]
    InstanceFaulted {
        /// Correlation id of the faulted instance
        correlation_id: String,
        /// What went wrong
        reason: String,
    },

    /// A step result addressed a different instance than the one being handled
    #[error("Correlation mismatch: {0}")]
    CorrelationMismatch(String),

    /// State access used after its handler invocation finished
    #[error("State access expired: {0}")]
    StateAccessExpired(String),

    /// State access used in a way the capability does not allow
    #[error("State access violation: {0}")]
    StateAccessViolation(String),

    /// Error raised by step logic
    #[error("Step execution error: {0}")]
    StepExecutionError(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Timer error
    #[error("Timer error: {0}")]
    TimerError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Build an `InstanceFaulted` error for a correlation id
    pub fn faulted(correlation_id: impl Into<String>, reason: impl ToString) -> Self {
        CoreError::InstanceFaulted {
            correlation_id: correlation_id.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error is a build-time route composition error
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidTtl(_)
                | CoreError::DuplicateRegistration(_)
                | CoreError::UnregisteredStepReference(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::ConfigurationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
