use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Value object: Correlation ID
///
/// Ties every message of one workflow instance together. Created once when the
/// instance starts and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Generate a fresh, collision-resistant correlation id
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4().to_string())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(id: Uuid) -> Self {
        CorrelationId(id.to_string())
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        CorrelationId(id.to_string())
    }
}

/// Result of attributing an inbound message to an instance
pub type MaybeCorrelationId = Option<CorrelationId>;

/// Value object: Subscription ID
///
/// Partitions routes so independent workflow definitions can share a transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    /// Create a subscription id
    pub fn new(id: impl Into<String>) -> Self {
        SubscriptionId(id.into())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value object: Step name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepName(pub String);

impl StepName {
    /// Create a step name
    pub fn new(name: impl Into<String>) -> Self {
        StepName(name.into())
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
