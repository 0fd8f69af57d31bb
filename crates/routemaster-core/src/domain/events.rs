use chrono::{DateTime, Utc};
use std::fmt;

use super::correlation::{CorrelationId, StepName, SubscriptionId};
use crate::types::MessageType;
use crate::CoreError;

/// Which branch of an armed continuation fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// The expected reply arrived
    Reply,
    /// The deadline elapsed first
    Timeout,
}

/// Why an inbound message was dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// No registered step could attribute the message to an instance
    Unattributed,
    /// Nothing is armed for the correlation id (stale, cancelled or unknown instance)
    NoPendingContinuation,
    /// A continuation is armed, but for a different step
    StepMismatch,
    /// The instance's state is gone
    StateNotFound,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DropReason::Unattributed => "unattributed",
            DropReason::NoPendingContinuation => "no_pending_continuation",
            DropReason::StepMismatch => "step_mismatch",
            DropReason::StateNotFound => "state_not_found",
        };
        f.write_str(reason)
    }
}

/// Events emitted by the engine to its observability sink
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A new instance was created by a starter
    InstanceStarted {
        /// Route the instance belongs to
        subscription: SubscriptionId,
        /// Instance id
        correlation_id: CorrelationId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// A pending continuation was armed and its message sent
    ContinuationArmed {
        /// Route the instance belongs to
        subscription: SubscriptionId,
        /// Instance id
        correlation_id: CorrelationId,
        /// Step waiting for the reply
        next: StepName,
        /// Step that runs if the deadline elapses
        timeout: StepName,
        /// Deadline of the race
        deadline: DateTime<Utc>,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// A pending continuation was consumed and its step invoked
    ContinuationResolved {
        /// Route the instance belongs to
        subscription: SubscriptionId,
        /// Instance id
        correlation_id: CorrelationId,
        /// Step that ran
        step: StepName,
        /// Which branch won
        branch: Branch,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// The instance reached its terminal state
    InstanceCancelled {
        /// Route the instance belongs to
        subscription: SubscriptionId,
        /// Instance id
        correlation_id: CorrelationId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// Step logic failed; the instance no longer progresses
    InstanceFaulted {
        /// Route the instance belongs to
        subscription: SubscriptionId,
        /// Instance id
        correlation_id: CorrelationId,
        /// Step that failed, if the failure happened inside one
        step: Option<StepName>,
        /// The failure
        error: CoreError,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// An inbound message was dropped
    MessageDropped {
        /// Route that dropped it
        subscription: SubscriptionId,
        /// Type of the dropped message
        message_type: MessageType,
        /// Instance the message was attributed to, if any
        correlation_id: Option<CorrelationId>,
        /// Why it was dropped
        reason: DropReason,
        /// When it happened
        timestamp: DateTime<Utc>,
    },

    /// A reply or timeout arrived for a hop that was already resolved
    DuplicateSuppressed {
        /// Route that suppressed it
        subscription: SubscriptionId,
        /// Type of the suppressed message
        message_type: MessageType,
        /// Instance id
        correlation_id: CorrelationId,
        /// When it happened
        timestamp: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Returns the type of the event as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::InstanceStarted { .. } => "instance.started",
            EngineEvent::ContinuationArmed { .. } => "continuation.armed",
            EngineEvent::ContinuationResolved { .. } => "continuation.resolved",
            EngineEvent::InstanceCancelled { .. } => "instance.cancelled",
            EngineEvent::InstanceFaulted { .. } => "instance.faulted",
            EngineEvent::MessageDropped { .. } => "message.dropped",
            EngineEvent::DuplicateSuppressed { .. } => "message.duplicate_suppressed",
        }
    }

    /// Route the event belongs to
    pub fn subscription(&self) -> &SubscriptionId {
        match self {
            EngineEvent::InstanceStarted { subscription, .. }
            | EngineEvent::ContinuationArmed { subscription, .. }
            | EngineEvent::ContinuationResolved { subscription, .. }
            | EngineEvent::InstanceCancelled { subscription, .. }
            | EngineEvent::InstanceFaulted { subscription, .. }
            | EngineEvent::MessageDropped { subscription, .. }
            | EngineEvent::DuplicateSuppressed { subscription, .. } => subscription,
        }
    }

    /// Instance the event is about, if known
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            EngineEvent::InstanceStarted { correlation_id, .. }
            | EngineEvent::ContinuationArmed { correlation_id, .. }
            | EngineEvent::ContinuationResolved { correlation_id, .. }
            | EngineEvent::InstanceCancelled { correlation_id, .. }
            | EngineEvent::InstanceFaulted { correlation_id, .. }
            | EngineEvent::DuplicateSuppressed { correlation_id, .. } => Some(correlation_id),
            EngineEvent::MessageDropped { correlation_id, .. } => correlation_id.as_ref(),
        }
    }

    /// Returns the timestamp when the event occurred
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::InstanceStarted { timestamp, .. }
            | EngineEvent::ContinuationArmed { timestamp, .. }
            | EngineEvent::ContinuationResolved { timestamp, .. }
            | EngineEvent::InstanceCancelled { timestamp, .. }
            | EngineEvent::InstanceFaulted { timestamp, .. }
            | EngineEvent::MessageDropped { timestamp, .. }
            | EngineEvent::DuplicateSuppressed { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let cid = CorrelationId::from("cid-1");
        let event = EngineEvent::InstanceCancelled {
            subscription: SubscriptionId::new("sub"),
            correlation_id: cid.clone(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "instance.cancelled");
        assert_eq!(event.correlation_id(), Some(&cid));
        assert_eq!(event.subscription().0, "sub");
    }

    #[test]
    fn test_unattributed_drop_has_no_correlation_id() {
        let event = EngineEvent::MessageDropped {
            subscription: SubscriptionId::new("sub"),
            message_type: MessageType("x".to_string()),
            correlation_id: None,
            reason: DropReason::Unattributed,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "message.dropped");
        assert!(event.correlation_id().is_none());
    }

    #[test]
    fn test_drop_reason_display() {
        assert_eq!(DropReason::StepMismatch.to_string(), "step_mismatch");
        assert_eq!(
            DropReason::NoPendingContinuation.to_string(),
            "no_pending_continuation"
        );
    }
}
