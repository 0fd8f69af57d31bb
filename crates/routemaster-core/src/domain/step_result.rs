//! Step results and the pipeline protocol
//!
//! A step result is a pure value describing what should happen next; the
//! dispatcher is the only component that acts on it.

use chrono::{DateTime, Utc};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use super::correlation::CorrelationId;
use super::step::{RegisteredStep, StepRef, TimeoutMessage};
use crate::types::{Envelope, Message};
use crate::CoreError;

/// A message to be sent when a pipeline is applied
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    envelope: Envelope,
}

impl Outbound {
    /// Wrap a message for sending
    pub fn send<M: Message>(message: &M) -> Result<Self, CoreError> {
        Ok(Self {
            envelope: Envelope::wrap(message)?,
        })
    }

    /// Let the transport discard the message if undelivered after `ttl`
    pub fn with_expiry(mut self, ttl: Duration) -> Self {
        self.envelope = self.envelope.expiring_after(ttl);
        self
    }

    /// Envelope that will be handed to the transport
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub(crate) fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

/// Deadline `ttl` after `from`, or `InvalidTtl` if it is not representable
pub(crate) fn deadline_after(from: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, CoreError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| from.checked_add_signed(ttl))
        .ok_or_else(|| CoreError::InvalidTtl(format!("deadline {:?} from {} is out of range", ttl, from)))
}

/// Send a message, then race a reply step against a timeout step
pub struct Pipeline<S> {
    /// Instance the hop belongs to
    pub correlation_id: CorrelationId,
    /// Message sent once the continuation is armed
    pub outbound: Outbound,
    /// Step that handles the expected reply
    pub next: StepRef,
    /// How long to wait for the reply
    pub ttl: Duration,
    /// Step that runs if `ttl` elapses first
    pub timeout: StepRef,
    _state: PhantomData<fn() -> S>,
}

impl<S> fmt::Debug for Pipeline<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("correlation_id", &self.correlation_id)
            .field("outbound", &self.outbound.envelope.message_type)
            .field("next", &self.next.key)
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout.key)
            .finish()
    }
}

/// Outcome of invoking a step
#[derive(Debug)]
pub enum StepResult<S> {
    /// The instance is finished; nothing further is armed
    Cancel,
    /// Send a message and arm the next continuation
    Pipeline(Pipeline<S>),
}

impl<S> StepResult<S> {
    /// Terminal marker
    pub fn cancel() -> Self {
        StepResult::Cancel
    }

    /// Describe the next hop
    ///
    /// Rejects a zero `ttl`, or one whose deadline cannot be represented, with
    /// `InvalidTtl`.
    pub fn pipeline<M>(
        correlation_id: CorrelationId,
        outbound: Outbound,
        next: &RegisteredStep<M, S>,
        ttl: Duration,
        timeout: &RegisteredStep<TimeoutMessage, S>,
    ) -> Result<Self, CoreError> {
        if ttl.is_zero() {
            return Err(CoreError::InvalidTtl(format!(
                "pipeline for {} waiting on {} must have a positive ttl",
                correlation_id,
                next.name()
            )));
        }
        deadline_after(Utc::now(), ttl)?;
        Ok(StepResult::Pipeline(Pipeline {
            correlation_id,
            outbound,
            next: next.step_ref().clone(),
            ttl,
            timeout: timeout.step_ref().clone(),
            _state: PhantomData,
        }))
    }

    /// Whether this is the terminal marker
    pub fn is_cancel(&self) -> bool {
        matches!(self, StepResult::Cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::correlation::{StepName, SubscriptionId};
    use crate::domain::step::{RouteId, StepKey};
    use crate::types::MessageType;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Hello {
        to: String,
    }

    impl Message for Hello {}

    fn registered<M: Message>(name: &str, index: usize) -> RegisteredStep<M, ()> {
        RegisteredStep::new(StepRef {
            route: RouteId(Uuid::nil()),
            index,
            key: StepKey {
                subscription: SubscriptionId::new("sub"),
                message_type: M::message_type(),
                name: StepName::new(name),
            },
        })
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let result = StepResult::pipeline(
            CorrelationId::new(),
            Outbound::send(&Hello { to: "bob".into() }).unwrap(),
            &registered::<Hello>("next", 0),
            Duration::ZERO,
            &registered::<TimeoutMessage>("timeout", 1),
        );
        assert!(matches!(result, Err(CoreError::InvalidTtl(_))));
    }

    #[test]
    fn test_out_of_range_ttl_is_rejected() {
        for ttl in [Duration::from_secs(1 << 50), Duration::MAX] {
            let result = StepResult::pipeline(
                CorrelationId::new(),
                Outbound::send(&Hello { to: "bob".into() }).unwrap(),
                &registered::<Hello>("next", 0),
                ttl,
                &registered::<TimeoutMessage>("timeout", 1),
            );
            assert!(matches!(result, Err(CoreError::InvalidTtl(_))), "{:?}", ttl);
        }
    }

    #[test]
    fn test_deadline_after() {
        let now = Utc::now();
        assert_eq!(
            deadline_after(now, Duration::from_secs(60)).unwrap(),
            now + chrono::Duration::seconds(60)
        );
        assert!(matches!(
            deadline_after(now, Duration::from_secs(1 << 50)),
            Err(CoreError::InvalidTtl(_))
        ));
    }

    #[test]
    fn test_pipeline_captures_references() {
        let cid = CorrelationId::new();
        let result = StepResult::pipeline(
            cid.clone(),
            Outbound::send(&Hello { to: "bob".into() }).unwrap(),
            &registered::<Hello>("next", 0),
            Duration::from_secs(300),
            &registered::<TimeoutMessage>("timeout", 1),
        )
        .unwrap();

        match result {
            StepResult::Pipeline(p) => {
                assert_eq!(p.correlation_id, cid);
                assert_eq!(p.next.index, 0);
                assert_eq!(p.timeout.index, 1);
                assert_eq!(p.ttl, Duration::from_secs(300));
                assert_eq!(p.outbound.envelope().message_type, Hello::message_type());
            }
            StepResult::Cancel => panic!("Expected a pipeline"),
        }
    }

    #[test]
    fn test_outbound_expiry() {
        let outbound = Outbound::send(&Hello { to: "bob".into() })
            .unwrap()
            .with_expiry(Duration::from_secs(60));
        assert!(outbound.envelope().expires_at.is_some());
        assert_eq!(
            outbound.envelope().message_type,
            MessageType::of::<Hello>()
        );
    }

    #[test]
    fn test_cancel_marker() {
        assert!(StepResult::<()>::cancel().is_cancel());
    }
}
