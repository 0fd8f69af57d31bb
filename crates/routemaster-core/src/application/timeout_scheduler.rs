//! Per-instance deadlines
//!
//! Keeps at most one armed timer per correlation id on top of a
//! [`TimeoutEmitter`]. Cancellation is best-effort: a timeout already in
//! flight is de-duplicated by the dispatcher through its arm token.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::correlation::{CorrelationId, SubscriptionId};
use crate::domain::repository::{TimeoutEmitter, TimerHandle};
use crate::domain::step::TimeoutMessage;
use crate::domain::step_result::deadline_after;
use crate::types::Envelope;
use crate::CoreError;

#[derive(Debug, Clone)]
struct ArmedTimer {
    token: Uuid,
    handle: TimerHandle,
    deadline: DateTime<Utc>,
}

/// Arms and disarms timeout emissions for one route
pub struct TimeoutScheduler {
    subscription: SubscriptionId,
    emitter: Arc<dyn TimeoutEmitter>,
    armed: DashMap<CorrelationId, ArmedTimer>,
}

impl TimeoutScheduler {
    /// Create a scheduler emitting timeouts addressed to `subscription`
    pub fn new(subscription: SubscriptionId, emitter: Arc<dyn TimeoutEmitter>) -> Self {
        Self {
            subscription,
            emitter,
            armed: DashMap::new(),
        }
    }

    /// Schedule a one-shot `TimeoutMessage` for `correlation_id` after `ttl`
    ///
    /// Replaces (and cancels) any timer previously armed for the id.
    pub async fn arm(
        &self,
        correlation_id: &CorrelationId,
        token: Uuid,
        ttl: Duration,
    ) -> Result<DateTime<Utc>, CoreError> {
        if ttl.is_zero() {
            return Err(CoreError::InvalidTtl(format!(
                "timeout for {} must have a positive ttl",
                correlation_id
            )));
        }
        let deadline = deadline_after(Utc::now(), ttl)?;

        let message = TimeoutMessage {
            correlation_id: correlation_id.clone(),
            token,
            deadline,
        };
        let envelope = Envelope::wrap(&message)?.addressed_to(self.subscription.clone());
        let handle = self.emitter.schedule_once(envelope, ttl).await?;

        debug!(
            subscription = %self.subscription,
            correlation_id = %correlation_id,
            timer = %handle.0,
            "Armed timeout at {}",
            deadline
        );

        let previous = self.armed.insert(
            correlation_id.clone(),
            ArmedTimer {
                token,
                handle,
                deadline,
            },
        );
        if let Some(previous) = previous {
            if previous.token != token {
                self.cancel_quietly(correlation_id, &previous.handle).await;
            }
        }

        Ok(deadline)
    }

    /// Cancel the timer armed with `token` for `correlation_id`
    ///
    /// Returns `true` if a pending emission was cancelled. A timer armed with a
    /// different token is left alone.
    pub async fn disarm(&self, correlation_id: &CorrelationId, token: Uuid) -> bool {
        match self
            .armed
            .remove_if(correlation_id, |_, armed| armed.token == token)
        {
            Some((_, armed)) => self.cancel_quietly(correlation_id, &armed.handle).await,
            None => false,
        }
    }

    /// Deadline currently armed for the id
    pub fn deadline(&self, correlation_id: &CorrelationId) -> Option<DateTime<Utc>> {
        self.armed.get(correlation_id).map(|armed| armed.deadline)
    }

    /// Number of armed timers
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    async fn cancel_quietly(&self, correlation_id: &CorrelationId, handle: &TimerHandle) -> bool {
        match self.emitter.cancel(handle).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(
                    subscription = %self.subscription,
                    correlation_id = %correlation_id,
                    "Failed to cancel timer {}: {}",
                    handle.0,
                    e
                );
                false
            }
        }
    }
}
