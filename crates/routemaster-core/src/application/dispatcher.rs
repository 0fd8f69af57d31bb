//! Engine dispatcher
//!
//! Routes inbound envelopes to the step armed for their instance. Each
//! instance has at most one pending continuation, which is consumed with an
//! atomic check-and-clear so that a reply and a timeout racing for the same
//! hop result in exactly one handler invocation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::route::{Collaborators, InstanceHandle, Starter, StepTable};
use super::timeout_scheduler::TimeoutScheduler;
use crate::domain::correlation::{CorrelationId, StepName, SubscriptionId};
use crate::domain::events::{Branch, DropReason, EngineEvent};
use crate::domain::repository::{EngineEventHandler, InboundHandler, StateStore, Transport};
use crate::domain::state_access::{State, StateAccess};
use crate::domain::step::{StepRef, TimeoutMessage};
use crate::domain::step_result::{deadline_after, Pipeline, StepResult};
use crate::settings::EngineSettings;
use crate::types::{Envelope, MessageType};
use crate::CoreError;

/// Continuation armed for one instance
#[derive(Debug, Clone)]
struct PendingContinuation {
    next: StepRef,
    timeout: StepRef,
    token: Uuid,
    deadline: DateTime<Utc>,
    armed_at: DateTime<Utc>,
}

/// Applies step results and dispatches inbound messages for one route
pub struct Dispatcher<S> {
    subscription: SubscriptionId,
    table: StepTable<S>,
    pending: DashMap<CorrelationId, PendingContinuation>,
    // last consumed continuation per live instance, used to tell duplicates from strays
    recent: DashMap<CorrelationId, PendingContinuation>,
    scheduler: TimeoutScheduler,
    transport: Arc<dyn Transport>,
    state_store: Arc<dyn StateStore>,
    events: Arc<dyn EngineEventHandler>,
    settings: EngineSettings,
}

impl<S: State> Dispatcher<S> {
    pub(crate) fn new(
        subscription: SubscriptionId,
        table: StepTable<S>,
        collaborators: Collaborators,
        settings: EngineSettings,
    ) -> Self {
        Self {
            scheduler: TimeoutScheduler::new(
                subscription.clone(),
                collaborators.timeout_emitter,
            ),
            subscription,
            table,
            pending: DashMap::new(),
            recent: DashMap::new(),
            transport: collaborators.transport,
            state_store: collaborators.state_store,
            events: collaborators.events,
            settings,
        }
    }

    /// Subscription this dispatcher serves
    pub fn subscription(&self) -> &SubscriptionId {
        &self.subscription
    }

    /// Number of steps in the route
    pub fn step_count(&self) -> usize {
        self.table.len()
    }

    /// Whether a continuation is armed for the instance
    pub fn is_armed(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Number of armed continuations
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Deadline of the continuation armed for the instance
    pub fn deadline(&self, correlation_id: &CorrelationId) -> Option<DateTime<Utc>> {
        self.pending.get(correlation_id).map(|p| p.deadline)
    }

    pub(crate) async fn start_instance(
        &self,
        starter: &dyn Starter<S>,
        initial: S,
    ) -> Result<InstanceHandle, CoreError> {
        let correlation_id = CorrelationId::new();
        let value = serde_json::to_value(&initial)?;
        self.state_store
            .save(&self.subscription, &correlation_id, value)
            .await?;

        self.emit(EngineEvent::InstanceStarted {
            subscription: self.subscription.clone(),
            correlation_id: correlation_id.clone(),
            timestamp: Utc::now(),
        })
        .await;

        let outcome = match starter.start(correlation_id.clone(), &initial).await {
            Ok(result) => self.apply(&correlation_id, result).await,
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            self.fault(&correlation_id, None, e.clone()).await;
            return Err(e);
        }

        Ok(InstanceHandle {
            correlation_id,
            subscription: self.subscription.clone(),
        })
    }

    /// Act on a step result for `instance`
    async fn apply(&self, instance: &CorrelationId, result: StepResult<S>) -> Result<(), CoreError> {
        match result {
            StepResult::Cancel => {
                self.cancel(instance).await;
                Ok(())
            }
            StepResult::Pipeline(pipeline) => self.arm_and_send(instance, pipeline).await,
        }
    }

    async fn arm_and_send(
        &self,
        instance: &CorrelationId,
        pipeline: Pipeline<S>,
    ) -> Result<(), CoreError> {
        for step_ref in [&pipeline.next, &pipeline.timeout] {
            if !self.table.contains(step_ref) {
                return Err(CoreError::UnregisteredStepReference(step_ref.key.to_string()));
            }
        }
        if &pipeline.correlation_id != instance {
            return Err(CoreError::CorrelationMismatch(format!(
                "pipeline for {} returned while handling {}",
                pipeline.correlation_id, instance
            )));
        }

        let token = Uuid::new_v4();
        let armed_at = Utc::now();
        let deadline = deadline_after(armed_at, pipeline.ttl)?;

        self.pending.insert(
            instance.clone(),
            PendingContinuation {
                next: pipeline.next.clone(),
                timeout: pipeline.timeout.clone(),
                token,
                deadline,
                armed_at,
            },
        );

        let deadline = match self.scheduler.arm(instance, token, pipeline.ttl).await {
            Ok(deadline) => deadline,
            Err(e) => {
                self.pending.remove_if(instance, |_, p| p.token == token);
                return Err(e);
            }
        };

        let still_armed = match self.pending.get_mut(instance) {
            Some(mut entry) if entry.token == token => {
                entry.deadline = deadline;
                true
            }
            _ => false,
        };
        // a very short timer may already have consumed the continuation
        if !still_armed {
            self.scheduler.disarm(instance, token).await;
        }

        self.emit(EngineEvent::ContinuationArmed {
            subscription: self.subscription.clone(),
            correlation_id: instance.clone(),
            next: pipeline.next.key.name.clone(),
            timeout: pipeline.timeout.key.name.clone(),
            deadline,
            timestamp: Utc::now(),
        })
        .await;

        let envelope = pipeline.outbound.into_envelope();
        let message_type = envelope.message_type.clone();
        if let Err(e) = self.transport.send(envelope).await {
            warn!(
                subscription = %self.subscription,
                correlation_id = %instance,
                "Failed to send {}, rolling back continuation: {}",
                message_type,
                e
            );
            self.pending.remove_if(instance, |_, p| p.token == token);
            self.scheduler.disarm(instance, token).await;
            return Err(e);
        }

        debug!(
            subscription = %self.subscription,
            correlation_id = %instance,
            step = %pipeline.next.key.name,
            "Sent {}, waiting until {}",
            message_type,
            deadline
        );
        Ok(())
    }

    async fn on_timeout(&self, envelope: Envelope) {
        let timeout = match envelope.decode::<TimeoutMessage>() {
            Ok(timeout) => timeout,
            Err(e) => {
                debug!(subscription = %self.subscription, "Undecodable timeout message: {}", e);
                self.drop_message(&envelope.message_type, None, DropReason::Unattributed)
                    .await;
                return;
            }
        };
        let correlation_id = timeout.correlation_id.clone();

        let consumed = self
            .pending
            .remove_if(&correlation_id, |_, p| p.token == timeout.token);
        match consumed {
            Some((_, pending)) => {
                let index = pending.timeout.index;
                self.resolve(correlation_id, pending, Branch::Timeout, index, envelope)
                    .await;
            }
            None => {
                let duplicate = self
                    .recent
                    .get(&correlation_id)
                    .map(|r| r.token == timeout.token)
                    .unwrap_or(false);
                self.reject(&envelope.message_type, correlation_id, duplicate)
                    .await;
            }
        }
    }

    async fn on_reply(&self, envelope: Envelope) {
        let candidates = self.table.candidates(&envelope.message_type);
        let mut attributed: Option<CorrelationId> = None;

        for &index in candidates {
            let Some(step) = self.table.step(index) else {
                continue;
            };
            let Some(correlation_id) = step.extract(&envelope) else {
                continue;
            };

            let consumed = self
                .pending
                .remove_if(&correlation_id, |_, p| p.next.index == index);
            if let Some((_, pending)) = consumed {
                self.resolve(correlation_id, pending, Branch::Reply, index, envelope)
                    .await;
                return;
            }
            attributed.get_or_insert(correlation_id);
        }

        match attributed {
            Some(correlation_id) => {
                let duplicate = self
                    .recent
                    .get(&correlation_id)
                    .map(|r| candidates.contains(&r.next.index))
                    .unwrap_or(false);
                self.reject(&envelope.message_type, correlation_id, duplicate)
                    .await;
            }
            None => {
                self.drop_message(&envelope.message_type, None, DropReason::Unattributed)
                    .await
            }
        }
    }

    /// Report a message that matched no armed continuation
    async fn reject(&self, message_type: &MessageType, correlation_id: CorrelationId, duplicate: bool) {
        if duplicate {
            debug!(
                subscription = %self.subscription,
                correlation_id = %correlation_id,
                "Suppressed duplicate {}",
                message_type
            );
            self.emit(EngineEvent::DuplicateSuppressed {
                subscription: self.subscription.clone(),
                message_type: message_type.clone(),
                correlation_id,
                timestamp: Utc::now(),
            })
            .await;
            return;
        }

        let reason = if self.pending.contains_key(&correlation_id) {
            DropReason::StepMismatch
        } else {
            DropReason::NoPendingContinuation
        };
        self.drop_message(message_type, Some(correlation_id), reason)
            .await;
    }

    async fn drop_message(
        &self,
        message_type: &MessageType,
        correlation_id: Option<CorrelationId>,
        reason: DropReason,
    ) {
        debug!(
            subscription = %self.subscription,
            correlation_id = ?correlation_id.as_ref().map(|c| c.as_str()),
            reason = %reason,
            "Dropped {}",
            message_type
        );
        self.emit(EngineEvent::MessageDropped {
            subscription: self.subscription.clone(),
            message_type: message_type.clone(),
            correlation_id,
            reason,
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Run the step of a consumed continuation and apply its result
    async fn resolve(
        &self,
        correlation_id: CorrelationId,
        pending: PendingContinuation,
        branch: Branch,
        index: usize,
        envelope: Envelope,
    ) {
        let token = pending.token;
        let waited = Utc::now() - pending.armed_at;
        self.recent.insert(correlation_id.clone(), pending);
        self.scheduler.disarm(&correlation_id, token).await;

        let Some(step) = self.table.step(index).cloned() else {
            self.fault(
                &correlation_id,
                None,
                CoreError::UnregisteredStepReference(format!("step index {}", index)),
            )
            .await;
            return;
        };
        let step_name = step.name().clone();

        let (access, commit) = match StateAccess::<S>::open(
            self.state_store.as_ref(),
            &self.subscription,
            &correlation_id,
        )
        .await
        {
            Ok(opened) => opened,
            Err(CoreError::StateNotFound(_)) => {
                self.recent.remove(&correlation_id);
                self.drop_message(
                    &envelope.message_type,
                    Some(correlation_id),
                    DropReason::StateNotFound,
                )
                .await;
                return;
            }
            Err(e) => {
                self.fault(&correlation_id, Some(step_name), e).await;
                return;
            }
        };

        debug!(
            subscription = %self.subscription,
            correlation_id = %correlation_id,
            step = %step_name,
            branch = ?branch,
            waited_ms = waited.num_milliseconds(),
            "Resolved continuation"
        );
        self.emit(EngineEvent::ContinuationResolved {
            subscription: self.subscription.clone(),
            correlation_id: correlation_id.clone(),
            step: step_name.clone(),
            branch,
            timestamp: Utc::now(),
        })
        .await;

        let handler = match step.invoke(access, &envelope) {
            Ok(handler) => handler,
            Err(e) => {
                drop(commit);
                self.fault(&correlation_id, Some(step_name), e).await;
                return;
            }
        };

        let guarded = AssertUnwindSafe(handler).catch_unwind();
        let outcome = match self.settings.handler_timeout() {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(CoreError::faulted(
                    correlation_id.as_str(),
                    format!("step {} exceeded {:?}", step_name, limit),
                ))),
            },
            None => guarded.await,
        };

        let written = commit.finish();
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                self.fault(&correlation_id, Some(step_name), e).await;
                return;
            }
            Err(panic) => {
                let reason = format!("step {} panicked: {}", step_name, panic_message(panic.as_ref()));
                self.fault(
                    &correlation_id,
                    Some(step_name),
                    CoreError::faulted(correlation_id.as_str(), reason),
                )
                .await;
                return;
            }
        };

        if let Some(state) = written {
            if let Err(e) = self.commit_state(&correlation_id, &state).await {
                self.fault(&correlation_id, Some(step_name), e).await;
                return;
            }
        }

        if let Err(e) = self.apply(&correlation_id, result).await {
            self.fault(&correlation_id, Some(step_name), e).await;
        }
    }

    async fn commit_state(&self, correlation_id: &CorrelationId, state: &S) -> Result<(), CoreError> {
        let value = serde_json::to_value(state)?;
        self.state_store
            .save(&self.subscription, correlation_id, value)
            .await
    }

    /// Terminal transition; safe to call more than once
    async fn cancel(&self, correlation_id: &CorrelationId) {
        if let Some((_, pending)) = self.pending.remove(correlation_id) {
            self.scheduler.disarm(correlation_id, pending.token).await;
        }
        self.recent.remove(correlation_id);

        if !self.settings.retain_state_on_cancel {
            if let Err(e) = self
                .state_store
                .delete(&self.subscription, correlation_id)
                .await
            {
                warn!(
                    subscription = %self.subscription,
                    correlation_id = %correlation_id,
                    "Failed to delete state of cancelled instance: {}",
                    e
                );
            }
        }

        info!(
            subscription = %self.subscription,
            correlation_id = %correlation_id,
            "Instance cancelled"
        );
        self.emit(EngineEvent::InstanceCancelled {
            subscription: self.subscription.clone(),
            correlation_id: correlation_id.clone(),
            timestamp: Utc::now(),
        })
        .await;
    }

    /// Stop an instance after a failure; nothing stays armed for it
    async fn fault(&self, correlation_id: &CorrelationId, step: Option<StepName>, error: CoreError) {
        if let Some((_, pending)) = self.pending.remove(correlation_id) {
            self.scheduler.disarm(correlation_id, pending.token).await;
        }
        self.recent.remove(correlation_id);

        error!(
            subscription = %self.subscription,
            correlation_id = %correlation_id,
            step = ?step.as_ref().map(|s| s.0.as_str()),
            "Instance faulted: {}",
            error
        );

        if !self.settings.retain_state_on_fault {
            if let Err(e) = self
                .state_store
                .delete(&self.subscription, correlation_id)
                .await
            {
                warn!(
                    subscription = %self.subscription,
                    correlation_id = %correlation_id,
                    "Failed to delete state of faulted instance: {}",
                    e
                );
            }
        }

        self.emit(EngineEvent::InstanceFaulted {
            subscription: self.subscription.clone(),
            correlation_id: correlation_id.clone(),
            step,
            error,
            timestamp: Utc::now(),
        })
        .await;
    }

    async fn emit(&self, event: EngineEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.events.handle_event(event).await {
            warn!(
                subscription = %self.subscription,
                "Event handler failed for {}: {}",
                event_type,
                e
            );
        }
    }
}

#[async_trait]
impl<S: State> InboundHandler for Dispatcher<S> {
    async fn deliver(&self, envelope: Envelope) {
        if let Some(destination) = &envelope.destination {
            if destination != &self.subscription {
                return;
            }
        }

        if envelope.is::<TimeoutMessage>() {
            self.on_timeout(envelope).await;
        } else {
            self.on_reply(envelope).await;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
