//! Collaborator traits for the RouteMaster engine
//!
//! The engine only depends on these interfaces. External crates implement
//! them to provide transports, persistence and timers; the
//! `routemaster-state-inmemory` crate ships in-memory versions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::correlation::{CorrelationId, SubscriptionId};
use super::events::EngineEvent;
use crate::types::{Envelope, MessageType};
use crate::CoreError;

/// Persistence for per-instance state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the committed state of an instance
    async fn load(
        &self,
        subscription: &SubscriptionId,
        correlation_id: &CorrelationId,
    ) -> Result<Option<serde_json::Value>, CoreError>;

    /// Replace the committed state of an instance
    async fn save(
        &self,
        subscription: &SubscriptionId,
        correlation_id: &CorrelationId,
        state: serde_json::Value,
    ) -> Result<(), CoreError>;

    /// Remove the state of an instance
    async fn delete(
        &self,
        subscription: &SubscriptionId,
        correlation_id: &CorrelationId,
    ) -> Result<(), CoreError>;
}

/// Receives envelopes delivered by a transport
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one delivered envelope
    async fn deliver(&self, envelope: Envelope);
}

/// Moves envelopes between producers and consumers
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an envelope
    async fn send(&self, envelope: Envelope) -> Result<(), CoreError>;

    /// Deliver every envelope of `message_type` to `handler`
    ///
    /// Subscribing the same subscription to the same type again replaces the handler.
    async fn subscribe(
        &self,
        subscription: &SubscriptionId,
        message_type: &MessageType,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), CoreError>;
}

/// Handle returned by a timeout emitter for a scheduled emission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub String);

/// Emits envelopes back into the inbound path after a delay
#[async_trait]
pub trait TimeoutEmitter: Send + Sync {
    /// Emit `envelope` once `after` has elapsed
    async fn schedule_once(
        &self,
        envelope: Envelope,
        after: Duration,
    ) -> Result<TimerHandle, CoreError>;

    /// Cancel a scheduled emission; `false` if it already fired or was unknown
    async fn cancel(&self, handle: &TimerHandle) -> Result<bool, CoreError>;
}

/// Observability sink for engine events
#[async_trait]
pub trait EngineEventHandler: Send + Sync {
    /// Handle an engine event
    async fn handle_event(&self, event: EngineEvent) -> Result<(), CoreError>;
}

/// Event handler that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventHandler;

#[async_trait]
impl EngineEventHandler for NoopEventHandler {
    async fn handle_event(&self, _event: EngineEvent) -> Result<(), CoreError> {
        Ok(())
    }
}
