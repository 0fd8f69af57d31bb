//! Steps and their registration
//!
//! A [`Step`] pairs a correlation extractor with an async handler. Registering
//! it on a [`RouteBuilder`] yields a [`RegisteredStep`], an index into the
//! route's step arena that other steps can name as a continuation.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

use super::correlation::{CorrelationId, MaybeCorrelationId, StepName, SubscriptionId};
use super::state_access::{State, StateAccess};
use super::step_result::StepResult;
use crate::application::route::RouteBuilder;
use crate::types::{Envelope, Message, MessageType};
use crate::CoreError;

/// Future produced by a step handler
pub type StepFuture<S> = BoxFuture<'static, Result<StepResult<S>, CoreError>>;

type Extractor<M> = Arc<dyn Fn(&M) -> MaybeCorrelationId + Send + Sync>;
type Handler<M, S> = Arc<dyn Fn(StateAccess<S>, M) -> StepFuture<S> + Send + Sync>;

/// Synthetic message emitted when an armed deadline elapses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutMessage {
    /// Instance whose deadline elapsed
    pub correlation_id: CorrelationId,
    /// Identifies the arm this timeout belongs to
    pub token: Uuid,
    /// The deadline that elapsed
    pub deadline: DateTime<Utc>,
}

impl Message for TimeoutMessage {
    fn message_type() -> MessageType {
        MessageType("routemaster.timeout".to_string())
    }
}

/// Flavor of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Handles a domain reply message
    Reply,
    /// Handles the synthetic timeout message
    Timeout,
}

/// A named, typed unit of workflow logic
///
/// Immutable once created; cloning only bumps reference counts.
pub struct Step<M, S> {
    name: StepName,
    kind: StepKind,
    extractor: Extractor<M>,
    handler: Handler<M, S>,
}

impl<M, S> Clone for Step<M, S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind,
            extractor: self.extractor.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<M, S> fmt::Debug for Step<M, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl<M: Message, S: State> Step<M, S> {
    /// Create a step that handles reply messages of type `M`
    ///
    /// `extractor` attributes a message to an instance and must not fail;
    /// returning `None` drops the message.
    pub fn create<E, H, Fut>(name: StepName, extractor: E, handler: H) -> Self
    where
        E: Fn(&M) -> MaybeCorrelationId + Send + Sync + 'static,
        H: Fn(StateAccess<S>, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResult<S>, CoreError>> + Send + 'static,
    {
        Self {
            name,
            kind: StepKind::Reply,
            extractor: Arc::new(extractor),
            handler: Arc::new(move |access: StateAccess<S>, message: M| -> StepFuture<S> {
                Box::pin(handler(access, message))
            }),
        }
    }

    /// Step name
    pub fn name(&self) -> &StepName {
        &self.name
    }

    /// Step flavor
    pub fn kind(&self) -> StepKind {
        self.kind
    }

    /// Attribute a message to an instance
    pub fn extract(&self, message: &M) -> MaybeCorrelationId {
        (self.extractor)(message)
    }

    /// Bind the step to a route under construction
    pub fn register(&self, builder: &mut RouteBuilder<S>) -> RegisteredStep<M, S> {
        builder.register_step(self.clone())
    }
}

impl<S: State> Step<TimeoutMessage, S> {
    /// Create a step that runs when an armed deadline elapses
    pub fn create_timeout<H, Fut>(name: StepName, handler: H) -> Self
    where
        H: Fn(StateAccess<S>, TimeoutMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResult<S>, CoreError>> + Send + 'static,
    {
        Self {
            name,
            kind: StepKind::Timeout,
            extractor: Arc::new(|tm: &TimeoutMessage| Some(tm.correlation_id.clone())),
            handler: Arc::new(move |access: StateAccess<S>, message: TimeoutMessage| -> StepFuture<S> {
                Box::pin(handler(access, message))
            }),
        }
    }
}

/// Identity of a route builder, shared by every step registered on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(pub Uuid);

/// Route-scoped identity of a registered step
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey {
    /// Route partition
    pub subscription: SubscriptionId,
    /// Message type the step handles
    pub message_type: MessageType,
    /// Step name
    pub name: StepName,
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subscription, self.message_type, self.name)
    }
}

/// Untyped reference to a registered step; an index into the route's step table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepRef {
    /// Route the step was registered on
    pub route: RouteId,
    /// Position in the route's step table
    pub index: usize,
    /// Identity of the step
    pub key: StepKey,
}

/// A step bound to a route
pub struct RegisteredStep<M, S> {
    step_ref: StepRef,
    _marker: PhantomData<fn() -> (M, S)>,
}

impl<M, S> RegisteredStep<M, S> {
    pub(crate) fn new(step_ref: StepRef) -> Self {
        Self {
            step_ref,
            _marker: PhantomData,
        }
    }

    /// Untyped reference used in pipelines
    pub fn step_ref(&self) -> &StepRef {
        &self.step_ref
    }

    /// Step name
    pub fn name(&self) -> &StepName {
        &self.step_ref.key.name
    }
}

impl<M, S> Clone for RegisteredStep<M, S> {
    fn clone(&self) -> Self {
        Self::new(self.step_ref.clone())
    }
}

impl<M, S> fmt::Debug for RegisteredStep<M, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RegisteredStep").field(&self.step_ref).finish()
    }
}

/// Type-erased step stored in a route's step table
pub(crate) trait ErasedStep<S>: Send + Sync {
    fn name(&self) -> &StepName;

    fn kind(&self) -> StepKind;

    fn message_type(&self) -> MessageType;

    /// Attribute an envelope; decode failures count as absent
    fn extract(&self, envelope: &Envelope) -> MaybeCorrelationId;

    /// Decode the envelope and start the handler
    fn invoke(&self, access: StateAccess<S>, envelope: &Envelope)
        -> Result<StepFuture<S>, CoreError>;
}

impl<M: Message, S: State> ErasedStep<S> for Step<M, S> {
    fn name(&self) -> &StepName {
        &self.name
    }

    fn kind(&self) -> StepKind {
        self.kind
    }

    fn message_type(&self) -> MessageType {
        M::message_type()
    }

    fn extract(&self, envelope: &Envelope) -> MaybeCorrelationId {
        if !envelope.is::<M>() {
            return None;
        }
        match envelope.decode::<M>() {
            Ok(message) => (self.extractor)(&message),
            Err(e) => {
                tracing::debug!(step = %self.name, envelope = %envelope.id, "Undecodable payload: {}", e);
                None
            }
        }
    }

    fn invoke(
        &self,
        access: StateAccess<S>,
        envelope: &Envelope,
    ) -> Result<StepFuture<S>, CoreError> {
        let message = envelope.decode::<M>()?;
        Ok((self.handler)(access, message))
    }
}
