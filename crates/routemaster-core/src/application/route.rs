//! Route construction and instance start
//!
//! A workflow author implements [`BuildLogic`] to register steps on a
//! [`RouteBuilder`] and return a [`Starter`]. [`Config::build_route`] finalizes
//! the builder, wires a dispatcher to the transport and hands back a [`Route`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use crate::domain::correlation::{CorrelationId, SubscriptionId};
use crate::domain::repository::{
    EngineEventHandler, InboundHandler, NoopEventHandler, StateStore, TimeoutEmitter, Transport,
};
use crate::domain::state_access::State;
use crate::domain::step::{ErasedStep, RegisteredStep, RouteId, Step, StepKey, StepRef, TimeoutMessage};
use crate::domain::step_result::StepResult;
use crate::settings::EngineSettings;
use crate::types::{Message, MessageType};
use crate::CoreError;

/// External services a route runs on
#[derive(Clone)]
pub struct Collaborators {
    /// Moves messages between the route and the outside world
    pub transport: Arc<dyn Transport>,
    /// Per-instance state persistence
    pub state_store: Arc<dyn StateStore>,
    /// Emits timeout messages back into the inbound path
    pub timeout_emitter: Arc<dyn TimeoutEmitter>,
    /// Observability sink
    pub events: Arc<dyn EngineEventHandler>,
}

impl Collaborators {
    /// Collaborators with a no-op event sink
    pub fn new(
        transport: Arc<dyn Transport>,
        state_store: Arc<dyn StateStore>,
        timeout_emitter: Arc<dyn TimeoutEmitter>,
    ) -> Self {
        Self {
            transport,
            state_store,
            timeout_emitter,
            events: Arc::new(NoopEventHandler),
        }
    }

    /// Replace the event sink
    pub fn with_events(mut self, events: Arc<dyn EngineEventHandler>) -> Self {
        self.events = events;
        self
    }
}

/// Everything needed to build routes for one subscription
#[derive(Clone)]
pub struct Config {
    subscription: SubscriptionId,
    collaborators: Collaborators,
    settings: EngineSettings,
}

impl Config {
    /// Create a config with default settings
    pub fn new(subscription: SubscriptionId, collaborators: Collaborators) -> Self {
        Self::with_settings(subscription, collaborators, EngineSettings::default())
    }

    /// Create a config with explicit settings
    pub fn with_settings(
        subscription: SubscriptionId,
        collaborators: Collaborators,
        settings: EngineSettings,
    ) -> Self {
        Self {
            subscription,
            collaborators,
            settings,
        }
    }

    /// Subscription routes built from this config belong to
    pub fn subscription(&self) -> &SubscriptionId {
        &self.subscription
    }

    /// Engine settings
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Collaborators routes built from this config use
    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Fresh builder scoped to this config's subscription
    pub fn route_builder<S: State>(&self) -> RouteBuilder<S> {
        RouteBuilder::new(self.subscription.clone())
    }

    /// Build, validate and subscribe a route
    ///
    /// Registration errors abort the build; nothing is subscribed in that case.
    pub async fn build_route<S, L>(&self, logic: &L) -> Result<Route<S>, CoreError>
    where
        S: State,
        L: BuildLogic<S>,
    {
        let mut builder = self.route_builder::<S>();
        let starter = logic.build(&mut builder);
        let table = builder.finalize(&starter)?;

        let mut message_types: Vec<MessageType> = Vec::new();
        for message_type in table
            .message_types()
            .chain(std::iter::once(TimeoutMessage::message_type()))
        {
            if !message_types.contains(&message_type) {
                message_types.push(message_type);
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(
            self.subscription.clone(),
            table,
            self.collaborators.clone(),
            self.settings.clone(),
        ));

        let handler: Arc<dyn InboundHandler> = dispatcher.clone();
        for message_type in &message_types {
            self.collaborators
                .transport
                .subscribe(&self.subscription, message_type, handler.clone())
                .await?;
            debug!(
                subscription = %self.subscription,
                "Subscribed route to {}",
                message_type
            );
        }

        info!(
            subscription = %self.subscription,
            steps = dispatcher.step_count(),
            "Route built"
        );

        Ok(Route {
            dispatcher,
            starter: Arc::new(starter),
        })
    }
}

/// Supplied by the workflow author: registers steps and returns the starter
pub trait BuildLogic<S: State> {
    /// Starter produced by the build
    type Starter: Starter<S> + 'static;

    /// Register the route's steps
    fn build(&self, builder: &mut RouteBuilder<S>) -> Self::Starter;
}

/// Produces the first hop of a new instance
#[async_trait]
pub trait Starter<S: State>: Send + Sync {
    /// First step result for a freshly created instance
    ///
    /// The returned pipeline must carry `correlation_id`.
    async fn start(
        &self,
        correlation_id: CorrelationId,
        state: &S,
    ) -> Result<StepResult<S>, CoreError>;

    /// Every step the starter may reference, validated when the route is finalized
    ///
    /// A starter that only ever cancels returns an empty list.
    fn continuations(&self) -> Vec<StepRef>;
}

/// Collects step registrations for one route
pub struct RouteBuilder<S> {
    route_id: RouteId,
    subscription: SubscriptionId,
    steps: Vec<Arc<dyn ErasedStep<S>>>,
    keys: Vec<StepKey>,
    duplicates: Vec<StepKey>,
}

impl<S> fmt::Debug for RouteBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteBuilder")
            .field("route_id", &self.route_id)
            .field("subscription", &self.subscription)
            .field("steps", &self.keys)
            .finish()
    }
}

impl<S: State> RouteBuilder<S> {
    /// Empty builder for a subscription
    pub fn new(subscription: SubscriptionId) -> Self {
        Self {
            route_id: RouteId(Uuid::new_v4()),
            subscription,
            steps: Vec::new(),
            keys: Vec::new(),
            duplicates: Vec::new(),
        }
    }

    /// Subscription the route belongs to
    pub fn subscription(&self) -> &SubscriptionId {
        &self.subscription
    }

    /// Register a step; same as [`Step::register`]
    pub fn register<M: Message>(&mut self, step: &Step<M, S>) -> RegisteredStep<M, S> {
        self.register_step(step.clone())
    }

    pub(crate) fn register_step<M: Message>(&mut self, step: Step<M, S>) -> RegisteredStep<M, S> {
        let key = StepKey {
            subscription: self.subscription.clone(),
            message_type: M::message_type(),
            name: step.name().clone(),
        };
        if self.keys.contains(&key) {
            // reported by finalize
            self.duplicates.push(key.clone());
        }

        let index = self.steps.len();
        self.steps.push(Arc::new(step));
        self.keys.push(key.clone());

        RegisteredStep::new(StepRef {
            route: self.route_id,
            index,
            key,
        })
    }

    /// Validate registrations and the starter's references
    pub fn finalize(self, starter: &dyn Starter<S>) -> Result<StepTable<S>, CoreError> {
        if !self.duplicates.is_empty() {
            let names: Vec<String> = self.duplicates.iter().map(|k| k.to_string()).collect();
            return Err(CoreError::DuplicateRegistration(names.join(", ")));
        }

        let table = StepTable::new(self.route_id, self.steps, self.keys);
        let foreign: Vec<String> = starter
            .continuations()
            .iter()
            .filter(|step_ref| !table.contains(step_ref))
            .map(|step_ref| step_ref.key.to_string())
            .collect();
        if !foreign.is_empty() {
            return Err(CoreError::UnregisteredStepReference(foreign.join(", ")));
        }

        Ok(table)
    }
}

/// Finalized, immutable step arena of a route
pub struct StepTable<S> {
    route_id: RouteId,
    steps: Vec<Arc<dyn ErasedStep<S>>>,
    keys: Vec<StepKey>,
    by_type: HashMap<MessageType, Vec<usize>>,
}

impl<S> StepTable<S> {
    fn new(route_id: RouteId, steps: Vec<Arc<dyn ErasedStep<S>>>, keys: Vec<StepKey>) -> Self {
        let mut by_type: HashMap<MessageType, Vec<usize>> = HashMap::new();
        for (index, key) in keys.iter().enumerate() {
            by_type
                .entry(key.message_type.clone())
                .or_default()
                .push(index);
        }
        Self {
            route_id,
            steps,
            keys,
            by_type,
        }
    }

    /// Whether `step_ref` points at a step registered on this route
    pub fn contains(&self, step_ref: &StepRef) -> bool {
        step_ref.route == self.route_id && self.keys.get(step_ref.index) == Some(&step_ref.key)
    }

    /// Number of registered steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no step is registered
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Distinct message types handled by the route
    pub fn message_types(&self) -> impl Iterator<Item = MessageType> + '_ {
        self.by_type.keys().cloned()
    }

    pub(crate) fn step(&self, index: usize) -> Option<&Arc<dyn ErasedStep<S>>> {
        self.steps.get(index)
    }

    pub(crate) fn candidates(&self, message_type: &MessageType) -> &[usize] {
        self.by_type
            .get(message_type)
            .map(|indices| indices.as_slice())
            .unwrap_or(&[])
    }
}

/// Identifies a started instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceHandle {
    /// Correlation id assigned at start
    pub correlation_id: CorrelationId,
    /// Route the instance belongs to
    pub subscription: SubscriptionId,
}

/// A built route; the only way to create instances
pub struct Route<S: State> {
    dispatcher: Arc<Dispatcher<S>>,
    starter: Arc<dyn Starter<S>>,
}

impl<S: State> Clone for Route<S> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            starter: self.starter.clone(),
        }
    }
}

impl<S: State> Route<S> {
    /// Create an instance with `initial` state and run its first hop
    ///
    /// Returns once the first continuation is armed and its message sent, or
    /// with the error that prevented it.
    pub async fn start(&self, initial: S) -> Result<InstanceHandle, CoreError> {
        self.dispatcher
            .start_instance(self.starter.as_ref(), initial)
            .await
    }

    /// Subscription the route belongs to
    pub fn subscription(&self) -> &SubscriptionId {
        self.dispatcher.subscription()
    }

    /// Whether a continuation is armed for the instance
    pub fn is_armed(&self, correlation_id: &CorrelationId) -> bool {
        self.dispatcher.is_armed(correlation_id)
    }

    /// Number of instances waiting on a reply or timeout
    pub fn pending_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Dispatcher subscribed on the transport for this route
    pub fn dispatcher(&self) -> Arc<Dispatcher<S>> {
        self.dispatcher.clone()
    }
}
