//!
//! RouteMaster Core - Step pipelines with correlation matching
//!
//! A route is a set of typed steps. Each step handles one message type and
//! returns a [`StepResult`]: either cancel the instance, or send a message and
//! wait for a reply step or a timeout step, whichever fires first. The
//! dispatcher keeps one pending continuation per correlation id and consumes it
//! atomically so that exactly one of the two branches runs.
//!
//! Transports, state persistence and timers are collaborators supplied through
//! [`Collaborators`]; `routemaster-state-inmemory` provides in-process versions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - identities, steps, results and collaborator interfaces
pub mod domain;

/// Application services - routes, dispatcher and timeout scheduling
pub mod application;

/// Core types and traits
pub mod types;

/// Error types
pub mod error;

/// Engine settings
pub mod settings;

pub use error::CoreError;
pub use settings::EngineSettings;
pub use types::{DataPacket, Envelope, Message, MessageType};

pub use domain::correlation::{CorrelationId, MaybeCorrelationId, StepName, SubscriptionId};
pub use domain::events::{Branch, DropReason, EngineEvent};
pub use domain::repository::{
    EngineEventHandler, InboundHandler, NoopEventHandler, StateStore, TimeoutEmitter,
    TimerHandle, Transport,
};
pub use domain::state_access::{State, StateAccess};
pub use domain::step::{RegisteredStep, Step, StepKey, StepKind, StepRef, TimeoutMessage};
pub use domain::step_result::{Outbound, Pipeline, StepResult};

pub use application::dispatcher::Dispatcher;
pub use application::route::{
    BuildLogic, Collaborators, Config, InstanceHandle, Route, RouteBuilder, Starter, StepTable,
};
pub use application::timeout_scheduler::TimeoutScheduler;
