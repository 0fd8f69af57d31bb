//! In-memory collaborators for RouteMaster
//!
//! This crate provides in-memory implementations of the collaborator
//! interfaces defined in the routemaster-core crate. It is primarily useful
//! for development, testing, and single-process deployments where durability
//! is not required.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod event_log;
pub mod repositories;

pub use event_log::RecordingEventHandler;
pub use repositories::{InMemoryStateStore, InMemoryTransport, TokioTimeoutEmitter};

use routemaster_core::{Collaborators, Config, EngineEventHandler, EngineSettings, SubscriptionId};

/// Provider for in-memory collaborators
///
/// Configs created from one provider share a transport, a state store and an
/// event log, so several routes can talk to each other in-process.
pub struct InMemoryProvider {
    transport: Arc<InMemoryTransport>,
    state_store: Arc<InMemoryStateStore>,
    timeout_emitter: Arc<TokioTimeoutEmitter>,
    events: Arc<RecordingEventHandler>,
}

impl InMemoryProvider {
    /// Create a new in-memory provider
    pub fn new() -> Self {
        let transport = Arc::new(InMemoryTransport::new());
        let states = Arc::new(RwLock::new(HashMap::new()));
        Self {
            timeout_emitter: Arc::new(TokioTimeoutEmitter::new(transport.clone())),
            transport,
            state_store: Arc::new(InMemoryStateStore::new(states)),
            events: Arc::new(RecordingEventHandler::new()),
        }
    }

    /// Collaborators backed by this provider, reporting to the shared event log
    pub fn collaborators(&self) -> Collaborators {
        self.collaborators_with_events(self.events.clone())
    }

    /// Collaborators backed by this provider, reporting to `events`
    pub fn collaborators_with_events(&self, events: Arc<dyn EngineEventHandler>) -> Collaborators {
        Collaborators::new(
            self.transport.clone(),
            self.state_store.clone(),
            self.timeout_emitter.clone(),
        )
        .with_events(events)
    }

    /// Config for `subscription` with default settings
    pub fn create_config(&self, subscription: impl Into<String>) -> Config {
        Config::new(SubscriptionId::new(subscription), self.collaborators())
    }

    /// Config for `subscription` with explicit settings
    pub fn create_config_with(
        &self,
        subscription: impl Into<String>,
        settings: EngineSettings,
    ) -> Config {
        Config::with_settings(SubscriptionId::new(subscription), self.collaborators(), settings)
    }

    /// Shared transport
    pub fn transport(&self) -> Arc<InMemoryTransport> {
        self.transport.clone()
    }

    /// Shared state store
    pub fn state_store(&self) -> Arc<InMemoryStateStore> {
        self.state_store.clone()
    }

    /// Shared timeout emitter
    pub fn timeout_emitter(&self) -> Arc<TokioTimeoutEmitter> {
        self.timeout_emitter.clone()
    }

    /// Shared event log
    pub fn events(&self) -> Arc<RecordingEventHandler> {
        self.events.clone()
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}
