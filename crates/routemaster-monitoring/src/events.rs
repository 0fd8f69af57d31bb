//! Engine event sinks backed by tracing and metrics

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use routemaster_core::{CoreError, EngineEvent, EngineEventHandler};

use crate::MonitoringConfig;

/// Logs every engine event and counts it as a metric
///
/// Counters are named `routemaster_events_total` and labelled with the
/// event type and subscription.
pub struct TracingEventHandler {
    service_name: String,
    enable_metrics: bool,
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl TracingEventHandler {
    /// Create a handler from the monitoring config
    pub fn new(config: &MonitoringConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            enable_metrics: config.enable_metrics,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Number of events of one type seen by this handler
    pub fn count(&self, event_type: &str) -> u64 {
        self.counts.lock().get(event_type).copied().unwrap_or(0)
    }

    fn record(&self, event: &EngineEvent) {
        *self.counts.lock().entry(event.event_type()).or_insert(0) += 1;
        if self.enable_metrics {
            metrics::increment_counter!(
                "routemaster_events_total",
                "service" => self.service_name.clone(),
                "event" => event.event_type(),
                "subscription" => event.subscription().0.clone()
            );
        }
    }
}

#[async_trait]
impl EngineEventHandler for TracingEventHandler {
    async fn handle_event(&self, event: EngineEvent) -> Result<(), CoreError> {
        self.record(&event);

        match &event {
            EngineEvent::InstanceStarted {
                subscription,
                correlation_id,
                ..
            } => {
                info!(subscription = %subscription, correlation_id = %correlation_id, "Instance started");
            }
            EngineEvent::ContinuationArmed {
                subscription,
                correlation_id,
                next,
                timeout,
                deadline,
                ..
            } => {
                debug!(
                    subscription = %subscription,
                    correlation_id = %correlation_id,
                    next = %next,
                    timeout = %timeout,
                    "Continuation armed until {}",
                    deadline
                );
            }
            EngineEvent::ContinuationResolved {
                subscription,
                correlation_id,
                step,
                branch,
                ..
            } => {
                debug!(
                    subscription = %subscription,
                    correlation_id = %correlation_id,
                    step = %step,
                    branch = ?branch,
                    "Continuation resolved"
                );
            }
            EngineEvent::InstanceCancelled {
                subscription,
                correlation_id,
                ..
            } => {
                info!(subscription = %subscription, correlation_id = %correlation_id, "Instance finished");
            }
            EngineEvent::InstanceFaulted {
                subscription,
                correlation_id,
                step,
                error,
                ..
            } => {
                error!(
                    subscription = %subscription,
                    correlation_id = %correlation_id,
                    step = ?step.as_ref().map(|s| s.0.as_str()),
                    "Instance faulted: {}",
                    error
                );
            }
            EngineEvent::MessageDropped {
                subscription,
                message_type,
                correlation_id,
                reason,
                ..
            } => {
                warn!(
                    subscription = %subscription,
                    correlation_id = ?correlation_id.as_ref().map(|c| c.as_str()),
                    reason = %reason,
                    "Dropped {}",
                    message_type
                );
            }
            EngineEvent::DuplicateSuppressed {
                subscription,
                message_type,
                correlation_id,
                ..
            } => {
                debug!(
                    subscription = %subscription,
                    correlation_id = %correlation_id,
                    "Duplicate {} suppressed",
                    message_type
                );
            }
        }

        Ok(())
    }
}

/// Forwards every event to several handlers
///
/// All handlers see every event; the first error is returned.
#[derive(Default, Clone)]
pub struct CompositeEventHandler {
    handlers: Vec<Arc<dyn EngineEventHandler>>,
}

impl CompositeEventHandler {
    /// Create a composite over `handlers`
    pub fn new(handlers: Vec<Arc<dyn EngineEventHandler>>) -> Self {
        Self { handlers }
    }

    /// Add another handler
    pub fn with(mut self, handler: Arc<dyn EngineEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }
}

#[async_trait]
impl EngineEventHandler for CompositeEventHandler {
    async fn handle_event(&self, event: EngineEvent) -> Result<(), CoreError> {
        let results = join_all(
            self.handlers
                .iter()
                .map(|handler| handler.handle_event(event.clone())),
        )
        .await;
        results.into_iter().collect()
    }
}
