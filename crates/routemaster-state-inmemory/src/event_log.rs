use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use routemaster_core::{CoreError, CorrelationId, EngineEvent, EngineEventHandler};

/// Event handler that keeps every engine event in memory
///
/// Tests use it to wait for and assert on what the dispatcher did.
#[derive(Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<EngineEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Create an empty event log
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Events of one type, e.g. `"instance.cancelled"`
    pub fn of_type(&self, event_type: &str) -> Vec<EngineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Number of events of one type
    pub fn count(&self, event_type: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type() == event_type)
            .count()
    }

    /// Events recorded for one instance
    pub fn for_instance(&self, correlation_id: &CorrelationId) -> Vec<EngineEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.correlation_id() == Some(correlation_id))
            .cloned()
            .collect()
    }

    /// Wait until at least `count` events of `event_type` were recorded
    ///
    /// Returns `false` if `within` elapses first.
    pub async fn wait_for(&self, event_type: &str, count: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let notified = self.notify.notified();
            if self.count(event_type) >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.count(event_type) >= count;
            }
        }
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EngineEventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: EngineEvent) -> Result<(), CoreError> {
        self.events.lock().push(event);
        self.notify.notify_waiters();
        Ok(())
    }
}
