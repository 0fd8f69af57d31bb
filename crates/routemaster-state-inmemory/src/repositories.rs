use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use routemaster_core::{
    CoreError, CorrelationId, Envelope, InboundHandler, Message, MessageType, StateStore,
    SubscriptionId, TimeoutEmitter, TimerHandle, Transport,
};

/// In-memory implementation of the StateStore
#[derive(Default)]
pub struct InMemoryStateStore {
    states: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl InMemoryStateStore {
    /// Create a new in-memory state store
    pub fn new(states: Arc<RwLock<HashMap<String, serde_json::Value>>>) -> Self {
        Self { states }
    }

    fn make_key(subscription: &SubscriptionId, correlation_id: &CorrelationId) -> String {
        format!("{}:{}", subscription.0, correlation_id.0)
    }

    /// Number of stored instances
    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    /// Whether no instance is stored
    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(
        &self,
        subscription: &SubscriptionId,
        correlation_id: &CorrelationId,
    ) -> Result<Option<serde_json::Value>, CoreError> {
        let key = Self::make_key(subscription, correlation_id);
        let states = self.states.read().await;
        Ok(states.get(&key).cloned())
    }

    async fn save(
        &self,
        subscription: &SubscriptionId,
        correlation_id: &CorrelationId,
        state: serde_json::Value,
    ) -> Result<(), CoreError> {
        let key = Self::make_key(subscription, correlation_id);
        let mut states = self.states.write().await;
        states.insert(key, state);
        Ok(())
    }

    async fn delete(
        &self,
        subscription: &SubscriptionId,
        correlation_id: &CorrelationId,
    ) -> Result<(), CoreError> {
        let key = Self::make_key(subscription, correlation_id);
        let mut states = self.states.write().await;
        states.remove(&key);
        Ok(())
    }
}

type Subscriber = (SubscriptionId, Arc<dyn InboundHandler>);

/// Number of sent envelopes kept by [`InMemoryTransport::new`]
pub const DEFAULT_SENT_LOG_CAPACITY: usize = 1024;

/// In-process transport
///
/// Every delivery runs on its own tokio task, so handlers never run on the
/// sender's stack. Directed envelopes only reach their destination subscription.
/// The most recently sent envelopes are kept in a bounded log; the oldest
/// entries are evicted once it is full.
pub struct InMemoryTransport {
    subscribers: RwLock<HashMap<MessageType, Vec<Subscriber>>>,
    sent: Mutex<VecDeque<Envelope>>,
    sent_capacity: usize,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::with_sent_capacity(DEFAULT_SENT_LOG_CAPACITY)
    }
}

impl InMemoryTransport {
    /// Create a new in-memory transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport keeping at most `capacity` sent envelopes; 0 keeps none
    pub fn with_sent_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            sent: Mutex::new(VecDeque::new()),
            sent_capacity: capacity,
        }
    }

    /// Envelopes accepted by `send` and still in the log, oldest first
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().iter().cloned().collect()
    }

    /// Drain the sent log
    pub fn take_sent(&self) -> Vec<Envelope> {
        self.sent.lock().drain(..).collect()
    }

    fn record(&self, envelope: &Envelope) {
        if self.sent_capacity == 0 {
            return;
        }
        let mut sent = self.sent.lock();
        while sent.len() >= self.sent_capacity {
            sent.pop_front();
        }
        sent.push_back(envelope.clone());
    }

    /// Decoded messages of type `M` accepted by `send`
    pub fn sent_messages<M: Message>(&self) -> Vec<M> {
        self.sent
            .lock()
            .iter()
            .filter(|envelope| envelope.is::<M>())
            .filter_map(|envelope| envelope.decode::<M>().ok())
            .collect()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), CoreError> {
        self.record(&envelope);

        if envelope.is_expired_at(Utc::now()) {
            debug!(
                envelope = %envelope.id,
                "Discarding expired {}",
                envelope.message_type
            );
            return Ok(());
        }

        let subscribers = self.subscribers.read().await;
        let Some(handlers) = subscribers.get(&envelope.message_type) else {
            trace!("No subscribers for {}", envelope.message_type);
            return Ok(());
        };

        for (subscription, handler) in handlers {
            if let Some(destination) = &envelope.destination {
                if destination != subscription {
                    continue;
                }
            }
            let handler = handler.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move {
                handler.deliver(envelope).await;
            });
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subscription: &SubscriptionId,
        message_type: &MessageType,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), CoreError> {
        let mut subscribers = self.subscribers.write().await;
        let handlers = subscribers.entry(message_type.clone()).or_default();
        handlers.retain(|(existing, _)| existing != subscription);
        handlers.push((subscription.clone(), handler));
        debug!(subscription = %subscription, "Subscribed to {}", message_type);
        Ok(())
    }
}

/// Timeout emitter backed by tokio timers
///
/// Fired envelopes are sent back through the transport.
pub struct TokioTimeoutEmitter {
    transport: Arc<dyn Transport>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioTimeoutEmitter {
    /// Create an emitter that sends fired envelopes on `transport`
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of timers that have not fired or been cancelled
    pub fn scheduled(&self) -> usize {
        self.timers
            .lock()
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }
}

#[async_trait]
impl TimeoutEmitter for TokioTimeoutEmitter {
    async fn schedule_once(
        &self,
        envelope: Envelope,
        after: Duration,
    ) -> Result<TimerHandle, CoreError> {
        let timer_id = Uuid::new_v4().to_string();
        let transport = self.transport.clone();
        let timer_id_clone = timer_id.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            debug!(timer = %timer_id_clone, "Timer fired");
            if let Err(e) = transport.send(envelope).await {
                warn!(timer = %timer_id_clone, "Failed to emit timeout: {}", e);
            }
        });

        let mut timers = self.timers.lock();
        timers.retain(|_, handle| !handle.is_finished());
        timers.insert(timer_id.clone(), task);

        Ok(TimerHandle(timer_id))
    }

    async fn cancel(&self, handle: &TimerHandle) -> Result<bool, CoreError> {
        let task = self.timers.lock().remove(&handle.0);
        Ok(match task {
            Some(task) => {
                let live = !task.is_finished();
                task.abort();
                live
            }
            None => false,
        })
    }
}
