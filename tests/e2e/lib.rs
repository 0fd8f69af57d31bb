// RouteMaster E2E Tests
//
// This crate contains end-to-end tests for RouteMaster routes

/// A single-hop route that asks an email service to send a message
pub mod email {
    use async_trait::async_trait;
    use routemaster_core::{
        BuildLogic, CoreError, CorrelationId, Envelope, InboundHandler, Message, Outbound,
        RegisteredStep, RouteBuilder, Starter, StateAccess, Step, StepName, StepRef, StepResult,
        SubscriptionId, TimeoutMessage, Transport,
    };
    use parking_lot::Mutex;
    use routemaster_state_inmemory::InMemoryTransport;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Maximum time to wait for a route to finish
    pub const ROUTE_COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Command sent to the email service
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct SendEmail {
        pub correlation_id: CorrelationId,
        pub to: String,
    }

    impl Message for SendEmail {}

    /// Reply from the email service
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct EmailSent {
        pub correlation_id: CorrelationId,
    }

    impl Message for EmailSent {}

    /// State of one email instance
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct EmailRouteState {
        pub to_address: String,
        pub delivered: bool,
        pub timed_out: bool,
    }

    impl EmailRouteState {
        pub fn to(address: &str) -> Self {
            Self {
                to_address: address.to_string(),
                ..Default::default()
            }
        }
    }

    /// What the route's step bodies did
    #[derive(Default)]
    pub struct Signals {
        pub sent: AtomicUsize,
        pub timed_out: AtomicUsize,
        pub done: Notify,
    }

    impl Signals {
        pub fn sent(&self) -> usize {
            self.sent.load(Ordering::SeqCst)
        }

        pub fn timed_out(&self) -> usize {
            self.timed_out.load(Ordering::SeqCst)
        }
    }

    /// Stub email service; answers every `SendEmail` unless muted
    pub struct EmailService {
        transport: Arc<InMemoryTransport>,
        muted: bool,
        received: Mutex<Vec<SendEmail>>,
    }

    impl EmailService {
        /// Subscribe a stub service to `SendEmail` on `transport`
        pub async fn attach(
            transport: Arc<InMemoryTransport>,
            muted: bool,
        ) -> Result<Arc<Self>, CoreError> {
            let service = Arc::new(Self {
                transport: transport.clone(),
                muted,
                received: Mutex::new(Vec::new()),
            });
            transport
                .subscribe(
                    &SubscriptionId::new("email-service"),
                    &SendEmail::message_type(),
                    service.clone(),
                )
                .await?;
            Ok(service)
        }

        /// Every command the service has seen
        pub fn received(&self) -> Vec<SendEmail> {
            self.received.lock().clone()
        }
    }

    #[async_trait]
    impl InboundHandler for EmailService {
        async fn deliver(&self, envelope: Envelope) {
            let Ok(command) = envelope.decode::<SendEmail>() else {
                return;
            };
            self.received.lock().push(command.clone());
            if self.muted {
                return;
            }
            if let Ok(reply) = Envelope::wrap(&EmailSent {
                correlation_id: command.correlation_id,
            }) {
                let _ = self.transport.send(reply).await;
            }
        }
    }

    /// Start -> SendEmail -> (EmailSent | timeout) -> Cancel
    pub struct EmailRoute {
        pub signals: Arc<Signals>,
        pub ttl: Duration,
    }

    pub struct EmailStarter {
        sent: RegisteredStep<EmailSent, EmailRouteState>,
        timeout: RegisteredStep<TimeoutMessage, EmailRouteState>,
        ttl: Duration,
    }

    #[async_trait]
    impl Starter<EmailRouteState> for EmailStarter {
        async fn start(
            &self,
            correlation_id: CorrelationId,
            state: &EmailRouteState,
        ) -> Result<StepResult<EmailRouteState>, CoreError> {
            let command = SendEmail {
                correlation_id: correlation_id.clone(),
                to: state.to_address.clone(),
            };
            StepResult::pipeline(
                correlation_id,
                Outbound::send(&command)?,
                &self.sent,
                self.ttl,
                &self.timeout,
            )
        }

        fn continuations(&self) -> Vec<StepRef> {
            vec![self.sent.step_ref().clone(), self.timeout.step_ref().clone()]
        }
    }

    impl BuildLogic<EmailRouteState> for EmailRoute {
        type Starter = EmailStarter;

        fn build(&self, builder: &mut RouteBuilder<EmailRouteState>) -> EmailStarter {
            let signals = self.signals.clone();
            let sent = Step::create(
                StepName::new("EmailSent"),
                |reply: &EmailSent| Some(reply.correlation_id.clone()),
                move |access: StateAccess<EmailRouteState>, _reply: EmailSent| {
                    let signals = signals.clone();
                    async move {
                        let mut state = access.load();
                        state.delivered = true;
                        access.save(state)?;
                        signals.sent.fetch_add(1, Ordering::SeqCst);
                        signals.done.notify_one();
                        Ok::<_, CoreError>(StepResult::cancel())
                    }
                },
            )
            .register(builder);

            let signals = self.signals.clone();
            let timeout = Step::create_timeout(
                StepName::new("EmailTimedOut"),
                move |access: StateAccess<EmailRouteState>, _tm: TimeoutMessage| {
                    let signals = signals.clone();
                    async move {
                        let mut state = access.load();
                        state.timed_out = true;
                        access.save(state)?;
                        signals.timed_out.fetch_add(1, Ordering::SeqCst);
                        signals.done.notify_one();
                        Ok::<_, CoreError>(StepResult::cancel())
                    }
                },
            )
            .register(builder);

            EmailStarter {
                sent,
                timeout,
                ttl: self.ttl,
            }
        }
    }
}
