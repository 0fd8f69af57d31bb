//! End-to-end tests for the email route
//!
//! The route sends `SendEmail`, then waits for `EmailSent` or a timeout.
//! Events go to both the recording log and the tracing handler, the same way
//! a service would wire monitoring in.

use routemaster_core::{Config, EngineEventHandler, EngineSettings, StateStore, SubscriptionId};
use routemaster_e2e_tests::email::{
    EmailRoute, EmailRouteState, EmailService, SendEmail, Signals, ROUTE_COMPLETION_TIMEOUT,
};
use routemaster_monitoring::{CompositeEventHandler, MonitoringConfig, TracingEventHandler};
use routemaster_state_inmemory::InMemoryProvider;
use std::sync::Arc;
use std::time::Duration;

const SUBSCRIPTION: &str = "email-route";

/// Config whose events reach the provider's log and a tracing handler
fn monitored_config(provider: &InMemoryProvider) -> (Config, Arc<TracingEventHandler>) {
    routemaster_monitoring::logging::init_test_tracing();
    let tracing_handler = Arc::new(TracingEventHandler::new(&MonitoringConfig {
        service_name: "email-e2e".to_string(),
        enable_metrics: false,
        ..Default::default()
    }));
    let events: Arc<dyn EngineEventHandler> = Arc::new(
        CompositeEventHandler::default()
            .with(provider.events())
            .with(tracing_handler.clone()),
    );
    let config = Config::with_settings(
        SubscriptionId::new(SUBSCRIPTION),
        provider.collaborators_with_events(events),
        EngineSettings {
            retain_state_on_cancel: true,
            ..Default::default()
        },
    );
    (config, tracing_handler)
}

async fn stored_state(
    provider: &InMemoryProvider,
    correlation_id: &routemaster_core::CorrelationId,
) -> Option<EmailRouteState> {
    provider
        .state_store()
        .load(&SubscriptionId::new(SUBSCRIPTION), correlation_id)
        .await
        .unwrap()
        .map(|value| serde_json::from_value(value).unwrap())
}

#[tokio::test]
async fn test_email_sent_reply_completes_the_route() {
    // === SETUP ===
    let provider = InMemoryProvider::new();
    let service = EmailService::attach(provider.transport(), false)
        .await
        .unwrap();
    let (config, tracing_handler) = monitored_config(&provider);
    let signals = Arc::new(Signals::default());
    let route = config
        .build_route(&EmailRoute {
            signals: signals.clone(),
            ttl: Duration::from_secs(60),
        })
        .await
        .unwrap();

    // === EXECUTION ===
    let handle = route
        .start(EmailRouteState::to("bob@example.com"))
        .await
        .unwrap();

    // === VERIFICATION ===
    tokio::time::timeout(ROUTE_COMPLETION_TIMEOUT, signals.done.notified())
        .await
        .expect("route did not complete in time");
    assert!(
        provider
            .events()
            .wait_for("instance.cancelled", 1, ROUTE_COMPLETION_TIMEOUT)
            .await
    );

    assert_eq!(
        service.received(),
        vec![SendEmail {
            correlation_id: handle.correlation_id.clone(),
            to: "bob@example.com".to_string(),
        }]
    );
    assert_eq!(signals.sent(), 1);
    assert_eq!(signals.timed_out(), 0);

    let state = stored_state(&provider, &handle.correlation_id)
        .await
        .unwrap();
    assert!(state.delivered);
    assert!(!state.timed_out);
    assert!(!route.is_armed(&handle.correlation_id));

    assert_eq!(tracing_handler.count("instance.started"), 1);
    assert_eq!(tracing_handler.count("continuation.armed"), 1);
    assert_eq!(tracing_handler.count("instance.cancelled"), 1);
    assert_eq!(tracing_handler.count("instance.faulted"), 0);
}

#[tokio::test]
async fn test_each_start_uses_a_fresh_correlation_id() {
    let provider = InMemoryProvider::new();
    let service = EmailService::attach(provider.transport(), false)
        .await
        .unwrap();
    let (config, _) = monitored_config(&provider);
    let route = config
        .build_route(&EmailRoute {
            signals: Arc::new(Signals::default()),
            ttl: Duration::from_secs(60),
        })
        .await
        .unwrap();

    let first = route.start(EmailRouteState::to("bob@example.com")).await.unwrap();
    let second = route.start(EmailRouteState::to("bob@example.com")).await.unwrap();

    assert_ne!(first.correlation_id, second.correlation_id);
    assert!(
        provider
            .events()
            .wait_for("instance.cancelled", 2, ROUTE_COMPLETION_TIMEOUT)
            .await
    );
    assert_eq!(service.received().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_reply_runs_timeout_step_after_ttl() {
    // === SETUP ===
    let provider = InMemoryProvider::new();
    let service = EmailService::attach(provider.transport(), true)
        .await
        .unwrap();
    let (config, tracing_handler) = monitored_config(&provider);
    let signals = Arc::new(Signals::default());
    let ttl = Duration::from_secs(5 * 60);
    let route = config
        .build_route(&EmailRoute {
            signals: signals.clone(),
            ttl,
        })
        .await
        .unwrap();

    // === EXECUTION ===
    let started = tokio::time::Instant::now();
    let handle = route
        .start(EmailRouteState::to("bob@example.com"))
        .await
        .unwrap();

    // === VERIFICATION ===
    tokio::time::timeout(ttl * 2, signals.done.notified())
        .await
        .expect("timeout step never ran");
    assert!(started.elapsed() >= ttl);
    assert!(
        provider
            .events()
            .wait_for("instance.cancelled", 1, ttl)
            .await
    );

    assert_eq!(service.received().len(), 1);
    assert_eq!(signals.timed_out(), 1);
    assert_eq!(signals.sent(), 0);

    let state = stored_state(&provider, &handle.correlation_id)
        .await
        .unwrap();
    assert!(state.timed_out);
    assert!(!state.delivered);
    assert_eq!(tracing_handler.count("instance.cancelled"), 1);
}
