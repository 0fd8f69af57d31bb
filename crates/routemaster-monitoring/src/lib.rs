//! Monitoring for RouteMaster routes.
//!
//! Installs structured logging and turns engine events into tracing records
//! and metrics counters.

use serde::{Deserialize, Serialize};
use tracing::info;

pub mod events;
pub mod logging;

pub use events::{CompositeEventHandler, TracingEventHandler};
pub use logging::{init_logging, LogExt};

/// Configuration for initializing the monitoring system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Service name used for tracing and metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Log level filter (e.g., "info,routemaster_core=debug")
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Emit JSON log lines instead of pretty output
    #[serde(default)]
    pub enable_json_logging: bool,
    /// Record metrics counters for engine events
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,
    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_service_name() -> String {
    "routemaster".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_enable_metrics() -> bool {
    true
}

fn default_environment() -> String {
    "dev".to_string()
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_filter: default_log_filter(),
            enable_json_logging: false,
            enable_metrics: default_enable_metrics(),
            environment: default_environment(),
        }
    }
}

/// Initialize logging and return the event handler to pass to routes
pub fn init(config: &MonitoringConfig) -> anyhow::Result<TracingEventHandler> {
    init_logging(config)?;
    info!(
        service_name = %config.service_name,
        environment = %config.environment,
        metrics = config.enable_metrics,
        "Monitoring initialized"
    );
    Ok(TracingEventHandler::new(config))
}
