//! Engine settings
//!
//! Settings are layered from an optional file and `ROUTEMASTER_*` environment
//! variables, falling back to the defaults below.

use config::{Config as ConfigLoader, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::CoreError;

/// Tunables for a route's dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Keep instance state after a step cancels the instance
    #[serde(default)]
    pub retain_state_on_cancel: bool,

    /// Keep instance state after a step faults, for inspection
    #[serde(default = "default_retain_state_on_fault")]
    pub retain_state_on_fault: bool,

    /// Fault handlers that run longer than this
    #[serde(default)]
    pub handler_timeout_ms: Option<u64>,
}

fn default_retain_state_on_fault() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retain_state_on_cancel: false,
            retain_state_on_fault: default_retain_state_on_fault(),
            handler_timeout_ms: None,
        }
    }
}

impl EngineSettings {
    /// Load settings from an optional file plus `ROUTEMASTER_*` environment variables
    ///
    /// A missing file is not an error. Environment variables win over the file.
    pub fn load(path: Option<&str>) -> Result<Self, CoreError> {
        let mut builder = ConfigLoader::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let settings: Self = builder
            .add_source(Environment::with_prefix("ROUTEMASTER").try_parsing(true))
            .build()?
            .try_deserialize()?;

        debug!(?settings, "Loaded engine settings");
        Ok(settings)
    }

    /// Handler time limit, if one is configured
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
