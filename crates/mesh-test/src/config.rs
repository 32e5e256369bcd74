//! Framework configuration.
//!
//! Configuration is loaded once per test run from environment variables and
//! threaded through [`Context`](crate::resource::Context). Nothing here is
//! process-global; tests that need different settings build their own
//! [`FrameworkConfig`] via [`FrameworkConfig::from_vars`].

use crate::environment::Environment;
use crate::features::{parse_duration, PilotFeatures};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Default namespace components are deployed to.
pub const DEFAULT_NAMESPACE: &str = "istio-system";

/// Default Pilot discovery address (port-forwarded gRPC port).
pub const DEFAULT_PILOT_ADDRESS: &str = "http://localhost:15010";

/// Default policy backend address (port-forwarded HTTP port).
pub const DEFAULT_POLICY_BACKEND_ADDRESS: &str = "http://localhost:1071";

/// Default DNS suffix for in-cluster app services.
pub const DEFAULT_APPS_DOMAIN: &str = "svc.cluster.local";

/// Default overall timeout for retry loops.
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay between retry attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Default timeout for reaching cluster endpoints at construction time.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("Invalid duration for {name}: {message}")]
    InvalidDuration { name: String, message: String },

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

/// Settings shared by every component in a test run.
#[derive(Debug, Clone)]
pub struct FrameworkConfig {
    /// Environment all resources are created in (`MESH_TEST_ENV`).
    pub environment: Environment,

    /// Namespace used for app naming and config snippets (`MESH_TEST_NAMESPACE`).
    pub namespace: String,

    /// Pilot ADS endpoint in Kube mode (`MESH_TEST_PILOT_ADDRESS`).
    pub pilot_address: String,

    /// Policy backend endpoint in Kube mode (`MESH_TEST_POLICY_BACKEND_ADDRESS`).
    pub policy_backend_address: String,

    /// DNS suffix appended to `<app>.<namespace>` in Kube mode (`MESH_TEST_APPS_DOMAIN`).
    pub apps_domain: String,

    /// Default retry timeout (`MESH_TEST_RETRY_TIMEOUT`).
    pub retry_timeout: Duration,

    /// Default delay between retry attempts (`MESH_TEST_RETRY_DELAY`).
    pub retry_delay: Duration,

    /// Reachability timeout for cluster endpoints (`MESH_TEST_CONNECT_TIMEOUT`).
    pub connect_timeout: Duration,

    /// Pilot feature flags.
    pub pilot_features: PilotFeatures,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Native,
            namespace: DEFAULT_NAMESPACE.to_string(),
            pilot_address: DEFAULT_PILOT_ADDRESS.to_string(),
            policy_backend_address: DEFAULT_POLICY_BACKEND_ADDRESS.to_string(),
            apps_domain: DEFAULT_APPS_DOMAIN.to_string(),
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            pilot_features: PilotFeatures::default(),
        }
    }
}

impl FrameworkConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let environment = match vars.get("MESH_TEST_ENV") {
            Some(value) => value
                .parse::<Environment>()
                .map_err(ConfigError::InvalidEnvironment)?,
            None => defaults.environment,
        };

        let namespace = vars
            .get("MESH_TEST_NAMESPACE")
            .cloned()
            .unwrap_or(defaults.namespace);

        if namespace.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "MESH_TEST_NAMESPACE".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let pilot_address = vars
            .get("MESH_TEST_PILOT_ADDRESS")
            .cloned()
            .unwrap_or(defaults.pilot_address);

        let policy_backend_address = vars
            .get("MESH_TEST_POLICY_BACKEND_ADDRESS")
            .cloned()
            .unwrap_or(defaults.policy_backend_address);

        let apps_domain = vars
            .get("MESH_TEST_APPS_DOMAIN")
            .cloned()
            .unwrap_or(defaults.apps_domain);

        let retry_timeout =
            positive_duration(vars, "MESH_TEST_RETRY_TIMEOUT", defaults.retry_timeout)?;
        let retry_delay = positive_duration(vars, "MESH_TEST_RETRY_DELAY", defaults.retry_delay)?;
        let connect_timeout =
            positive_duration(vars, "MESH_TEST_CONNECT_TIMEOUT", defaults.connect_timeout)?;

        let pilot_features = PilotFeatures::from_vars(vars)?;

        Ok(Self {
            environment,
            namespace,
            pilot_address,
            policy_backend_address,
            apps_domain,
            retry_timeout,
            retry_delay,
            connect_timeout,
            pilot_features,
        })
    }
}

fn positive_duration(
    vars: &HashMap<String, String>,
    name: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(value) = vars.get(name) else {
        return Ok(default);
    };

    let duration = parse_duration(value).map_err(|message| ConfigError::InvalidDuration {
        name: name.to_string(),
        message,
    })?;

    if duration.is_zero() {
        return Err(ConfigError::InvalidDuration {
            name: name.to_string(),
            message: "must be greater than 0".to_string(),
        });
    }

    Ok(duration)
}
