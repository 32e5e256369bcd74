//! Test resources and the context they are created in.
//!
//! A resource is a handle to a provisioned test-time component (Pilot, Apps,
//! PolicyBackend). Resources are created through a component's `new` /
//! `new_or_fail` factory, are bound to the context's [`Environment`] for their
//! whole life, and release their backend when dropped.

use crate::config::FrameworkConfig;
use crate::environment::Environment;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while creating a test resource.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("unsupported environment: {0}")]
    UnsupportedEnvironment(Environment),

    #[error("failed to construct {component}: {message}")]
    Construction {
        component: &'static str,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ResourceError {
    /// Shorthand for a [`ResourceError::Construction`] error.
    pub fn construction(component: &'static str, message: impl fmt::Display) -> Self {
        ResourceError::Construction {
            component,
            message: message.to_string(),
        }
    }
}

/// Identity of a resource within a test run, used in logs and error messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceId {
    kind: &'static str,
    id: Uuid,
}

impl ResourceId {
    /// Allocate a fresh id for a resource of the given kind.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            id: Uuid::new_v4(),
        }
    }

    /// Component kind, e.g. `"pilot"`.
    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.id.simple())
    }
}

/// Common surface of every test resource.
pub trait Resource: Send + Sync {
    /// Identity of this resource.
    fn id(&self) -> &ResourceId;

    /// Environment this resource was created in.
    fn environment(&self) -> Environment;
}

/// Context in which resources are created.
///
/// The environment is fixed for the lifetime of the context. Cloning is cheap
/// and clones share the same configuration.
#[derive(Debug, Clone)]
pub struct Context {
    environment: Environment,
    config: Arc<FrameworkConfig>,
}

impl Context {
    /// Create a context for the environment selected in `config`.
    pub fn new(config: FrameworkConfig) -> Self {
        Self {
            environment: config.environment,
            config: Arc::new(config),
        }
    }

    /// Create a context from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::InvalidConfig`] if any variable fails to parse.
    pub fn from_env() -> Result<Self, ResourceError> {
        let config =
            FrameworkConfig::from_env().map_err(|e| ResourceError::InvalidConfig(e.to_string()))?;
        Ok(Self::new(config))
    }

    /// The environment every resource in this context is bound to.
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Framework configuration.
    pub fn config(&self) -> &FrameworkConfig {
        &self.config
    }

    /// Require that this context runs in `environment`.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::UnsupportedEnvironment`] naming the active
    /// environment otherwise.
    pub fn require_environment(&self, environment: Environment) -> Result<(), ResourceError> {
        if self.environment == environment {
            Ok(())
        } else {
            Err(ResourceError::UnsupportedEnvironment(self.environment))
        }
    }

    /// Returns true when the current test should be skipped because it needs `environment`.
    ///
    /// ```rust,ignore
    /// if ctx.skip_unless(Environment::Native) {
    ///     return;
    /// }
    /// ```
    pub fn skip_unless(&self, environment: Environment) -> bool {
        let skip = self.environment != environment;
        if skip {
            tracing::info!(
                target: "mesh_test.resource",
                required = %environment,
                active = %self.environment,
                "Skipping test: environment not supported"
            );
        }
        skip
    }
}

/// Fail the current test if resource creation failed.
///
/// Used by every component's `new_or_fail`; the message is prefixed with the
/// factory name so failures point at the right component.
#[allow(clippy::panic)]
#[track_caller]
pub(crate) fn or_fail<T>(factory: &str, result: Result<T, ResourceError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{}: {}", factory, e),
    }
}
