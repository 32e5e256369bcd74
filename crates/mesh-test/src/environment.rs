//! Runtime environments and per-environment constructor dispatch.
//!
//! Every test component can be backed by an in-process fake (`Native`) or by
//! a deployment in a Kubernetes cluster (`Kube`). Components register one
//! constructor per environment they support with an [`EnvironmentSwitch`];
//! only the constructor for the active environment ever runs.

use crate::resource::ResourceError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

/// Deployment target a test run is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    /// In-process fakes running inside the test binary.
    Native,
    /// Components deployed to a Kubernetes cluster.
    Kube,
}

impl Environment {
    /// Name used in configuration and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Native => "native",
            Environment::Kube => "kube",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(Environment::Native),
            "kube" | "kubernetes" => Ok(Environment::Kube),
            other => Err(format!(
                "unknown environment '{}', expected 'native' or 'kube'",
                other
            )),
        }
    }
}

type Constructor<'a, T> = Box<dyn FnOnce() -> BoxFuture<'a, Result<T, ResourceError>> + Send + 'a>;

/// Runs exactly one environment-specific constructor.
///
/// # Example
///
/// ```rust,ignore
/// let pilot = EnvironmentSwitch::new()
///     .native(|| async { native::start(&cfg).await })
///     .kube(|| async { kube::connect(&cfg).await })
///     .run(ctx.environment())
///     .await?;
/// ```
pub struct EnvironmentSwitch<'a, T> {
    native: Option<Constructor<'a, T>>,
    kube: Option<Constructor<'a, T>>,
}

impl<'a, T> Default for EnvironmentSwitch<'a, T> {
    fn default() -> Self {
        Self {
            native: None,
            kube: None,
        }
    }
}

impl<'a, T: 'a> EnvironmentSwitch<'a, T> {
    /// Create a switch with no registered cases.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor used when running natively.
    #[must_use]
    pub fn native<F, Fut>(mut self, constructor: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, ResourceError>> + Send + 'a,
    {
        self.native = Some(Box::new(move || constructor().boxed()));
        self
    }

    /// Register the constructor used when running against a cluster.
    #[must_use]
    pub fn kube<F, Fut>(mut self, constructor: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<T, ResourceError>> + Send + 'a,
    {
        self.kube = Some(Box::new(move || constructor().boxed()));
        self
    }

    /// Whether a constructor is registered for `environment`.
    pub fn supports(&self, environment: Environment) -> bool {
        match environment {
            Environment::Native => self.native.is_some(),
            Environment::Kube => self.kube.is_some(),
        }
    }

    /// Run the constructor registered for `environment` and return its result unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::UnsupportedEnvironment`] without running any
    /// constructor when no case is registered for `environment`. Otherwise the
    /// constructor's own error is passed through.
    pub async fn run(self, environment: Environment) -> Result<T, ResourceError> {
        let case = match environment {
            Environment::Native => self.native,
            Environment::Kube => self.kube,
        };

        match case {
            Some(constructor) => constructor().await,
            None => Err(ResourceError::UnsupportedEnvironment(environment)),
        }
    }
}
