//! Pilot: the discovery server under test.
//!
//! Tests talk to Pilot through the discovery protocol only:
//!
//! ```rust,ignore
//! let mut pilot = pilot::new_or_fail(&ctx, PilotConfig::default()).await;
//! pilot.start_discovery(request).await?;
//! pilot
//!     .watch_discovery(Duration::from_secs(10), |resp| Ok(!resp.resources.is_empty()))
//!     .await?;
//! ```
//!
//! In the native environment the discovery server runs in-process and config
//! is pushed with [`NativePilot::apply`], reachable through [`Pilot::native`].

pub mod kube;
pub mod native;

pub use kube::KubePilot;
pub use native::NativePilot;

use crate::discovery::{DiscoveryChannel, DiscoveryError};
use crate::environment::{Environment, EnvironmentSwitch};
use crate::features::PilotFeatures;
use crate::resource::{or_fail, Context, Resource, ResourceError, ResourceId};
use std::time::Duration;
use tracing::{debug, instrument};
use xds_proto::{DiscoveryRequest, DiscoveryResponse};

/// Options for creating a Pilot.
#[derive(Debug, Clone, Default)]
pub struct PilotConfig {
    /// Feature flags for the native server. Defaults to the context's flags.
    pub features: Option<PilotFeatures>,
}

enum Backend {
    Native(NativePilot),
    Kube(KubePilot),
}

/// Handle to a running Pilot.
pub struct Pilot {
    id: ResourceId,
    environment: Environment,
    backend: Backend,
    channel: DiscoveryChannel,
}

impl Pilot {
    /// The in-process server, when running natively.
    pub fn native(&self) -> Option<&NativePilot> {
        match &self.backend {
            Backend::Native(native) => Some(native),
            Backend::Kube(_) => None,
        }
    }

    /// Discovery address for cluster pilots; `None` for the in-process server.
    pub fn address(&self) -> Option<&str> {
        match &self.backend {
            Backend::Native(_) => None,
            Backend::Kube(kube) => Some(kube.address()),
        }
    }

    /// One-shot discovery request. See [`DiscoveryChannel::call_discovery`].
    pub async fn call_discovery(
        &self,
        request: DiscoveryRequest,
    ) -> Result<DiscoveryResponse, DiscoveryError> {
        self.channel.call_discovery(request).await
    }

    /// Open the subscription used by [`watch_discovery`](Self::watch_discovery).
    pub async fn start_discovery(
        &mut self,
        request: DiscoveryRequest,
    ) -> Result<(), DiscoveryError> {
        self.channel.start_discovery(request).await
    }

    /// Wait for a subscribed response that satisfies `predicate`.
    pub async fn watch_discovery<P>(
        &mut self,
        duration: Duration,
        predicate: P,
    ) -> Result<(), DiscoveryError>
    where
        P: FnMut(&DiscoveryResponse) -> anyhow::Result<bool>,
    {
        self.channel.watch_discovery(duration, predicate).await
    }
}

impl Resource for Pilot {
    fn id(&self) -> &ResourceId {
        &self.id
    }

    fn environment(&self) -> Environment {
        self.environment
    }
}

/// Create a Pilot for the context's environment.
///
/// # Errors
///
/// - [`ResourceError::InvalidConfig`] if the feature flags do not validate
/// - [`ResourceError::Construction`] if the cluster pilot is not reachable
#[instrument(skip_all, fields(environment = %ctx.environment()))]
pub async fn new(ctx: &Context, config: PilotConfig) -> Result<Pilot, ResourceError> {
    let features = config
        .features
        .unwrap_or_else(|| ctx.config().pilot_features.clone());
    features
        .validate()
        .map_err(|e| ResourceError::InvalidConfig(e.to_string()))?;

    let environment = ctx.environment();
    let pilot = EnvironmentSwitch::new()
        .native(|| async move {
            let native = NativePilot::start(features);
            let channel = DiscoveryChannel::new(native.connector());
            Ok(Pilot {
                id: ResourceId::new("pilot"),
                environment,
                backend: Backend::Native(native),
                channel,
            })
        })
        .kube(|| async move {
            let (kube, connector) = KubePilot::connect(ctx).await?;
            Ok(Pilot {
                id: ResourceId::new("pilot"),
                environment,
                backend: Backend::Kube(kube),
                channel: DiscoveryChannel::new(connector),
            })
        })
        .run(environment)
        .await?;

    debug!(target: "mesh_test.pilot", id = %pilot.id, "Pilot ready");
    Ok(pilot)
}

/// Like [`new`], but fails the current test on error.
pub async fn new_or_fail(ctx: &Context, config: PilotConfig) -> Pilot {
    or_fail("pilot::new_or_fail", new(ctx, config).await)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::FrameworkConfig;
    use prost_types::Any;
    use xds_proto::listener::Listener;
    use xds_proto::type_url;

    fn native_context() -> Context {
        Context::new(FrameworkConfig {
            environment: Environment::Native,
            pilot_features: PilotFeatures {
                debounce_after: Duration::from_millis(1),
                ..PilotFeatures::default()
            },
            ..FrameworkConfig::default()
        })
    }

    #[tokio::test]
    async fn test_native_pilot_serves_applied_config() {
        let ctx = native_context();
        let mut pilot = new(&ctx, PilotConfig::default()).await.unwrap();
        assert_eq!(pilot.environment(), Environment::Native);
        assert_eq!(pilot.id().kind(), "pilot");
        assert!(pilot.address().is_none());

        pilot
            .start_discovery(DiscoveryRequest::for_type(
                type_url::LISTENER,
                Default::default(),
            ))
            .await
            .unwrap();

        let listener = Any::from_msg(&Listener {
            name: "virtual".to_string(),
            ..Default::default()
        })
        .unwrap();
        pilot
            .native()
            .unwrap()
            .apply(type_url::LISTENER, vec![listener])
            .await;

        pilot
            .watch_discovery(Duration::from_secs(5), |resp| {
                Ok(resp
                    .decode_resources::<Listener>()
                    .into_iter()
                    .filter_map(Result::ok)
                    .any(|l| l.name == "virtual"))
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_features_rejected() {
        let ctx = native_context();
        let config = PilotConfig {
            features: Some(PilotFeatures {
                trace_sampling: 150.0,
                ..PilotFeatures::default()
            }),
        };

        let err = new(&ctx, config).await.err().unwrap();
        assert!(matches!(err, ResourceError::InvalidConfig(_)));
    }

    #[tokio::test]
    #[should_panic(expected = "pilot::new_or_fail: invalid configuration")]
    async fn test_new_or_fail_panics_on_invalid_features() {
        let ctx = native_context();
        let config = PilotConfig {
            features: Some(PilotFeatures {
                max_concurrent_streams: 0,
                ..PilotFeatures::default()
            }),
        };
        new_or_fail(&ctx, config).await;
    }
}
