//! Pilot deployed in a cluster, reached over gRPC ADS.

use crate::cluster;
use crate::discovery::grpc::GrpcConnector;
use crate::discovery::DiscoveryConnector;
use crate::resource::{Context, ResourceError};
use std::sync::Arc;
use tracing::info;

/// Connection details of a cluster pilot.
pub struct KubePilot {
    address: String,
}

impl KubePilot {
    /// Check that the configured discovery address accepts connections and
    /// build a lazy gRPC connector for it.
    pub(crate) async fn connect(
        ctx: &Context,
    ) -> Result<(Self, Arc<dyn DiscoveryConnector>), ResourceError> {
        let config = ctx.config();
        let address = config.pilot_address.clone();

        cluster::check_endpoint(&address, config.connect_timeout)
            .await
            .map_err(|e| ResourceError::construction("pilot", e))?;

        let connector = GrpcConnector::lazy(&address, config.connect_timeout)
            .map_err(|e| ResourceError::construction("pilot", e))?;

        info!(target: "mesh_test.pilot", address = %address, "Connected to cluster pilot");
        Ok((Self { address }, Arc::new(connector)))
    }

    /// Discovery address this pilot was reached at.
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::FrameworkConfig;
    use crate::environment::Environment;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_fails_without_port_forward() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let ctx = Context::new(FrameworkConfig {
            environment: Environment::Kube,
            pilot_address: format!("http://127.0.0.1:{}", port),
            connect_timeout: Duration::from_millis(500),
            ..FrameworkConfig::default()
        });

        let err = KubePilot::connect(&ctx).await.err().unwrap();
        assert!(matches!(
            err,
            ResourceError::Construction {
                component: "pilot",
                ..
            }
        ));
        assert!(err.to_string().contains("not reachable"));
    }

    #[tokio::test]
    async fn test_connect_succeeds_when_port_open() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let ctx = Context::new(FrameworkConfig {
            environment: Environment::Kube,
            pilot_address: address.clone(),
            ..FrameworkConfig::default()
        });

        let (pilot, _connector) = KubePilot::connect(&ctx).await.unwrap();
        assert_eq!(pilot.address(), address);
    }
}
