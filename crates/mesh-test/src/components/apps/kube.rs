//! Echo apps deployed as services in a cluster.

use super::{App, AppEndpoint, AppProtocol};
use crate::cluster;
use crate::resource::{Context, ResourceError};
use reqwest::Client;
use tracing::debug;

/// HTTP port every echo service exposes.
pub const HTTP_PORT: u16 = 80;

/// gRPC port every echo service exposes.
pub const GRPC_PORT: u16 = 7070;

/// Fully qualified service name of `app` in `namespace`.
pub fn service_host(app: &str, namespace: &str, domain: &str) -> String {
    format!("{}.{}.{}", app, namespace, domain)
}

/// Resolve every app's service and describe its ports.
pub(crate) async fn resolve(
    ctx: &Context,
    names: &[String],
    client: Client,
) -> Result<Vec<App>, ResourceError> {
    let config = ctx.config();
    let mut apps = Vec::with_capacity(names.len());

    for name in names {
        let host = service_host(name, &config.namespace, &config.apps_domain);
        let addr = cluster::resolve(&host, HTTP_PORT)
            .await
            .map_err(|e| ResourceError::construction("apps", e))?;

        debug!(
            target: "mesh_test.apps",
            app = %name,
            host = %host,
            ip = %addr.ip(),
            "Resolved app"
        );

        let endpoints = vec![
            AppEndpoint::new("http", name, AppProtocol::Http, &host, name, HTTP_PORT),
            AppEndpoint::new("grpc", name, AppProtocol::Grpc, &host, name, GRPC_PORT),
        ];

        apps.push(App {
            name: name.clone(),
            namespace: config.namespace.clone(),
            ip: addr.ip(),
            endpoints,
            client: client.clone(),
            _server: None,
        });
    }

    Ok(apps)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::FrameworkConfig;
    use crate::environment::Environment;

    #[test]
    fn test_service_host() {
        assert_eq!(
            service_host("a", "istio-system", "svc.cluster.local"),
            "a.istio-system.svc.cluster.local"
        );
    }

    #[tokio::test]
    async fn test_resolve_fails_for_unknown_service() {
        let ctx = Context::new(FrameworkConfig {
            environment: Environment::Kube,
            apps_domain: "invalid".to_string(),
            ..FrameworkConfig::default()
        });

        let err = resolve(&ctx, &["a".to_string()], Client::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ResourceError::Construction {
                component: "apps",
                ..
            }
        ));
    }
}
