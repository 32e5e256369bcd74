//! Cluster endpoint reachability checks.
//!
//! Kube-backed components talk to services through port-forwards or
//! in-cluster DNS. Constructors call [`check_endpoint`] first so a missing
//! port-forward fails resource creation with an actionable message instead
//! of a timeout deep inside a test.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Cluster connection errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Endpoint {address} not reachable. Check that the port-forward or service is running")]
    EndpointNotReachable { address: String },

    #[error("Invalid endpoint address: {0}")]
    InvalidAddress(String),

    #[error("Could not resolve {host}: {message}")]
    ResolutionFailed { host: String, message: String },
}

/// Check that a TCP connection to the host and port of `url` succeeds within `connect_timeout`.
///
/// Returns the address that accepted the connection.
pub async fn check_endpoint(
    url: &str,
    connect_timeout: Duration,
) -> Result<SocketAddr, ClusterError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ClusterError::InvalidAddress(format!("{}: {}", url, e)))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| ClusterError::InvalidAddress(format!("{}: missing host", url)))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| ClusterError::InvalidAddress(format!("{}: missing port", url)))?;

    let addr = resolve(host, port).await?;

    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => {
            debug!(target: "mesh_test.cluster", address = %addr, "Endpoint reachable");
            Ok(addr)
        }
        _ => Err(ClusterError::EndpointNotReachable {
            address: format!("{}:{}", host, port),
        }),
    }
}

/// Resolve `host:port` to the first address DNS returns.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ClusterError> {
    // Bracketed IPv6 hosts come back from Url::host_str with brackets
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    lookup_host((bare, port))
        .await
        .map_err(|e| ClusterError::ResolutionFailed {
            host: host.to_string(),
            message: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ClusterError::ResolutionFailed {
            host: host.to_string(),
            message: "no addresses returned".to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_endpoint_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let addr = check_endpoint(
            &format!("http://127.0.0.1:{}", port),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(addr.port(), port);
    }

    #[tokio::test]
    async fn test_check_endpoint_not_reachable() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = check_endpoint(
            &format!("http://127.0.0.1:{}", port),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ClusterError::EndpointNotReachable { .. }));
        assert!(err.to_string().contains(&port.to_string()));
    }

    #[tokio::test]
    async fn test_check_endpoint_invalid_url() {
        let err = check_endpoint("localhost-without-scheme", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_resolve_ip_literal() {
        let addr = resolve("10.1.2.3", 80).await.unwrap();
        assert_eq!(addr, "10.1.2.3:80".parse().unwrap());
    }
}
