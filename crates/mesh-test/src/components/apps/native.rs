//! In-process echo apps.

use super::{App, AppEndpoint, AppProtocol};
use crate::resource::{Context, ResourceError};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Uri};
use axum::{Json, Router};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

struct EchoState {
    hostname: String,
    port: u16,
}

/// A running echo server. Stops when dropped.
pub struct EchoServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl EchoServer {
    /// Bind a loopback port and serve echo responses as `hostname`.
    pub async fn spawn(hostname: &str) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(SocketAddr::new(LOOPBACK, 0)).await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(EchoState {
            hostname: hostname.to_string(),
            port: addr.port(),
        });
        let app = Router::new().fallback(echo).with_state(state);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let name = hostname.to_string();
        tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = server.await {
                error!(target: "mesh_test.apps", app = %name, error = %e, "Echo server failed");
            }
        });

        debug!(target: "mesh_test.apps", app = %hostname, address = %addr, "Echo server listening");
        Ok(Self { addr, shutdown })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn echo(
    State(state): State<Arc<EchoState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Json<Value> {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let headers: BTreeMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    Json(json!({
        "hostname": state.hostname,
        "port": state.port,
        "method": method.as_str(),
        "url": uri.to_string(),
        "host": host,
        "headers": headers,
    }))
}

/// Start one echo server per app.
pub(crate) async fn start(
    ctx: &Context,
    names: &[String],
    client: Client,
) -> Result<Vec<App>, ResourceError> {
    let namespace = &ctx.config().namespace;
    let mut apps = Vec::with_capacity(names.len());

    for name in names {
        let server = EchoServer::spawn(name)
            .await
            .map_err(|e| ResourceError::construction("apps", format!("{}: {}", name, e)))?;

        let host = LOOPBACK.to_string();
        let endpoints = vec![AppEndpoint::new(
            "http",
            name,
            AppProtocol::Http,
            &host,
            &host,
            server.addr().port(),
        )];

        apps.push(App {
            name: name.clone(),
            namespace: namespace.clone(),
            ip: LOOPBACK,
            endpoints,
            client: client.clone(),
            _server: Some(server),
        });
    }

    Ok(apps)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_reports_request() {
        let server = EchoServer::spawn("echo").await.unwrap();
        let url = format!("http://{}/path?q=1", server.addr());

        let body: Value = Client::new()
            .post(&url)
            .header("x-probe", "1")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["hostname"], "echo");
        assert_eq!(body["method"], "POST");
        assert_eq!(body["url"], "/path?q=1");
        assert_eq!(body["headers"]["x-probe"], "1");
        assert_eq!(body["port"], server.addr().port());
    }
}
