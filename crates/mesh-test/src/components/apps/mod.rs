//! Apps: echo applications deployed into the mesh.
//!
//! Each app answers HTTP requests with a JSON description of what it
//! received, so tests can assert on routing and headers. Natively the apps
//! are in-process axum servers; in a cluster they are the `<name>` services
//! in the context's namespace.

pub mod kube;
pub mod native;

use crate::environment::{Environment, EnvironmentSwitch};
use crate::resource::{or_fail, Context, Resource, ResourceError, ResourceId};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, instrument};
use xds_proto::{DiscoveryRequest, Node};

/// Apps deployed when the config lists none.
pub const DEFAULT_APPS: [&str; 4] = ["a", "b", "c", "d"];

/// Errors from looking up or calling apps.
#[derive(Debug, Error)]
pub enum AppsError {
    #[error("app '{0}' not found")]
    UnknownApp(String),

    #[error("protocol {0} is not supported for app calls")]
    UnsupportedProtocol(AppProtocol),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Protocol used to call an app endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AppProtocol {
    #[default]
    Http,
    Grpc,
    WebSocket,
}

impl AppProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppProtocol::Http => "http",
            AppProtocol::Grpc => "grpc",
            AppProtocol::WebSocket => "ws",
        }
    }
}

impl fmt::Display for AppProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a single app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppParam {
    pub name: String,
}

impl AppParam {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Options for creating Apps.
#[derive(Debug, Clone, Default)]
pub struct AppsConfig {
    /// Apps needed by the test. Empty deploys [`DEFAULT_APPS`].
    pub app_params: Vec<AppParam>,
}

impl AppsConfig {
    fn app_names(&self) -> Vec<String> {
        if self.app_params.is_empty() {
            DEFAULT_APPS.iter().map(|n| n.to_string()).collect()
        } else {
            self.app_params.iter().map(|p| p.name.clone()).collect()
        }
    }
}

/// Options for a call to an app endpoint.
#[derive(Debug, Clone, Default)]
pub struct AppCallOptions {
    pub protocol: AppProtocol,

    /// Number of requests to send. 0 sends one.
    pub count: usize,

    pub headers: Vec<(String, String)>,

    /// Use TLS to reach the endpoint.
    pub secure: bool,

    /// Address the app by its short name. Ignored natively.
    pub use_short_hostname: bool,
}

/// A named port on an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppEndpoint {
    name: String,
    owner: String,
    protocol: AppProtocol,
    host: String,
    short_host: String,
    port: u16,
}

impl AppEndpoint {
    pub(crate) fn new(
        name: &str,
        owner: &str,
        protocol: AppProtocol,
        host: &str,
        short_host: &str,
        port: u16,
    ) -> Self {
        Self {
            name: name.to_string(),
            owner: owner.to_string(),
            protocol,
            host: host.to_string(),
            short_host: short_host.to_string(),
            port,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the app this endpoint belongs to.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn protocol(&self) -> AppProtocol {
        self.protocol
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// What an echo app saw for one request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EchoResponse {
    /// HTTP status of the exchange.
    #[serde(skip)]
    pub code: u16,

    /// Name of the app that answered.
    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub url: String,

    /// Host header as received.
    #[serde(default)]
    pub host: String,

    /// Request headers as received, lowercased.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl EchoResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 200
    }
}

/// One deployed echo app.
pub struct App {
    name: String,
    namespace: String,
    ip: IpAddr,
    endpoints: Vec<AppEndpoint>,
    client: Client,
    _server: Option<native::EchoServer>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("endpoints", &self.endpoints)
            .finish()
    }
}

impl App {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Address used as the app's workload IP.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn endpoints(&self) -> &[AppEndpoint] {
        &self.endpoints
    }

    pub fn endpoints_for_protocol(&self, protocol: AppProtocol) -> Vec<&AppEndpoint> {
        self.endpoints
            .iter()
            .filter(|e| e.protocol == protocol)
            .collect()
    }

    /// Call `endpoint` `opts.count` times and collect what the target saw.
    ///
    /// `endpoint` usually belongs to another app: `a.call(b_http, ..)` sends
    /// from `a` to `b`. Only HTTP is supported.
    ///
    /// # Errors
    ///
    /// - [`AppsError::UnsupportedProtocol`] for gRPC or WebSocket calls
    /// - [`AppsError::Http`] if a request cannot be sent
    #[instrument(
        skip_all,
        fields(from = %self.name, to = %endpoint.owner, endpoint = %endpoint.name)
    )]
    pub async fn call(
        &self,
        endpoint: &AppEndpoint,
        opts: &AppCallOptions,
    ) -> Result<Vec<EchoResponse>, AppsError> {
        for protocol in [opts.protocol, endpoint.protocol] {
            if protocol != AppProtocol::Http {
                return Err(AppsError::UnsupportedProtocol(protocol));
            }
        }

        let scheme = if opts.secure { "https" } else { "http" };
        let host = if opts.use_short_hostname {
            &endpoint.short_host
        } else {
            &endpoint.host
        };
        let url = format!("{}://{}:{}/", scheme, host, endpoint.port);
        let count = opts.count.max(1);

        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            let mut request = self
                .client
                .get(&url)
                .header("x-mesh-test-source", &self.name);
            for (name, value) in &opts.headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request.send().await?;
            let code = response.status().as_u16();
            let body = response.text().await?;

            // Non-echo bodies (proxy errors) still carry a status code
            let mut parsed: EchoResponse = serde_json::from_str(&body).unwrap_or_default();
            parsed.code = code;
            responses.push(parsed);
        }

        debug!(target: "mesh_test.apps", url = %url, count, "App call complete");
        Ok(responses)
    }

    /// Like [`call`](Self::call), but fails the current test on error.
    #[allow(clippy::panic)]
    pub async fn call_or_fail(
        &self,
        endpoint: &AppEndpoint,
        opts: &AppCallOptions,
    ) -> Vec<EchoResponse> {
        match self.call(endpoint, opts).await {
            Ok(responses) => responses,
            Err(e) => panic!("app {}: call to {} failed: {}", self.name, endpoint.owner, e),
        }
    }
}

/// The set of apps deployed for a test.
pub struct Apps {
    id: ResourceId,
    environment: Environment,
    namespace: String,
    apps: Vec<App>,
}

impl Apps {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn get_app(&self, name: &str) -> Result<&App, AppsError> {
        self.apps
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| AppsError::UnknownApp(name.to_string()))
    }

    #[allow(clippy::panic)]
    #[track_caller]
    pub fn get_app_or_fail(&self, name: &str) -> &App {
        match self.get_app(name) {
            Ok(app) => app,
            Err(e) => panic!("apps::get_app_or_fail: {}", e),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &App> {
        self.apps.iter()
    }
}

impl Resource for Apps {
    fn id(&self) -> &ResourceId {
        &self.id
    }

    fn environment(&self) -> Environment {
        self.environment
    }
}

/// Deploy the apps listed in `config`.
///
/// # Errors
///
/// - [`ResourceError::InvalidConfig`] for empty or duplicate app names
/// - [`ResourceError::Construction`] if an app cannot be started or resolved
#[instrument(skip_all, fields(environment = %ctx.environment()))]
pub async fn new(ctx: &Context, config: AppsConfig) -> Result<Apps, ResourceError> {
    let names = config.app_names();
    for (i, name) in names.iter().enumerate() {
        if name.is_empty() {
            return Err(ResourceError::InvalidConfig(
                "app name must not be empty".to_string(),
            ));
        }
        if names.iter().skip(i + 1).any(|n| n == name) {
            return Err(ResourceError::InvalidConfig(format!(
                "duplicate app '{}'",
                name
            )));
        }
    }

    let client = Client::builder()
        .connect_timeout(ctx.config().connect_timeout)
        .build()
        .map_err(|e| ResourceError::construction("apps", e))?;

    let names = &names;
    let native_client = client.clone();
    let apps = EnvironmentSwitch::new()
        .native(|| native::start(ctx, names, native_client))
        .kube(|| kube::resolve(ctx, names, client))
        .run(ctx.environment())
        .await?;

    Ok(Apps {
        id: ResourceId::new("apps"),
        environment: ctx.environment(),
        namespace: ctx.config().namespace.clone(),
        apps,
    })
}

/// Like [`new`], but fails the current test on error.
pub async fn new_or_fail(ctx: &Context, config: AppsConfig) -> Apps {
    or_fail("apps::new_or_fail", new(ctx, config).await)
}

/// Build a discovery request as `app`'s sidecar would send it.
///
/// The node id follows the sidecar convention
/// `sidecar~<ip>~<name>.<namespace>~<namespace>.svc.cluster.local`.
pub fn construct_discovery_request(app: &App, type_url: &str) -> DiscoveryRequest {
    let node = Node {
        id: format!(
            "sidecar~{}~{}.{}~{}.svc.cluster.local",
            app.ip, app.name, app.namespace, app.namespace
        ),
        cluster: app.name.clone(),
        ..Default::default()
    };
    DiscoveryRequest::for_type(type_url, node)
}
