//! PolicyBackend: a fake out-of-process policy adapter.
//!
//! The backend answers policy checks with a switchable allow/deny decision
//! and records every report it receives. Tests prime it with
//! [`PolicyBackend::deny_check`] and assert on reports with
//! [`PolicyBackend::expect_report_json`].

pub mod server;

pub use server::PolicyBackendServer;

use crate::cluster;
use crate::environment::{Environment, EnvironmentSwitch};
use crate::resource::{or_fail, Context, Resource, ResourceError, ResourceId};
use crate::retry::{self, RetryError, RetryOptions};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use server::{CheckResponse, ClearReportsQuery, DenyRequest};
use thiserror::Error;
use tracing::{debug, instrument};

/// Port the backend's service listens on inside a cluster.
pub const SERVICE_PORT: u16 = 1071;

/// Maximum length of a response body quoted in an error.
const MAX_ERROR_BODY_LEN: usize = 256;

/// Policy backend errors.
#[derive(Debug, Error)]
pub enum PolicyBackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected reports not received: {0}")]
    ReportsMissing(#[from] RetryError),
}

enum Backend {
    Native { _server: PolicyBackendServer },
    Kube,
}

/// Handle to a policy backend.
pub struct PolicyBackend {
    id: ResourceId,
    environment: Environment,
    backend: Backend,
    base_url: String,
    handler_address: String,
    retry: RetryOptions,
    client: Client,
}

impl PolicyBackend {
    /// Base URL of the backend's HTTP API.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Make every following check deny (`true`) or allow (`false`).
    #[instrument(skip(self))]
    pub async fn deny_check(&self, deny: bool) -> Result<(), PolicyBackendError> {
        let response = self
            .client
            .put(format!("{}/admin/deny", self.base_url))
            .json(&DenyRequest { deny })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Like [`deny_check`](Self::deny_check), but fails the current test on error.
    #[allow(clippy::panic)]
    pub async fn deny_check_or_fail(&self, deny: bool) {
        if let Err(e) = self.deny_check(deny).await {
            panic!("policybackend::deny_check_or_fail: {}", e);
        }
    }

    /// Send a check. Returns whether it was allowed.
    pub async fn check(&self) -> Result<bool, PolicyBackendError> {
        let response = self
            .client
            .post(format!("{}/check", self.base_url))
            .send()
            .await?;

        if response.status() == StatusCode::FORBIDDEN {
            return Ok(false);
        }
        let response = ensure_success(response).await?;
        let body: CheckResponse = response.json().await?;
        Ok(body.status == "OK")
    }

    /// Deliver a report, as the mesh would.
    pub async fn report(&self, report: &Value) -> Result<(), PolicyBackendError> {
        let response = self
            .client
            .post(format!("{}/report", self.base_url))
            .json(report)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Reports received so far, oldest first.
    pub async fn get_reports(&self) -> Result<Vec<Value>, PolicyBackendError> {
        let response = self
            .client
            .get(format!("{}/admin/reports", self.base_url))
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    /// Drop the `count` oldest reports.
    async fn consume_reports(&self, count: usize) -> Result<(), PolicyBackendError> {
        let response = self
            .client
            .delete(format!("{}/admin/reports", self.base_url))
            .query(&ClearReportsQuery { count: Some(count) })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    /// Wait until every `expected` JSON document has been reported, then
    /// consume the reports seen by the matching poll.
    ///
    /// Reports that arrive after the match are kept for later expectations.
    ///
    /// Documents are compared as parsed JSON, so key order and whitespace do
    /// not matter.
    ///
    /// # Errors
    ///
    /// - [`PolicyBackendError::Json`] if an expected document does not parse
    /// - [`PolicyBackendError::ReportsMissing`] if they did not all arrive in time
    #[instrument(skip_all, fields(expected = expected.len()))]
    pub async fn expect_report_json(&self, expected: &[&str]) -> Result<(), PolicyBackendError> {
        let expected: Vec<Value> = expected
            .iter()
            .map(|e| serde_json::from_str(e))
            .collect::<Result<_, _>>()?;

        let observed = retry::until_success(self.retry, || async {
            let reports = self.get_reports().await?;
            let missing = expected.iter().filter(|e| !reports.contains(e)).count();
            if missing == 0 {
                Ok(reports.len())
            } else {
                Err(anyhow::anyhow!(
                    "{} of {} expected reports missing; received {}",
                    missing,
                    expected.len(),
                    serde_json::to_string(&reports).unwrap_or_default()
                ))
            }
        })
        .await?;

        debug!(target: "mesh_test.policybackend", observed, "Expected reports received");
        self.consume_reports(observed).await
    }

    /// Like [`expect_report_json`](Self::expect_report_json), but fails the current test on error.
    #[allow(clippy::panic)]
    pub async fn expect_report_json_or_fail(&self, expected: &[&str]) {
        if let Err(e) = self.expect_report_json(expected).await {
            panic!("policybackend::expect_report_json_or_fail: {}", e);
        }
    }

    /// Config for a `bypass` adapter handler named `name` that forwards to this backend.
    pub fn create_config_snippet(&self, name: &str, namespace: &str) -> String {
        format!(
            r#"apiVersion: "config.istio.io/v1alpha2"
kind: bypass
metadata:
  name: {name}
  namespace: {namespace}
spec:
  backend_address: {address}
"#,
            name = name,
            namespace = namespace,
            address = self.handler_address
        )
    }

    /// Override how long report expectations wait.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Whether this backend runs in-process.
    pub fn is_native(&self) -> bool {
        matches!(self.backend, Backend::Native { .. })
    }
}

impl Resource for PolicyBackend {
    fn id(&self) -> &ResourceId {
        &self.id
    }

    fn environment(&self) -> Environment {
        self.environment
    }
}

/// Turn a non-2xx response into [`PolicyBackendError::RequestFailed`].
async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, PolicyBackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY_LEN {
        let cut = (0..=MAX_ERROR_BODY_LEN)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        body.truncate(cut);
        body.push_str("...[truncated]");
    }
    Err(PolicyBackendError::RequestFailed {
        status: status.as_u16(),
        body,
    })
}

/// Start or connect to a policy backend.
///
/// # Errors
///
/// Returns [`ResourceError::Construction`] if the in-process server cannot
/// bind or the cluster backend is not reachable.
#[instrument(skip_all, fields(environment = %ctx.environment()))]
pub async fn new(ctx: &Context) -> Result<PolicyBackend, ResourceError> {
    let config = ctx.config();
    let client = Client::builder()
        .connect_timeout(config.connect_timeout)
        .build()
        .map_err(|e| ResourceError::construction("policybackend", e))?;

    let (backend, base_url, handler_address) = EnvironmentSwitch::new()
        .native(|| async {
            let server = PolicyBackendServer::spawn()
                .await
                .map_err(|e| ResourceError::construction("policybackend", e))?;
            let addr = server.addr();
            Ok((
                Backend::Native { _server: server },
                format!("http://{}", addr),
                addr.to_string(),
            ))
        })
        .kube(|| async {
            let base_url = config
                .policy_backend_address
                .trim_end_matches('/')
                .to_string();
            cluster::check_endpoint(&base_url, config.connect_timeout)
                .await
                .map_err(|e| ResourceError::construction("policybackend", e))?;
            let handler_address = format!(
                "policy-backend.{}.{}:{}",
                config.namespace, config.apps_domain, SERVICE_PORT
            );
            Ok((Backend::Kube, base_url, handler_address))
        })
        .run(ctx.environment())
        .await?;

    debug!(target: "mesh_test.policybackend", base_url = %base_url, "Policy backend ready");

    Ok(PolicyBackend {
        id: ResourceId::new("policybackend"),
        environment: ctx.environment(),
        backend,
        base_url,
        handler_address,
        retry: RetryOptions::from_config(config),
        client,
    })
}

/// Like [`new`], but fails the current test on error.
pub async fn new_or_fail(ctx: &Context) -> PolicyBackend {
    or_fail("policybackend::new_or_fail", new(ctx).await)
}
