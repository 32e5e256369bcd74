//! In-process fake policy backend.
//!
//! Serves the same HTTP API a deployed backend exposes:
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /check` | Policy check; 200 when allowed, 403 when denying |
//! | `POST /report` | Record a JSON report |
//! | `PUT /admin/deny` | `{"deny": bool}` switches check behavior |
//! | `GET /admin/reports` | Reports received so far |
//! | `DELETE /admin/reports` | Drop recorded reports; `?count=N` drops only the oldest `N` |
//! | `GET /health` | Liveness |

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Body of `PUT /admin/deny`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DenyRequest {
    pub deny: bool,
}

/// Body of a `POST /check` answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub status: String,
}

/// Query of `DELETE /admin/reports`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClearReportsQuery {
    /// Oldest reports to drop. All of them when absent.
    pub count: Option<usize>,
}

#[derive(Default)]
struct BackendState {
    deny: AtomicBool,
    reports: Mutex<Vec<Value>>,
}

/// A running fake backend. Stops when dropped.
pub struct PolicyBackendServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl PolicyBackendServer {
    /// Bind a loopback port and start serving.
    pub async fn spawn() -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
        let addr = listener.local_addr()?;

        let app = routes(Arc::new(BackendState::default()));
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();

        tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = server.await {
                error!(
                    target: "mesh_test.policybackend",
                    error = %e,
                    "Policy backend server failed"
                );
            }
        });

        debug!(target: "mesh_test.policybackend", address = %addr, "Policy backend listening");
        Ok(Self { addr, shutdown })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for PolicyBackendServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn routes(state: Arc<BackendState>) -> Router {
    Router::new()
        .route("/check", post(check))
        .route("/report", post(report))
        .route("/admin/deny", put(set_deny))
        .route("/admin/reports", get(list_reports).delete(clear_reports))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

async fn check(State(state): State<Arc<BackendState>>) -> (StatusCode, Json<CheckResponse>) {
    if state.deny.load(Ordering::SeqCst) {
        (
            StatusCode::FORBIDDEN,
            Json(CheckResponse {
                status: "PERMISSION_DENIED".to_string(),
            }),
        )
    } else {
        (
            StatusCode::OK,
            Json(CheckResponse {
                status: "OK".to_string(),
            }),
        )
    }
}

async fn report(State(state): State<Arc<BackendState>>, Json(report): Json<Value>) -> StatusCode {
    state.reports.lock().await.push(report);
    StatusCode::OK
}

async fn set_deny(
    State(state): State<Arc<BackendState>>,
    Json(request): Json<DenyRequest>,
) -> StatusCode {
    state.deny.store(request.deny, Ordering::SeqCst);
    debug!(target: "mesh_test.policybackend", deny = request.deny, "Check behavior updated");
    StatusCode::NO_CONTENT
}

async fn list_reports(State(state): State<Arc<BackendState>>) -> Json<Vec<Value>> {
    Json(state.reports.lock().await.clone())
}

async fn clear_reports(
    State(state): State<Arc<BackendState>>,
    Query(query): Query<ClearReportsQuery>,
) -> StatusCode {
    let mut reports = state.reports.lock().await;
    let count = query.count.unwrap_or(reports.len()).min(reports.len());
    reports.drain(..count);
    debug!(
        target: "mesh_test.policybackend",
        dropped = count,
        kept = reports.len(),
        "Reports cleared"
    );
    StatusCode::NO_CONTENT
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_deny_switch() {
        let server = PolicyBackendServer::spawn().await.unwrap();
        let base = format!("http://{}", server.addr());
        let client = reqwest::Client::new();

        let status = client
            .post(format!("{}/check", base))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::OK);

        client
            .put(format!("{}/admin/deny", base))
            .json(&DenyRequest { deny: true })
            .send()
            .await
            .unwrap();

        let response = client.post(format!("{}/check", base)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
        let body: CheckResponse = response.json().await.unwrap();
        assert_eq!(body.status, "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn test_reports_recorded_and_cleared() {
        let server = PolicyBackendServer::spawn().await.unwrap();
        let base = format!("http://{}", server.addr());
        let client = reqwest::Client::new();

        client
            .post(format!("{}/report", base))
            .json(&json!({"name": "metric1"}))
            .send()
            .await
            .unwrap();

        let reports: Vec<Value> = client
            .get(format!("{}/admin/reports", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reports, vec![json!({"name": "metric1"})]);

        client
            .delete(format!("{}/admin/reports", base))
            .send()
            .await
            .unwrap();
        let reports: Vec<Value> = client
            .get(format!("{}/admin/reports", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn test_clear_oldest_reports_only() {
        let server = PolicyBackendServer::spawn().await.unwrap();
        let base = format!("http://{}", server.addr());
        let client = reqwest::Client::new();

        for name in ["r1", "r2", "r3"] {
            client
                .post(format!("{}/report", base))
                .json(&json!({ "name": name }))
                .send()
                .await
                .unwrap();
        }

        let status = client
            .delete(format!("{}/admin/reports?count=2", base))
            .send()
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NO_CONTENT);

        let reports: Vec<Value> = client
            .get(format!("{}/admin/reports", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(reports, vec![json!({"name": "r3"})]);

        // Counts past the end drop what is there
        client
            .delete(format!("{}/admin/reports?count=10", base))
            .send()
            .await
            .unwrap();
        let reports: Vec<Value> = client
            .get(format!("{}/admin/reports", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(reports.is_empty());
    }
}
