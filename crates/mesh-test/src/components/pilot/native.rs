//! In-process Pilot.
//!
//! Serves discovery streams from a typed config store held in memory. Tests
//! put resources into the store with [`NativePilot::apply`]; every open
//! subscription for that type receives a new snapshot after the configured
//! debounce delay. Config generation is not modelled: what you apply is what
//! proxies receive.

use crate::discovery::{DiscoveryConnector, DiscoveryError, DiscoveryStream, RESPONSE_BUFFER};
use crate::features::PilotFeatures;
use async_trait::async_trait;
use prost_types::Any;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use xds_proto::{DiscoveryRequest, DiscoveryResponse};

/// Requests buffered from a proxy before it blocks.
const REQUEST_BUFFER: usize = 4;

/// Resources by type URL plus a version counter bumped on every change.
struct ConfigStore {
    resources: RwLock<HashMap<String, Vec<Any>>>,
    version: watch::Sender<u64>,
}

impl ConfigStore {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            resources: RwLock::new(HashMap::new()),
            version,
        }
    }

    async fn snapshot(&self, type_url: &str) -> (u64, Vec<Any>) {
        let resources = self.resources.read().await;
        let version = *self.version.borrow();
        (version, resources.get(type_url).cloned().unwrap_or_default())
    }
}

/// Handle to the in-process discovery server.
///
/// Dropping the handle ends every open stream.
pub struct NativePilot {
    store: Arc<ConfigStore>,
    features: PilotFeatures,
    active_streams: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl NativePilot {
    pub(crate) fn start(features: PilotFeatures) -> Self {
        debug!(
            target: "mesh_test.pilot",
            debounce_after = ?features.debounce_after,
            max_streams = features.max_concurrent_streams,
            "Starting native pilot"
        );

        Self {
            store: Arc::new(ConfigStore::new()),
            features,
            active_streams: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace every resource of `type_url` and push to subscribers.
    ///
    /// Returns the new config version.
    pub async fn apply(&self, type_url: &str, resources: Vec<Any>) -> u64 {
        let mut store = self.store.resources.write().await;
        store.insert(type_url.to_string(), resources);

        let mut version = 0;
        self.store.version.send_modify(|v| {
            *v += 1;
            version = *v;
        });

        debug!(target: "mesh_test.pilot", type_url = %type_url, version, "Config applied");
        version
    }

    /// Remove every resource of `type_url` and push the empty snapshot.
    pub async fn clear(&self, type_url: &str) -> u64 {
        self.apply(type_url, Vec::new()).await
    }

    /// Current config version.
    pub fn version(&self) -> u64 {
        *self.store.version.borrow()
    }

    /// Number of discovery streams currently being served.
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Feature flags this pilot runs with.
    pub fn features(&self) -> &PilotFeatures {
        &self.features
    }

    pub(crate) fn connector(&self) -> Arc<dyn DiscoveryConnector> {
        Arc::new(NativeConnector {
            store: self.store.clone(),
            debounce_after: self.features.debounce_after,
            max_streams: self.features.max_concurrent_streams as usize,
            active_streams: self.active_streams.clone(),
            shutdown: self.shutdown.clone(),
        })
    }
}

impl Drop for NativePilot {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct NativeConnector {
    store: Arc<ConfigStore>,
    debounce_after: Duration,
    max_streams: usize,
    active_streams: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

#[async_trait]
impl DiscoveryConnector for NativeConnector {
    async fn open(&self, initial: DiscoveryRequest) -> Result<DiscoveryStream, DiscoveryError> {
        if self.shutdown.is_cancelled() {
            return Err(DiscoveryError::Transport("pilot has shut down".to_string()));
        }

        let admitted = self
            .active_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_streams).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            return Err(DiscoveryError::Transport(format!(
                "max concurrent streams ({}) reached",
                self.max_streams
            )));
        }
        let guard = StreamGuard(self.active_streams.clone());

        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_BUFFER);

        request_tx
            .send(initial)
            .await
            .map_err(|_| DiscoveryError::Transport("request stream closed".to_string()))?;

        let session = StreamSession {
            store: self.store.clone(),
            debounce_after: self.debounce_after,
            subscriptions: BTreeSet::new(),
            nonce: 0,
            response_tx,
        };
        tokio::spawn(session.run(request_rx, self.shutdown.clone()));

        Ok(DiscoveryStream::new(request_tx, response_rx).holding(guard))
    }
}

/// Decrements the active stream count when the client drops its stream.
struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Server side of one discovery stream.
struct StreamSession {
    store: Arc<ConfigStore>,
    debounce_after: Duration,
    subscriptions: BTreeSet<String>,
    nonce: u64,
    response_tx: mpsc::Sender<Result<DiscoveryResponse, DiscoveryError>>,
}

impl StreamSession {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<DiscoveryRequest>,
        shutdown: CancellationToken,
    ) {
        let mut updates = self.store.version.subscribe();
        let response_tx = self.response_tx.clone();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = response_tx.closed() => break,
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    if !self.handle_request(request).await {
                        break;
                    }
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !self.debounce(&shutdown).await {
                        break;
                    }
                    // Changes during the debounce window are folded into this push
                    updates.borrow_and_update();
                    if !self.push_all().await {
                        break;
                    }
                }
            }
        }

        trace!(target: "mesh_test.pilot", "Discovery stream closed");
    }

    /// Wait out the debounce window. Returns false if the stream ends meanwhile.
    async fn debounce(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = shutdown.cancelled() => false,
            () = self.response_tx.closed() => false,
            () = tokio::time::sleep(self.debounce_after) => true,
        }
    }

    /// Returns false once the client has gone away.
    async fn handle_request(&mut self, request: DiscoveryRequest) -> bool {
        if request.is_ack() {
            if let Some(detail) = &request.error_detail {
                warn!(
                    target: "mesh_test.pilot",
                    nonce = %request.response_nonce,
                    type_url = %request.type_url,
                    error = %detail.message,
                    "Proxy rejected config"
                );
            }
            return true;
        }

        let node = request.node.as_ref().map(|n| n.id.as_str()).unwrap_or("");
        debug!(
            target: "mesh_test.pilot",
            node = %node,
            type_url = %request.type_url,
            "Discovery subscription"
        );

        self.subscriptions.insert(request.type_url.clone());
        self.push(&request.type_url).await
    }

    async fn push_all(&mut self) -> bool {
        let type_urls: Vec<String> = self.subscriptions.iter().cloned().collect();
        for type_url in type_urls {
            if !self.push(&type_url).await {
                return false;
            }
        }
        true
    }

    async fn push(&mut self, type_url: &str) -> bool {
        let (version, resources) = self.store.snapshot(type_url).await;
        self.nonce += 1;

        let response = DiscoveryResponse {
            version_info: version.to_string(),
            resources,
            type_url: type_url.to_string(),
            nonce: self.nonce.to_string(),
            ..Default::default()
        };

        self.response_tx.send(Ok(response)).await.is_ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::discovery::DiscoveryChannel;
    use xds_proto::listener::Listener;
    use xds_proto::type_url;

    fn features() -> PilotFeatures {
        PilotFeatures {
            debounce_after: Duration::from_millis(1),
            ..PilotFeatures::default()
        }
    }

    fn request(type_url: &str) -> DiscoveryRequest {
        DiscoveryRequest::for_type(type_url, Default::default())
    }

    fn listener(name: &str) -> Any {
        Any::from_msg(&Listener {
            name: name.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_call_returns_current_snapshot() {
        let pilot = NativePilot::start(features());
        pilot
            .apply(type_url::LISTENER, vec![listener("inbound")])
            .await;

        let channel = DiscoveryChannel::new(pilot.connector());
        let response = channel
            .call_discovery(request(type_url::LISTENER))
            .await
            .unwrap();

        assert_eq!(response.version_info, "1");
        assert_eq!(response.type_url, type_url::LISTENER);
        let listeners = response.decode_resources::<Listener>();
        assert_eq!(listeners.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_type_pushes_empty_snapshot() {
        let pilot = NativePilot::start(features());
        let channel = DiscoveryChannel::new(pilot.connector());

        let response = channel
            .call_discovery(request(type_url::CLUSTER))
            .await
            .unwrap();
        assert!(response.resources.is_empty());
        assert_eq!(response.version_info, "0");
    }

    #[tokio::test]
    async fn test_apply_pushes_to_subscribers() {
        let pilot = NativePilot::start(features());
        let mut channel = DiscoveryChannel::new(pilot.connector());
        channel
            .start_discovery(request(type_url::LISTENER))
            .await
            .unwrap();

        pilot
            .apply(type_url::LISTENER, vec![listener("a"), listener("b")])
            .await;

        let mut versions = Vec::new();
        channel
            .watch_discovery(Duration::from_secs(5), |resp| {
                versions.push(resp.version_info.clone());
                Ok(resp.resources.len() == 2)
            })
            .await
            .unwrap();

        // The initial snapshot may already include the change
        assert_eq!(versions.last().map(String::as_str), Some("1"));
        assert!(versions.len() <= 2);
    }

    #[tokio::test]
    async fn test_stream_limit_enforced() {
        let pilot = NativePilot::start(PilotFeatures {
            max_concurrent_streams: 1,
            ..features()
        });
        let mut first = DiscoveryChannel::new(pilot.connector());
        first
            .start_discovery(request(type_url::LISTENER))
            .await
            .unwrap();
        assert_eq!(pilot.active_streams(), 1);

        let second = DiscoveryChannel::new(pilot.connector());
        let err = second
            .call_discovery(request(type_url::LISTENER))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("max concurrent streams"));
    }

    #[tokio::test]
    async fn test_sequential_calls_within_stream_limit() {
        let pilot = NativePilot::start(PilotFeatures {
            max_concurrent_streams: 1,
            ..features()
        });
        let channel = DiscoveryChannel::new(pilot.connector());

        for _ in 0..3 {
            channel
                .call_discovery(request(type_url::LISTENER))
                .await
                .unwrap();
            assert_eq!(pilot.active_streams(), 0);
        }
    }

    #[tokio::test]
    async fn test_resubscribe_at_stream_limit() {
        let pilot = NativePilot::start(PilotFeatures {
            max_concurrent_streams: 1,
            ..features()
        });
        let mut channel = DiscoveryChannel::new(pilot.connector());

        channel
            .start_discovery(request(type_url::LISTENER))
            .await
            .unwrap();
        channel
            .start_discovery(request(type_url::CLUSTER))
            .await
            .unwrap();
        assert_eq!(pilot.active_streams(), 1);

        let timeout = Duration::from_secs(5);
        channel
            .watch_discovery(timeout, |r| Ok(r.type_url == type_url::CLUSTER))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drop_during_debounce_closes_streams() {
        let pilot = NativePilot::start(PilotFeatures {
            debounce_after: Duration::from_secs(60),
            ..features()
        });
        let mut channel = DiscoveryChannel::new(pilot.connector());
        channel
            .start_discovery(request(type_url::LISTENER))
            .await
            .unwrap();

        pilot.apply(type_url::LISTENER, vec![listener("a")]).await;
        // Let the session pick up the change and enter the debounce window
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(pilot);

        let start = std::time::Instant::now();
        let err = channel
            .watch_discovery(Duration::from_secs(5), |_| Ok(false))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::StreamClosed));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_drop_closes_streams() {
        let pilot = NativePilot::start(features());
        let mut channel = DiscoveryChannel::new(pilot.connector());
        channel
            .start_discovery(request(type_url::LISTENER))
            .await
            .unwrap();
        drop(pilot);

        let err = channel
            .watch_discovery(Duration::from_secs(5), |resp| Ok(resp.version_info == "99"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::StreamClosed));
    }
}
