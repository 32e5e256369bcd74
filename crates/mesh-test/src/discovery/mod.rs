//! Discovery channel: one-shot calls, subscriptions and predicate watches.
//!
//! A [`DiscoveryChannel`] talks to a discovery endpoint through a
//! [`DiscoveryConnector`], which hides whether the endpoint is an in-process
//! fake or a remote ADS server.
//!
//! # Subscription states
//!
//! ```text
//! Idle --start_discovery--> Subscribed --watch_discovery--> match | predicate error | timeout
//!   ^                            |
//!   +---- transport error / stream closed
//! ```
//!
//! `call_discovery` does not touch the subscription.

pub mod grpc;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, trace, warn};
use xds_proto::{DiscoveryRequest, DiscoveryResponse};

/// Buffered responses per stream before the sender applies backpressure.
pub const RESPONSE_BUFFER: usize = 16;

/// Discovery errors.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery transport error: {0}")]
    Transport(String),

    #[error("discovery stream closed by server")]
    StreamClosed,

    #[error("watch_discovery called without an active subscription; call start_discovery first")]
    NotSubscribed,

    #[error("discovery predicate failed: {0}")]
    Predicate(anyhow::Error),

    #[error("no matching discovery response within {duration:?}")]
    Timeout { duration: Duration },
}

/// One open request/response stream.
pub struct DiscoveryStream {
    // Dropping the sender half-closes the stream, so it is held for the stream's life.
    _requests: mpsc::Sender<DiscoveryRequest>,
    responses: mpsc::Receiver<Result<DiscoveryResponse, DiscoveryError>>,
    // Released together with the stream.
    _slot: Option<Box<dyn Send + Sync>>,
}

impl DiscoveryStream {
    /// Wrap the two halves of an open stream.
    pub fn new(
        requests: mpsc::Sender<DiscoveryRequest>,
        responses: mpsc::Receiver<Result<DiscoveryResponse, DiscoveryError>>,
    ) -> Self {
        Self {
            _requests: requests,
            responses,
            _slot: None,
        }
    }

    /// Keep `slot` alive until this stream is dropped.
    ///
    /// Servers use it to release per-stream resources (an admission slot) as
    /// soon as the client lets go of the stream.
    pub fn holding<T: Send + Sync + 'static>(mut self, slot: T) -> Self {
        self._slot = Some(Box::new(slot));
        self
    }

    /// Next response in arrival order, or `None` once the server closed the stream.
    pub async fn recv(&mut self) -> Option<Result<DiscoveryResponse, DiscoveryError>> {
        self.responses.recv().await
    }
}

/// Opens discovery streams against one endpoint.
#[async_trait]
pub trait DiscoveryConnector: Send + Sync {
    /// Open a stream and send `initial` on it.
    ///
    /// Returns as soon as the request is dispatched; responses arrive on the
    /// returned stream.
    async fn open(&self, initial: DiscoveryRequest) -> Result<DiscoveryStream, DiscoveryError>;
}

/// Client side of a discovery endpoint.
pub struct DiscoveryChannel {
    connector: Arc<dyn DiscoveryConnector>,
    subscription: Option<DiscoveryStream>,
}

impl DiscoveryChannel {
    /// Create an idle channel.
    pub fn new(connector: Arc<dyn DiscoveryConnector>) -> Self {
        Self {
            connector,
            subscription: None,
        }
    }

    /// Whether a `start_discovery` subscription is open.
    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Send `request` on a fresh stream and wait for the first response.
    ///
    /// No retry: a transport failure is returned immediately. The stream is
    /// closed afterwards and any subscription is left untouched.
    #[instrument(skip_all, fields(type_url = %request.type_url))]
    pub async fn call_discovery(
        &self,
        request: DiscoveryRequest,
    ) -> Result<DiscoveryResponse, DiscoveryError> {
        let mut stream = self.connector.open(request).await?;

        match stream.recv().await {
            Some(Ok(response)) => {
                debug!(
                    target: "mesh_test.discovery",
                    version = %response.version_info,
                    resources = response.resources.len(),
                    "Discovery call answered"
                );
                Ok(response)
            }
            Some(Err(e)) => Err(e),
            None => Err(DiscoveryError::StreamClosed),
        }
    }

    /// Open a long-lived subscription by sending `request`.
    ///
    /// Returns once the request is sent; responses are consumed by
    /// [`watch_discovery`](Self::watch_discovery). Replaces any existing
    /// subscription.
    #[instrument(skip_all, fields(type_url = %request.type_url))]
    pub async fn start_discovery(
        &mut self,
        request: DiscoveryRequest,
    ) -> Result<(), DiscoveryError> {
        self.subscription = None;
        let stream = self.connector.open(request).await?;
        self.subscription = Some(stream);

        debug!(target: "mesh_test.discovery", "Discovery subscription started");
        Ok(())
    }

    /// Apply `predicate` to each subscribed response until one matches.
    ///
    /// Every response is offered to the predicate once, in arrival order.
    /// `Ok(true)` ends the watch successfully, `Ok(false)` keeps waiting and
    /// `Err(e)` ends it with [`DiscoveryError::Predicate`] without looking at
    /// later responses. The subscription stays open after a match or a
    /// predicate error; a transport error or server close drops it.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError::NotSubscribed`] without a prior `start_discovery`
    /// - [`DiscoveryError::Predicate`] if the predicate rejects a response
    /// - [`DiscoveryError::Timeout`] if nothing matched within `duration`
    /// - [`DiscoveryError::Transport`] / [`DiscoveryError::StreamClosed`] if the stream fails
    #[instrument(skip_all, fields(duration = ?duration))]
    pub async fn watch_discovery<P>(
        &mut self,
        duration: Duration,
        mut predicate: P,
    ) -> Result<(), DiscoveryError>
    where
        P: FnMut(&DiscoveryResponse) -> anyhow::Result<bool>,
    {
        let Some(stream) = self.subscription.as_mut() else {
            return Err(DiscoveryError::NotSubscribed);
        };

        // A duration past the clock's range never expires
        let deadline = Instant::now().checked_add(duration);
        let mut seen = 0usize;

        loop {
            let next = match deadline {
                Some(deadline) => match timeout_at(deadline, stream.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            target: "mesh_test.discovery",
                            responses_seen = seen,
                            "No matching discovery response before deadline"
                        );
                        return Err(DiscoveryError::Timeout { duration });
                    }
                },
                None => stream.recv().await,
            };

            match next {
                Some(Ok(response)) => {
                    seen += 1;
                    match predicate(&response) {
                        Ok(true) => {
                            debug!(
                                target: "mesh_test.discovery",
                                responses_seen = seen,
                                version = %response.version_info,
                                "Discovery response matched"
                            );
                            return Ok(());
                        }
                        Ok(false) => {
                            trace!(
                                target: "mesh_test.discovery",
                                version = %response.version_info,
                                "Discovery response did not match"
                            );
                        }
                        Err(e) => return Err(DiscoveryError::Predicate(e)),
                    }
                }
                Some(Err(e)) => {
                    self.subscription = None;
                    return Err(e);
                }
                None => {
                    self.subscription = None;
                    return Err(DiscoveryError::StreamClosed);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc::error::TryRecvError;

    /// Connector whose streams replay a fixed script of responses.
    ///
    /// The response sender of the last opened stream is kept so tests can
    /// push more responses or hold the stream open.
    struct ScriptedConnector {
        script: Vec<Result<DiscoveryResponse, String>>,
        close_after_script: bool,
        opened: Mutex<Vec<DiscoveryRequest>>,
        _held: Mutex<Vec<mpsc::Sender<Result<DiscoveryResponse, DiscoveryError>>>>,
        requests: Mutex<Vec<mpsc::Receiver<DiscoveryRequest>>>,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Result<DiscoveryResponse, String>>) -> Self {
            Self {
                script,
                close_after_script: false,
                opened: Mutex::new(Vec::new()),
                _held: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn closing(mut self) -> Self {
            self.close_after_script = true;
            self
        }

        fn opened(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DiscoveryConnector for ScriptedConnector {
        async fn open(
            &self,
            initial: DiscoveryRequest,
        ) -> Result<DiscoveryStream, DiscoveryError> {
            if initial.type_url == "unreachable" {
                return Err(DiscoveryError::Transport("connection refused".to_string()));
            }
            self.opened.lock().unwrap().push(initial);

            let (request_tx, request_rx) = mpsc::channel(1);
            let (response_tx, response_rx) = mpsc::channel(self.script.len() + 1);
            for item in &self.script {
                let item = item.clone().map_err(DiscoveryError::Transport);
                response_tx.try_send(item).unwrap();
            }
            if !self.close_after_script {
                self._held.lock().unwrap().push(response_tx);
            }
            self.requests.lock().unwrap().push(request_rx);

            Ok(DiscoveryStream::new(request_tx, response_rx))
        }
    }

    fn response(version: &str) -> DiscoveryResponse {
        DiscoveryResponse {
            version_info: version.to_string(),
            type_url: xds_proto::type_url::LISTENER.to_string(),
            ..Default::default()
        }
    }

    fn request() -> DiscoveryRequest {
        DiscoveryRequest::for_type(xds_proto::type_url::LISTENER, Default::default())
    }

    fn make_channel(connector: ScriptedConnector) -> (DiscoveryChannel, Arc<ScriptedConnector>) {
        let connector = Arc::new(connector);
        (DiscoveryChannel::new(connector.clone()), connector)
    }

    #[tokio::test]
    async fn test_call_discovery_returns_first_response() {
        let (channel, connector) = make_channel(ScriptedConnector::new(vec![
            Ok(response("1")),
            Ok(response("2")),
        ]));

        let resp = channel.call_discovery(request()).await.unwrap();
        assert_eq!(resp.version_info, "1");
        assert_eq!(connector.opened(), 1);
        assert!(!channel.is_subscribed());
    }

    #[tokio::test]
    async fn test_call_discovery_surfaces_transport_error() {
        let (channel, _) = make_channel(ScriptedConnector::new(vec![Err("reset".to_string())]));
        let err = channel.call_discovery(request()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Transport(msg) if msg == "reset"));

        let (channel, _) = make_channel(ScriptedConnector::new(vec![]).closing());
        let err = channel.call_discovery(request()).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::StreamClosed));
    }

    #[tokio::test]
    async fn test_start_discovery_failure_leaves_channel_idle() {
        let (mut channel, _) = make_channel(ScriptedConnector::new(vec![]));
        let mut req = request();
        req.type_url = "unreachable".to_string();

        let err = channel.start_discovery(req).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Transport(_)));
        assert!(!channel.is_subscribed());
    }

    #[tokio::test]
    async fn test_start_discovery_sends_request() {
        let (mut channel, connector) = make_channel(ScriptedConnector::new(vec![]));
        channel.start_discovery(request()).await.unwrap();

        assert!(channel.is_subscribed());
        let opened = connector.opened.lock().unwrap();
        assert_eq!(opened[0].type_url, xds_proto::type_url::LISTENER);
        // Only the initial request was sent through the connector
        let mut requests = connector.requests.lock().unwrap();
        assert!(matches!(
            requests[0].try_recv(),
            Err(TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_watch_without_subscription_fails() {
        let (mut channel, _) = make_channel(ScriptedConnector::new(vec![Ok(response("1"))]));
        let err = channel
            .watch_discovery(Duration::from_secs(1), |_| Ok(true))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NotSubscribed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_matches_first_response_without_waiting() {
        let (mut channel, _) = make_channel(ScriptedConnector::new(vec![Ok(response("1"))]));
        channel.start_discovery(request()).await.unwrap();

        let start = Instant::now();
        channel
            .watch_discovery(Duration::from_secs(10), |_| Ok(true))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(channel.is_subscribed());
    }

    #[tokio::test]
    async fn test_watch_sees_every_response_in_order() {
        let (mut channel, _) = make_channel(ScriptedConnector::new(vec![
            Ok(response("1")),
            Ok(response("2")),
            Ok(response("3")),
        ]));
        channel.start_discovery(request()).await.unwrap();

        let mut seen = Vec::new();
        channel
            .watch_discovery(Duration::from_secs(5), |resp| {
                seen.push(resp.version_info.clone());
                Ok(resp.version_info == "3")
            })
            .await
            .unwrap();

        assert_eq!(seen, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_watch_predicate_error_beats_later_match() {
        let (mut channel, _) = make_channel(ScriptedConnector::new(vec![
            Ok(response("1")),
            Ok(response("bad")),
            Ok(response("3")),
        ]));
        channel.start_discovery(request()).await.unwrap();

        let mut calls = 0;
        let err = channel
            .watch_discovery(Duration::from_secs(5), |resp| {
                calls += 1;
                match resp.version_info.as_str() {
                    "bad" => Err(anyhow::anyhow!("listener missing tls inspector")),
                    "3" => Ok(true),
                    _ => Ok(false),
                }
            })
            .await
            .unwrap_err();

        match err {
            DiscoveryError::Predicate(e) => {
                assert_eq!(e.to_string(), "listener missing tls inspector")
            }
            other => panic!("expected predicate error, got {:?}", other),
        }
        assert_eq!(calls, 2);
        // The subscription survives a predicate error; the unread response is still there
        channel
            .watch_discovery(Duration::from_secs(5), |resp| Ok(resp.version_info == "3"))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_times_out_within_bound() {
        let (mut channel, _) = make_channel(ScriptedConnector::new(vec![
            Ok(response("1")),
            Ok(response("2")),
        ]));
        channel.start_discovery(request()).await.unwrap();

        let duration = Duration::from_secs(2);
        let start = Instant::now();
        let err = channel
            .watch_discovery(duration, |_| Ok(false))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, DiscoveryError::Timeout { duration: d } if d == duration));
        assert!(err.to_string().contains("2s"));
        assert!(elapsed >= duration);
        assert!(elapsed < duration + crate::retry::DEFAULT_DELAY);
        assert!(channel.is_subscribed());
    }

    #[tokio::test]
    async fn test_watch_with_unbounded_duration() {
        let (mut channel, _) = make_channel(ScriptedConnector::new(vec![
            Ok(response("1")),
            Ok(response("2")),
        ]));
        channel.start_discovery(request()).await.unwrap();

        channel
            .watch_discovery(Duration::MAX, |resp| Ok(resp.version_info == "2"))
            .await
            .unwrap();
        assert!(channel.is_subscribed());
    }

    #[tokio::test]
    async fn test_stream_releases_slot_on_drop() {
        let slot = Arc::new(());
        let (request_tx, _request_rx) = mpsc::channel(1);
        let (_response_tx, response_rx) = mpsc::channel(1);

        let stream = DiscoveryStream::new(request_tx, response_rx).holding(slot.clone());
        assert_eq!(Arc::strong_count(&slot), 2);
        drop(stream);
        assert_eq!(Arc::strong_count(&slot), 1);
    }

    #[tokio::test]
    async fn test_watch_stream_closed_drops_subscription() {
        let (mut channel, _) =
            make_channel(ScriptedConnector::new(vec![Ok(response("1"))]).closing());
        channel.start_discovery(request()).await.unwrap();

        let err = channel
            .watch_discovery(Duration::from_secs(5), |_| Ok(false))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::StreamClosed));
        assert!(!channel.is_subscribed());
    }

    #[tokio::test]
    async fn test_watch_transport_error_drops_subscription() {
        let (mut channel, _) = make_channel(ScriptedConnector::new(vec![
            Ok(response("1")),
            Err("connection reset".to_string()),
        ]));
        channel.start_discovery(request()).await.unwrap();

        let err = channel
            .watch_discovery(Duration::from_secs(5), |_| Ok(false))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Transport(_)));
        assert!(!channel.is_subscribed());
    }
}
