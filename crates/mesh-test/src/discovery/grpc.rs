//! Aggregated Discovery Service connector over gRPC.
//!
//! Opens `StreamAggregatedResources` bidi streams on a shared tonic
//! [`Channel`]. Responses are forwarded from the tonic stream into the
//! framework's [`DiscoveryStream`] by a background task that exits when the
//! stream is dropped or the server ends it.

use super::{DiscoveryConnector, DiscoveryError, DiscoveryStream, RESPONSE_BUFFER};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};
use xds_proto::{DiscoveryRequest, DiscoveryResponse};

/// gRPC method path of the v2 ADS stream.
pub const ADS_PATH: &str =
    "/envoy.service.discovery.v2.AggregatedDiscoveryService/StreamAggregatedResources";

/// Requests buffered on the client half of a stream.
const REQUEST_BUFFER: usize = 4;

/// Connector to a remote ADS server.
#[derive(Clone)]
pub struct GrpcConnector {
    channel: Channel,
}

impl GrpcConnector {
    /// Build a connector for `address` without connecting yet.
    ///
    /// The underlying channel connects on first use and reconnects as needed.
    pub fn lazy(address: &str, connect_timeout: Duration) -> Result<Self, DiscoveryError> {
        let channel = Endpoint::from_shared(address.to_string())
            .map_err(|e| {
                DiscoveryError::Transport(format!("invalid discovery address '{}': {}", address, e))
            })?
            .connect_timeout(connect_timeout)
            .connect_lazy();

        Ok(Self { channel })
    }
}

#[async_trait]
impl DiscoveryConnector for GrpcConnector {
    async fn open(&self, initial: DiscoveryRequest) -> Result<DiscoveryStream, DiscoveryError> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| {
            DiscoveryError::Transport(format!("discovery service not ready: {}", e))
        })?;

        // The server only answers after the first request, so it must be queued
        // before the call waits for response headers.
        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
        request_tx
            .send(initial)
            .await
            .map_err(|_| DiscoveryError::Transport("request stream closed".to_string()))?;

        let codec = ProstCodec::<DiscoveryRequest, DiscoveryResponse>::default();
        let response = grpc
            .streaming(
                tonic::Request::new(ReceiverStream::new(request_rx)),
                PathAndQuery::from_static(ADS_PATH),
                codec,
            )
            .await
            .map_err(|status| {
                DiscoveryError::Transport(format!(
                    "ADS stream rejected ({:?}): {}",
                    status.code(),
                    status.message()
                ))
            })?;

        let mut inbound = response.into_inner();
        let (response_tx, response_rx) = mpsc::channel(RESPONSE_BUFFER);

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = response_tx.closed() => break,
                    message = inbound.message() => message,
                };

                match message {
                    Ok(Some(response)) => {
                        if response_tx.send(Ok(response)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(target: "mesh_test.discovery.grpc", "ADS stream ended by server");
                        break;
                    }
                    Err(status) => {
                        warn!(
                            target: "mesh_test.discovery.grpc",
                            code = ?status.code(),
                            error = %status.message(),
                            "ADS stream failed"
                        );
                        let _ = response_tx
                            .send(Err(DiscoveryError::Transport(status.message().to_string())))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(DiscoveryStream::new(request_tx, response_rx))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lazy_rejects_invalid_address() {
        let result = GrpcConnector::lazy("not a uri", Duration::from_secs(1));
        assert!(matches!(result, Err(DiscoveryError::Transport(_))));
    }

    #[tokio::test]
    async fn test_open_fails_fast_when_nothing_listens() {
        // Bind and drop to get a port with no listener
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let connector = GrpcConnector::lazy(
            &format!("http://127.0.0.1:{}", port),
            Duration::from_secs(1),
        )
        .unwrap();
        let result = connector.open(DiscoveryRequest::default()).await;
        assert!(matches!(result, Err(DiscoveryError::Transport(_))));
    }
}
