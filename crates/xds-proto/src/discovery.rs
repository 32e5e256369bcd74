//! `envoy.api.v2` discovery request/response pair.

/// Identity of the proxy issuing discovery requests.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Node {
    /// Opaque node identifier, e.g. `sidecar~10.0.0.1~a.ns~ns.svc.cluster.local`.
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    /// Service cluster the node belongs to.
    #[prost(string, tag = "2")]
    pub cluster: ::prost::alloc::string::String,
    /// Free-form node metadata.
    #[prost(message, optional, tag = "3")]
    pub metadata: ::core::option::Option<::prost_types::Struct>,
    #[prost(string, tag = "5")]
    pub build_version: ::prost::alloc::string::String,
}

/// A request for resources of one type, sent by a proxy on a discovery stream.
///
/// A request with a non-empty `response_nonce` acknowledges (or, with
/// `error_detail` set, rejects) the response carrying that nonce.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoveryRequest {
    /// Version of the last response the node accepted.
    #[prost(string, tag = "1")]
    pub version_info: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub node: ::core::option::Option<Node>,
    /// Resources to subscribe to. Empty means all resources of `type_url`.
    #[prost(string, repeated, tag = "3")]
    pub resource_names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, tag = "4")]
    pub type_url: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub response_nonce: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "6")]
    pub error_detail: ::core::option::Option<super::rpc::Status>,
}

/// A snapshot of resources of one type pushed by the control plane.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DiscoveryResponse {
    #[prost(string, tag = "1")]
    pub version_info: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub resources: ::prost::alloc::vec::Vec<::prost_types::Any>,
    #[prost(bool, tag = "3")]
    pub canary: bool,
    #[prost(string, tag = "4")]
    pub type_url: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub nonce: ::prost::alloc::string::String,
}

impl DiscoveryRequest {
    /// Build a subscription request for every resource of `type_url`.
    pub fn for_type(type_url: impl Into<String>, node: Node) -> Self {
        Self {
            type_url: type_url.into(),
            node: Some(node),
            ..Default::default()
        }
    }

    /// Whether this request acknowledges or rejects an earlier response.
    pub fn is_ack(&self) -> bool {
        !self.response_nonce.is_empty()
    }
}

impl DiscoveryResponse {
    /// Decode every resource whose type URL matches `M`, skipping the rest.
    ///
    /// Resources that claim the right type but fail to decode are returned as
    /// errors so predicates can decide whether that is fatal.
    pub fn decode_resources<M>(&self) -> Vec<Result<M, ::prost::DecodeError>>
    where
        M: ::prost::Message + ::prost::Name + Default,
    {
        let expected = M::type_url();
        self.resources
            .iter()
            .filter(|any| any.type_url == expected)
            .map(prost_types::Any::to_msg::<M>)
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::listener::Listener;
    use prost::Message;

    #[test]
    fn test_ack_detection() {
        let mut req = DiscoveryRequest::for_type(crate::type_url::LISTENER, Node::default());
        assert!(!req.is_ack());

        req.response_nonce = "7".to_string();
        assert!(req.is_ack());
    }

    #[test]
    fn test_decode_resources_skips_other_types() {
        let listener = Listener {
            name: "virtual".to_string(),
            ..Default::default()
        };
        let response = DiscoveryResponse {
            resources: vec![
                prost_types::Any::from_msg(&listener).unwrap(),
                prost_types::Any {
                    type_url: crate::type_url::CLUSTER.to_string(),
                    value: vec![],
                },
            ],
            type_url: crate::type_url::LISTENER.to_string(),
            ..Default::default()
        };

        let decoded = response.decode_resources::<Listener>();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap().name, "virtual");
    }

    #[test]
    fn test_request_wire_tags_match_envoy() {
        // type_url is field 4: tag byte (4 << 3 | 2) = 0x22
        let req = DiscoveryRequest {
            type_url: "t".to_string(),
            ..Default::default()
        };
        assert_eq!(req.encode_to_vec(), vec![0x22, 0x01, b't']);
    }
}
