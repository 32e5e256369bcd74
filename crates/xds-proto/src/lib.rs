//! Discovery protocol messages for the mesh test framework.
//!
//! This crate holds the subset of the `envoy.api.v2` xDS messages that the
//! test framework exchanges with a control plane. The structs are laid out the
//! way `prost-build` would emit them, so they stay wire-compatible with a real
//! Aggregated Discovery Service while keeping the build free of `protoc`.

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

// Re-export prost traits for convenience
pub use prost::{Message, Name};
pub use prost_types::Any;

pub mod discovery;
pub mod listener;
pub mod rpc;

pub use discovery::{DiscoveryRequest, DiscoveryResponse, Node};
pub use listener::Listener;

/// Type URL prefix shared by every xDS resource.
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// Well-known xDS v2 resource type URLs.
pub mod type_url {
    /// Listener Discovery Service.
    pub const LISTENER: &str = "type.googleapis.com/envoy.api.v2.Listener";
    /// Cluster Discovery Service.
    pub const CLUSTER: &str = "type.googleapis.com/envoy.api.v2.Cluster";
    /// Endpoint Discovery Service.
    pub const ENDPOINT: &str = "type.googleapis.com/envoy.api.v2.ClusterLoadAssignment";
    /// Route Discovery Service.
    pub const ROUTE: &str = "type.googleapis.com/envoy.api.v2.RouteConfiguration";
}
