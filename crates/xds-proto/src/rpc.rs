//! `google.rpc` status carried in NACKs.

/// Error detail attached to a discovery request that rejects a prior response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}
