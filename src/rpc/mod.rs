//! RPC layer - interface-checked calls against a peer
//!
//! Before calling into a peer, the negotiator fetches the interface
//! descriptor the peer advertises and compares it with the interface the
//! caller was written against. Same id, same major version and a remote minor
//! version at least as new as the declared one are required.

mod negotiator;

pub use negotiator::{
    check, extract_host, parse_declared_version, InterfaceDescriptor, InterfaceVersion,
    Negotiator, INTERFACE_INFO_PATH, URL_SCHEME,
};

use crate::gateway::{GatewayStatus, RpcFailure};
use thiserror::Error;

/// RPC errors
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Invalid interface version '{0}', expected <major>.<minor> with major >= 1")]
    InvalidVersionFormat(String),

    #[error("Malformed RPC URL '{0}'")]
    MalformedUrl(String),

    #[error(
        "Interface mismatch: expected {expected_id} {expected_major}.{expected_minor}, \
         peer has {actual_id} {actual_major}.{actual_minor}"
    )]
    InterfaceMismatch {
        expected_id: String,
        expected_major: i32,
        expected_minor: i32,
        actual_id: String,
        actual_major: i32,
        actual_minor: i32,
    },

    #[error("RPC invocation failed with status {0}")]
    InvocationFailed(GatewayStatus),

    /// Error document returned by the peer, unmodified
    #[error("{0}")]
    StructuredFailure(String),

    #[error("Malformed RPC response: {0}")]
    MalformedResponse(String),

    #[error("Could not read interface definition '{path}': {source}")]
    DefinitionUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<RpcFailure> for RpcError {
    fn from(failure: RpcFailure) -> Self {
        match failure {
            RpcFailure::Structured(document) => RpcError::StructuredFailure(document),
            RpcFailure::Transport(status) => RpcError::InvocationFailed(status),
        }
    }
}
