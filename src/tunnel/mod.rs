//! Tunnel layer - local listeners forwarded through a peer session
//!
//! Provides:
//! - Compact tunnel spec parsing (`<local>:<host>:<remote>`)
//! - Tunnel registry with state polling and transition reporting
//! - Batch open with an explicit failure policy

mod registry;
mod spec;

pub use registry::{
    CloseReport, OpenFailurePolicy, TransitionDetail, TunnelEvent, TunnelRecord, TunnelRegistry,
    DEFAULT_POLL_INTERVAL,
};
pub use spec::{parse_tunnel_spec, TunnelSpec};

use crate::gateway::GatewayError;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Malformed tunnel spec '{spec}': {reason}")]
    MalformedSpec { spec: String, reason: &'static str },

    #[error("Could not open tunnel to {device_id}: {source}")]
    OpenFailed {
        device_id: String,
        #[source]
        source: GatewayError,
    },

    #[error("No tunnel could be opened")]
    NothingOpened,
}
