//! Session gateway boundary
//!
//! The gateway is the backend that actually authenticates sessions, opens
//! tunnels and carries RPC calls. The rest of the crate only sees it through
//! the [`SessionGateway`] trait and the typed values defined here; raw
//! integer codes coming out of a backend are mapped into these enums at the
//! boundary.
//!
//! Provides:
//! - [`MemoryGateway`]: scripted in-memory backend, also loadable from a
//!   simulation file for dry runs
//! - [`DirectGateway`]: plain TCP forwarder for peers on the local network

mod memory;

#[cfg(feature = "direct")]
mod direct;

pub use memory::{MemoryGateway, ScriptedTunnel};

#[cfg(feature = "direct")]
pub use direct::DirectGateway;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Length in bytes of a certificate fingerprint
pub const FINGERPRINT_LEN: usize = 16;

/// Opaque tunnel identifier issued by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelHandle(pub u64);

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque session identifier issued by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Connection state of a tunnel as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// No information yet
    Unknown,
    /// Connection attempt in progress
    Connecting,
    /// Connection dropped, can be re-established
    ReadyForReconnect,
    /// Connected on the local network
    Local,
    /// Connected peer-to-peer
    RemoteP2p,
    /// Connected through a UDP relay
    RemoteRelay,
    /// Connected through a TCP relay
    RemoteRelayMicro,
    /// Tunnel closed
    Closed,
}

impl TunnelState {
    /// Map a raw gateway state code. Unrecognised codes become `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => TunnelState::Closed,
            1 => TunnelState::Connecting,
            2 => TunnelState::ReadyForReconnect,
            4 => TunnelState::Local,
            5 => TunnelState::RemoteP2p,
            6 => TunnelState::RemoteRelay,
            7 => TunnelState::RemoteRelayMicro,
            _ => TunnelState::Unknown,
        }
    }

    /// Raw gateway code for this state
    pub fn code(self) -> i32 {
        match self {
            TunnelState::Closed => 0,
            TunnelState::Connecting => 1,
            TunnelState::ReadyForReconnect => 2,
            TunnelState::Unknown => 3,
            TunnelState::Local => 4,
            TunnelState::RemoteP2p => 5,
            TunnelState::RemoteRelay => 6,
            TunnelState::RemoteRelayMicro => 7,
        }
    }

    /// True for the states in which traffic flows to the peer
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            TunnelState::Local
                | TunnelState::RemoteP2p
                | TunnelState::RemoteRelay
                | TunnelState::RemoteRelayMicro
        )
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        match self {
            TunnelState::Unknown => "UNKNOWN",
            TunnelState::Connecting => "CONNECTING",
            TunnelState::ReadyForReconnect => "READY_FOR_RECONNECT",
            TunnelState::Local => "LOCAL",
            TunnelState::RemoteP2p => "REMOTE_P2P",
            TunnelState::RemoteRelay => "REMOTE_RELAY (UDP)",
            TunnelState::RemoteRelayMicro => "REMOTE_RELAY (TCP)",
            TunnelState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-tunnel attribute that can be queried from the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelAttribute {
    /// Negotiated tunnel protocol version
    Version,
    /// Local TCP port the tunnel listener is bound to
    BoundLocalPort,
    /// Last error code recorded for the tunnel
    LastError,
}

/// Status codes returned by a gateway call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    /// Generic failure
    Failed,
    /// Credential profile could not be opened
    NoProfile,
    /// Private key could not be unlocked with the given passphrase
    UnlockFailed,
    /// Session handle is not valid
    InvalidSession,
    /// Tunnel handle is not valid
    InvalidTunnel,
    /// Address or port could not be used
    InvalidAddress,
    /// Local port already in use
    AddressInUse,
    /// Peer could not be reached in time
    ConnectTimeout,
    /// Operation not supported by this gateway
    NotSupported,
    /// Code without a known meaning
    Other(i32),
}

impl GatewayStatus {
    /// Map a raw gateway status code
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => GatewayStatus::Failed,
            2 => GatewayStatus::NoProfile,
            3 => GatewayStatus::UnlockFailed,
            4 => GatewayStatus::InvalidSession,
            5 => GatewayStatus::InvalidTunnel,
            6 => GatewayStatus::InvalidAddress,
            7 => GatewayStatus::AddressInUse,
            8 => GatewayStatus::ConnectTimeout,
            9 => GatewayStatus::NotSupported,
            other => GatewayStatus::Other(other),
        }
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayStatus::Failed => write!(f, "failed"),
            GatewayStatus::NoProfile => write!(f, "no such profile"),
            GatewayStatus::UnlockFailed => write!(f, "unlock failed"),
            GatewayStatus::InvalidSession => write!(f, "invalid session"),
            GatewayStatus::InvalidTunnel => write!(f, "invalid tunnel"),
            GatewayStatus::InvalidAddress => write!(f, "invalid address"),
            GatewayStatus::AddressInUse => write!(f, "address in use"),
            GatewayStatus::ConnectTimeout => write!(f, "connect timeout"),
            GatewayStatus::NotSupported => write!(f, "not supported"),
            GatewayStatus::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// Gateway errors
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Status(GatewayStatus),

    #[error("Authentication failed for '{cert_name}': {status}")]
    Auth {
        cert_name: String,
        status: GatewayStatus,
    },
}

impl GatewayError {
    /// Status carried by the error
    pub fn status(&self) -> GatewayStatus {
        match self {
            GatewayError::Status(status) => *status,
            GatewayError::Auth { status, .. } => *status,
        }
    }
}

impl From<GatewayStatus> for GatewayError {
    fn from(status: GatewayStatus) -> Self {
        GatewayError::Status(status)
    }
}

/// Failure of an RPC-style gateway call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcFailure {
    /// The peer answered with an error document
    #[error("{0}")]
    Structured(String),

    /// The call did not complete
    #[error("transport failure: {0}")]
    Transport(GatewayStatus),
}

/// Backend that authenticates sessions, opens tunnels and carries RPC.
///
/// Calls are awaited one at a time by the core; timeouts, retries and
/// reconnection are the backend's business.
#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// Open an authenticated session with the named credential
    async fn open_session(
        &self,
        cert_name: &str,
        passphrase: &str,
    ) -> Result<SessionHandle, GatewayError>;

    /// Close a session
    async fn close_session(&self, session: SessionHandle) -> Result<(), GatewayError>;

    /// Attach a basestation authentication document to the session
    async fn set_basestation_auth_json(
        &self,
        session: SessionHandle,
        json: &str,
    ) -> Result<(), GatewayError>;

    /// Install a pre-shared key for local connections
    async fn set_local_psk(
        &self,
        session: SessionHandle,
        psk_id: &[u8],
        psk: &[u8],
    ) -> Result<(), GatewayError>;

    /// Open a tunnel. `local_port` 0 lets the gateway pick a port.
    async fn open_tunnel(
        &self,
        session: SessionHandle,
        local_port: u16,
        device_id: &str,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelHandle, GatewayError>;

    /// Current state of a tunnel
    async fn tunnel_state(&self, tunnel: TunnelHandle) -> Result<TunnelState, GatewayError>;

    /// Query a numeric tunnel attribute
    async fn tunnel_attribute(
        &self,
        tunnel: TunnelHandle,
        attribute: TunnelAttribute,
    ) -> Result<i32, GatewayError>;

    /// Close a tunnel
    async fn close_tunnel(&self, tunnel: TunnelHandle) -> Result<(), GatewayError>;

    /// Install the RPC interface definition used to encode calls
    async fn set_default_interface(
        &self,
        session: SessionHandle,
        definition: &str,
    ) -> Result<(), RpcFailure>;

    /// Invoke an RPC URL and return the response document
    async fn invoke_rpc(&self, session: SessionHandle, url: &str) -> Result<String, RpcFailure>;

    /// Device ids discovered on the local network
    async fn list_local_devices(&self) -> Result<Vec<String>, GatewayError>;

    /// Create a credential backed by a self-signed certificate. The key is
    /// protected by `passphrase`; storage is the backend's.
    async fn create_self_signed_profile(
        &self,
        cert_name: &str,
        passphrase: &str,
    ) -> Result<(), GatewayError>;

    /// Fingerprint of a stored certificate
    async fn fingerprint(&self, cert_name: &str) -> Result<[u8; FINGERPRINT_LEN], GatewayError>;

    /// Names of the stored certificates
    async fn list_certificates(&self) -> Result<Vec<String>, GatewayError>;

    /// Backend version string
    fn version(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        for code in 0..8 {
            assert_eq!(TunnelState::from_code(code).code(), code);
        }
        assert_eq!(TunnelState::from_code(42), TunnelState::Unknown);
        assert_eq!(TunnelState::from_code(-1), TunnelState::Unknown);
    }

    #[test]
    fn test_connected_states() {
        assert!(TunnelState::Local.is_connected());
        assert!(TunnelState::RemoteP2p.is_connected());
        assert!(TunnelState::RemoteRelay.is_connected());
        assert!(TunnelState::RemoteRelayMicro.is_connected());
        assert!(!TunnelState::Connecting.is_connected());
        assert!(!TunnelState::ReadyForReconnect.is_connected());
        assert!(!TunnelState::Unknown.is_connected());
        assert!(!TunnelState::Closed.is_connected());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(TunnelState::RemoteRelay.to_string(), "REMOTE_RELAY (UDP)");
        assert_eq!(TunnelState::RemoteRelayMicro.to_string(), "REMOTE_RELAY (TCP)");
        assert_eq!(TunnelState::Closed.to_string(), "CLOSED");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayStatus::from_code(5), GatewayStatus::InvalidTunnel);
        assert_eq!(GatewayStatus::from_code(1000), GatewayStatus::Other(1000));
        assert_eq!(GatewayStatus::Other(1000).to_string(), "status 1000");
    }
}
