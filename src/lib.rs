//! # peerlink
//!
//! Local TCP tunnels and interface-checked RPC over authenticated peer
//! sessions.
//!
//! ## Features
//!
//! - **Tunnel registry** that opens tunnels through a session gateway, polls
//!   their connection state and reports every transition
//! - **Cooperative shutdown** through a lock-free cancellation flag
//! - **Interface negotiation** that refuses RPC calls against peers with an
//!   incompatible interface version
//! - **Compact grammars** for tunnel specs (`<local>:<host>:<remote>`) and
//!   hex encoded pre-shared keys
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Orchestration                     │
//! │    (client flows, CLI, config, Ctrl-C handling)      │
//! ├──────────────────────────┬──────────────────────────┤
//! │      Tunnel Registry     │   Interface Negotiator   │
//! │  (open, watch, close)    │  (version gate for RPC)  │
//! ├──────────────────────────┴──────────────────────────┤
//! │                   Session Gateway                    │
//! │     (sessions, tunnels, RPC - external backend)      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod crypto;
pub mod gateway;
pub mod rpc;
pub mod tunnel;

pub use cancel::CancellationSignal;
pub use config::Config;
pub use gateway::{SessionGateway, SessionHandle, TunnelHandle, TunnelState};
pub use rpc::Negotiator;
pub use tunnel::{TunnelRegistry, TunnelSpec};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] gateway::GatewayError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("RPC error: {0}")]
    Rpc(#[from] rpc::RpcError),

    #[error("Session error: {0}")]
    Session(#[from] client::SessionError),

    #[error("Configuration error: {0}")]
    Config(String),
}
