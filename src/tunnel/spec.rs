//! Compact tunnel specification
//!
//! Format: `<local port>:<remote host>:<remote port>`. An empty local port
//! lets the gateway choose one. The host ends at the second colon, so IPv6
//! literals cannot be expressed in this form.

use super::TunnelError;
use std::fmt;
use std::str::FromStr;

/// Parsed tunnel specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Local listening port, 0 for gateway assigned
    pub local_port: u16,
    /// Host on the peer's network to connect to
    pub remote_host: String,
    /// Port on the remote host
    pub remote_port: u16,
}

/// Parse a `<local>:<host>:<remote>` tunnel spec
pub fn parse_tunnel_spec(spec: &str) -> Result<TunnelSpec, TunnelError> {
    let malformed = |reason| TunnelError::MalformedSpec {
        spec: spec.to_string(),
        reason,
    };

    let (local, rest) = spec
        .split_once(':')
        .ok_or_else(|| malformed("missing ':' after local port"))?;
    let (host, remote) = rest
        .split_once(':')
        .ok_or_else(|| malformed("missing ':' after remote host"))?;

    let local_port = if local.is_empty() {
        0
    } else {
        parse_port(local).ok_or_else(|| malformed("invalid local port"))?
    };
    if host.is_empty() {
        return Err(malformed("empty remote host"));
    }
    let remote_port = parse_port(remote).ok_or_else(|| malformed("invalid remote port"))?;

    Ok(TunnelSpec {
        local_port,
        remote_host: host.to_string(),
        remote_port,
    })
}

/// Decimal digits only, no sign, must fit in a port
fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl FromStr for TunnelSpec {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_tunnel_spec(s)
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}
