//! Direct TCP gateway
//!
//! Forwards tunnels straight to `remote_host:remote_port` without a peer in
//! between. Useful for devices whose services are reachable on the local
//! network, and for exercising the tunnel registry against real sockets.

use super::{
    GatewayError, GatewayStatus, RpcFailure, SessionGateway, SessionHandle, TunnelAttribute,
    TunnelHandle, TunnelState, FINGERPRINT_LEN,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

/// Tunnel protocol version reported for direct tunnels
const DIRECT_TUNNEL_VERSION: i32 = 1;

/// State shared with the accept task
struct Shared {
    state: AtomicI32,
    last_error: AtomicI32,
}

struct DirectTunnel {
    bound_port: u16,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    next_handle: u64,
    sessions: Vec<SessionHandle>,
    tunnels: HashMap<TunnelHandle, DirectTunnel>,
}

/// Gateway that binds a local listener per tunnel and relays each accepted
/// connection to the target over plain TCP.
pub struct DirectGateway {
    bind_host: String,
    inner: Mutex<Inner>,
}

impl DirectGateway {
    /// Create a gateway binding tunnel listeners on 127.0.0.1
    pub fn new() -> Self {
        Self::with_bind_host("127.0.0.1")
    }

    /// Create a gateway binding tunnel listeners on `bind_host`
    pub fn with_bind_host(bind_host: &str) -> Self {
        Self {
            bind_host: bind_host.to_string(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn check_session(inner: &Inner, session: SessionHandle) -> Result<(), GatewayStatus> {
        if inner.sessions.contains(&session) {
            Ok(())
        } else {
            Err(GatewayStatus::InvalidSession)
        }
    }
}

impl Default for DirectGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept connections and relay each one to `target`.
///
/// Relays live in a `JoinSet` owned by this task, so aborting the task on
/// close tears down every connection it accepted.
async fn accept_loop(listener: TcpListener, target: String, shared: Arc<Shared>) {
    let mut relays = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((inbound, peer)) => {
                    debug!("Accepted {} for {}", peer, target);
                    let target = target.clone();
                    relays.spawn(async move {
                        if let Err(e) = relay(inbound, &target).await {
                            debug!("Relay to {} ended: {}", target, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Tunnel listener for {} failed: {}", target, e);
                    shared
                        .last_error
                        .store(e.raw_os_error().unwrap_or(-1), Ordering::SeqCst);
                    shared
                        .state
                        .store(TunnelState::Closed.code(), Ordering::SeqCst);
                    return;
                }
            },
            // Reap finished relays
            Some(_) = relays.join_next(), if !relays.is_empty() => {}
        }
    }
}

async fn relay(mut inbound: TcpStream, target: &str) -> std::io::Result<()> {
    let mut outbound = TcpStream::connect(target).await?;
    inbound.set_nodelay(true).ok();
    outbound.set_nodelay(true).ok();
    tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
    Ok(())
}

#[async_trait]
impl SessionGateway for DirectGateway {
    async fn open_session(
        &self,
        cert_name: &str,
        _passphrase: &str,
    ) -> Result<SessionHandle, GatewayError> {
        if cert_name.is_empty() {
            return Err(GatewayError::Auth {
                cert_name: String::new(),
                status: GatewayStatus::NoProfile,
            });
        }
        let mut inner = self.inner.lock().await;
        inner.next_handle += 1;
        let session = SessionHandle(inner.next_handle);
        inner.sessions.push(session);
        Ok(session)
    }

    async fn close_session(&self, session: SessionHandle) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().await;
        Self::check_session(&inner, session)?;
        inner.sessions.retain(|s| *s != session);
        Ok(())
    }

    async fn set_basestation_auth_json(
        &self,
        _session: SessionHandle,
        _json: &str,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::Status(GatewayStatus::NotSupported))
    }

    async fn set_local_psk(
        &self,
        session: SessionHandle,
        _psk_id: &[u8],
        _psk: &[u8],
    ) -> Result<(), GatewayError> {
        // Plain TCP relay, nothing to secure with the key
        let inner = self.inner.lock().await;
        Self::check_session(&inner, session)?;
        Ok(())
    }

    async fn open_tunnel(
        &self,
        session: SessionHandle,
        local_port: u16,
        device_id: &str,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelHandle, GatewayError> {
        let mut inner = self.inner.lock().await;
        Self::check_session(&inner, session)?;

        let listener = TcpListener::bind((self.bind_host.as_str(), local_port))
            .await
            .map_err(|e| {
                warn!("Could not bind tunnel for {} on port {}: {}", device_id, local_port, e);
                match e.kind() {
                    std::io::ErrorKind::AddrInUse => GatewayStatus::AddressInUse,
                    _ => GatewayStatus::InvalidAddress,
                }
            })?;
        let bound_port = listener
            .local_addr()
            .map_err(|_| GatewayStatus::InvalidAddress)?
            .port();

        let shared = Arc::new(Shared {
            state: AtomicI32::new(TunnelState::Local.code()),
            last_error: AtomicI32::new(0),
        });
        let target = format!("{}:{}", remote_host, remote_port);
        let accept_task = tokio::spawn(accept_loop(listener, target, Arc::clone(&shared)));

        inner.next_handle += 1;
        let handle = TunnelHandle(inner.next_handle);
        inner.tunnels.insert(
            handle,
            DirectTunnel {
                bound_port,
                shared,
                accept_task,
                closed: false,
            },
        );
        Ok(handle)
    }

    async fn tunnel_state(&self, tunnel: TunnelHandle) -> Result<TunnelState, GatewayError> {
        let inner = self.inner.lock().await;
        let entry = inner
            .tunnels
            .get(&tunnel)
            .ok_or(GatewayStatus::InvalidTunnel)?;
        Ok(TunnelState::from_code(
            entry.shared.state.load(Ordering::SeqCst),
        ))
    }

    async fn tunnel_attribute(
        &self,
        tunnel: TunnelHandle,
        attribute: TunnelAttribute,
    ) -> Result<i32, GatewayError> {
        let inner = self.inner.lock().await;
        let entry = inner
            .tunnels
            .get(&tunnel)
            .ok_or(GatewayStatus::InvalidTunnel)?;
        Ok(match attribute {
            TunnelAttribute::Version => DIRECT_TUNNEL_VERSION,
            TunnelAttribute::BoundLocalPort => i32::from(entry.bound_port),
            TunnelAttribute::LastError => entry.shared.last_error.load(Ordering::SeqCst),
        })
    }

    async fn close_tunnel(&self, tunnel: TunnelHandle) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .tunnels
            .get_mut(&tunnel)
            .ok_or(GatewayStatus::InvalidTunnel)?;
        if entry.closed {
            return Err(GatewayError::Status(GatewayStatus::InvalidTunnel));
        }
        entry.accept_task.abort();
        entry.closed = true;
        entry
            .shared
            .state
            .store(TunnelState::Closed.code(), Ordering::SeqCst);
        Ok(())
    }

    async fn set_default_interface(
        &self,
        _session: SessionHandle,
        _definition: &str,
    ) -> Result<(), RpcFailure> {
        Err(RpcFailure::Transport(GatewayStatus::NotSupported))
    }

    async fn invoke_rpc(&self, _session: SessionHandle, _url: &str) -> Result<String, RpcFailure> {
        Err(RpcFailure::Transport(GatewayStatus::NotSupported))
    }

    async fn list_local_devices(&self) -> Result<Vec<String>, GatewayError> {
        Ok(Vec::new())
    }

    async fn create_self_signed_profile(
        &self,
        _cert_name: &str,
        _passphrase: &str,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::Status(GatewayStatus::NotSupported))
    }

    async fn fingerprint(&self, _cert_name: &str) -> Result<[u8; FINGERPRINT_LEN], GatewayError> {
        Err(GatewayError::Status(GatewayStatus::NotSupported))
    }

    async fn list_certificates(&self) -> Result<Vec<String>, GatewayError> {
        Err(GatewayError::Status(GatewayStatus::NotSupported))
    }

    fn version(&self) -> String {
        format!("direct-gateway {}", crate::VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_direct_tunnel_relays() {
        // Echo server standing in for the remote service
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let gateway = DirectGateway::new();
        let session = gateway.open_session("guest", "").await.unwrap();
        let tunnel = gateway
            .open_tunnel(session, 0, "local-device", "127.0.0.1", echo_port)
            .await
            .unwrap();
        assert_eq!(gateway.tunnel_state(tunnel).await.unwrap(), TunnelState::Local);

        let port = gateway
            .tunnel_attribute(tunnel, TunnelAttribute::BoundLocalPort)
            .await
            .unwrap();
        let mut client = TcpStream::connect(("127.0.0.1", port as u16)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        gateway.close_tunnel(tunnel).await.unwrap();
        assert_eq!(gateway.tunnel_state(tunnel).await.unwrap(), TunnelState::Closed);
    }

    #[tokio::test]
    async fn test_close_tears_down_accepted_connections() {
        // Echo server that keeps its connection open
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let gateway = DirectGateway::new();
        let session = gateway.open_session("guest", "").await.unwrap();
        let tunnel = gateway
            .open_tunnel(session, 0, "local-device", "127.0.0.1", echo_port)
            .await
            .unwrap();
        let port = gateway
            .tunnel_attribute(tunnel, TunnelAttribute::BoundLocalPort)
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port as u16)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        gateway.close_tunnel(tunnel).await.unwrap();

        // The relay is gone: the client sees EOF or a reset, not silence
        let mut rest = [0u8; 16];
        let result = tokio::time::timeout(Duration::from_secs(5), client.read(&mut rest))
            .await
            .expect("relay still open after close");
        assert!(matches!(result, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_rpc_not_supported() {
        let gateway = DirectGateway::new();
        let session = gateway.open_session("guest", "").await.unwrap();
        assert_eq!(
            gateway.invoke_rpc(session, "nabto://dev/x.json").await,
            Err(RpcFailure::Transport(GatewayStatus::NotSupported))
        );
        assert_eq!(
            gateway.list_certificates().await.unwrap_err().status(),
            GatewayStatus::NotSupported
        );
    }
}
