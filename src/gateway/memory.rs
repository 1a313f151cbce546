//! In-memory gateway with scripted tunnel behavior
//!
//! Besides the builder calls used by tests, the gateway can be seeded from a
//! [`SimulationConfig`] file. Certificates created through it are written
//! back to that file so they survive between runs.

use super::{
    GatewayError, GatewayStatus, RpcFailure, SessionGateway, SessionHandle, TunnelAttribute,
    TunnelHandle, TunnelState, FINGERPRINT_LEN,
};
use crate::config::{CertificateEntry, SimulationConfig};
use crate::crypto::{format_fingerprint, parse_psk};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Scripted behavior of a tunnel opened through [`MemoryGateway`]
#[derive(Debug, Clone, Default)]
pub struct ScriptedTunnel {
    /// Answers to successive state queries; the last one repeats
    pub states: Vec<Result<TunnelState, GatewayStatus>>,
    /// Reported protocol version
    pub version: Option<i32>,
    /// Reported bound port; defaults to the requested local port
    pub bound_port: Option<u16>,
    /// Reported last error code
    pub last_error: Option<i32>,
    /// Make `close_tunnel` fail with this status
    pub close_failure: Option<GatewayStatus>,
}

impl ScriptedTunnel {
    /// Script a sequence of observed states
    pub fn from_states(states: impl IntoIterator<Item = TunnelState>) -> Self {
        Self {
            states: states.into_iter().map(Ok).collect(),
            ..Self::default()
        }
    }

    /// Append a failing state query
    pub fn then_query_failure(mut self, status: GatewayStatus) -> Self {
        self.states.push(Err(status));
        self
    }

    /// Append an observed state
    pub fn then_state(mut self, state: TunnelState) -> Self {
        self.states.push(Ok(state));
        self
    }

    pub fn with_version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_bound_port(mut self, port: u16) -> Self {
        self.bound_port = Some(port);
        self
    }

    pub fn with_last_error(mut self, code: i32) -> Self {
        self.last_error = Some(code);
        self
    }

    pub fn with_close_failure(mut self, status: GatewayStatus) -> Self {
        self.close_failure = Some(status);
        self
    }
}

/// Live tunnel inside the memory gateway
struct MemoryTunnel {
    script: ScriptedTunnel,
    pending: VecDeque<Result<TunnelState, GatewayStatus>>,
    local_port: u16,
    closed: bool,
}

/// Stored credential
#[derive(Debug, Clone)]
struct Credential {
    passphrase: String,
    fingerprint: [u8; FINGERPRINT_LEN],
}

/// Stand-in fingerprint for certificates that never had a real one
fn simulated_fingerprint(cert_name: &str, serial: u64) -> [u8; FINGERPRINT_LEN] {
    let mut out = [0u8; FINGERPRINT_LEN];
    let mut hasher = DefaultHasher::new();
    (cert_name, serial).hash(&mut hasher);
    let high = hasher.finish();
    high.hash(&mut hasher);
    let low = hasher.finish();
    out[..8].copy_from_slice(&high.to_be_bytes());
    out[8..].copy_from_slice(&low.to_be_bytes());
    out
}

#[derive(Default)]
struct Inner {
    next_handle: u64,
    credentials: BTreeMap<String, Credential>,
    sessions: Vec<SessionHandle>,
    scripts: HashMap<String, ScriptedTunnel>,
    open_failures: HashMap<String, GatewayStatus>,
    port_failures: HashMap<u16, GatewayStatus>,
    tunnels: HashMap<TunnelHandle, MemoryTunnel>,
    rpc_responses: HashMap<String, Result<String, RpcFailure>>,
    rpc_calls: Vec<String>,
    close_calls: Vec<TunnelHandle>,
    interface_definition: Option<String>,
    devices: Vec<String>,
}

/// Gateway whose sessions, tunnels and RPC answers are scripted up front.
///
/// Used by the test suites and for dry runs of the tunnel orchestration.
#[derive(Default)]
pub struct MemoryGateway {
    inner: Mutex<Inner>,
    state_file: Option<PathBuf>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a gateway from simulation data
    pub fn from_simulation(simulation: &SimulationConfig) -> Result<Self, crate::Error> {
        let mut inner = Inner::default();
        for device in &simulation.devices {
            inner.scripts.insert(
                device.clone(),
                ScriptedTunnel::from_states([TunnelState::Connecting, TunnelState::Local])
                    .with_version(1),
            );
            inner.devices.push(device.clone());
        }
        for entry in &simulation.certificates {
            let fingerprint = match &entry.fingerprint {
                Some(text) => {
                    let bytes = parse_psk(text, FINGERPRINT_LEN)?;
                    let mut fingerprint = [0u8; FINGERPRINT_LEN];
                    fingerprint.copy_from_slice(&bytes);
                    fingerprint
                }
                None => simulated_fingerprint(&entry.name, 0),
            };
            inner.credentials.insert(
                entry.name.clone(),
                Credential {
                    passphrase: entry.password.clone(),
                    fingerprint,
                },
            );
        }
        for (url, document) in &simulation.responses {
            inner.rpc_responses.insert(url.clone(), Ok(document.clone()));
        }
        for (url, document) in &simulation.failures {
            inner
                .rpc_responses
                .insert(url.clone(), Err(RpcFailure::Structured(document.clone())));
        }
        Ok(Self {
            inner: Mutex::new(inner),
            state_file: None,
        })
    }

    /// Load the simulation file at `path`, starting empty if it does not
    /// exist. Certificates created later are saved back to it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let path = path.as_ref();
        let simulation = SimulationConfig::load_or_default(path)?;
        let mut gateway = Self::from_simulation(&simulation)?;
        gateway.state_file = Some(path.to_path_buf());
        debug!(
            "Loaded simulation from {} ({} device(s), {} certificate(s))",
            path.display(),
            simulation.devices.len(),
            simulation.certificates.len()
        );
        Ok(gateway)
    }

    /// Current state as simulation data
    pub async fn snapshot(&self) -> SimulationConfig {
        let inner = self.inner.lock().await;
        let mut simulation = SimulationConfig {
            devices: inner.devices.clone(),
            ..SimulationConfig::default()
        };
        for (name, credential) in &inner.credentials {
            simulation.certificates.push(CertificateEntry {
                name: name.clone(),
                password: credential.passphrase.clone(),
                fingerprint: Some(format_fingerprint(&credential.fingerprint)),
            });
        }
        for (url, response) in &inner.rpc_responses {
            match response {
                Ok(document) => {
                    simulation.responses.insert(url.clone(), document.clone());
                }
                Err(RpcFailure::Structured(document)) => {
                    simulation.failures.insert(url.clone(), document.clone());
                }
                Err(RpcFailure::Transport(_)) => {}
            }
        }
        simulation
    }

    /// Write the current state to the simulation file, if there is one
    async fn persist(&self) -> Result<(), GatewayError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let text = self.snapshot().await.to_toml().map_err(|e| {
            warn!("Could not serialize simulation: {}", e);
            GatewayStatus::Failed
        })?;
        tokio::fs::write(path, text).await.map_err(|e| {
            warn!("Could not save simulation to {}: {}", path.display(), e);
            GatewayStatus::Failed
        })?;
        Ok(())
    }

    /// Only accept sessions for this credential and passphrase
    pub async fn add_credential(&self, cert_name: &str, passphrase: &str) {
        let mut inner = self.inner.lock().await;
        inner.credentials.insert(
            cert_name.to_string(),
            Credential {
                passphrase: passphrase.to_string(),
                fingerprint: simulated_fingerprint(cert_name, 0),
            },
        );
    }

    /// Script the tunnels opened towards `device_id`
    pub async fn script_device(&self, device_id: &str, script: ScriptedTunnel) {
        let mut inner = self.inner.lock().await;
        inner.scripts.insert(device_id.to_string(), script);
        inner.devices.push(device_id.to_string());
    }

    /// Make tunnel opens towards `device_id` fail
    pub async fn fail_open(&self, device_id: &str, status: GatewayStatus) {
        let mut inner = self.inner.lock().await;
        inner.open_failures.insert(device_id.to_string(), status);
    }

    /// Make tunnel opens towards `remote_port` fail, whatever the device
    pub async fn fail_open_port(&self, remote_port: u16, status: GatewayStatus) {
        let mut inner = self.inner.lock().await;
        inner.port_failures.insert(remote_port, status);
    }

    /// Script the answer to an RPC URL
    pub async fn respond(&self, url: &str, response: Result<String, RpcFailure>) {
        let mut inner = self.inner.lock().await;
        inner.rpc_responses.insert(url.to_string(), response);
    }

    /// URLs invoked so far, in order
    pub async fn rpc_calls(&self) -> Vec<String> {
        self.inner.lock().await.rpc_calls.clone()
    }

    /// Handles passed to `close_tunnel` so far, in order
    pub async fn close_calls(&self) -> Vec<TunnelHandle> {
        self.inner.lock().await.close_calls.clone()
    }

    /// Number of tunnels opened and not yet closed
    pub async fn open_tunnel_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.tunnels.values().filter(|t| !t.closed).count()
    }

    /// Interface definition installed through `set_default_interface`
    pub async fn interface_definition(&self) -> Option<String> {
        self.inner.lock().await.interface_definition.clone()
    }

    fn check_session(inner: &Inner, session: SessionHandle) -> Result<(), GatewayStatus> {
        if inner.sessions.contains(&session) {
            Ok(())
        } else {
            Err(GatewayStatus::InvalidSession)
        }
    }
}

#[async_trait]
impl SessionGateway for MemoryGateway {
    async fn open_session(
        &self,
        cert_name: &str,
        passphrase: &str,
    ) -> Result<SessionHandle, GatewayError> {
        let mut inner = self.inner.lock().await;
        if !inner.credentials.is_empty() {
            let status = match inner.credentials.get(cert_name) {
                None => Some(GatewayStatus::NoProfile),
                Some(credential) if credential.passphrase != passphrase => {
                    Some(GatewayStatus::UnlockFailed)
                }
                Some(_) => None,
            };
            if let Some(status) = status {
                return Err(GatewayError::Auth {
                    cert_name: cert_name.to_string(),
                    status,
                });
            }
        }
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
        session: SessionHandle,
        json: &str,
    ) -> Result<(), GatewayError> {
        let inner = self.inner.lock().await;
        Self::check_session(&inner, session)?;
        serde_json::from_str::<serde_json::Value>(json)
            .map_err(|_| GatewayError::Status(GatewayStatus::Failed))?;
        Ok(())
    }

    async fn set_local_psk(
        &self,
        session: SessionHandle,
        _psk_id: &[u8],
        _psk: &[u8],
    ) -> Result<(), GatewayError> {
        let inner = self.inner.lock().await;
        Self::check_session(&inner, session)?;
        Ok(())
    }

    async fn open_tunnel(
        &self,
        session: SessionHandle,
        local_port: u16,
        device_id: &str,
        _remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelHandle, GatewayError> {
        let mut inner = self.inner.lock().await;
        Self::check_session(&inner, session)?;
        let failure = inner
            .open_failures
            .get(device_id)
            .or_else(|| inner.port_failures.get(&remote_port));
        if let Some(status) = failure {
            return Err(GatewayError::Status(*status));
        }
        let script = inner.scripts.get(device_id).cloned().unwrap_or_default();

        inner.next_handle += 1;
        let handle = TunnelHandle(inner.next_handle);
        inner.tunnels.insert(
            handle,
            MemoryTunnel {
                pending: script.states.iter().cloned().collect(),
                script,
                local_port,
                closed: false,
            },
        );
        Ok(handle)
    }

    async fn tunnel_state(&self, tunnel: TunnelHandle) -> Result<TunnelState, GatewayError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .tunnels
            .get_mut(&tunnel)
            .ok_or(GatewayStatus::InvalidTunnel)?;
        if entry.closed {
            return Ok(TunnelState::Closed);
        }
        let answer = if entry.pending.len() > 1 {
            entry.pending.pop_front()
        } else {
            entry.pending.front().cloned()
        };
        match answer {
            Some(result) => result.map_err(GatewayError::Status),
            None => Ok(TunnelState::Unknown),
        }
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
        let value = match attribute {
            TunnelAttribute::Version => entry.script.version,
            TunnelAttribute::BoundLocalPort => Some(i32::from(
                entry.script.bound_port.unwrap_or(entry.local_port),
            )),
            TunnelAttribute::LastError => entry.script.last_error,
        };
        value.ok_or(GatewayError::Status(GatewayStatus::Failed))
    }

    async fn close_tunnel(&self, tunnel: TunnelHandle) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().await;
        inner.close_calls.push(tunnel);
        let entry = inner
            .tunnels
            .get_mut(&tunnel)
            .ok_or(GatewayStatus::InvalidTunnel)?;
        if entry.closed {
            return Err(GatewayError::Status(GatewayStatus::InvalidTunnel));
        }
        if let Some(status) = entry.script.close_failure {
            return Err(GatewayError::Status(status));
        }
        entry.closed = true;
        Ok(())
    }

    async fn set_default_interface(
        &self,
        session: SessionHandle,
        definition: &str,
    ) -> Result<(), RpcFailure> {
        let mut inner = self.inner.lock().await;
        Self::check_session(&inner, session).map_err(RpcFailure::Transport)?;
        if definition.trim().is_empty() {
            return Err(RpcFailure::Structured(
                r#"{"error":{"event":"EMPTY_INTERFACE_DEFINITION"}}"#.to_string(),
            ));
        }
        inner.interface_definition = Some(definition.to_string());
        Ok(())
    }

    async fn invoke_rpc(&self, session: SessionHandle, url: &str) -> Result<String, RpcFailure> {
        let mut inner = self.inner.lock().await;
        Self::check_session(&inner, session).map_err(RpcFailure::Transport)?;
        inner.rpc_calls.push(url.to_string());
        inner
            .rpc_responses
            .get(url)
            .cloned()
            .unwrap_or(Err(RpcFailure::Transport(GatewayStatus::Failed)))
    }

    async fn list_local_devices(&self) -> Result<Vec<String>, GatewayError> {
        Ok(self.inner.lock().await.devices.clone())
    }

    async fn create_self_signed_profile(
        &self,
        cert_name: &str,
        passphrase: &str,
    ) -> Result<(), GatewayError> {
        if cert_name.is_empty() {
            return Err(GatewayError::Status(GatewayStatus::Failed));
        }
        {
            let mut inner = self.inner.lock().await;
            inner.next_handle += 1;
            let fingerprint = simulated_fingerprint(cert_name, inner.next_handle);
            inner.credentials.insert(
                cert_name.to_string(),
                Credential {
                    passphrase: passphrase.to_string(),
                    fingerprint,
                },
            );
        }
        self.persist().await
    }

    async fn fingerprint(&self, cert_name: &str) -> Result<[u8; FINGERPRINT_LEN], GatewayError> {
        let inner = self.inner.lock().await;
        inner
            .credentials
            .get(cert_name)
            .map(|c| c.fingerprint)
            .ok_or(GatewayError::Status(GatewayStatus::NoProfile))
    }

    async fn list_certificates(&self) -> Result<Vec<String>, GatewayError> {
        Ok(self.inner.lock().await.credentials.keys().cloned().collect())
    }

    fn version(&self) -> String {
        format!("memory-gateway {}", crate::VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_states_repeat_last() {
        let gateway = MemoryGateway::new();
        gateway
            .script_device(
                "dev",
                ScriptedTunnel::from_states([TunnelState::Connecting, TunnelState::Local]),
            )
            .await;
        let session = gateway.open_session("any", "pw").await.unwrap();
        let tunnel = gateway
            .open_tunnel(session, 0, "dev", "127.0.0.1", 80)
            .await
            .unwrap();

        assert_eq!(gateway.tunnel_state(tunnel).await.unwrap(), TunnelState::Connecting);
        assert_eq!(gateway.tunnel_state(tunnel).await.unwrap(), TunnelState::Local);
        assert_eq!(gateway.tunnel_state(tunnel).await.unwrap(), TunnelState::Local);

        gateway.close_tunnel(tunnel).await.unwrap();
        assert_eq!(gateway.tunnel_state(tunnel).await.unwrap(), TunnelState::Closed);
        assert!(gateway.close_tunnel(tunnel).await.is_err());
    }

    #[tokio::test]
    async fn test_credentials_checked() {
        let gateway = MemoryGateway::new();
        gateway.add_credential("guest", "secret").await;

        let err = gateway.open_session("guest", "wrong").await.unwrap_err();
        assert_eq!(err.status(), GatewayStatus::UnlockFailed);

        let err = gateway.open_session("nobody", "secret").await.unwrap_err();
        assert_eq!(err.status(), GatewayStatus::NoProfile);

        assert!(gateway.open_session("guest", "secret").await.is_ok());
    }

    #[tokio::test]
    async fn test_self_signed_profile() {
        let gateway = MemoryGateway::new();
        gateway.create_self_signed_profile("alice", "pw").await.unwrap();
        gateway.create_self_signed_profile("bob", "pw2").await.unwrap();

        assert_eq!(gateway.list_certificates().await.unwrap(), vec!["alice", "bob"]);
        let alice = gateway.fingerprint("alice").await.unwrap();
        assert_ne!(alice, gateway.fingerprint("bob").await.unwrap());
        assert_eq!(
            gateway.fingerprint("carol").await.unwrap_err().status(),
            GatewayStatus::NoProfile
        );

        // The new profile unlocks sessions
        assert!(gateway.open_session("alice", "pw").await.is_ok());
        assert_eq!(
            gateway.open_session("alice", "pw2").await.unwrap_err().status(),
            GatewayStatus::UnlockFailed
        );
    }

    #[tokio::test]
    async fn test_from_simulation() {
        let mut simulation = SimulationConfig {
            devices: vec!["dev.example.net".to_string()],
            certificates: vec![CertificateEntry {
                name: "guest".to_string(),
                password: "secret".to_string(),
                fingerprint: Some("00:11:22:33:44:55:66:77:88:99:aa:bb:cc:dd:ee:ff".to_string()),
            }],
            ..SimulationConfig::default()
        };
        simulation
            .responses
            .insert("nabto://dev.example.net/ping.json?".to_string(), "{}".to_string());
        simulation.failures.insert(
            "nabto://dev.example.net/admin.json?".to_string(),
            r#"{"error":{}}"#.to_string(),
        );
        let gateway = MemoryGateway::from_simulation(&simulation).unwrap();

        assert_eq!(gateway.list_local_devices().await.unwrap(), vec!["dev.example.net"]);
        assert_eq!(gateway.fingerprint("guest").await.unwrap()[15], 0xff);

        let session = gateway.open_session("guest", "secret").await.unwrap();
        assert_eq!(
            gateway.invoke_rpc(session, "nabto://dev.example.net/ping.json?").await,
            Ok("{}".to_string())
        );
        assert_eq!(
            gateway.invoke_rpc(session, "nabto://dev.example.net/admin.json?").await,
            Err(RpcFailure::Structured(r#"{"error":{}}"#.to_string()))
        );

        let tunnel = gateway
            .open_tunnel(session, 0, "dev.example.net", "127.0.0.1", 80)
            .await
            .unwrap();
        assert_eq!(gateway.tunnel_state(tunnel).await.unwrap(), TunnelState::Connecting);
        assert_eq!(gateway.tunnel_state(tunnel).await.unwrap(), TunnelState::Local);

        assert_eq!(gateway.snapshot().await, simulation);
    }

    #[test]
    fn test_bad_simulation_fingerprint() {
        let simulation = SimulationConfig {
            certificates: vec![CertificateEntry {
                name: "guest".to_string(),
                password: "secret".to_string(),
                fingerprint: Some("not-hex".to_string()),
            }],
            ..SimulationConfig::default()
        };
        assert!(matches!(
            MemoryGateway::from_simulation(&simulation),
            Err(crate::Error::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let gateway = MemoryGateway::new();
        let err = gateway
            .open_tunnel(SessionHandle(99), 0, "dev", "127.0.0.1", 80)
            .await
            .unwrap_err();
        assert_eq!(err.status(), GatewayStatus::InvalidSession);
    }
}
