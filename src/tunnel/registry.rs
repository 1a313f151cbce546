//! Tunnel registry and status poller
//!
//! The registry owns every tunnel it opened for one session. `watch()`
//! observes the states the gateway reports and logs each change; it never
//! drives the state itself. Shutdown is cooperative: a [`CancellationSignal`]
//! ends the poll loop, and the caller closes the tunnels afterwards with
//! `close_all()`.

use super::{TunnelError, TunnelSpec};
use crate::cancel::CancellationSignal;
use crate::gateway::{
    GatewayError, GatewayStatus, SessionGateway, SessionHandle, TunnelAttribute, TunnelHandle,
    TunnelState,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Interval between two state polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to do with already opened tunnels when a batch open fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenFailurePolicy {
    /// Close the tunnels opened so far and fail the batch
    #[default]
    Rollback,
    /// Keep what opened and carry on with the rest
    Keep,
}

/// A tunnel owned by the registry
#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub handle: TunnelHandle,
    /// Requested local port, 0 for gateway assigned
    pub local_port: u16,
    pub device_id: String,
    pub remote_host: String,
    pub remote_port: u16,
    /// State seen at the last successful poll
    pub last_state: TunnelState,
    /// Last error code reported when the tunnel closed
    pub last_error: Option<i32>,
    /// Close confirmed by the gateway
    closed: bool,
}

impl TunnelRecord {
    /// True once the gateway confirmed a close issued by the registry.
    /// `last_state` is left to the poller.
    pub fn close_confirmed(&self) -> bool {
        self.closed
    }
}

/// Extra information attached to a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionDetail {
    None,
    /// Entered one of the connected states
    Connected {
        version: Option<i32>,
        local_port: Option<u16>,
    },
    /// Entered the closed state
    Closed { last_error: Option<i32> },
}

/// Lifecycle event reported by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Opened {
        handle: TunnelHandle,
        device_id: String,
        local_port: u16,
    },
    OpenFailed {
        device_id: String,
        status: GatewayStatus,
    },
    Transition {
        handle: TunnelHandle,
        from: TunnelState,
        to: TunnelState,
        detail: TransitionDetail,
    },
    QueryFailed {
        handle: TunnelHandle,
        status: GatewayStatus,
    },
    Closed {
        handle: TunnelHandle,
    },
    CloseFailed {
        handle: TunnelHandle,
        status: GatewayStatus,
    },
}

/// Outcome of `close_all()`
#[derive(Debug, Default)]
pub struct CloseReport {
    /// Handles a close was issued for
    pub attempted: usize,
    /// Handles the gateway confirmed closed
    pub closed: usize,
    /// Close failures on tunnels that were still open
    pub failures: Vec<(TunnelHandle, GatewayError)>,
}

impl CloseReport {
    /// True when no close failed
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owner of the tunnels opened through one session
pub struct TunnelRegistry<G: SessionGateway + ?Sized> {
    gateway: Arc<G>,
    session: SessionHandle,
    records: Vec<TunnelRecord>,
    cancel: CancellationSignal,
    poll_interval: Duration,
    events: Option<mpsc::UnboundedSender<TunnelEvent>>,
}

impl<G: SessionGateway + ?Sized> TunnelRegistry<G> {
    /// Create an empty registry for `session`
    pub fn new(gateway: Arc<G>, session: SessionHandle, cancel: CancellationSignal) -> Self {
        Self {
            gateway,
            session,
            records: Vec::new(),
            cancel,
            poll_interval: DEFAULT_POLL_INTERVAL,
            events: None,
        }
    }

    /// Override the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Receive every event the registry reports from now on
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TunnelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Handle that can stop `watch()` from another task or thread
    pub fn cancellation(&self) -> CancellationSignal {
        self.cancel.clone()
    }

    /// Ask `watch()` to return at its next tick. Performs no I/O.
    pub fn request_stop(&self) {
        self.cancel.request_stop();
    }

    /// Tunnels owned by the registry
    pub fn records(&self) -> &[TunnelRecord] {
        &self.records
    }

    /// Look up a tunnel by handle
    pub fn get(&self, handle: TunnelHandle) -> Option<&TunnelRecord> {
        self.records.iter().find(|r| r.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// True when every tracked tunnel was last seen closed
    pub fn all_closed(&self) -> bool {
        self.records
            .iter()
            .all(|r| r.last_state == TunnelState::Closed)
    }

    /// Open one tunnel through the gateway
    pub async fn open(
        &mut self,
        local_port: u16,
        device_id: &str,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelHandle, TunnelError> {
        let result = self
            .gateway
            .open_tunnel(self.session, local_port, device_id, remote_host, remote_port)
            .await;

        match result {
            Ok(handle) => {
                self.records.push(TunnelRecord {
                    handle,
                    local_port,
                    device_id: device_id.to_string(),
                    remote_host: remote_host.to_string(),
                    remote_port,
                    last_state: TunnelState::Unknown,
                    last_error: None,
                    closed: false,
                });
                self.emit(TunnelEvent::Opened {
                    handle,
                    device_id: device_id.to_string(),
                    local_port,
                });
                Ok(handle)
            }
            Err(source) => {
                self.emit(TunnelEvent::OpenFailed {
                    device_id: device_id.to_string(),
                    status: source.status(),
                });
                Err(TunnelError::OpenFailed {
                    device_id: device_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Open the tunnel described by a parsed spec
    pub async fn open_spec(
        &mut self,
        device_id: &str,
        spec: &TunnelSpec,
    ) -> Result<TunnelHandle, TunnelError> {
        self.open(spec.local_port, device_id, &spec.remote_host, spec.remote_port)
            .await
    }

    /// Open a batch of tunnels to one device.
    ///
    /// With [`OpenFailurePolicy::Rollback`] the first failure closes and
    /// forgets every tunnel opened by this call, then returns the error. With
    /// [`OpenFailurePolicy::Keep`] failures are skipped and the call only
    /// fails if nothing opened.
    pub async fn open_all(
        &mut self,
        device_id: &str,
        specs: &[TunnelSpec],
        policy: OpenFailurePolicy,
    ) -> Result<Vec<TunnelHandle>, TunnelError> {
        let mut opened = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.open_spec(device_id, spec).await {
                Ok(handle) => opened.push(handle),
                Err(e) => match policy {
                    OpenFailurePolicy::Rollback => {
                        warn!("Open of {} failed, rolling back {} tunnel(s)", spec, opened.len());
                        self.discard(&opened).await;
                        return Err(e);
                    }
                    OpenFailurePolicy::Keep => {
                        warn!("Skipping tunnel {}: {}", spec, e);
                    }
                },
            }
        }
        if opened.is_empty() && !specs.is_empty() {
            return Err(TunnelError::NothingOpened);
        }
        Ok(opened)
    }

    /// Close and forget the given tunnels
    async fn discard(&mut self, handles: &[TunnelHandle]) {
        for handle in handles {
            match self.gateway.close_tunnel(*handle).await {
                Ok(()) => self.emit(TunnelEvent::Closed { handle: *handle }),
                Err(e) => self.emit(TunnelEvent::CloseFailed {
                    handle: *handle,
                    status: e.status(),
                }),
            }
        }
        self.records.retain(|r| !handles.contains(&r.handle));
    }

    /// Poll tunnel states until a stop is requested or every tunnel is closed
    pub async fn watch(&mut self) {
        info!(
            "Watching {} tunnel(s), polling every {:?}",
            self.records.len(),
            self.poll_interval
        );
        loop {
            tokio::time::sleep(self.poll_interval).await;
            if self.cancel.is_stop_requested() {
                info!("Stop requested, leaving tunnel watch");
                break;
            }
            self.poll().await;
            if self.all_closed() {
                info!("All tunnels closed");
                break;
            }
        }
    }

    /// Run a single poll over every live tunnel
    pub async fn poll(&mut self) {
        for i in 0..self.records.len() {
            if self.records[i].closed {
                continue;
            }
            let handle = self.records[i].handle;
            let previous = self.records[i].last_state;

            let state = match self.gateway.tunnel_state(handle).await {
                Ok(state) => state,
                Err(e) => {
                    self.emit(TunnelEvent::QueryFailed {
                        handle,
                        status: e.status(),
                    });
                    continue;
                }
            };
            if state == previous {
                continue;
            }

            let detail = if state.is_connected() {
                let version = self.attribute(handle, TunnelAttribute::Version).await;
                let local_port = self
                    .attribute(handle, TunnelAttribute::BoundLocalPort)
                    .await
                    .and_then(|p| u16::try_from(p).ok());
                TransitionDetail::Connected {
                    version,
                    local_port,
                }
            } else if state == TunnelState::Closed {
                let last_error = self.attribute(handle, TunnelAttribute::LastError).await;
                self.records[i].last_error = last_error;
                TransitionDetail::Closed { last_error }
            } else {
                TransitionDetail::None
            };

            self.records[i].last_state = state;
            self.emit(TunnelEvent::Transition {
                handle,
                from: previous,
                to: state,
                detail,
            });
        }
    }

    /// Best-effort attribute query
    async fn attribute(&self, handle: TunnelHandle, attribute: TunnelAttribute) -> Option<i32> {
        match self.gateway.tunnel_attribute(handle, attribute).await {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Tunnel {} has no {:?}: {}", handle, attribute, e);
                None
            }
        }
    }

    /// Issue a close for every tracked tunnel.
    ///
    /// Safe to call repeatedly: each call attempts every handle, and a
    /// failure on a tunnel an earlier call already closed is not reported.
    /// A tunnel whose close failed stays live and is reported again.
    pub async fn close_all(&mut self) -> CloseReport {
        let mut report = CloseReport::default();
        for i in 0..self.records.len() {
            let handle = self.records[i].handle;
            let already_closed = self.records[i].closed;
            report.attempted += 1;

            match self.gateway.close_tunnel(handle).await {
                Ok(()) => {
                    report.closed += 1;
                    self.records[i].closed = true;
                    self.emit(TunnelEvent::Closed { handle });
                }
                Err(e) if already_closed => {
                    debug!("Tunnel {} already closed: {}", handle, e);
                }
                Err(e) => {
                    self.emit(TunnelEvent::CloseFailed {
                        handle,
                        status: e.status(),
                    });
                    report.failures.push((handle, e));
                }
            }
        }
        report
    }

    /// Log an event and forward it to the subscriber, if any
    fn emit(&self, event: TunnelEvent) {
        match &event {
            TunnelEvent::Opened {
                handle,
                device_id,
                local_port,
            } => info!(
                "Opened tunnel {} to {} (requested local port {})",
                handle, device_id, local_port
            ),
            TunnelEvent::OpenFailed { device_id, status } => warn!(
                "Could not open tunnel to {}, tunnel open failed with status {}",
                device_id, status
            ),
            TunnelEvent::Transition {
                handle, to, detail, ..
            } => {
                info!(
                    "State has changed for tunnel {} status {} ({})",
                    handle,
                    to,
                    to.code()
                );
                match detail {
                    TransitionDetail::Connected {
                        version,
                        local_port,
                    } => info!(
                        "Tunnel {} connected, tunnel version: {}, local TCP port: {}",
                        handle,
                        version.map_or_else(|| "?".to_string(), |v| v.to_string()),
                        local_port.map_or_else(|| "?".to_string(), |p| p.to_string())
                    ),
                    TransitionDetail::Closed {
                        last_error: Some(code),
                    } => info!("Tunnel {} connection closed, last error = {}", handle, code),
                    TransitionDetail::Closed { last_error: None } => {
                        info!("Tunnel {} connection closed", handle)
                    }
                    TransitionDetail::None => {}
                }
            }
            TunnelEvent::QueryFailed { handle, status } => {
                warn!("State query failed for tunnel {}: {}", handle, status)
            }
            TunnelEvent::Closed { handle } => debug!("Closed tunnel {}", handle),
            TunnelEvent::CloseFailed { handle, status } => {
                warn!("Tunnel {} close failed with status {}", handle, status)
            }
        }

        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{MemoryGateway, ScriptedTunnel};

    async fn setup(
        scripts: &[(&str, ScriptedTunnel)],
    ) -> (Arc<MemoryGateway>, TunnelRegistry<MemoryGateway>) {
        let gateway = Arc::new(MemoryGateway::new());
        for (device, script) in scripts {
            gateway.script_device(device, script.clone()).await;
        }
        let session = gateway.open_session("guest", "pw").await.unwrap();
        let registry = TunnelRegistry::new(Arc::clone(&gateway), session, CancellationSignal::new());
        (gateway, registry)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<TunnelEvent>) -> Vec<TunnelEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_open_starts_unknown() {
        let (_, mut registry) = setup(&[]).await;
        let handle = registry.open(0, "dev", "127.0.0.1", 22).await.unwrap();

        let record = registry.get(handle).unwrap();
        assert_eq!(record.last_state, TunnelState::Unknown);
        assert_eq!(record.local_port, 0);
        assert_eq!(record.remote_port, 22);
        assert!(!registry.all_closed());
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_record() {
        let (gateway, mut registry) = setup(&[]).await;
        registry.open(0, "good", "127.0.0.1", 22).await.unwrap();
        gateway.fail_open("bad", GatewayStatus::ConnectTimeout).await;

        let err = registry.open(0, "bad", "127.0.0.1", 22).await.unwrap_err();
        match err {
            TunnelError::OpenFailed { device_id, source } => {
                assert_eq!(device_id, "bad");
                assert_eq!(source.status(), GatewayStatus::ConnectTimeout);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_reports_only_changes() {
        let script = ScriptedTunnel::from_states([
            TunnelState::Connecting,
            TunnelState::Connecting,
            TunnelState::RemoteP2p,
        ])
        .with_version(2);
        let (_, mut registry) = setup(&[("dev", script)]).await;
        let handle = registry.open(0, "dev", "127.0.0.1", 22).await.unwrap();
        let mut rx = registry.subscribe();

        for _ in 0..3 {
            registry.poll().await;
        }

        let transitions: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, TunnelEvent::Transition { .. }))
            .collect();
        assert_eq!(
            transitions,
            vec![
                TunnelEvent::Transition {
                    handle,
                    from: TunnelState::Unknown,
                    to: TunnelState::Connecting,
                    detail: TransitionDetail::None,
                },
                TunnelEvent::Transition {
                    handle,
                    from: TunnelState::Connecting,
                    to: TunnelState::RemoteP2p,
                    detail: TransitionDetail::Connected {
                        version: Some(2),
                        local_port: Some(0),
                    },
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_query_failure_keeps_state() {
        let script = ScriptedTunnel::from_states([TunnelState::Local])
            .then_query_failure(GatewayStatus::Failed)
            .then_state(TunnelState::Local);
        let (_, mut registry) = setup(&[("dev", script)]).await;
        let handle = registry.open(0, "dev", "127.0.0.1", 22).await.unwrap();
        let mut rx = registry.subscribe();

        registry.poll().await;
        registry.poll().await;
        assert_eq!(registry.get(handle).unwrap().last_state, TunnelState::Local);
        registry.poll().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TunnelEvent::Transition { to: TunnelState::Local, .. }));
        assert_eq!(
            events[1],
            TunnelEvent::QueryFailed {
                handle,
                status: GatewayStatus::Failed
            }
        );
    }

    #[tokio::test]
    async fn test_closed_without_error_code() {
        let script = ScriptedTunnel::from_states([TunnelState::Closed]);
        let (_, mut registry) = setup(&[("dev", script)]).await;
        let handle = registry.open(0, "dev", "127.0.0.1", 22).await.unwrap();

        registry.poll().await;
        let record = registry.get(handle).unwrap();
        assert_eq!(record.last_state, TunnelState::Closed);
        assert_eq!(record.last_error, None);
        assert!(registry.all_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_watch_returns() {
        let (_, mut registry) = setup(&[]).await;
        registry.watch().await;
        assert!(registry.all_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_watch() {
        let (_, mut registry) = setup(&[("dev", ScriptedTunnel::from_states([TunnelState::Local]))]).await;
        registry.open(0, "dev", "127.0.0.1", 22).await.unwrap();
        registry.request_stop();
        registry.watch().await;
        // Stopped before the first poll
        assert_eq!(registry.records()[0].last_state, TunnelState::Unknown);
    }

    #[tokio::test]
    async fn test_close_all_is_idempotent() {
        let (gateway, mut registry) = setup(&[]).await;
        let a = registry.open(0, "dev", "127.0.0.1", 22).await.unwrap();
        let b = registry.open(0, "dev", "127.0.0.1", 80).await.unwrap();

        let first = registry.close_all().await;
        assert_eq!(first.attempted, 2);
        assert_eq!(first.closed, 2);
        assert!(first.is_clean());

        let second = registry.close_all().await;
        assert_eq!(second.attempted, 2);
        assert_eq!(second.closed, 0);
        assert!(second.is_clean());

        assert_eq!(gateway.close_calls().await, vec![a, b, a, b]);
        assert_eq!(gateway.open_tunnel_count().await, 0);
        assert!(registry.records().iter().all(|r| r.close_confirmed()));
        // Closing does not stand in for an observed state
        assert!(registry
            .records()
            .iter()
            .all(|r| r.last_state == TunnelState::Unknown));
    }

    #[tokio::test]
    async fn test_close_failure_does_not_stop_others() {
        let stubborn = ScriptedTunnel::default().with_close_failure(GatewayStatus::Failed);
        let (gateway, mut registry) = setup(&[("stubborn", stubborn)]).await;
        let a = registry.open(0, "stubborn", "127.0.0.1", 22).await.unwrap();
        let b = registry.open(0, "dev", "127.0.0.1", 80).await.unwrap();

        let report = registry.close_all().await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.closed, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, a);
        assert_eq!(gateway.close_calls().await, vec![a, b]);
    }

    #[tokio::test]
    async fn test_failed_close_reported_again() {
        let stubborn = ScriptedTunnel::from_states([TunnelState::Local])
            .with_close_failure(GatewayStatus::Failed);
        let (gateway, mut registry) = setup(&[("stubborn", stubborn)]).await;
        let handle = registry.open(0, "stubborn", "127.0.0.1", 22).await.unwrap();
        registry.poll().await;

        let first = registry.close_all().await;
        assert_eq!(first.failures.len(), 1);

        let second = registry.close_all().await;
        assert_eq!(second.attempted, 1);
        assert_eq!(second.failures.len(), 1);
        assert_eq!(second.failures[0].0, handle);
        assert_eq!(gateway.open_tunnel_count().await, 1);

        let record = registry.get(handle).unwrap();
        assert!(!record.close_confirmed());
        assert_eq!(record.last_state, TunnelState::Local);

        // Still watched after the failed close
        let mut rx = registry.subscribe();
        registry.poll().await;
        assert!(drain(&mut rx).is_empty());
        assert!(!registry.all_closed());
    }

    fn specs(list: &[&str]) -> Vec<TunnelSpec> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_open_all_rollback() {
        let (gateway, mut registry) = setup(&[]).await;
        registry.open(0, "dev", "127.0.0.1", 8000).await.unwrap();
        gateway.fail_open_port(3, GatewayStatus::Failed).await;

        let err = registry
            .open_all("dev", &specs(&["1:h:1", "2:h:2", "3:h:3", "4:h:4"]), OpenFailurePolicy::Rollback)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::OpenFailed { .. }));

        // Only the tunnel from before the batch survives
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.records()[0].remote_port, 8000);
        assert_eq!(gateway.open_tunnel_count().await, 1);
    }

    #[tokio::test]
    async fn test_open_all_keep() {
        let (gateway, mut registry) = setup(&[]).await;
        gateway.fail_open_port(3, GatewayStatus::Failed).await;

        let opened = registry
            .open_all("dev", &specs(&["1:h:1", "2:h:2", "3:h:3", "4:h:4"]), OpenFailurePolicy::Keep)
            .await
            .unwrap();
        assert_eq!(opened.len(), 3);
        assert_eq!(registry.len(), 3);
        assert_eq!(gateway.open_tunnel_count().await, 3);
    }

    #[tokio::test]
    async fn test_open_all_keep_nothing_opened() {
        let (gateway, mut registry) = setup(&[]).await;
        gateway.fail_open("dev", GatewayStatus::Failed).await;

        let err = registry
            .open_all("dev", &specs(&["1:h:1", "2:h:2"]), OpenFailurePolicy::Keep)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::NothingOpened));
    }
}
