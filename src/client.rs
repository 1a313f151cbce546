//! Command flows of the `peerlink` client
//!
//! Each flow takes a gateway and already parsed inputs, so the same code runs
//! against the direct backend, the memory backend and the test suites. The
//! binary only adds argument parsing, signal handling and printing.

use crate::crypto::{format_fingerprint, Psk, PskId};
use crate::gateway::{GatewayError, GatewayStatus, SessionGateway, SessionHandle};
use crate::rpc::{Negotiator, RpcError};
use crate::tunnel::{CloseReport, OpenFailurePolicy, TunnelError, TunnelRegistry, TunnelSpec};
use std::path::Path;
use thiserror::Error;
use tracing::{error, info, warn};

/// Everything needed to open and prepare a session
#[derive(Debug)]
pub struct SessionOptions {
    pub cert_name: String,
    pub password: String,
    /// Document handed to the basestation for authentication
    pub basestation_auth_json: Option<String>,
    /// Pre-shared key for local connections
    pub psk: Option<(PskId, Psk)>,
}

/// Session setup errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No such certificate {0}")]
    NoSuchCertificate(String),

    #[error("Invalid password specified for {0}")]
    InvalidPassword(String),

    #[error("Failed to open session: {0}")]
    Open(#[source] GatewayError),

    #[error("Session opened, but could not set basestation auth json doc: {0}")]
    BasestationAuth(#[source] GatewayError),

    #[error("Could not install local PSK: {0}")]
    Psk(#[source] GatewayError),
}

/// Open a session and apply the optional basestation document and PSK.
///
/// A session that opened but could not be prepared is closed again.
pub async fn open_session<G: SessionGateway + ?Sized>(
    gateway: &G,
    options: &SessionOptions,
) -> Result<SessionHandle, SessionError> {
    let session = match gateway
        .open_session(&options.cert_name, &options.password)
        .await
    {
        Ok(session) => session,
        Err(GatewayError::Auth {
            status: GatewayStatus::NoProfile,
            ..
        }) => return Err(SessionError::NoSuchCertificate(options.cert_name.clone())),
        Err(GatewayError::Auth {
            status: GatewayStatus::UnlockFailed,
            ..
        }) => return Err(SessionError::InvalidPassword(options.cert_name.clone())),
        Err(e) => return Err(SessionError::Open(e)),
    };

    if let Err(e) = prepare_session(gateway, session, options).await {
        close_session(gateway, session).await;
        return Err(e);
    }
    Ok(session)
}

async fn prepare_session<G: SessionGateway + ?Sized>(
    gateway: &G,
    session: SessionHandle,
    options: &SessionOptions,
) -> Result<(), SessionError> {
    if let Some(json) = &options.basestation_auth_json {
        gateway
            .set_basestation_auth_json(session, json)
            .await
            .map_err(SessionError::BasestationAuth)?;
    }
    if let Some((id, key)) = &options.psk {
        gateway
            .set_local_psk(session, id.as_bytes(), key.as_bytes())
            .await
            .map_err(SessionError::Psk)?;
        info!("Local PSK {} installed", id);
    }
    Ok(())
}

/// Close a session, logging a failure
pub async fn close_session<G: SessionGateway + ?Sized>(gateway: &G, session: SessionHandle) {
    if let Err(e) = gateway.close_session(session).await {
        warn!("Session close failed: {}", e);
    }
}

/// Open `specs` towards `device_id`, watch them until a stop is requested
/// or all of them closed, then close them.
///
/// Stopping is the caller's business through the registry's
/// [`CancellationSignal`](crate::CancellationSignal).
pub async fn run_tunnels<G: SessionGateway + ?Sized>(
    registry: &mut TunnelRegistry<G>,
    device_id: &str,
    specs: &[TunnelSpec],
    policy: OpenFailurePolicy,
) -> Result<CloseReport, TunnelError> {
    if let Err(e) = registry.open_all(device_id, specs, policy).await {
        error!("Could not start tunnels: {}", e);
        registry.close_all().await;
        return Err(e);
    }

    registry.watch().await;

    let report = registry.close_all().await;
    for (handle, e) in &report.failures {
        warn!("Tunnel {} close failed: {}", handle, e);
    }
    info!("Closed {} of {} tunnel(s)", report.closed, report.attempted);
    Ok(report)
}

/// Invoke `url` and return the response document.
///
/// The interface definition is installed first when given, and with a
/// declared `(interface id, version)` the call only goes out to a compatible
/// peer.
pub async fn run_rpc<G: SessionGateway + ?Sized>(
    negotiator: &Negotiator<G>,
    url: &str,
    definition: Option<&Path>,
    declared: Option<(&str, &str)>,
) -> Result<String, RpcError> {
    if let Some(path) = definition {
        negotiator.set_interface_definition(path).await?;
    }

    match declared {
        Some((id, version)) => negotiator.guard_invoke(url, id, version).await,
        None => negotiator.invoke(url).await,
    }
}

/// Create a self-signed certificate and return its fingerprint in colon form
pub async fn create_certificate<G: SessionGateway + ?Sized>(
    gateway: &G,
    cert_name: &str,
    password: &str,
) -> Result<String, GatewayError> {
    gateway
        .create_self_signed_profile(cert_name, password)
        .await?;
    let fingerprint = gateway.fingerprint(cert_name).await?;
    Ok(format_fingerprint(&fingerprint))
}
