//! Interface compatibility negotiation

use super::RpcError;
use crate::gateway::{SessionGateway, SessionHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scheme every RPC URL starts with
pub const URL_SCHEME: &str = "nabto://";

/// Well-known read-only call returning the peer's interface descriptor
pub const INTERFACE_INFO_PATH: &str = "get_interface_info.json";

/// Interface version the caller was written against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceVersion {
    pub major: i32,
    pub minor: i32,
}

impl fmt::Display for InterfaceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for InterfaceVersion {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_declared_version(s)
    }
}

/// Interface advertised by a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    #[serde(rename = "interface_id")]
    pub id: String,
    #[serde(rename = "interface_version_major")]
    pub version_major: i32,
    #[serde(rename = "interface_version_minor")]
    pub version_minor: i32,
}

/// Response document of the interface info call
#[derive(Deserialize)]
struct InterfaceInfoResponse {
    response: InterfaceDescriptor,
}

/// Parse a `<major>.<minor>` version string
pub fn parse_declared_version(s: &str) -> Result<InterfaceVersion, RpcError> {
    let invalid = || RpcError::InvalidVersionFormat(s.to_string());

    let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
    if minor.contains('.') {
        return Err(invalid());
    }
    let major: i32 = major.parse().map_err(|_| invalid())?;
    let minor: i32 = minor.parse().map_err(|_| invalid())?;
    if major < 1 || minor < 0 {
        return Err(invalid());
    }
    Ok(InterfaceVersion { major, minor })
}

/// Host part of an RPC URL: everything between the scheme and the next `/`
pub fn extract_host(url: &str) -> Result<&str, RpcError> {
    let malformed = || RpcError::MalformedUrl(url.to_string());

    let rest = url.strip_prefix(URL_SCHEME).ok_or_else(malformed)?;
    let (host, _) = rest.split_once('/').ok_or_else(malformed)?;
    if host.is_empty() {
        return Err(malformed());
    }
    Ok(host)
}

/// Compare a peer's descriptor with the declared interface.
///
/// Major versions must match exactly; the peer's minor version must be at
/// least the declared one.
pub fn check(
    declared_id: &str,
    declared: InterfaceVersion,
    descriptor: &InterfaceDescriptor,
) -> Result<(), RpcError> {
    let compatible = descriptor.id == declared_id
        && descriptor.version_major == declared.major
        && descriptor.version_minor >= declared.minor;
    if compatible {
        return Ok(());
    }
    Err(RpcError::InterfaceMismatch {
        expected_id: declared_id.to_string(),
        expected_major: declared.major,
        expected_minor: declared.minor,
        actual_id: descriptor.id.clone(),
        actual_major: descriptor.version_major,
        actual_minor: descriptor.version_minor,
    })
}

/// Issues RPC calls on one session, optionally gated on interface checks
pub struct Negotiator<G: SessionGateway + ?Sized> {
    gateway: Arc<G>,
    session: SessionHandle,
}

impl<G: SessionGateway + ?Sized> Negotiator<G> {
    pub fn new(gateway: Arc<G>, session: SessionHandle) -> Self {
        Self { gateway, session }
    }

    /// Read an interface definition file and install it on the session
    pub async fn set_interface_definition(&self, path: impl AsRef<Path>) -> Result<(), RpcError> {
        let path = path.as_ref();
        let definition = tokio::fs::read_to_string(path).await.map_err(|source| {
            RpcError::DefinitionUnreadable {
                path: path.display().to_string(),
                source,
            }
        })?;
        self.gateway
            .set_default_interface(self.session, &definition)
            .await?;
        debug!("Installed interface definition from {}", path.display());
        Ok(())
    }

    /// Fetch the interface descriptor advertised by `host`
    pub async fn fetch_descriptor(&self, host: &str) -> Result<InterfaceDescriptor, RpcError> {
        let url = format!("{}{}/{}", URL_SCHEME, host, INTERFACE_INFO_PATH);
        let document = self.gateway.invoke_rpc(self.session, &url).await?;
        let info: InterfaceInfoResponse = serde_json::from_str(&document)
            .map_err(|e| RpcError::MalformedResponse(e.to_string()))?;
        debug!(
            "Peer {} implements {} {}.{}",
            host, info.response.id, info.response.version_major, info.response.version_minor
        );
        Ok(info.response)
    }

    /// Check that the peer behind `url` implements a compatible interface
    pub async fn verify(
        &self,
        url: &str,
        declared_id: &str,
        declared_version: &str,
    ) -> Result<InterfaceDescriptor, RpcError> {
        let declared = parse_declared_version(declared_version)?;
        let host = extract_host(url)?;
        let descriptor = self.fetch_descriptor(host).await?;
        if let Err(e) = check(declared_id, declared, &descriptor) {
            warn!("Refusing to call {}: {}", url, e);
            return Err(e);
        }
        Ok(descriptor)
    }

    /// Invoke `url` without any interface check
    pub async fn invoke(&self, url: &str) -> Result<String, RpcError> {
        Ok(self.gateway.invoke_rpc(self.session, url).await?)
    }

    /// Invoke `url` only if the peer's interface is compatible with the
    /// declared one. Nothing but the descriptor fetch reaches the peer when
    /// the check fails.
    pub async fn guard_invoke(
        &self,
        url: &str,
        declared_id: &str,
        declared_version: &str,
    ) -> Result<String, RpcError> {
        let descriptor = self.verify(url, declared_id, declared_version).await?;
        info!(
            "Interface {} {}.{} accepted, invoking {}",
            descriptor.id, descriptor.version_major, descriptor.version_minor, url
        );
        self.invoke(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, major: i32, minor: i32) -> InterfaceDescriptor {
        InterfaceDescriptor {
            id: id.to_string(),
            version_major: major,
            version_minor: minor,
        }
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_declared_version("1.3").unwrap(),
            InterfaceVersion { major: 1, minor: 3 }
        );
        assert_eq!(
            "12.0".parse::<InterfaceVersion>().unwrap(),
            InterfaceVersion { major: 12, minor: 0 }
        );
    }

    #[test]
    fn test_parse_version_rejects() {
        for bad in ["abc", "10", "0.5", "1.", ".1", "1.2.3", "-1.0", "1.-1", "a.b", ""] {
            match parse_declared_version(bad) {
                Err(RpcError::InvalidVersionFormat(s)) => assert_eq!(s, bad),
                other => panic!("{:?} should be rejected, got {:?}", bad, other),
            }
        }
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("nabto://dev.example.net/ping.json?x=1").unwrap(), "dev.example.net");
        assert!(matches!(
            extract_host("http://dev/ping.json"),
            Err(RpcError::MalformedUrl(_))
        ));
        assert!(matches!(
            extract_host("nabto://dev"),
            Err(RpcError::MalformedUrl(_))
        ));
        assert!(matches!(
            extract_host("nabto:///ping.json"),
            Err(RpcError::MalformedUrl(_))
        ));
    }

    #[test]
    fn test_check_rules() {
        let remote = descriptor("abc", 1, 5);
        let v = |s: &str| parse_declared_version(s).unwrap();

        assert!(check("abc", v("1.3"), &remote).is_ok());
        assert!(check("abc", v("1.5"), &remote).is_ok());
        assert!(check("abc", v("1.6"), &remote).is_err());
        assert!(check("xyz", v("1.3"), &remote).is_err());
        assert!(check("abc", v("2.0"), &remote).is_err());
    }

    #[test]
    fn test_mismatch_carries_both_sides() {
        let err = check("xyz", InterfaceVersion { major: 2, minor: 1 }, &descriptor("abc", 1, 5))
            .unwrap_err();
        match err {
            RpcError::InterfaceMismatch {
                expected_id,
                expected_major,
                expected_minor,
                actual_id,
                actual_major,
                actual_minor,
            } => {
                assert_eq!((expected_id.as_str(), expected_major, expected_minor), ("xyz", 2, 1));
                assert_eq!((actual_id.as_str(), actual_major, actual_minor), ("abc", 1, 5));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_descriptor_document() {
        let doc = r#"{"response":{"interface_id":"abc","interface_version_major":1,"interface_version_minor":5}}"#;
        let info: InterfaceInfoResponse = serde_json::from_str(doc).unwrap();
        assert_eq!(info.response, descriptor("abc", 1, 5));
    }
}
