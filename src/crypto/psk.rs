//! Pre-shared key decoding
//!
//! Keys are written either as plain hex (`00112233...`, `2 * len` characters)
//! or in fingerprint style with one separator after every byte but the last
//! (`00:11:22:...`, `3 * len - 1` characters). The separator character itself
//! is not checked.

use super::{CryptoError, PSK_LEN};
use std::fmt;
use std::str::FromStr;

fn malformed(reason: impl Into<String>) -> CryptoError {
    CryptoError::MalformedPskHex {
        reason: reason.into(),
    }
}

/// Decode `len` bytes of key material from hex text
pub fn parse_psk(s: &str, len: usize) -> Result<Vec<u8>, CryptoError> {
    let text = s.as_bytes();
    let stride = if text.len() == 2 * len {
        2
    } else if len > 0 && text.len() == 3 * len - 1 {
        3
    } else {
        return Err(malformed(format!(
            "expected {} or {} characters for {} bytes, got {}",
            2 * len,
            (3 * len).saturating_sub(1),
            len,
            text.len()
        )));
    };

    let mut out = vec![0u8; len];
    for (i, byte) in out.iter_mut().enumerate() {
        let pos = i * stride;
        let mut decoded = [0u8; 1];
        hex::decode_to_slice(&text[pos..pos + 2], &mut decoded).map_err(|e| match e {
            hex::FromHexError::InvalidHexCharacter { index, .. } => {
                malformed(format!("invalid hex digit at position {}", pos + index))
            }
            other => malformed(other.to_string()),
        })?;
        *byte = decoded[0];
    }
    Ok(out)
}

/// Render bytes as lowercase hex pairs joined by `:`
pub fn format_fingerprint(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_fixed(s: &str) -> Result<[u8; PSK_LEN], CryptoError> {
    let bytes = parse_psk(s, PSK_LEN)?;
    let mut arr = [0u8; PSK_LEN];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

/// Identifier of a pre-shared key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PskId(pub [u8; PSK_LEN]);

impl PskId {
    /// Decode from hex text
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        parse_fixed(s).map(Self)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; PSK_LEN] {
        &self.0
    }
}

impl FromStr for PskId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for PskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Pre-shared key (kept secret)
#[derive(Clone, PartialEq, Eq)]
pub struct Psk([u8; PSK_LEN]);

impl Psk {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; PSK_LEN]) -> Self {
        Self(bytes)
    }

    /// Decode from hex text
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        parse_fixed(s).map(Self)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; PSK_LEN] {
        &self.0
    }
}

impl FromStr for Psk {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for Psk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Psk([REDACTED])")
    }
}

// Zeroize key bytes on drop
impl Drop for Psk {
    fn drop(&mut self) {
        for byte in &mut self.0 {
            unsafe {
                std::ptr::write_volatile(byte, 0);
            }
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}
