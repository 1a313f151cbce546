//! Key material for local connections
//!
//! This module provides:
//! - Pre-shared key (PSK) and key id decoding from hex text
//! - Colon separated fingerprint rendering

mod psk;

pub use psk::{format_fingerprint, parse_psk, Psk, PskId};

use thiserror::Error;

/// Length of a pre-shared key and of its key id in bytes
pub const PSK_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Malformed PSK hex: {reason}")]
    MalformedPskHex { reason: String },
}
