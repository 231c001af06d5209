//! Normalization of stored document snapshots.
//!
//! Snapshots reach the server in whatever shape the storage transport hands
//! back: raw bytes, Postgres hex-escaped `bytea` text (`\x0a0b…`), or base64
//! text written by older clients. Everything is reduced to raw yrs v1 update
//! bytes before it is applied to a document.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::Update;

use crate::payload::check_update_v1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Snapshot is empty")]
    Empty,

    #[error("Invalid hex escape: {0}")]
    InvalidHex(String),

    #[error("Snapshot is not a raw, hex-escaped or base64 update")]
    Unrecognized,
}

/// How a snapshot was encoded before normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotEncoding {
    Raw,
    Base64,
    HexEscaped,
    /// Base64 text stored inside a hex-escaped `bytea`
    HexEscapedBase64,
}

/// Reduce any accepted snapshot encoding to raw update bytes
pub fn normalize_snapshot(raw: &[u8]) -> Result<(Vec<u8>, SnapshotEncoding), SnapshotError> {
    if raw.is_empty() {
        return Err(SnapshotError::Empty);
    }

    if let Some(hex) = strip_hex_prefix(raw) {
        let decoded = decode_hex(hex)?;
        return match decode_plain(&decoded) {
            Some((bytes, SnapshotEncoding::Base64)) => {
                Ok((bytes, SnapshotEncoding::HexEscapedBase64))
            }
            Some((bytes, _)) => Ok((bytes, SnapshotEncoding::HexEscaped)),
            None => Err(SnapshotError::Unrecognized),
        };
    }

    decode_plain(raw).ok_or(SnapshotError::Unrecognized)
}

// Base64 text is tried before raw bytes
fn decode_plain(bytes: &[u8]) -> Option<(Vec<u8>, SnapshotEncoding)> {
    if let Some(decoded) = decode_base64(bytes).filter(|decoded| is_update(decoded)) {
        return Some((decoded, SnapshotEncoding::Base64));
    }
    is_update(bytes).then(|| (bytes.to_vec(), SnapshotEncoding::Raw))
}

fn decode_base64(bytes: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    STANDARD
        .decode(text)
        .or_else(|_| STANDARD_NO_PAD.decode(text))
        .ok()
}

fn is_update(bytes: &[u8]) -> bool {
    !bytes.is_empty() && check_update_v1(bytes).is_ok() && Update::decode_v1(bytes).is_ok()
}

fn strip_hex_prefix(raw: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(raw).ok()?.trim();
    text.strip_prefix("\\x")
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, SnapshotError> {
    if hex.len() % 2 != 0 {
        return Err(SnapshotError::InvalidHex(format!(
            "odd number of digits ({})",
            hex.len()
        )));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| SnapshotError::InvalidHex(format!("bad digits at offset {}", i)))
        })
        .collect()
}
