//! Shared frame logic for the object stream
//!
//! Pure functions over byte slices: building a frame, locating the end of a
//! length prefix and decoding a payload. The stream in `object_stream` owns
//! the buffering and ordering; everything here is stateless.

use anyhow::Result;
use serde_json::Value;
use std::path::Path;

use crate::error::BackupError;

/// A usize never needs more than 20 decimal digits
pub const MAX_PREFIX_DIGITS: usize = 20;

/// Outcome of scanning the front of the receive buffer for a length prefix
#[derive(Debug, PartialEq, Eq)]
pub enum LengthPrefix {
    /// Not enough bytes yet to know where the digit run ends
    Incomplete,
    /// `digits` bytes of prefix announcing a `len`-byte payload
    Complete { len: usize, digits: usize },
    /// The buffer cannot start a frame
    Invalid(String),
}

/// Build a frame: decimal payload length immediately followed by the payload
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let prefix = payload.len().to_string();
    let mut frame = Vec::with_capacity(prefix.len() + payload.len());
    frame.extend_from_slice(prefix.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Serialize a message into a frame.
/// Absent (`null`) and non-object values are refused before anything is written.
pub fn encode_message(value: &Value) -> Result<Vec<u8>, BackupError> {
    match value {
        Value::Null => Err(BackupError::InvalidArgument(
            "no message given".to_string(),
        )),
        Value::Object(_) => Ok(build_frame(&serde_json::to_vec(value)?)),
        other => Err(BackupError::InvalidArgument(format!(
            "message must be a JSON object, got {}",
            json_kind(other)
        ))),
    }
}

/// Scan the leading run of ASCII digits.
///
/// The run ends at the first non-digit byte, which is the first byte of the
/// payload. A run that reaches the end of the buffer may still be growing.
pub fn parse_length_prefix(buf: &[u8]) -> LengthPrefix {
    let digits = buf.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return match buf.first() {
            None => LengthPrefix::Incomplete,
            Some(b) => LengthPrefix::Invalid(format!(
                "expected length prefix, found byte 0x{b:02x}"
            )),
        };
    }
    if digits > MAX_PREFIX_DIGITS {
        return LengthPrefix::Invalid(format!("length prefix has {digits} digits"));
    }
    if digits == buf.len() {
        return LengthPrefix::Incomplete;
    }
    // Only ASCII digits in this range, so from_utf8 cannot fail
    let text = std::str::from_utf8(&buf[..digits]).unwrap_or_default();
    match text.parse::<usize>() {
        Ok(len) => LengthPrefix::Complete { len, digits },
        Err(e) => LengthPrefix::Invalid(format!("bad length prefix {text:?}: {e}")),
    }
}

/// Decode one complete payload
pub fn decode_payload(payload: &[u8]) -> Result<Value, BackupError> {
    serde_json::from_slice(payload).map_err(|e| BackupError::Parse(e.to_string()))
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir_exists(parent)?;
        }
    }
    Ok(())
}
