//! Encodings for subscriber events.
//!
//! Three encodings are supported:
//!
//! - JSON lines for plain HTTP streaming and polling
//! - SSE `data:` payloads for `text/event-stream`
//! - length-prefixed MessagePack for binary WebSocket clients

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::events::Event;

/// Maximum frame size (1 MiB). Events are small; anything larger is corrupt.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode an event as a single newline-terminated JSON line.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json_line(event: &Event) -> Result<Bytes, ProtocolError> {
    let mut buf = serde_json::to_vec(event)?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}

/// Encode an event as a complete SSE frame (`event:` + `data:` lines).
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_sse(event: &Event) -> Result<String, ProtocolError> {
    let data = serde_json::to_string(event)?;
    Ok(format!("event: {}\ndata: {}\n\n", event.event.as_str(), data))
}

/// Encode an event as length-prefixed MessagePack.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded event
///
/// # Errors
///
/// Returns an error if the event is too large or encoding fails.
pub fn encode(event: &Event) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an event into an existing buffer.
///
/// # Errors
///
/// Returns an error if the event is too large or encoding fails.
pub fn encode_into(event: &Event, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(event)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a length-prefixed MessagePack event.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Event, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_line_is_newline_terminated() {
        let event = Event::message(1, "alerts", 10, "hello");
        let line = encode_json_line(&event).unwrap();

        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
        let decoded: Event = serde_json::from_slice(&line[..line.len() - 1]).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_sse_frame_layout() {
        let frame = encode_sse(&Event::keepalive("alerts", 5)).unwrap();

        assert!(frame.starts_with("event: keepalive\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&Event::open("alerts", 1)).unwrap();

        match decode(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_bytes(0, 8);

        assert!(matches!(decode(&buf), Err(ProtocolError::FrameTooLarge(_))));
    }
}
