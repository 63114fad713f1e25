//! Hardware serial-radio adapter (§4.8).
//!
//! No teacher file touches a physical serial port, and `serialport` is not
//! present in the retrieved corpus; it is the standard real crate for this
//! exact job, picked per DESIGN.md's noted gap. Framing discipline (a
//! length-prefixed byte stream) is this crate's own addition, needed
//! because a raw serial byte stream has no built-in frame boundaries the
//! way a Meshtastic firmware link would provide.

use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::adapter::{check_frame_size, RadioAdapter, RadioError, MAX_CHUNK_SIZE};

/// `[node_id_len: u8][node_id bytes][frame_len: u8][frame bytes]`.
fn encode_frame(node_id: &str, frame: &[u8]) -> Result<Vec<u8>, RadioError> {
    check_frame_size(frame)?;
    if node_id.len() > u8::MAX as usize {
        return Err(RadioError::SendFailed(format!(
            "node id {node_id:?} too long for serial framing"
        )));
    }
    let mut out = Vec::with_capacity(2 + node_id.len() + frame.len());
    out.push(node_id.len() as u8);
    out.extend_from_slice(node_id.as_bytes());
    out.push(frame.len() as u8);
    out.extend_from_slice(frame);
    Ok(out)
}

fn decode_frame(bytes: &[u8]) -> Result<(String, Bytes), RadioError> {
    let mut cursor = bytes;
    let id_len = *cursor
        .first()
        .ok_or_else(|| RadioError::SendFailed("truncated serial frame".into()))? as usize;
    cursor = &cursor[1..];
    if cursor.len() < id_len {
        return Err(RadioError::SendFailed("truncated node id".into()));
    }
    let node_id = String::from_utf8_lossy(&cursor[..id_len]).into_owned();
    cursor = &cursor[id_len..];
    let frame_len = *cursor
        .first()
        .ok_or_else(|| RadioError::SendFailed("truncated serial frame".into()))? as usize;
    cursor = &cursor[1..];
    if cursor.len() < frame_len {
        return Err(RadioError::SendFailed("truncated frame body".into()));
    }
    Ok((node_id, Bytes::copy_from_slice(&cursor[..frame_len])))
}

/// Wraps a `serialport::SerialPort` behind the [`RadioAdapter`] contract.
pub struct SerialRadioAdapter {
    node_id: String,
    port: Mutex<Box<dyn serialport::SerialPort>>,
}

impl SerialRadioAdapter {
    pub fn open(node_id: impl Into<String>, port_name: &str, baud_rate: u32) -> Result<Self, RadioError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(Duration::from_secs(5))
            .open()
            .map_err(|e| RadioError::SendFailed(format!("failed to open {port_name}: {e}")))?;
        Ok(SerialRadioAdapter {
            node_id: node_id.into(),
            port: Mutex::new(port),
        })
    }
}

impl RadioAdapter for SerialRadioAdapter {
    fn send(&self, _destination_node_id: &str, frame: Bytes) -> Result<(), RadioError> {
        let encoded = encode_frame(&self.node_id, &frame)?;
        let mut port = self.port.lock().unwrap();
        port.write_all(&encoded)
            .map_err(|e| RadioError::SendFailed(e.to_string()))?;
        port.flush().map_err(|e| RadioError::SendFailed(e.to_string()))
    }

    fn recv(&self) -> Result<(String, Bytes), RadioError> {
        let mut port = self.port.lock().unwrap();

        let mut id_len_buf = [0u8; 1];
        port.read_exact(&mut id_len_buf)
            .map_err(|e| RadioError::SendFailed(e.to_string()))?;
        let id_len = id_len_buf[0] as usize;

        let mut id_buf = vec![0u8; id_len];
        port.read_exact(&mut id_buf)
            .map_err(|e| RadioError::SendFailed(e.to_string()))?;

        let mut frame_len_buf = [0u8; 1];
        port.read_exact(&mut frame_len_buf)
            .map_err(|e| RadioError::SendFailed(e.to_string()))?;
        let frame_len = frame_len_buf[0] as usize;
        if frame_len > MAX_CHUNK_SIZE {
            warn!(frame_len, "peer sent an oversize frame, dropping connection state");
            return Err(RadioError::FrameTooLarge {
                actual: frame_len,
                limit: MAX_CHUNK_SIZE,
            });
        }

        let mut body = BytesMut::zeroed(frame_len);
        port.read_exact(&mut body)
            .map_err(|e| RadioError::SendFailed(e.to_string()))?;

        Ok((String::from_utf8_lossy(&id_buf).into_owned(), body.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let encoded = encode_frame("nodeA", b"hello").unwrap();
        let (node_id, frame) = decode_frame(&encoded).unwrap();
        assert_eq!(node_id, "nodeA");
        assert_eq!(frame, Bytes::from_static(b"hello"));
    }

    #[test]
    fn oversize_frame_rejected_at_encode() {
        let big = vec![0u8; 231];
        let err = encode_frame("nodeA", &big).unwrap_err();
        assert!(matches!(err, RadioError::FrameTooLarge { .. }));
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let err = decode_frame(&[5, b'n', b'o', b'd']).unwrap_err();
        assert!(matches!(err, RadioError::SendFailed(_)));
    }
}
