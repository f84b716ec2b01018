//! Per-peer and tracker wire framing: length-unbounded JSON objects over
//! TCP, chunked piece payloads terminated by a literal end marker, and the
//! three-byte `ACK` acknowledgement.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

pub const END_MARKER: &str = "###END###";
const ACK: &[u8] = b"ACK";
const CHUNK_SIZE: usize = 4096;

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);
pub const ACK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Applies the default 5s socket I/O timeout to both directions.
pub fn set_default_timeouts(stream: &TcpStream) -> Result<()> {
    stream.set_read_timeout(Some(DEFAULT_IO_TIMEOUT))?;
    stream.set_write_timeout(Some(DEFAULT_IO_TIMEOUT))?;
    Ok(())
}

/// Serializes `value` and writes it to `stream` in ~4KiB chunks.
pub fn send_message<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    for chunk in bytes.chunks(CHUNK_SIZE) {
        stream.write_all(chunk).map_err(map_io_timeout)?;
    }
    stream.flush().map_err(map_io_timeout)?;
    Ok(())
}

/// Distinguishes a socket read/write timeout from any other I/O failure, so
/// callers that care (the scheduler's peer-loss classification) can match on
/// `Error::Timeout` instead of a generic `Error::IoError`.
fn map_io_timeout(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout(e.to_string()),
        _ => Error::IoError(e),
    }
}

fn contains_end_marker(buf: &[u8]) -> bool {
    let marker = END_MARKER.as_bytes();
    buf.windows(marker.len()).any(|w| w == marker)
}

/// Reads from `stream` until a complete JSON object has accumulated, then
/// parses it. Tolerates arbitrary TCP fragmentation: small control messages
/// usually parse after the first `read`. Large piece payloads carry an
/// `end_marker` field, but `Value`'s key order is not the wire order, so its
/// presence in the buffer is only a hint to start attempting parses, never a
/// guarantee the object is complete; a failed parse after the marker is seen
/// just means more reads are still needed.
pub fn recv_message(stream: &mut TcpStream) -> Result<Value> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut marker_seen = false;
    loop {
        let n = stream.read(&mut chunk).map_err(map_io_timeout)?;
        if n == 0 {
            if buf.is_empty() {
                return Err(Error::ConnectError("connection closed by peer".into()));
            }
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        marker_seen = marker_seen || contains_end_marker(&buf);
        if marker_seen {
            if let Ok(v) = serde_json::from_slice::<Value>(&buf) {
                return Ok(v);
            }
        } else if let Ok(v) = serde_json::from_slice::<Value>(&buf) {
            return Ok(v);
        }
    }
    serde_json::from_slice(&buf)
        .map_err(|e| Error::ProtocolError(format!("malformed JSON message: {e}")))
}

/// Sends the literal `ACK` acknowledgement.
pub fn send_ack(stream: &mut TcpStream) -> Result<()> {
    stream.write_all(ACK)?;
    stream.flush()?;
    Ok(())
}

/// Waits up to `timeout` for the literal `ACK`. Returns `Ok(false)` on a
/// timeout; the caller logs it and does not retry the wait.
pub fn wait_for_ack(stream: &mut TcpStream, timeout: Duration) -> Result<bool> {
    stream.set_read_timeout(Some(timeout))?;
    let mut buf = [0u8; 3];
    match stream.read_exact(&mut buf) {
        Ok(()) => Ok(buf == ACK),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
        Err(e) => Err(Error::from(e)),
    }
}

pub fn handshake_request(peer_id: &str) -> Value {
    serde_json::json!({ "type": "handshake", "peer_id": peer_id })
}

/// A handshake that also announces the sender's own serving address, so the
/// tracker's `PeerRecord` for `peer_id` reflects where other peers can reach
/// it rather than the ephemeral port of the connection to the tracker.
pub fn handshake_request_with_addr(peer_id: &str, ip: &str, port: u16) -> Value {
    serde_json::json!({ "type": "handshake", "peer_id": peer_id, "ip": ip, "port": port })
}

pub fn success_response() -> Value {
    serde_json::json!({ "status": "success" })
}

pub fn error_response(message: impl Into<String>) -> Value {
    serde_json::json!({ "status": "error", "message": message.into() })
}

pub fn is_success(value: &Value) -> bool {
    value.get("status").and_then(Value::as_str) == Some("success")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpStream::connect(addr).unwrap();
        let server = handle.join().unwrap();
        (client, server)
    }

    #[test]
    fn small_control_message_round_trips() {
        let (mut client, mut server) = loopback_pair();
        thread::spawn(move || {
            send_message(&mut client, &handshake_request("peer-a")).unwrap();
        });
        let msg = recv_message(&mut server).unwrap();
        assert_eq!(msg["type"], "handshake");
        assert_eq!(msg["peer_id"], "peer-a");
    }

    #[test]
    fn large_payload_with_end_marker_round_trips() {
        let (mut client, mut server) = loopback_pair();
        let payload = serde_json::json!({
            "status": "success",
            "piece_index": 0,
            "piece_data": "A".repeat(20_000),
            "end_marker": END_MARKER,
        });
        let expected = payload.clone();
        thread::spawn(move || {
            send_message(&mut client, &payload).unwrap();
        });
        let msg = recv_message(&mut server).unwrap();
        assert_eq!(msg, expected);
    }

    #[test]
    fn ack_round_trips() {
        let (mut client, mut server) = loopback_pair();
        thread::spawn(move || {
            send_ack(&mut client).unwrap();
        });
        assert!(wait_for_ack(&mut server, Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn ack_wait_times_out_without_rollback() {
        let (_client, mut server) = loopback_pair();
        assert!(!wait_for_ack(&mut server, Duration::from_millis(100)).unwrap());
    }

    #[test]
    fn recv_on_a_silent_connection_times_out_as_timeout_not_io_error() {
        let (_client, mut server) = loopback_pair();
        server.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
        match recv_message(&mut server) {
            Err(Error::Timeout(_)) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }
}
