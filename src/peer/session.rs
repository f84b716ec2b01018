//! Serving side of the peer wire protocol: an inbound TCP listener that
//! answers `handshake` and `request_piece` messages out of a local [`Store`].

use crate::error::Error;
use crate::store::Store;
use crate::wire;
use base64::Engine as _;
use serde_json::Value;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_secs(3);

pub struct PeerSession {
    listener: TcpListener,
    store: Arc<dyn Store>,
    self_peer_id: String,
    running: Arc<AtomicBool>,
}

impl PeerSession {
    pub fn bind(addr: &str, self_peer_id: String, store: Arc<dyn Store>) -> crate::error::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(PeerSession {
            listener,
            store,
            self_peer_id,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.listener.local_addr().unwrap()
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Runs the inbound accept loop until the cancellation token clears.
    pub fn run(&self) {
        log::info!("peer listener ({}) bound on {}", self.self_peer_id, self.local_addr());
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::info!("peer session accepted connection from {addr}");
                    let store = self.store.clone();
                    let self_peer_id = self.self_peer_id.clone();
                    thread::spawn(move || handle_connection(stream, self_peer_id, store));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::error!("peer listener accept error: {e}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        log::info!("peer listener ({}) shutting down", self.self_peer_id);
    }
}

fn handle_connection(mut stream: TcpStream, self_peer_id: String, store: Arc<dyn Store>) {
    let peer_addr = stream.peer_addr().ok();
    if wire::set_default_timeouts(&stream).is_err() {
        return;
    }

    let handshake = match wire::recv_message(&mut stream) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("peer session from {peer_addr:?} failed to handshake: {e}");
            return;
        }
    };
    if handshake.get("type").and_then(Value::as_str) != Some("handshake") {
        let _ = wire::send_message(&mut stream, &wire::error_response("expected handshake"));
        return;
    }
    let remote_peer_id = match handshake.get("peer_id").and_then(Value::as_str) {
        Some(p) => p.to_string(),
        None => {
            let _ = wire::send_message(&mut stream, &wire::error_response("handshake missing peer_id"));
            return;
        }
    };
    if wire::send_message(&mut stream, &wire::success_response()).is_err() {
        return;
    }
    log::info!("peer session bound to remote peer_id {remote_peer_id}");

    loop {
        let request = match wire::recv_message(&mut stream) {
            Ok(v) => v,
            Err(Error::ConnectError(_)) => return,
            Err(e) => {
                log::warn!("peer session with {remote_peer_id} errored: {e}");
                return;
            }
        };
        match request.get("type").and_then(Value::as_str) {
            Some("request_piece") => {
                if serve_piece_request(&mut stream, &request, &self_peer_id, &store).is_err() {
                    return;
                }
            }
            Some(other) => {
                if wire::send_message(&mut stream, &wire::error_response(format!("unknown request type: {other}"))).is_err() {
                    return;
                }
            }
            None => {
                if wire::send_message(&mut stream, &wire::error_response("missing request type")).is_err() {
                    return;
                }
            }
        }
    }
}

fn serve_piece_request(
    stream: &mut TcpStream,
    request: &Value,
    self_peer_id: &str,
    store: &Arc<dyn Store>,
) -> crate::error::Result<()> {
    let piece_index = request.get("piece_index").and_then(Value::as_u64).map(|v| v as u32);
    let info_hash = request.get("info_hash").and_then(Value::as_str).map(str::to_string);
    let (piece_index, info_hash) = match (piece_index, info_hash) {
        (Some(i), Some(h)) => (i, h),
        _ => return wire::send_message(stream, &wire::error_response("request_piece missing fields")),
    };

    let bytes = store.get_piece(self_peer_id, &info_hash, piece_index)?;
    let bytes = match bytes {
        Some(b) => b,
        None => return wire::send_message(stream, &wire::error_response("Piece not found")),
    };

    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    wire::send_message(
        stream,
        &serde_json::json!({
            "status": "success",
            "piece_index": piece_index,
            "piece_data": encoded,
            "end_marker": wire::END_MARKER,
        }),
    )?;

    match wire::wait_for_ack(stream, wire::ACK_WAIT_TIMEOUT) {
        Ok(true) => log::debug!("piece {piece_index} ack'd"),
        Ok(false) => log::warn!("no ACK received for piece {piece_index} within timeout"),
        Err(e) => log::warn!("error waiting for ACK on piece {piece_index}: {e}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn spawn_session(self_peer_id: &str, store: Arc<dyn Store>) -> std::net::SocketAddr {
        let session = PeerSession::bind("127.0.0.1:0", self_peer_id.to_string(), store).unwrap();
        let addr = session.local_addr();
        thread::spawn(move || session.run());
        addr
    }

    #[test]
    fn serves_known_piece_and_waits_for_ack() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.put_piece("seeder-1", "deadbeef", 0, b"hello world!!!".to_vec()).unwrap();
        let addr = spawn_session("seeder-1", store);

        let mut conn = TcpStream::connect(addr).unwrap();
        wire::send_message(&mut conn, &wire::handshake_request("leecher-1")).unwrap();
        let resp = wire::recv_message(&mut conn).unwrap();
        assert!(wire::is_success(&resp));

        wire::send_message(
            &mut conn,
            &serde_json::json!({ "type": "request_piece", "piece_index": 0, "peer_id": "leecher-1", "info_hash": "deadbeef" }),
        )
        .unwrap();
        let resp = wire::recv_message(&mut conn).unwrap();
        assert_eq!(resp["status"], "success");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(resp["piece_data"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"hello world!!!");
        wire::send_ack(&mut conn).unwrap();
    }

    #[test]
    fn missing_piece_returns_error() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let addr = spawn_session("seeder-1", store);

        let mut conn = TcpStream::connect(addr).unwrap();
        wire::send_message(&mut conn, &wire::handshake_request("leecher-1")).unwrap();
        wire::recv_message(&mut conn).unwrap();

        wire::send_message(
            &mut conn,
            &serde_json::json!({ "type": "request_piece", "piece_index": 0, "peer_id": "leecher-1", "info_hash": "deadbeef" }),
        )
        .unwrap();
        let resp = wire::recv_message(&mut conn).unwrap();
        assert_eq!(resp["status"], "error");
        assert_eq!(resp["message"], "Piece not found");
    }
}
