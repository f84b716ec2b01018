//! The directory service: accepts inbound peer connections, answers
//! `handshake`/`get_peers`/`update_pieces`/`upload` requests against a
//! shared [`Store`], and never terminates on a client error.

use crate::error::Error;
use crate::metadata::TorrentInfo;
use crate::store::Store;
use crate::wire;
use base64::Engine as _;
use serde_json::Value;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Inactivity timeout applied to every `recv` on a tracker connection.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `accept` blocks before rechecking the cancellation flag.
const ACCEPT_POLL: Duration = Duration::from_secs(3);

pub struct TrackerServer {
    listener: TcpListener,
    store: Arc<dyn Store>,
    running: Arc<AtomicBool>,
}

impl TrackerServer {
    pub fn bind(addr: &str, store: Arc<dyn Store>) -> crate::error::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(TrackerServer {
            listener,
            store,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// A clone-able flag a signal handler can flip to unblock the accept loop.
    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Runs the accept loop until `cancellation_token()` is cleared. Each
    /// inbound connection gets its own handler thread.
    pub fn run(&self) {
        log::info!("tracker listening on {}", self.local_addr());
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    log::info!("tracker accepted connection from {addr}");
                    let store = self.store.clone();
                    thread::spawn(move || handle_connection(stream, store));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    log::error!("tracker accept error: {e}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        log::info!("tracker shutting down");
    }
}

fn handle_connection(mut stream: TcpStream, store: Arc<dyn Store>) {
    let peer_addr = stream.peer_addr().ok();
    let mut bound_peer_id: Option<String> = None;
    loop {
        if stream.set_read_timeout(Some(CONNECTION_TIMEOUT)).is_err() {
            return;
        }
        let request = match wire::recv_message(&mut stream) {
            Ok(v) => v,
            Err(Error::ConnectError(_)) => {
                log::debug!("tracker connection from {peer_addr:?} closed");
                return;
            }
            Err(e) => {
                log::warn!("tracker connection from {peer_addr:?} timed out or errored: {e}");
                return;
            }
        };

        let response = dispatch(&request, &store, &mut bound_peer_id, peer_addr);
        if wire::send_message(&mut stream, &response).is_err() {
            return;
        }
    }
}

fn dispatch(
    request: &Value,
    store: &Arc<dyn Store>,
    bound_peer_id: &mut Option<String>,
    peer_addr: Option<std::net::SocketAddr>,
) -> Value {
    let req_type = match request.get("type").and_then(Value::as_str) {
        Some(t) => t,
        None => return wire::error_response("missing request type"),
    };
    match req_type {
        "handshake" => handle_handshake(request, store, bound_peer_id, peer_addr),
        "get_peers" => handle_get_peers(request, store, bound_peer_id),
        "update_pieces" => handle_update_pieces(request, store, bound_peer_id),
        "upload" => handle_upload(request, store, bound_peer_id),
        other => wire::error_response(format!("unknown request type: {other}")),
    }
}

fn handle_handshake(
    request: &Value,
    store: &Arc<dyn Store>,
    bound_peer_id: &mut Option<String>,
    peer_addr: Option<std::net::SocketAddr>,
) -> Value {
    let peer_id = match request.get("peer_id").and_then(Value::as_str) {
        Some(p) => p.to_string(),
        None => return wire::error_response("handshake missing peer_id"),
    };
    let ip = request
        .get("ip")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| peer_addr.map(|a| a.ip().to_string()))
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let port = request
        .get("port")
        .and_then(Value::as_u64)
        .map(|p| p as u16)
        .unwrap_or(0);

    if let Err(e) = store.upsert_peer(&peer_id, &ip, port) {
        return wire::error_response(e.to_string());
    }
    *bound_peer_id = Some(peer_id);
    wire::success_response()
}

fn handle_get_peers(request: &Value, store: &Arc<dyn Store>, bound_peer_id: &Option<String>) -> Value {
    let requesting_peer = match bound_peer_id {
        Some(p) => p.clone(),
        None => return wire::error_response("handshake required before get_peers"),
    };
    let info_hash = match request.get("info_hash").and_then(Value::as_str) {
        Some(h) => h,
        None => return wire::error_response("get_peers missing info_hash"),
    };
    let entry = match store.get_file(info_hash) {
        Ok(Some(e)) => e,
        Ok(None) => return wire::error_response(format!("unknown info_hash: {info_hash}")),
        Err(e) => return wire::error_response(e.to_string()),
    };

    let mut peers = Vec::new();
    for peer_info in entry.peers_info.iter().filter(|p| p.peer_id != requesting_peer) {
        let record = match store.get_peer(&peer_info.peer_id) {
            Ok(Some(r)) => r,
            _ => continue,
        };
        let mut pieces: Vec<u32> = peer_info.piece_indices.iter().copied().collect();
        pieces.sort_unstable();
        peers.push(serde_json::json!({
            "peer_id": record.peer_id,
            "ip_address": record.ip,
            "port": record.port,
            "pieces": pieces,
        }));
    }

    serde_json::json!({ "status": "success", "peers": peers })
}

fn handle_update_pieces(
    request: &Value,
    store: &Arc<dyn Store>,
    bound_peer_id: &Option<String>,
) -> Value {
    let requesting_peer = match bound_peer_id {
        Some(p) => p.clone(),
        None => return wire::error_response("handshake required before update_pieces"),
    };
    let info_hash = match request.get("info_hash").and_then(Value::as_str) {
        Some(h) => h,
        None => return wire::error_response("update_pieces missing info_hash"),
    };
    let pieces: HashSet<u32> = match request.get("pieces").and_then(Value::as_array) {
        Some(arr) => arr.iter().filter_map(Value::as_u64).map(|v| v as u32).collect(),
        None => return wire::error_response("update_pieces missing pieces"),
    };

    if let Ok(Some(info)) = store.get_torrent(info_hash) {
        if pieces.iter().any(|&i| i as usize >= info.piece_count()) {
            return wire::error_response("piece index out of range for torrent");
        }
    } else {
        return wire::error_response(format!("unknown info_hash: {info_hash}"));
    }

    match store.set_file_peers(info_hash, &requesting_peer, pieces) {
        Ok(()) => wire::success_response(),
        Err(e) => wire::error_response(e.to_string()),
    }
}

fn handle_upload(request: &Value, store: &Arc<dyn Store>, bound_peer_id: &Option<String>) -> Value {
    let peer_id = match bound_peer_id {
        Some(p) => p.clone(),
        None => return wire::error_response("handshake required before upload"),
    };
    let name = match request.get("name").and_then(Value::as_str) {
        Some(n) => n.to_string(),
        None => return wire::error_response("upload missing name"),
    };
    let piece_length = match request.get("piece_length").and_then(Value::as_u64) {
        Some(p) => p as u32,
        None => return wire::error_response("upload missing piece_length"),
    };
    let length = match request.get("length").and_then(Value::as_u64) {
        Some(l) => l,
        None => return wire::error_response("upload missing length"),
    };
    let pieces_b64: Vec<String> = match request.get("pieces_b64").and_then(Value::as_array) {
        Some(arr) => arr
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        None => return wire::error_response("upload missing pieces_b64"),
    };

    let mut piece_bytes = Vec::with_capacity(pieces_b64.len());
    for encoded in &pieces_b64 {
        match base64::engine::general_purpose::STANDARD.decode(encoded) {
            Ok(bytes) => piece_bytes.push(bytes),
            Err(e) => return wire::error_response(format!("invalid base64 piece: {e}")),
        }
    }

    let hashes = crate::metadata::hash_pieces(&piece_bytes);
    let info = TorrentInfo::new(name, piece_length, length, &hashes);
    let info_hash = match info.info_hash() {
        Ok(h) => h,
        Err(e) => return wire::error_response(e.to_string()),
    };

    if let Err(e) = store.add_torrent(&info_hash, &info) {
        return wire::error_response(e.to_string());
    }
    let all_indices: HashSet<u32> = (0..info.piece_count() as u32).collect();
    if let Err(e) = store.set_file_peers(&info_hash, &peer_id, all_indices) {
        return wire::error_response(e.to_string());
    }
    for (index, bytes) in piece_bytes.into_iter().enumerate() {
        if let Err(e) = store.put_piece(&peer_id, &info_hash, index as u32, bytes) {
            return wire::error_response(e.to_string());
        }
    }

    serde_json::json!({ "status": "success", "info_hash": info_hash })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::thread;

    fn spawn_tracker() -> (std::net::SocketAddr, Arc<AtomicBool>) {
        let server = TrackerServer::bind("127.0.0.1:0", Arc::new(MemoryStore::new())).unwrap();
        let addr = server.local_addr();
        let token = server.cancellation_token();
        thread::spawn(move || server.run());
        (addr, token)
    }

    fn connect_and_handshake(addr: std::net::SocketAddr, peer_id: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        wire::send_message(&mut stream, &wire::handshake_request(peer_id)).unwrap();
        let resp = wire::recv_message(&mut stream).unwrap();
        assert!(wire::is_success(&resp));
        stream
    }

    #[test]
    fn handshake_then_upload_then_get_peers_excludes_requester() {
        let (addr, _token) = spawn_tracker();

        let mut uploader = connect_and_handshake(addr, "seeder-1");
        let pieces_b64 = vec![base64::engine::general_purpose::STANDARD.encode(b"hello world!!!")];
        wire::send_message(
            &mut uploader,
            &serde_json::json!({
                "type": "upload",
                "peer_id": "seeder-1",
                "name": "hello.txt",
                "piece_length": 32 * 1024,
                "length": 14,
                "pieces_b64": pieces_b64,
            }),
        )
        .unwrap();
        let resp = wire::recv_message(&mut uploader).unwrap();
        assert!(wire::is_success(&resp));
        let info_hash = resp["info_hash"].as_str().unwrap().to_string();

        let mut leecher = connect_and_handshake(addr, "leecher-1");
        wire::send_message(
            &mut leecher,
            &serde_json::json!({ "type": "get_peers", "info_hash": info_hash }),
        )
        .unwrap();
        let resp = wire::recv_message(&mut leecher).unwrap();
        let peers = resp["peers"].as_array().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0]["peer_id"], "seeder-1");

        // the uploader never sees itself in its own get_peers call
        wire::send_message(
            &mut uploader,
            &serde_json::json!({ "type": "get_peers", "info_hash": info_hash }),
        )
        .unwrap();
        let resp = wire::recv_message(&mut uploader).unwrap();
        assert!(resp["peers"].as_array().unwrap().is_empty());
    }

    #[test]
    fn unknown_info_hash_is_an_error_and_connection_stays_open() {
        let (addr, _token) = spawn_tracker();
        let mut conn = connect_and_handshake(addr, "peer-x");
        wire::send_message(
            &mut conn,
            &serde_json::json!({ "type": "get_peers", "info_hash": "deadbeef" }),
        )
        .unwrap();
        let resp = wire::recv_message(&mut conn).unwrap();
        assert_eq!(resp["status"], "error");

        // connection still usable afterwards
        wire::send_message(&mut conn, &wire::handshake_request("peer-x")).unwrap();
        let resp = wire::recv_message(&mut conn).unwrap();
        assert!(wire::is_success(&resp));
    }

    #[test]
    fn update_pieces_requires_prior_handshake() {
        let (addr, _token) = spawn_tracker();
        let mut conn = TcpStream::connect(addr).unwrap();
        wire::send_message(
            &mut conn,
            &serde_json::json!({ "type": "update_pieces", "info_hash": "deadbeef", "pieces": [0] }),
        )
        .unwrap();
        let resp = wire::recv_message(&mut conn).unwrap();
        assert_eq!(resp["status"], "error");
    }
}
