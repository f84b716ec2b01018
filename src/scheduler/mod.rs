//! The piece scheduler: the concurrent machinery that turns a list of
//! candidate peers and a `TorrentInfo` into a fully verified, ordered set
//! of piece bytes. One worker thread per candidate peer, a priority queue
//! of `PieceRequest`s, adaptive peer scoring, and reassignment on peer loss.

use crate::error::{Error, Result};
use crate::metadata::TorrentInfo;
use crate::wire;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const MAX_RETRIES: u32 = 5;
const RECONNECT_TIMEOUT: Duration = Duration::from_secs(6);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const QUEUE_POLL: Duration = Duration::from_millis(500);
const PIECE_TRANSFER_TIMEOUT: Duration = Duration::from_secs(10);
const COMPLETION_POLL: Duration = Duration::from_millis(50);
const REQUEUE_YIELD: Duration = Duration::from_millis(10);
const CONNECTED_AFFINITY_BONUS: f64 = 2.0;
const LOAD_BALANCE_PENALTY: f64 = 0.1;
/// Reference throughput the capacity term is normalized against.
const SPEED_NORM_BYTES_PER_SEC: f64 = 1024.0 * 1024.0;
/// EMA smoothing factor applied to each new speed sample.
const SPEED_EMA_ALPHA: f64 = 0.3;
/// `success_rate` assumed for a peer with no completed or failed requests yet.
const UNKNOWN_SUCCESS_RATE: f64 = 0.5;

/// A peer advertised for this torrent's swarm: identity plus the piece
/// indices it claims to hold.
#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub peer_id: String,
    pub ip: String,
    pub port: u16,
    pub pieces: HashSet<u32>,
}

impl PeerCandidate {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    InFlight,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct QueueEntry {
    piece_index: u32,
    assigned_peer_id: Option<String>,
    attempts: u32,
    priority: u32,
}

// BinaryHeap is a max-heap; we want the smallest (priority, attempts) to
// dequeue first, so `Ord` is inverted here.
impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.attempts == other.attempts
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.attempts).cmp(&(self.priority, self.attempts))
    }
}

struct WorkQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    condvar: Condvar,
}

impl WorkQueue {
    fn new() -> Self {
        WorkQueue {
            heap: Mutex::new(BinaryHeap::new()),
            condvar: Condvar::new(),
        }
    }

    fn push(&self, entry: QueueEntry) {
        let mut heap = self.heap.lock().unwrap();
        heap.push(entry);
        self.condvar.notify_all();
    }

    /// Waits up to `timeout` for an entry; `None` means the queue was empty
    /// at the deadline (the caller should recheck the running flag).
    fn pop_timeout(&self, timeout: Duration) -> Option<QueueEntry> {
        let heap = self.heap.lock().unwrap();
        let (mut heap, _) = self
            .condvar
            .wait_timeout_while(heap, timeout, |h| h.is_empty())
            .unwrap();
        heap.pop()
    }

    fn drain_for_peer(&self, peer_id: &str) -> Vec<QueueEntry> {
        let mut heap = self.heap.lock().unwrap();
        let (for_peer, rest): (Vec<_>, Vec<_>) = heap
            .drain()
            .partition(|e| e.assigned_peer_id.as_deref() == Some(peer_id));
        *heap = rest.into_iter().collect();
        for_peer
    }
}

/// Per-peer throughput and reliability stats the §4.5.1 formula is computed
/// from: `score = min(ema_speed / 1 MiB·s⁻¹, 10) + success_rate * 5`. The
/// connected-peer affinity term is folded in separately by `effective_score`
/// since it depends on live connection state, not track record.
#[derive(Default, Clone, Copy)]
struct PeerStats {
    ema_speed: f64,
    successes: u32,
    attempts: u32,
}

impl PeerStats {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            UNKNOWN_SUCCESS_RATE
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }

    fn score(&self) -> f64 {
        (self.ema_speed / SPEED_NORM_BYTES_PER_SEC).min(10.0) + self.success_rate() * 5.0
    }
}

#[derive(Default)]
struct PeerScores {
    stats: HashMap<String, PeerStats>,
}

impl PeerScores {
    fn seed(&mut self, peer_id: &str) {
        self.stats.entry(peer_id.to_string()).or_default();
    }

    fn bump_success(&mut self, peer_id: &str, sample_bytes_per_sec: f64) {
        let s = self.stats.entry(peer_id.to_string()).or_default();
        s.attempts += 1;
        s.successes += 1;
        s.ema_speed = (1.0 - SPEED_EMA_ALPHA) * s.ema_speed + SPEED_EMA_ALPHA * sample_bytes_per_sec;
    }

    fn bump_failure(&mut self, peer_id: &str) {
        let s = self.stats.entry(peer_id.to_string()).or_default();
        s.attempts += 1;
    }

    fn base(&self, peer_id: &str) -> f64 {
        self.stats.get(peer_id).copied().unwrap_or_default().score()
    }
}

/// Outcome of a completed scheduler run: verified piece bytes in ascending
/// index order, ready for [`crate::metadata::combine_pieces`].
pub struct DownloadResult {
    pub pieces: Vec<Vec<u8>>,
    pub download_history: HashMap<String, HashSet<u32>>,
}

pub struct Scheduler {
    torrent: TorrentInfo,
    info_hash: String,
    my_peer_id: String,
    peers: Vec<PeerCandidate>,
    needed: Vec<u32>,

    queue: WorkQueue,
    completed_pieces: Mutex<HashSet<u32>>,
    active_downloads: Mutex<HashMap<u32, Vec<u8>>>,
    failed_pieces: Mutex<HashMap<u32, u32>>,
    connected_peers: Mutex<HashMap<String, TcpStream>>,
    peer_scores: Mutex<PeerScores>,
    download_history: Mutex<HashMap<String, HashSet<u32>>>,
    peer_assignments: Mutex<HashMap<String, usize>>,
    unavailable_pieces: Mutex<HashSet<u32>>,
    evicted_peers: Mutex<HashSet<String>>,
    connect_lock: Mutex<()>,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        torrent: TorrentInfo,
        info_hash: String,
        my_peer_id: String,
        peers: Vec<PeerCandidate>,
    ) -> Arc<Self> {
        let needed: Vec<u32> = (0..torrent.piece_count() as u32).collect();
        let mut scores = PeerScores::default();
        for p in &peers {
            scores.seed(&p.peer_id);
        }

        let scheduler = Arc::new(Scheduler {
            torrent,
            info_hash,
            my_peer_id,
            peers,
            needed,
            queue: WorkQueue::new(),
            completed_pieces: Mutex::new(HashSet::new()),
            active_downloads: Mutex::new(HashMap::new()),
            failed_pieces: Mutex::new(HashMap::new()),
            connected_peers: Mutex::new(HashMap::new()),
            peer_scores: Mutex::new(scores),
            download_history: Mutex::new(HashMap::new()),
            peer_assignments: Mutex::new(HashMap::new()),
            unavailable_pieces: Mutex::new(HashSet::new()),
            evicted_peers: Mutex::new(HashSet::new()),
            connect_lock: Mutex::new(()),
            running: Arc::new(AtomicBool::new(true)),
        });
        scheduler.initial_assignment();
        scheduler
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    fn effective_score(&self, peer_id: &str) -> f64 {
        let base = self.peer_scores.lock().unwrap().base(peer_id);
        let bonus = if self.connected_peers.lock().unwrap().contains_key(peer_id) {
            CONNECTED_AFFINITY_BONUS
        } else {
            0.0
        };
        base + bonus
    }

    fn initial_assignment(&self) {
        let mut assigned_counts: HashMap<String, u32> = HashMap::new();
        for &index in &self.needed {
            let best = self
                .peers
                .iter()
                .filter(|p| p.pieces.contains(&index))
                .map(|p| {
                    let penalty = LOAD_BALANCE_PENALTY * *assigned_counts.get(&p.peer_id).unwrap_or(&0) as f64;
                    (p.peer_id.clone(), self.effective_score(&p.peer_id) - penalty)
                })
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| b.0.cmp(&a.0)));

            match best {
                Some((peer_id, _)) => {
                    *assigned_counts.entry(peer_id.clone()).or_insert(0) += 1;
                    self.queue.push(QueueEntry {
                        piece_index: index,
                        assigned_peer_id: Some(peer_id),
                        attempts: 0,
                        priority: 0,
                    });
                }
                None => {
                    // Enqueued-then-diverted: no candidate ever claims this
                    // piece, so there is nothing a worker could do with it.
                    self.unavailable_pieces.lock().unwrap().insert(index);
                }
            }
        }
    }

    fn ensure_connection(&self, peer: &PeerCandidate) -> Result<()> {
        {
            let connected = self.connected_peers.lock().unwrap();
            if connected.contains_key(&peer.peer_id) {
                return Ok(());
            }
        }
        let _connect_guard = self.connect_lock.lock().unwrap();
        // Re-check: another worker may have connected while we waited.
        {
            let connected = self.connected_peers.lock().unwrap();
            if connected.contains_key(&peer.peer_id) {
                return Ok(());
            }
        }

        let deadline = Instant::now() + RECONNECT_TIMEOUT;
        loop {
            match self.try_connect_and_handshake(peer) {
                Ok(stream) => {
                    self.connected_peers.lock().unwrap().insert(peer.peer_id.clone(), stream);
                    return Ok(());
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    thread::sleep(RECONNECT_BACKOFF);
                }
            }
        }
    }

    fn try_connect_and_handshake(&self, peer: &PeerCandidate) -> Result<TcpStream> {
        let addr = peer
            .addr()
            .parse()
            .map_err(|e| Error::ConnectError(format!("bad peer address {}: {e}", peer.addr())))?;
        let mut stream = TcpStream::connect_timeout(&addr, wire::DEFAULT_IO_TIMEOUT)
            .map_err(|e| Error::ConnectError(format!("connect to {}: {e}", peer.addr())))?;
        wire::set_default_timeouts(&stream)?;
        wire::send_message(&mut stream, &wire::handshake_request(&self.my_peer_id))?;
        let resp = wire::recv_message(&mut stream)?;
        if !wire::is_success(&resp) {
            return Err(Error::ConnectError(format!("handshake rejected by {}", peer.peer_id)));
        }
        Ok(stream)
    }

    fn reassign_on_peer_loss(&self, lost_peer_id: &str) {
        self.evicted_peers.lock().unwrap().insert(lost_peer_id.to_string());
        self.connected_peers.lock().unwrap().remove(lost_peer_id);
        self.peer_assignments.lock().unwrap().remove(lost_peer_id);

        for entry in self.queue.drain_for_peer(lost_peer_id) {
            let evicted = self.evicted_peers.lock().unwrap();
            let best = self
                .peers
                .iter()
                .filter(|p| p.peer_id != lost_peer_id && !evicted.contains(&p.peer_id))
                .filter(|p| p.pieces.contains(&entry.piece_index))
                .map(|p| (p.peer_id.clone(), self.effective_score(&p.peer_id)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then_with(|| b.0.cmp(&a.0)));
            drop(evicted);

            match best {
                Some((peer_id, _)) => {
                    self.queue.push(QueueEntry {
                        piece_index: entry.piece_index,
                        assigned_peer_id: Some(peer_id),
                        attempts: entry.attempts,
                        priority: entry.priority,
                    });
                }
                None => {
                    self.unavailable_pieces.lock().unwrap().insert(entry.piece_index);
                    log::warn!("piece {} unavailable: no live peer claims it after reassignment", entry.piece_index);
                }
            }
        }
    }

    fn record_failure(&self, entry: QueueEntry, peer_id: &str) {
        self.peer_scores.lock().unwrap().bump_failure(peer_id);
        let attempts = {
            let mut failed = self.failed_pieces.lock().unwrap();
            let count = failed.entry(entry.piece_index).or_insert(0);
            *count += 1;
            *count
        };
        if attempts < MAX_RETRIES {
            self.queue.push(QueueEntry {
                piece_index: entry.piece_index,
                assigned_peer_id: Some(peer_id.to_string()),
                attempts: entry.attempts + 1,
                priority: 1,
            });
        } else {
            log::error!("piece {} abandoned after {attempts} attempts", entry.piece_index);
        }
    }

    fn record_success(&self, peer_id: &str, index: u32, bytes: Vec<u8>, sample_bytes_per_sec: f64) {
        self.completed_pieces.lock().unwrap().insert(index);
        self.active_downloads.lock().unwrap().insert(index, bytes);
        self.download_history
            .lock()
            .unwrap()
            .entry(peer_id.to_string())
            .or_default()
            .insert(index);
        self.peer_scores.lock().unwrap().bump_success(peer_id, sample_bytes_per_sec);
    }

    fn process_entry(&self, entry: QueueEntry, peer: &PeerCandidate) {
        let piece_index = entry.piece_index;
        let expected_hash = match self.torrent.piece_hash(piece_index) {
            Some(h) => h,
            None => {
                log::error!("piece index {piece_index} out of range for torrent");
                return;
            }
        };

        // The stream is taken out of the shared map for the duration of the
        // I/O so the peer lock is never held across a blocking call; it is
        // put back only on success. A connection-level error simply leaves
        // it removed, which is exactly the eviction the caller needs.
        let taken = self.connected_peers.lock().unwrap().remove(&peer.peer_id);
        let mut stream = match taken {
            Some(s) => s,
            None => {
                self.queue.push(entry);
                self.reassign_on_peer_loss(&peer.peer_id);
                return;
            }
        };

        let started = Instant::now();
        let outcome: Result<Vec<u8>> = (|| {
            stream.set_read_timeout(Some(PIECE_TRANSFER_TIMEOUT))?;
            wire::send_message(
                &mut stream,
                &serde_json::json!({
                    "type": "request_piece",
                    "piece_index": piece_index,
                    "peer_id": self.my_peer_id,
                    "info_hash": self.info_hash,
                }),
            )?;
            let response = wire::recv_message(&mut stream)?;
            if response.get("status").and_then(serde_json::Value::as_str) == Some("error") {
                return Err(Error::ProtocolError(
                    response
                        .get("message")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("peer returned an error")
                        .to_string(),
                ));
            }
            let encoded = response
                .get("piece_data")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| Error::ProtocolError("response missing piece_data".into()))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| Error::ProtocolError(format!("invalid base64 piece data: {e}")))?;

            let mut hasher = Sha1::new();
            hasher.update(&bytes);
            let actual: [u8; 20] = hasher.finalize().into();
            if actual != expected_hash {
                return Err(Error::HashMismatch(format!("piece {piece_index} failed verification")));
            }
            wire::send_ack(&mut stream)?;
            Ok(bytes)
        })();

        // The connection itself is still healthy unless the failure was a
        // transport-level error; a hash mismatch or protocol error is the
        // remote peer behaving badly, not a dead socket, so the stream goes
        // back in the pool for this worker's next request.
        let connection_alive = !matches!(
            outcome,
            Err(Error::ConnectError(_)) | Err(Error::Timeout(_)) | Err(Error::IoError(_))
        );
        if connection_alive {
            self.connected_peers.lock().unwrap().insert(peer.peer_id.clone(), stream);
        }

        match outcome {
            Ok(bytes) => {
                let elapsed = started.elapsed().as_secs_f64().max(1e-6);
                let sample_speed = bytes.len() as f64 / elapsed;
                self.record_success(&peer.peer_id, piece_index, bytes, sample_speed);
            }
            Err(Error::HashMismatch(msg)) => {
                log::warn!("{msg}; not ack'ing, penalizing {}", peer.peer_id);
                self.record_failure(entry, &peer.peer_id);
            }
            Err(Error::ConnectError(_)) | Err(Error::Timeout(_)) | Err(Error::IoError(_)) => {
                log::warn!("connection to {} lost mid-transfer, evicting", peer.peer_id);
                self.queue.push(entry); // retry the same request once reassigned
                self.reassign_on_peer_loss(&peer.peer_id);
            }
            Err(e) => {
                log::warn!("piece {piece_index} request to {} failed: {e}", peer.peer_id);
                self.record_failure(entry, &peer.peer_id);
            }
        }
    }

    fn worker_loop(&self, worker_id: usize, peer: &PeerCandidate) {
        loop {
            if !self.running.load(AtomicOrdering::SeqCst) {
                return;
            }
            if self.evicted_peers.lock().unwrap().contains(&peer.peer_id) {
                return;
            }
            let entry = match self.queue.pop_timeout(QUEUE_POLL) {
                Some(e) => e,
                None => continue,
            };

            let entry = match &entry.assigned_peer_id {
                Some(pid) if pid != &peer.peer_id => {
                    self.queue.push(entry);
                    thread::sleep(REQUEUE_YIELD);
                    continue;
                }
                Some(_) => entry,
                None => {
                    let mut assignments = self.peer_assignments.lock().unwrap();
                    assignments.entry(peer.peer_id.clone()).or_insert(worker_id);
                    drop(assignments);
                    QueueEntry {
                        assigned_peer_id: Some(peer.peer_id.clone()),
                        ..entry
                    }
                }
            };

            if let Err(e) = self.ensure_connection(peer) {
                log::error!("worker {worker_id} could not (re)connect to {}: {e}", peer.peer_id);
                self.queue.push(entry);
                self.reassign_on_peer_loss(&peer.peer_id);
                self.peer_assignments.lock().unwrap().remove(&peer.peer_id);
                return;
            }

            self.process_entry(entry, peer);
        }
    }

    fn is_done(&self) -> bool {
        self.completed_pieces.lock().unwrap().len() == self.needed.len()
    }

    fn retries_exhausted_pieces(&self) -> Vec<u32> {
        let completed = self.completed_pieces.lock().unwrap();
        let failed = self.failed_pieces.lock().unwrap();
        self.needed
            .iter()
            .copied()
            .filter(|i| !completed.contains(i) && *failed.get(i).unwrap_or(&0) >= MAX_RETRIES)
            .collect()
    }

    /// Runs the full scheduler: spawns one worker thread per candidate peer,
    /// polls for the completion predicate, and returns the verified pieces
    /// in ascending index order on success.
    pub fn run(self: &Arc<Self>) -> Result<DownloadResult> {
        if self.needed.is_empty() {
            return Ok(DownloadResult { pieces: Vec::new(), download_history: HashMap::new() });
        }
        if !self.unavailable_pieces.lock().unwrap().is_empty() {
            let mut missing: Vec<u32> = self.unavailable_pieces.lock().unwrap().iter().copied().collect();
            missing.sort_unstable();
            return Err(Error::Unavailable(missing));
        }

        let handles: Vec<_> = self
            .peers
            .iter()
            .enumerate()
            .map(|(worker_id, peer)| {
                let scheduler = self.clone();
                let peer = peer.clone();
                thread::spawn(move || scheduler.worker_loop(worker_id, &peer))
            })
            .collect();

        let result = loop {
            if !self.running.load(AtomicOrdering::SeqCst) {
                break Err(Error::Cancelled);
            }
            if self.is_done() {
                break Ok(());
            }
            if !self.unavailable_pieces.lock().unwrap().is_empty() {
                let mut missing: Vec<u32> = self.unavailable_pieces.lock().unwrap().iter().copied().collect();
                missing.sort_unstable();
                break Err(Error::Unavailable(missing));
            }
            let exhausted = self.retries_exhausted_pieces();
            if !exhausted.is_empty() {
                let still_pending = self.needed.len() - self.completed_pieces.lock().unwrap().len();
                if exhausted.len() == still_pending {
                    break Err(Error::RetriesExhausted(exhausted));
                }
            }
            thread::sleep(COMPLETION_POLL);
        };

        self.running.store(false, AtomicOrdering::SeqCst);
        for handle in handles {
            let _ = handle.join();
        }

        result?;
        let active = self.active_downloads.lock().unwrap();
        let pieces = self
            .needed
            .iter()
            .map(|i| active.get(i).cloned().unwrap_or_default())
            .collect();
        Ok(DownloadResult {
            pieces,
            download_history: self.download_history.lock().unwrap().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::session::PeerSession;
    use crate::store::{MemoryStore, Store};
    use crate::metadata::TorrentInfo;

    fn spawn_seeder(peer_id: &str, pieces: &[(u32, Vec<u8>)]) -> std::net::SocketAddr {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        for (index, bytes) in pieces {
            store.put_piece(peer_id, "test-hash", *index, bytes.clone()).unwrap();
        }
        let session = PeerSession::bind("127.0.0.1:0", peer_id.to_string(), store).unwrap();
        let addr = session.local_addr();
        thread::spawn(move || session.run());
        addr
    }

    fn candidate(peer_id: &str, addr: std::net::SocketAddr, pieces: &[u32]) -> PeerCandidate {
        PeerCandidate {
            peer_id: peer_id.to_string(),
            ip: addr.ip().to_string(),
            port: addr.port(),
            pieces: pieces.iter().copied().collect(),
        }
    }

    fn torrent_for(pieces: &[Vec<u8>]) -> TorrentInfo {
        let hashes = crate::metadata::hash_pieces(pieces);
        let total: u64 = pieces.iter().map(|p| p.len() as u64).sum();
        TorrentInfo::new("test.bin".into(), 32 * 1024, total, &hashes)
    }

    #[test]
    fn single_peer_round_trip() {
        let piece0 = b"hello world!!!".to_vec();
        let torrent = torrent_for(&[piece0.clone()]);
        let addr = spawn_seeder("seeder-1", &[(0, piece0.clone())]);
        let peers = vec![candidate("seeder-1", addr, &[0])];

        let scheduler = Scheduler::new(torrent, "test-hash".into(), "leecher-1".into(), peers);
        let result = scheduler.run().unwrap();
        assert_eq!(result.pieces, vec![piece0]);
    }

    #[test]
    fn three_piece_swarm_with_two_full_seeders() {
        let pieces: Vec<Vec<u8>> = (0..3).map(|i| vec![i as u8; 32 * 1024]).collect();
        let torrent = torrent_for(&pieces);
        let indexed: Vec<(u32, Vec<u8>)> = pieces.iter().cloned().enumerate().map(|(i, p)| (i as u32, p)).collect();
        let addr_a = spawn_seeder("seeder-a", &indexed);
        let addr_b = spawn_seeder("seeder-b", &indexed);
        let peers = vec![
            candidate("seeder-a", addr_a, &[0, 1, 2]),
            candidate("seeder-b", addr_b, &[0, 1, 2]),
        ];

        let scheduler = Scheduler::new(torrent, "test-hash".into(), "leecher-1".into(), peers);
        let result = scheduler.run().unwrap();
        assert_eq!(result.pieces, pieces);
        let total_attributed: usize = result.download_history.values().map(|s| s.len()).sum();
        assert_eq!(total_attributed, 3);
    }

    #[test]
    fn partial_coverage_across_two_peers() {
        let pieces: Vec<Vec<u8>> = (0..3).map(|i| vec![i as u8; 32 * 1024]).collect();
        let torrent = torrent_for(&pieces);
        let idx = |i: u32| (i, pieces[i as usize].clone());
        let addr_a = spawn_seeder("peer-a", &[idx(0), idx(1)]);
        let addr_b = spawn_seeder("peer-b", &[idx(1), idx(2)]);
        let peers = vec![
            candidate("peer-a", addr_a, &[0, 1]),
            candidate("peer-b", addr_b, &[1, 2]),
        ];

        let scheduler = Scheduler::new(torrent, "test-hash".into(), "leecher-1".into(), peers);
        let result = scheduler.run().unwrap();
        assert_eq!(result.pieces, pieces);
    }

    #[test]
    fn no_peer_claims_a_piece_surfaces_unavailable() {
        let pieces: Vec<Vec<u8>> = (0..2).map(|i| vec![i as u8; 32 * 1024]).collect();
        let torrent = torrent_for(&pieces);
        let addr = spawn_seeder("peer-a", &[(0, pieces[0].clone())]);
        let peers = vec![candidate("peer-a", addr, &[0])]; // nobody claims piece 1

        let scheduler = Scheduler::new(torrent, "test-hash".into(), "leecher-1".into(), peers);
        match scheduler.run() {
            Err(Error::Unavailable(missing)) => assert_eq!(missing, vec![1]),
            other => panic!("expected Unavailable, got {:?}", other.map(|r| r.pieces.len())),
        }
    }

    #[test]
    fn zero_piece_torrent_completes_as_a_no_op() {
        let torrent = torrent_for(&[]);
        let scheduler = Scheduler::new(torrent, "test-hash".into(), "leecher-1".into(), Vec::new());
        let result = scheduler.run().unwrap();
        assert!(result.pieces.is_empty());
    }
}
