//! Persistence abstraction: an inverted index of which peers claim which
//! pieces for a torrent (`FileEntry`), plus the peer directory
//! (`PeerRecord`) it references. The tracker and the scheduler's finalizer
//! depend only on the `Store` trait; `MemoryStore` is one replaceable
//! implementation of it.

use crate::error::{Error, Result};
use crate::metadata::TorrentInfo;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: String,
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePeerInfo {
    pub peer_id: String,
    pub piece_indices: HashSet<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub info_hash: String,
    pub peers_info: Vec<FilePeerInfo>,
}

pub trait Store: Send + Sync {
    fn upsert_peer(&self, peer_id: &str, ip: &str, port: u16) -> Result<()>;
    fn get_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>>;

    fn add_torrent(&self, info_hash: &str, info: &TorrentInfo) -> Result<()>;
    fn get_torrent(&self, info_hash: &str) -> Result<Option<TorrentInfo>>;

    fn set_file_peers(&self, info_hash: &str, peer_id: &str, pieces: HashSet<u32>) -> Result<()>;
    fn get_file(&self, info_hash: &str) -> Result<Option<FileEntry>>;

    fn put_piece(&self, peer_id: &str, info_hash: &str, index: u32, bytes: Vec<u8>) -> Result<()>;
    fn get_piece(&self, peer_id: &str, info_hash: &str, index: u32) -> Result<Option<Vec<u8>>>;
}

#[derive(Default)]
pub struct MemoryStore {
    peers: Mutex<HashMap<String, PeerRecord>>,
    torrents: Mutex<HashMap<String, TorrentInfo>>,
    files: Mutex<HashMap<String, FileEntry>>,
    pieces: Mutex<HashMap<(String, String, u32), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn upsert_peer(&self, peer_id: &str, ip: &str, port: u16) -> Result<()> {
        let mut peers = self.peers.lock().unwrap();
        peers.insert(
            peer_id.to_string(),
            PeerRecord {
                peer_id: peer_id.to_string(),
                ip: ip.to_string(),
                port,
            },
        );
        Ok(())
    }

    fn get_peer(&self, peer_id: &str) -> Result<Option<PeerRecord>> {
        Ok(self.peers.lock().unwrap().get(peer_id).cloned())
    }

    fn add_torrent(&self, info_hash: &str, info: &TorrentInfo) -> Result<()> {
        self.torrents
            .lock()
            .unwrap()
            .insert(info_hash.to_string(), info.clone());
        Ok(())
    }

    fn get_torrent(&self, info_hash: &str) -> Result<Option<TorrentInfo>> {
        Ok(self.torrents.lock().unwrap().get(info_hash).cloned())
    }

    fn set_file_peers(&self, info_hash: &str, peer_id: &str, pieces: HashSet<u32>) -> Result<()> {
        if self.get_peer(peer_id)?.is_none() {
            return Err(Error::NotFound(format!("unknown peer {peer_id}")));
        }
        let mut files = self.files.lock().unwrap();
        let entry = files.entry(info_hash.to_string()).or_insert_with(|| FileEntry {
            info_hash: info_hash.to_string(),
            peers_info: Vec::new(),
        });
        match entry.peers_info.iter_mut().find(|p| p.peer_id == peer_id) {
            Some(p) => p.piece_indices = pieces,
            None => entry.peers_info.push(FilePeerInfo {
                peer_id: peer_id.to_string(),
                piece_indices: pieces,
            }),
        }
        Ok(())
    }

    fn get_file(&self, info_hash: &str) -> Result<Option<FileEntry>> {
        Ok(self.files.lock().unwrap().get(info_hash).cloned())
    }

    fn put_piece(&self, peer_id: &str, info_hash: &str, index: u32, bytes: Vec<u8>) -> Result<()> {
        self.pieces
            .lock()
            .unwrap()
            .insert((peer_id.to_string(), info_hash.to_string(), index), bytes);
        Ok(())
    }

    fn get_piece(&self, peer_id: &str, info_hash: &str, index: u32) -> Result<Option<Vec<u8>>> {
        Ok(self
            .pieces
            .lock()
            .unwrap()
            .get(&(peer_id.to_string(), info_hash.to_string(), index))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_peer_cannot_claim_pieces() {
        let store = MemoryStore::new();
        let err = store
            .set_file_peers("deadbeef", "ghost", HashSet::from([0]))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn peer_upsert_and_file_entry_round_trip() {
        let store = MemoryStore::new();
        store.upsert_peer("peer-a", "127.0.0.1", 6881).unwrap();
        store
            .set_file_peers("deadbeef", "peer-a", HashSet::from([0, 1]))
            .unwrap();
        let entry = store.get_file("deadbeef").unwrap().unwrap();
        assert_eq!(entry.peers_info.len(), 1);
        assert_eq!(entry.peers_info[0].piece_indices, HashSet::from([0, 1]));
    }

    #[test]
    fn piece_bytes_round_trip() {
        let store = MemoryStore::new();
        store.put_piece("peer-a", "deadbeef", 0, vec![1, 2, 3]).unwrap();
        assert_eq!(
            store.get_piece("peer-a", "deadbeef", 0).unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(store.get_piece("peer-a", "deadbeef", 1).unwrap(), None);
    }
}
