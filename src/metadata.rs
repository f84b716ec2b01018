//! Torrent metadata codec: the canonical bencoded `TorrentInfo` descriptor,
//! its content-addressed `info_hash`, and the file <-> pieces split/combine
//! helpers used by both the upload path and the download finalizer.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// Pieces below this length waste too much wire overhead per request.
pub const MIN_PIECE_LENGTH: u32 = 32 * 1024;
/// Pieces above this length make a single hash mismatch too expensive to retry.
pub const MAX_PIECE_LENGTH: u32 = 1024 * 1024;

/// The immutable, content-addressed descriptor of a single-file torrent.
///
/// `serde_bencode` sorts dictionary keys lexicographically on encode, so the
/// declaration order here only affects readability, not wire compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentInfo {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub length: u64,
    pub pieces: ByteBuf,
}

impl TorrentInfo {
    /// Builds a descriptor from a name, piece length and the already-hashed
    /// per-piece digests (as produced by [`split_file`]).
    pub fn new(name: String, piece_length: u32, length: u64, piece_hashes: &[[u8; 20]]) -> Self {
        let mut pieces = Vec::with_capacity(piece_hashes.len() * 20);
        for hash in piece_hashes {
            pieces.extend_from_slice(hash);
        }
        TorrentInfo {
            name,
            piece_length,
            length,
            pieces: ByteBuf::from(pieces),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.pieces
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    pub fn piece_hash(&self, index: u32) -> Option<[u8; 20]> {
        let start = index as usize * 20;
        let end = start + 20;
        if end > self.pieces.len() {
            return None;
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.pieces[start..end]);
        Some(hash)
    }

    /// Length of the piece at `index`, accounting for a short final piece.
    pub fn piece_len_at(&self, index: u32) -> u64 {
        let start = index as u64 * self.piece_length as u64;
        let remaining = self.length.saturating_sub(start);
        remaining.min(self.piece_length as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::MalformedMetadata("name is empty".into()));
        }
        if self.length > 0 && !(MIN_PIECE_LENGTH..=MAX_PIECE_LENGTH).contains(&self.piece_length) {
            return Err(Error::MalformedMetadata(format!(
                "piece length {} out of bounds [{}, {}]",
                self.piece_length, MIN_PIECE_LENGTH, MAX_PIECE_LENGTH
            )));
        }
        if !self.pieces.len().is_multiple_of(20) {
            return Err(Error::MalformedMetadata(
                "pieces field is not a multiple of 20 bytes".into(),
            ));
        }
        let expected_pieces = if self.length == 0 {
            0
        } else {
            self.length.div_ceil(self.piece_length as u64) as usize
        };
        if self.piece_count() != expected_pieces {
            return Err(Error::HashMismatch(format!(
                "expected {} piece hashes for length {} at piece_length {}, got {}",
                expected_pieces,
                self.length,
                self.piece_length,
                self.piece_count()
            )));
        }
        Ok(())
    }

    /// SHA-1 of the canonical bencoded encoding, as 40 lowercase hex chars.
    ///
    /// This is the system-wide content identifier (invariant 4 in the data
    /// model): any `info_hash` persisted alongside a metadata file is
    /// advisory only and is never trusted in place of this computation.
    pub fn info_hash(&self) -> Result<String> {
        let bytes = encode(self)?;
        let mut hasher = Sha1::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Encodes a `TorrentInfo` to its canonical bencoded form.
pub fn encode(info: &TorrentInfo) -> Result<Vec<u8>> {
    serde_bencode::to_bytes(info).map_err(Error::from)
}

/// Decodes and validates a bencoded `TorrentInfo`.
pub fn decode(bytes: &[u8]) -> Result<TorrentInfo> {
    let info: TorrentInfo = serde_bencode::from_bytes(bytes).map_err(Error::from)?;
    info.validate()?;
    Ok(info)
}

/// Reads `path` in order, emitting fixed-size chunks of `piece_length` bytes.
/// The final chunk is shorter iff the file length isn't a multiple of
/// `piece_length`. An empty file yields zero pieces.
pub fn split_file(path: &Path, piece_length: u32) -> Result<Vec<Vec<u8>>> {
    let mut file = File::open(path)?;
    let mut pieces = Vec::new();
    let mut buf = vec![0u8; piece_length as usize];
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        pieces.push(buf[..filled].to_vec());
        if filled < buf.len() {
            break;
        }
    }
    Ok(pieces)
}

/// SHA-1 hashes each piece produced by [`split_file`], in index order.
pub fn hash_pieces(pieces: &[Vec<u8>]) -> Vec<[u8; 20]> {
    pieces
        .iter()
        .map(|piece| {
            let mut hasher = Sha1::new();
            hasher.update(piece);
            let digest = hasher.finalize();
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&digest);
            hash
        })
        .collect()
}

/// Writes `pieces` to `out_path` in ascending index order, via a temporary
/// file and an atomic rename. A zero-piece input produces an empty file.
pub fn combine_pieces(pieces: &[Vec<u8>], out_path: &Path) -> Result<()> {
    if pieces.iter().any(|p| p.is_empty()) {
        return Err(Error::MalformedMetadata(
            "cannot combine an empty piece".into(),
        ));
    }
    let dir = out_path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new().tempfile_in(dir)?;
    for piece in pieces {
        tmp.write_all(piece)?;
    }
    tmp.flush()?;
    tmp.persist(out_path).map_err(|e| Error::IoError(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> TorrentInfo {
        let hashes = vec![[1u8; 20], [2u8; 20], [3u8; 20]];
        TorrentInfo::new("hello.txt".into(), 32 * 1024, 3 * 32 * 1024, &hashes)
    }

    #[test]
    fn round_trip_encode_decode() {
        let info = sample_info();
        let bytes = encode(&info).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(info, decoded);
    }

    #[test]
    fn info_hash_is_pure_function_of_fields() {
        let a = sample_info();
        let b = sample_info();
        assert_eq!(a.info_hash().unwrap(), b.info_hash().unwrap());

        let mut c = sample_info();
        c.name = "other.txt".into();
        assert_ne!(a.info_hash().unwrap(), c.info_hash().unwrap());
    }

    #[test]
    fn rejects_piece_count_hash_length_mismatch() {
        let mut info = sample_info();
        info.length = 4 * 32 * 1024; // now needs 4 hashes, only has 3
        let bytes = encode(&info).unwrap();
        match decode(&bytes) {
            Err(Error::HashMismatch(_)) => {}
            other => panic!("expected HashMismatch, got {other:?}"),
        }
    }

    #[test]
    fn split_then_combine_round_trips_arbitrary_file() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("input.bin");
        let mut src = File::create(&src_path).unwrap();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        src.write_all(&data).unwrap();
        drop(src);

        let piece_length = 32 * 1024;
        let pieces = split_file(&src_path, piece_length).unwrap();
        assert_eq!(pieces.last().unwrap().len(), data.len() % piece_length as usize);

        let out_path = dir.path().join("output.bin");
        combine_pieces(&pieces, &out_path).unwrap();
        let combined = std::fs::read(&out_path).unwrap();
        assert_eq!(combined, data);
    }

    #[test]
    fn zero_length_file_yields_no_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("empty.bin");
        File::create(&src_path).unwrap();

        let pieces = split_file(&src_path, 32 * 1024).unwrap();
        assert!(pieces.is_empty());

        let out_path = dir.path().join("out.bin");
        combine_pieces(&pieces, &out_path).unwrap();
        assert_eq!(std::fs::read(&out_path).unwrap().len(), 0);
    }

    #[test]
    fn exact_multiple_of_piece_length_has_no_short_final_piece() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("exact.bin");
        std::fs::write(&src_path, vec![7u8; 64 * 1024]).unwrap();

        let pieces = split_file(&src_path, 32 * 1024).unwrap();
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].len(), 32 * 1024);
        assert_eq!(pieces[1].len(), 32 * 1024);
    }
}
