//! Process configuration: a JSON file with individual CLI flags layered on
//! top, matching the precedence rule in the configuration section of the
//! design doc (flag wins over file, file wins over default).

use crate::error::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_TRACKER_PORT: u16 = 6969;
const DEFAULT_PEER_PORT: u16 = 6881;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub peer_id: Option<String>,
    pub store_path: Option<String>,
    pub tracker_host: Option<String>,
    pub tracker_port: Option<u16>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// CLI flags override file fields one at a time; `None` leaves the file
    /// (or default) value in place.
    pub fn apply_overrides(
        mut self,
        host: Option<String>,
        port: Option<u16>,
        peer_id: Option<String>,
        tracker_host: Option<String>,
        tracker_port: Option<u16>,
    ) -> Self {
        if host.is_some() {
            self.host = host;
        }
        if port.is_some() {
            self.port = port;
        }
        if peer_id.is_some() {
            self.peer_id = peer_id;
        }
        if tracker_host.is_some() {
            self.tracker_host = tracker_host;
        }
        if tracker_port.is_some() {
            self.tracker_port = tracker_port;
        }
        self
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn tracker_host(&self) -> &str {
        self.tracker_host.as_deref().unwrap_or(DEFAULT_HOST)
    }

    pub fn tracker_port(&self) -> u16 {
        self.tracker_port.unwrap_or(DEFAULT_TRACKER_PORT)
    }

    pub fn peer_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PEER_PORT)
    }

    pub fn peer_id(&self) -> String {
        self.peer_id.clone().unwrap_or_else(generate_peer_id)
    }
}

const PEER_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// A random 20-character opaque peer identity, suitable for direct use as a JSON string.
pub fn generate_peer_id() -> String {
    let mut rng = rand::thread_rng();
    (0..20)
        .map(|_| PEER_ID_ALPHABET[rng.gen_range(0..PEER_ID_ALPHABET.len())] as char)
        .collect()
}
