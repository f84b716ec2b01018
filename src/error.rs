use std::fmt;

/// The closed error taxonomy shared by the metadata codec, wire framing,
/// tracker, scheduler and store modules.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("hash mismatch: {0}")]
    HashMismatch(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("connect error: {0}")]
    ConnectError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("retries exhausted for piece(s): {0:?}")]
    RetriesExhausted(Vec<u32>),

    #[error("no peer holds piece(s): {0:?}")]
    Unavailable(Vec<u32>),

    #[error("cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ProtocolError(e.to_string())
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::MalformedMetadata(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Short human-readable status carried back to the CLI boundary.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub ok: bool,
    pub message: String,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
