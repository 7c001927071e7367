//! Error taxonomy for the Zif core.
//!
//! Errors are grouped by kind rather than by origin: callers match on what
//! went wrong (unreachable peer, failed verification, backend fault) and the
//! long-running loops trap, log and continue on their next tick.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ZifError>;

#[derive(Debug, Error)]
pub enum ZifError {
    /// Dial, ping or stream-open failed. Never retried inside an RPC;
    /// the heartbeat converts persistent failure into a disconnect.
    #[error("peer could not be reached")]
    PeerUnreachable,

    /// The session closed after registration.
    #[error("peer has disconnected")]
    PeerDisconnected,

    /// The iterative lookup exhausted without an exact match.
    #[error("address could not be resolved: {0}")]
    AddressUnresolved(String),

    /// Entry signature or size invariants broken. The offending entry is
    /// dropped by the caller.
    #[error("entry verification failed: {0}")]
    VerifyFailed(String),

    /// Unexpected header, oversize payload, or out-of-order response.
    /// Close the stream, leave the session open.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A mirrored piece hashed to a value that disagrees with the signed
    /// hash list. The mirror is aborted for that peer.
    #[error("piece {piece} hash does not match the signed hash list")]
    IntegrityMismatch { piece: usize },

    #[error("address {0} is not a valid zif address")]
    InvalidAddress(String),

    // Backend errors: SQL, disk or encoding. Surfaced as-is, no recovery
    // inside the core.
    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ZifError {
    /// True for the backend kind (SQL, disk, encoding).
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            ZifError::Sql(_) | ZifError::Io(_) | ZifError::Encode(_) | ZifError::Json(_)
        )
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ZifError::ProtocolViolation(msg.into())
    }

    pub fn verify(msg: impl Into<String>) -> Self {
        ZifError::VerifyFailed(msg.into())
    }
}
