//! Engine error types.

use std::net::SocketAddr;

use quarry_types::SettingsError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur inside an engine node or one of its clients.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The index already exists.
    #[error("index [{0}] already exists")]
    IndexAlreadyExists(String),

    /// The index does not exist.
    #[error("index [{0}] not found")]
    IndexNotFound(String),

    /// The node serving the request has been closed.
    #[error("node [{0}] is closed")]
    NodeClosed(String),

    /// No master is currently elected.
    #[error("no master node is elected")]
    NoMaster,

    /// Document source is not a JSON object.
    #[error("invalid document source: {0}")]
    InvalidDocument(String),

    /// Node settings could not be interpreted.
    #[error(transparent)]
    InvalidSettings(#[from] SettingsError),

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport frame or handshake violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport peer belongs to another cluster.
    #[error("cluster name mismatch: expected {expected}, got {actual}")]
    ClusterNameMismatch { expected: String, actual: String },

    /// Transport payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Error reported by a remote node without a local equivalent.
    #[error("remote error: {0}")]
    Remote(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// HTTP status code used when this error reaches the HTTP endpoint.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::IndexNotFound(_) => 404,
            Self::IndexAlreadyExists(_) | Self::InvalidDocument(_) | Self::InvalidSettings(_) => {
                400
            }
            Self::NoMaster | Self::NodeClosed(_) => 503,
            _ => 500,
        }
    }
}
