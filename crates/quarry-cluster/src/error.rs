//! Error types for cluster orchestration.

use std::fmt;
use std::path::PathBuf;

use quarry_engine::EngineError;
use quarry_types::HealthState;
use thiserror::Error;

/// Cluster orchestration errors.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid node count.
    #[error("Invalid node count: {0} (must be >= 1)")]
    InvalidNodeCount(usize),

    /// A node failed to start. Nodes started before it keep running.
    #[error("Node {ordinal} failed to start: {source}")]
    Launch {
        ordinal: usize,
        #[source]
        source: EngineError,
    },

    /// Ordinal outside `0..len`.
    #[error("Node ordinal {ordinal} out of range (cluster has {len} nodes)")]
    IndexOutOfRange { ordinal: usize, len: usize },

    /// No running node is the elected master, or no other node exists.
    #[error("No master node available")]
    NoMaster,

    /// Every node is closed.
    #[error("No running node in the cluster")]
    NoRunningNode,

    /// Health did not reach the threshold before the deadline.
    #[error(
        "Timed out waiting for {threshold} health on {}: last observed {last_observed}",
        .index.as_deref().unwrap_or("_all")
    )]
    HealthTimeout {
        threshold: HealthState,
        last_observed: HealthState,
        index: Option<String>,
    },

    /// Index already exists.
    #[error("Index [{0}] already exists")]
    IndexAlreadyExists(String),

    /// Some data directories could not be removed.
    #[error("Failed to remove {} path(s): {}", .failures.len(), CleanupList(.failures))]
    Cleanup { failures: Vec<CleanupFailure> },

    /// Error reported by an engine node or client.
    #[error("Engine error: {0}")]
    Engine(EngineError),

    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::IndexAlreadyExists(index) => Self::IndexAlreadyExists(index),
            other => Self::Engine(other),
        }
    }
}

/// One path `clean` could not remove.
#[derive(Debug)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub error: std::io::Error,
}

struct CleanupList<'a>(&'a [CleanupFailure]);

impl fmt::Display for CleanupList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{} ({})", failure.path.display(), failure.error)?;
        }
        Ok(())
    }
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, Error>;
