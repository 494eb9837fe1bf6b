//! # quarry-types: Core types for `Quarry`
//!
//! This crate contains the values shared by the engine, the cluster
//! orchestrator and the test clients:
//! - Cluster identity ([`ClusterIdentity`])
//! - Health ([`HealthState`], [`ClusterHealth`])
//! - Node settings ([`Settings`], [`SettingsBuilder`], [`StorageMode`])
//! - Documents and search ([`Query`], [`Sort`], [`SearchResponse`], ...)
//! - Cluster state snapshots ([`ClusterStateSnapshot`], [`MemberInfo`])

use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod search;
mod settings;

pub use search::{
    DeleteResponse, GetResponse, IndexResponse, Query, SearchHit, SearchRequest, SearchResponse,
    Sort, SortOrder,
};
pub use settings::{Settings, SettingsBuilder, SettingsError, keys};

#[cfg(test)]
mod tests;

// ============================================================================
// Cluster identity
// ============================================================================

/// Immutable identity of one cluster: its name and base data directory.
///
/// Cheap to clone. Every node launch receives the identity of the cluster it
/// joins; the identity never changes after the orchestrator builds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterIdentity {
    inner: Arc<IdentityInner>,
}

#[derive(Debug, PartialEq, Eq)]
struct IdentityInner {
    name: String,
    base_path: PathBuf,
}

impl ClusterIdentity {
    pub fn new(name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(IdentityInner {
                name: name.into(),
                base_path: base_path.into(),
            }),
        }
    }

    /// Cluster name nodes must present when joining.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Root of every per-node data directory.
    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    /// Data directory of the node at `ordinal` (`<base>/node_<ordinal+1>`).
    pub fn node_data_dir(&self, ordinal: usize) -> PathBuf {
        self.inner.base_path.join(format!("node_{}", ordinal + 1))
    }
}

impl Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.inner.name, self.inner.base_path.display())
    }
}

/// Display name of the node at `ordinal`.
///
/// ```
/// assert_eq!(quarry_types::node_name(0), "Node 1");
/// ```
pub fn node_name(ordinal: usize) -> String {
    format!("Node {}", ordinal + 1)
}

// ============================================================================
// Health
// ============================================================================

/// Cluster or index health, ordered `Red < Yellow < Green`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// At least one primary shard is not active.
    Red,
    /// All primaries are active, some replicas are not.
    Yellow,
    /// Every shard copy is active.
    Green,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Yellow => "yellow",
            Self::Green => "green",
        }
    }

    /// True when `self` meets or exceeds `threshold`.
    pub fn satisfies(self, threshold: HealthState) -> bool {
        self >= threshold
    }
}

impl Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown health string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown health state: {0}")]
pub struct ParseHealthError(String);

impl FromStr for HealthState {
    type Err = ParseHealthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "red" => Ok(Self::Red),
            "yellow" => Ok(Self::Yellow),
            "green" => Ok(Self::Green),
            _ => Err(ParseHealthError(s.to_string())),
        }
    }
}

/// Result of a cluster health query, optionally scoped to one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub cluster_name: String,
    pub status: HealthState,
    pub timed_out: bool,
    pub number_of_nodes: u32,
    pub number_of_data_nodes: u32,
    pub active_primary_shards: u32,
    pub active_shards: u32,
    pub initializing_shards: u32,
    pub unassigned_shards: u32,
}

// ============================================================================
// Storage
// ============================================================================

/// Where index data lives between flushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Segments stay in memory; flush never touches the disk.
    #[default]
    Memory,
    /// Flush writes segments under each node's data directory.
    Fs,
}

impl StorageMode {
    /// Value of the `index.store.type` setting for this mode.
    pub fn as_setting(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fs => "fs",
        }
    }

    pub fn from_setting(value: &str) -> Option<Self> {
        match value {
            "memory" | "ram" => Some(Self::Memory),
            "fs" | "niofs" | "mmapfs" => Some(Self::Fs),
            _ => None,
        }
    }
}

// ============================================================================
// Cluster state
// ============================================================================

/// One cluster member as seen by the elected master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub ordinal: usize,
    pub name: String,
    pub running: bool,
    pub master_eligible: bool,
    pub data: bool,
}

/// Point-in-time view of cluster membership and the elected master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateSnapshot {
    pub cluster_name: String,
    /// Name of the elected master, `None` while no master is elected.
    pub master_node: Option<String>,
    pub nodes: Vec<MemberInfo>,
    pub indices: Vec<String>,
}

impl ClusterStateSnapshot {
    pub fn running_nodes(&self) -> impl Iterator<Item = &MemberInfo> {
        self.nodes.iter().filter(|m| m.running)
    }
}
