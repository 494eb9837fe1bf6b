//! In-process multi-node search clusters for integration tests.
//!
//! Provides cluster orchestration for tests that need a real cluster:
//! - Build N cooperating engine nodes with per-node settings hooks
//! - Close and restart individual nodes without disturbing the others
//! - Master and non-master node lookup
//! - Blocking waits for yellow/green cluster health
//! - Native transport and HTTP access to every node (see [`curl`])
//!
//! ```ignore
//! use quarry_cluster::{ClusterRunner, RunnerConfig};
//!
//! let runner = ClusterRunner::build(RunnerConfig::new().num_of_node(3).ram_index_store())?;
//! runner.ensure_yellow(None)?;
//! let master = runner.master_node()?;
//! master.close()?;
//! runner.start_node(master.ordinal())?;
//! runner.ensure_green(None)?;
//! runner.close()?;
//! runner.clean()?;
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod loader;
pub mod membership;
pub mod node;
pub mod runner;

pub use config::{BuildCallback, IndexDefaults, NodeConfig, RunnerConfig};
pub use error::{CleanupFailure, Error, Result};
pub use health::HealthProber;
pub use loader::ConfigLoader;
pub use membership::MembershipTable;
pub use node::{NodeHandle, NodeStatus};
pub use runner::ClusterRunner;

pub use quarry_curl as curl;
pub use quarry_engine::{Client, TransportClient};
pub use quarry_types::{HealthState, Settings, SettingsBuilder, StorageMode};

use std::path::Path;

use anyhow::Context;

/// Builds a cluster from the `quarry.toml` configuration in `project_dir`.
pub fn start_cluster(project_dir: &Path) -> anyhow::Result<ClusterRunner> {
    let config = ConfigLoader::new()
        .with_project_dir(project_dir)
        .load()?;
    ClusterRunner::build(config).context("Failed to start cluster")
}

/// Closes every node of `runner` and removes its data.
pub fn stop_cluster(runner: &ClusterRunner) -> Result<()> {
    runner.close()?;
    runner.clean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_start_cluster_from_project() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(loader::PROJECT_CONFIG_FILE),
            "node_count = 2\nbase_path = \"data\"\nhttp_enabled = false\n",
        )
        .unwrap();

        let runner = start_cluster(temp.path()).unwrap();
        assert_eq!(runner.node_size(), 2);
        assert_eq!(runner.base_path(), temp.path().join("data"));
        assert!(temp.path().join("data").join("node_2").is_dir());

        stop_cluster(&runner).unwrap();
        assert!(runner.is_closed());
        assert!(!temp.path().join("data").exists());
    }

    #[test]
    fn test_start_cluster_rejects_zero_nodes() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(loader::PROJECT_CONFIG_FILE),
            "node_count = 0\n",
        )
        .unwrap();

        let err = start_cluster(temp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidNodeCount(0))
        ));
    }
}
