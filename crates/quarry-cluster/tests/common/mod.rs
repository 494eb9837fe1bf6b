//! Shared helpers for cluster integration tests.

#![allow(dead_code)]

use std::time::Duration;

use quarry_cluster::{ClusterRunner, RunnerConfig};
use tempfile::TempDir;

/// Installs a test-writer subscriber once; `RUST_LOG` overrides the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_test_writer()
        .try_init();
}

/// Config rooted in `temp` with quick health polling.
pub fn config(temp: &TempDir, nodes: usize) -> RunnerConfig {
    RunnerConfig::new()
        .num_of_node(nodes)
        .with_base_path(temp.path().join("cluster"))
        .with_poll_interval(Duration::from_millis(10))
        .with_health_timeout(Duration::from_secs(20))
        .with_allocation_delay(Duration::from_millis(20))
}

/// Builds a cluster and waits for yellow health.
pub fn start(config: RunnerConfig) -> ClusterRunner {
    init_tracing();
    let runner = ClusterRunner::build(config).expect("cluster should start");
    runner.ensure_yellow(None).expect("cluster should turn yellow");
    runner
}
