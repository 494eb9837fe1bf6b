//! Cluster configuration management.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use quarry_types::{ClusterIdentity, Settings, SettingsBuilder, StorageMode, keys, node_name};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Per-node settings hook, called with the node ordinal before it starts.
pub type BuildCallback = Arc<dyn Fn(usize, &mut SettingsBuilder) + Send + Sync>;

/// Configuration for a Quarry test cluster.
///
/// ```ignore
/// let config = RunnerConfig::new()
///     .num_of_node(3)
///     .ram_index_store()
///     .on_build(|ordinal, settings| {
///         settings.put("node.master", ordinal == 0);
///     });
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Number of nodes in the cluster.
    pub node_count: usize,

    /// Where index segments live on flush.
    pub storage: StorageMode,

    /// Root data directory. A fresh directory under the system temp dir
    /// when unset.
    pub base_path: Option<PathBuf>,

    /// Cluster name. `quarry-cluster-<uuid>` when unset.
    pub cluster_name: Option<String>,

    /// Upper bound for `ensure_yellow` / `ensure_green`.
    pub health_timeout_ms: u64,

    /// First delay between health polls.
    pub poll_interval_ms: u64,

    /// Shard layout of indices created without explicit settings.
    pub index_defaults: IndexDefaults,

    /// Time a shard copy spends initialising after allocation.
    pub allocation_delay_ms: u64,

    /// Whether nodes bind an HTTP endpoint.
    pub http_enabled: bool,

    #[serde(skip)]
    on_build: Option<BuildCallback>,
}

/// Default shard layout for new indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexDefaults {
    pub shards: u32,
    pub replicas: u32,
}

impl Default for IndexDefaults {
    fn default() -> Self {
        Self {
            shards: 5,
            replicas: 1,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            node_count: 3,
            storage: StorageMode::Memory,
            base_path: None,
            cluster_name: None,
            health_timeout_ms: 30_000,
            poll_interval_ms: 100,
            index_defaults: IndexDefaults::default(),
            allocation_delay_ms: 50,
            http_enabled: true,
            on_build: None,
        }
    }
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("node_count", &self.node_count)
            .field("storage", &self.storage)
            .field("base_path", &self.base_path)
            .field("cluster_name", &self.cluster_name)
            .field("health_timeout_ms", &self.health_timeout_ms)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("index_defaults", &self.index_defaults)
            .field("allocation_delay_ms", &self.allocation_delay_ms)
            .field("http_enabled", &self.http_enabled)
            .field("on_build", &self.on_build.is_some())
            .finish()
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of nodes.
    pub fn num_of_node(mut self, count: usize) -> Self {
        self.node_count = count;
        self
    }

    /// Keeps index segments in memory.
    pub fn ram_index_store(mut self) -> Self {
        self.storage = StorageMode::Memory;
        self
    }

    /// Writes index segments to each node's data directory on flush.
    pub fn fs_index_store(mut self) -> Self {
        self.storage = StorageMode::Fs;
        self
    }

    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = Some(name.into());
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_index_defaults(mut self, shards: u32, replicas: u32) -> Self {
        self.index_defaults = IndexDefaults { shards, replicas };
        self
    }

    pub fn with_allocation_delay(mut self, delay: Duration) -> Self {
        self.allocation_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_http(mut self, enabled: bool) -> Self {
        self.http_enabled = enabled;
        self
    }

    /// Registers a hook that adjusts each node's settings.
    ///
    /// The hook runs exactly once per ordinal, in ascending order, right
    /// before that node starts. `cluster.name`, `node.name` and `path.data`
    /// are applied after it and cannot be overridden.
    pub fn on_build<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize, &mut SettingsBuilder) + Send + Sync + 'static,
    {
        self.on_build = Some(Arc::new(callback));
        self
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Checks values no cluster can be built with.
    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 {
            return Err(Error::InvalidNodeCount(self.node_count));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be > 0".to_string()));
        }
        if self.index_defaults.shards == 0 {
            return Err(Error::Config("index_defaults.shards must be > 0".to_string()));
        }
        Ok(())
    }

    /// Loads a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Saves the configuration (without the build hook) as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Settings every node starts from, before the build hook.
    fn base_settings(&self) -> SettingsBuilder {
        let mut builder = Settings::builder();
        builder
            .put(keys::STORE_TYPE, self.storage.as_setting())
            .put(keys::NUMBER_OF_SHARDS, self.index_defaults.shards)
            .put(keys::NUMBER_OF_REPLICAS, self.index_defaults.replicas)
            .put(keys::ALLOCATION_DELAY_MS, self.allocation_delay_ms)
            .put(keys::HTTP_ENABLED, self.http_enabled);
        builder
    }

    /// Produces the immutable configuration of slot `ordinal`.
    ///
    /// Runs the build hook, so call it once per ordinal.
    pub(crate) fn node_config(&self, identity: &ClusterIdentity, ordinal: usize) -> NodeConfig {
        let mut builder = self.base_settings();
        if let Some(callback) = &self.on_build {
            callback(ordinal, &mut builder);
        }

        let name = node_name(ordinal);
        let data_dir = identity.node_data_dir(ordinal);
        let mandated = [
            (keys::CLUSTER_NAME, identity.name().to_string()),
            (keys::NODE_NAME, name.clone()),
            (keys::PATH_DATA, data_dir.display().to_string()),
        ];
        for (key, value) in mandated {
            let overridden = builder.get(key).is_some_and(|current| current != value);
            if overridden {
                warn!(
                    node = %name,
                    key,
                    attempted = builder.get(key).unwrap_or_default(),
                    "ignoring override of orchestrator-managed setting"
                );
            }
            builder.put(key, value);
        }

        NodeConfig {
            ordinal,
            name,
            data_dir,
            settings: builder.build(),
        }
    }
}

/// Configuration for a single node slot. Reused verbatim on restart.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Slot ordinal (0-indexed).
    pub ordinal: usize,

    /// Display name, `Node <ordinal+1>`.
    pub name: String,

    /// Data directory for this node.
    pub data_dir: PathBuf,

    /// Settings handed to the engine.
    pub settings: Settings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use test_case::test_case;

    fn identity(temp: &TempDir) -> ClusterIdentity {
        ClusterIdentity::new("cfg-test", temp.path())
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::new();
        assert_eq!(config.node_count, 3);
        assert_eq!(config.storage, StorageMode::Memory);
        assert_eq!(config.health_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.index_defaults, IndexDefaults { shards: 5, replicas: 1 });
        assert!(config.http_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let err = RunnerConfig::new().num_of_node(0).validate().unwrap_err();
        assert!(matches!(err, Error::InvalidNodeCount(0)));
    }

    #[test_case(RunnerConfig::new().with_poll_interval(Duration::ZERO), "poll_interval_ms"; "zero poll interval")]
    #[test_case(RunnerConfig::new().with_index_defaults(0, 1), "index_defaults.shards"; "zero shards")]
    fn test_invalid_config_rejected(config: RunnerConfig, field: &str) {
        match config.validate() {
            Err(Error::Config(message)) => assert!(message.contains(field), "{message}"),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_node_config_layout() {
        let temp = TempDir::new().unwrap();
        let config = RunnerConfig::new().fs_index_store().with_index_defaults(2, 0);
        let node = config.node_config(&identity(&temp), 1);

        assert_eq!(node.ordinal, 1);
        assert_eq!(node.name, "Node 2");
        assert_eq!(node.data_dir, temp.path().join("node_2"));
        for key in keys::MANDATED {
            assert!(node.settings.contains(key), "missing {key}");
        }
        assert_eq!(node.settings.get(keys::STORE_TYPE), Some("fs"));
        assert_eq!(node.settings.get(keys::NUMBER_OF_SHARDS), Some("2"));
        assert_eq!(node.settings.get(keys::NUMBER_OF_REPLICAS), Some("0"));
    }

    #[test]
    fn test_mandated_settings_survive_callback() {
        let temp = TempDir::new().unwrap();
        let config = RunnerConfig::new().on_build(|_, settings| {
            settings
                .put(keys::CLUSTER_NAME, "hijacked")
                .put(keys::NODE_NAME, "imposter")
                .put(keys::PATH_DATA, "/nowhere")
                .put(keys::NODE_DATA, false);
        });
        let node = config.node_config(&identity(&temp), 0);

        assert_eq!(node.settings.get(keys::CLUSTER_NAME), Some("cfg-test"));
        assert_eq!(node.settings.get(keys::NODE_NAME), Some("Node 1"));
        assert_eq!(
            node.settings.get(keys::PATH_DATA),
            Some(temp.path().join("node_1").display().to_string().as_str())
        );
        assert_eq!(node.settings.get(keys::NODE_DATA), Some("false"));
    }

    #[test]
    fn test_callback_sees_defaults_and_ordinal() {
        let temp = TempDir::new().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let config = RunnerConfig::new().on_build(move |ordinal, settings| {
            let shards = settings.get(keys::NUMBER_OF_SHARDS).map(str::to_string);
            recorder.lock().unwrap().push((ordinal, shards));
        });

        let identity = identity(&temp);
        for ordinal in 0..3 {
            config.node_config(&identity, ordinal);
        }
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (0, Some("5".to_string())),
                (1, Some("5".to_string())),
                (2, Some("5".to_string())),
            ]
        );
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cluster.toml");
        let config = RunnerConfig::new()
            .num_of_node(4)
            .fs_index_store()
            .with_cluster_name("saved")
            .with_poll_interval(Duration::from_millis(20));
        config.save(&path).unwrap();

        let loaded = RunnerConfig::load(&path).unwrap();
        assert_eq!(loaded.node_count, 4);
        assert_eq!(loaded.storage, StorageMode::Fs);
        assert_eq!(loaded.cluster_name.as_deref(), Some("saved"));
        assert_eq!(loaded.base_path, None);
        assert_eq!(loaded.poll_interval_ms, 20);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RunnerConfig = toml::from_str("node_count = 2\n").unwrap();
        assert_eq!(config.node_count, 2);
        assert_eq!(config.allocation_delay_ms, 50);
        assert_eq!(config.index_defaults.replicas, 1);
    }
}
