//! The cluster runner: builds, drives and tears down a test cluster.

use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use quarry_engine::{Client, Engine, LocalEngine};
use quarry_types::{
    ClusterIdentity, ClusterStateSnapshot, GetResponse, HealthState, Query, SearchRequest,
    SearchResponse, Settings, Sort,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::CleanupFailure;
use crate::health::HealthProber;
use crate::membership::MembershipTable;
use crate::node::NodeHandle;
use crate::{Error, Result, RunnerConfig};

/// Snapshot of the resolved configuration written under the base path.
pub const CLUSTER_CONFIG_FILE: &str = "cluster.toml";

/// An in-process multi-node cluster.
///
/// ```ignore
/// let runner = ClusterRunner::build(RunnerConfig::new().num_of_node(3))?;
/// runner.ensure_yellow(None)?;
/// runner.insert("fess", "doc", "1", r#"{"id":"1"}"#)?;
/// runner.refresh()?;
/// runner.close()?;
/// runner.clean()?;
/// ```
///
/// Dropping the runner closes every node; on-disk state is only removed by
/// [`ClusterRunner::clean`].
pub struct ClusterRunner {
    config: RunnerConfig,
    identity: ClusterIdentity,
    engine: Arc<dyn Engine>,
    configs: Vec<NodeConfig>,
    nodes: MembershipTable,
}

impl ClusterRunner {
    /// Builds and starts a cluster on the in-process engine.
    ///
    /// If a node fails to start, the nodes started before it are closed and
    /// the base path is removed before the launch error is returned. Use
    /// [`ClusterRunner::new`] and [`ClusterRunner::start_cluster`] to keep
    /// them for inspection.
    pub fn build(config: RunnerConfig) -> Result<Self> {
        Self::new(config)?.start_or_tear_down()
    }

    /// Starts every slot; on failure closes and cleans the partial cluster.
    fn start_or_tear_down(mut self) -> Result<Self> {
        if let Err(error) = self.start_cluster() {
            warn!(cluster = %self.identity.name(), %error, "cluster build failed, tearing down");
            if let Err(teardown) = self.close().and_then(|()| self.clean()) {
                warn!(cluster = %self.identity.name(), error = %teardown, "teardown incomplete");
            }
            return Err(error);
        }
        Ok(self)
    }

    /// Prepares a cluster on the in-process engine without starting nodes.
    pub fn new(config: RunnerConfig) -> Result<Self> {
        Self::with_engine(config, Arc::new(LocalEngine::new()))
    }

    /// Prepares a cluster whose nodes are launched by `engine`.
    pub fn with_engine(mut config: RunnerConfig, engine: Arc<dyn Engine>) -> Result<Self> {
        config.validate()?;

        let cluster_name = config
            .cluster_name
            .get_or_insert_with(|| format!("quarry-cluster-{}", Uuid::new_v4()))
            .clone();
        let base_path = config
            .base_path
            .get_or_insert_with(|| env::temp_dir().join(&cluster_name))
            .clone();
        fs::create_dir_all(&base_path)?;
        config.save(&base_path.join(CLUSTER_CONFIG_FILE))?;

        let identity = ClusterIdentity::new(cluster_name, base_path);
        info!(cluster = %identity, nodes = config.node_count, "cluster prepared");

        Ok(Self {
            config,
            identity,
            engine,
            configs: Vec::new(),
            nodes: MembershipTable::new(),
        })
    }

    /// Starts every slot not started yet, in ordinal order.
    ///
    /// Stops at the first node that fails; nodes already started keep
    /// running so the caller can inspect, `close` and `clean` them. Calling
    /// again retries from the failed slot with its stored configuration.
    #[instrument(skip(self), fields(cluster = %self.identity.name()))]
    pub fn start_cluster(&mut self) -> Result<()> {
        for ordinal in self.nodes.len()..self.config.node_count {
            if self.configs.len() == ordinal {
                let node_config = self.config.node_config(&self.identity, ordinal);
                fs::create_dir_all(&node_config.data_dir)?;
                self.configs.push(node_config);
            }
            let node_config = self.configs[ordinal].clone();
            let name = node_config.name.clone();

            let handle =
                NodeHandle::launch(Arc::clone(&self.engine), self.identity.clone(), node_config)?;
            info!(
                node = %name,
                transport = ?handle.transport_address(),
                http = ?handle.http_address(),
                "node launched"
            );
            self.nodes.push(handle);
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Closes every running node in ordinal order. Idempotent.
    ///
    /// Keeps going after a failure and returns the first error.
    pub fn close(&self) -> Result<()> {
        let mut first_error = None;
        for node in self.nodes.iter() {
            if let Err(e) = node.close() {
                warn!(node = %node.name(), error = %e, "failed to close node");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Removes every node data directory, then the base path.
    ///
    /// Missing paths are fine. Failures are logged and collected; the
    /// remaining paths are still removed.
    pub fn clean(&self) -> Result<()> {
        let mut failures = Vec::new();
        let node_dirs =
            (0..self.config.node_count).map(|ordinal| self.identity.node_data_dir(ordinal));
        for path in node_dirs.chain([self.identity.base_path().to_path_buf()]) {
            if let Err(error) = remove_tree(&path) {
                warn!(path = %path.display(), %error, "failed to remove directory");
                failures.push(CleanupFailure { path, error });
            } else {
                debug!(path = %path.display(), "removed directory");
            }
        }

        if failures.is_empty() {
            info!(cluster = %self.identity.name(), "cluster data removed");
            Ok(())
        } else {
            Err(Error::Cleanup { failures })
        }
    }

    /// Restarts the node at `ordinal` if it is closed.
    ///
    /// Returns `true` if a new instance was started, `false` if the node was
    /// already running.
    pub fn start_node(&self, ordinal: usize) -> Result<bool> {
        self.nodes.get(ordinal)?.start()
    }

    /// True when every node is closed.
    pub fn is_closed(&self) -> bool {
        self.nodes.iter().all(|node| node.is_closed())
    }

    // ========================================================================
    // Nodes
    // ========================================================================

    /// Number of node slots.
    pub fn node_size(&self) -> usize {
        self.nodes.len()
    }

    /// All node handles, running or not.
    pub fn nodes(&self) -> &MembershipTable {
        &self.nodes
    }

    /// First running node.
    pub fn node(&self) -> Result<&Arc<NodeHandle>> {
        self.nodes.first_running()
    }

    /// Client of the first running node.
    pub fn client(&self) -> Result<Arc<dyn Client>> {
        self.node()?.client()
    }

    /// Node at `ordinal`, running or not.
    pub fn get_node(&self, ordinal: usize) -> Result<&Arc<NodeHandle>> {
        self.nodes.get(ordinal)
    }

    /// Node whose display name is `name`.
    pub fn get_node_by_name(&self, name: &str) -> Option<&Arc<NodeHandle>> {
        self.nodes.by_name(name)
    }

    /// Running node the cluster elected as master.
    pub fn master_node(&self) -> Result<&Arc<NodeHandle>> {
        self.nodes.master(self.client()?.as_ref())
    }

    /// First running node that is not the master.
    pub fn non_master_node(&self) -> Result<&Arc<NodeHandle>> {
        self.nodes.non_master(self.client()?.as_ref())
    }

    /// Name every node joined under.
    pub fn cluster_name(&self) -> &str {
        self.identity.name()
    }

    /// Cluster name and base path.
    pub fn identity(&self) -> &ClusterIdentity {
        &self.identity
    }

    /// Directory holding `cluster.toml` and the node data directories.
    pub fn base_path(&self) -> &Path {
        self.identity.base_path()
    }

    /// Resolved configuration, with name and base path filled in.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Master and membership as seen by a running node.
    pub fn cluster_state(&self) -> Result<ClusterStateSnapshot> {
        Ok(self.client()?.cluster_state()?)
    }

    // ========================================================================
    // Health
    // ========================================================================

    /// Prober using the configured timeout and poll interval.
    pub fn health(&self) -> HealthProber<'_> {
        HealthProber::new(
            &self.nodes,
            self.config.health_timeout(),
            self.config.poll_interval(),
        )
    }

    /// Blocks until health is at least yellow or the configured timeout.
    pub fn ensure_yellow(&self, index: Option<&str>) -> Result<HealthState> {
        self.health().ensure_yellow(index)
    }

    /// Blocks until health is green or the configured timeout.
    pub fn ensure_green(&self, index: Option<&str>) -> Result<HealthState> {
        self.health().ensure_green(index)
    }

    /// Blocks until health reaches `threshold` or the configured timeout.
    pub fn wait_for(&self, threshold: HealthState, index: Option<&str>) -> Result<HealthState> {
        self.health().wait_for(threshold, index)
    }

    /// Like [`ClusterRunner::wait_for`] with an explicit deadline.
    pub fn wait_for_until(
        &self,
        threshold: HealthState,
        index: Option<&str>,
        deadline: Instant,
    ) -> Result<HealthState> {
        self.health().wait_for_until(threshold, index, deadline)
    }

    // ========================================================================
    // Indices
    // ========================================================================

    /// Creates `index`, failing with [`Error::IndexAlreadyExists`] if present.
    pub fn create_index(&self, index: &str, settings: Option<&Settings>) -> Result<()> {
        let empty = Settings::default();
        self.client()?.create_index(index, settings.unwrap_or(&empty))?;
        info!(index, "index created");
        Ok(())
    }

    /// Creates `index` unless it exists. Returns whether it was created.
    pub fn create_index_if_absent(&self, index: &str, settings: Option<&Settings>) -> Result<bool> {
        match self.create_index(index, settings) {
            Ok(()) => Ok(true),
            Err(Error::IndexAlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Adds a type mapping to an existing index.
    pub fn create_mapping(&self, index: &str, doc_type: &str, mapping: &str) -> Result<()> {
        Ok(self.client()?.put_mapping(index, doc_type, mapping)?)
    }

    /// Whether `index` exists.
    pub fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.client()?.index_exists(index)?)
    }

    /// Deletes `index` and its documents.
    pub fn delete_index(&self, index: &str) -> Result<()> {
        self.client()?.delete_index(index)?;
        info!(index, "index deleted");
        Ok(())
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Indexes a document. Returns `true` if it did not exist before.
    pub fn insert(&self, index: &str, doc_type: &str, id: &str, source: &str) -> Result<bool> {
        Ok(self.client()?.index(index, doc_type, Some(id), source)?.created)
    }

    /// Deletes a document. Returns `true` if it existed.
    pub fn delete(&self, index: &str, doc_type: &str, id: &str) -> Result<bool> {
        Ok(self.client()?.delete(index, doc_type, id)?.found)
    }

    /// Realtime get.
    pub fn get(&self, index: &str, doc_type: &str, id: &str) -> Result<GetResponse> {
        Ok(self.client()?.get(index, doc_type, id)?)
    }

    /// Searches `index`, match-all when `query` is `None`.
    pub fn search(
        &self,
        index: &str,
        doc_type: Option<&str>,
        query: Option<Query>,
        sort: Option<Sort>,
        from: usize,
        size: usize,
    ) -> Result<SearchResponse> {
        let mut request = SearchRequest::new(index)
            .query(query.unwrap_or_default())
            .page(from, size);
        request.doc_type = doc_type.map(str::to_string);
        request.sort = sort;
        self.search_with(&request)
    }

    /// Runs a prepared search request.
    pub fn search_with(&self, request: &SearchRequest) -> Result<SearchResponse> {
        Ok(self.client()?.search(request)?)
    }

    /// Number of searchable documents in `index`, optionally of one type.
    pub fn count(&self, index: &str, doc_type: Option<&str>) -> Result<u64> {
        Ok(self
            .client()?
            .count(Some(index), doc_type, &Query::MatchAll)?)
    }

    /// Makes every index's recent writes searchable.
    pub fn refresh(&self) -> Result<()> {
        Ok(self.client()?.refresh(None)?)
    }

    /// Refreshes every index and persists segments on `fs` storage.
    pub fn flush(&self) -> Result<()> {
        Ok(self.client()?.flush(None)?)
    }

    /// Merges away deleted documents in every index.
    pub fn optimize(&self, only_expunge_deletes: bool) -> Result<()> {
        Ok(self.client()?.optimize(None, only_expunge_deletes)?)
    }
}

impl fmt::Debug for ClusterRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterRunner")
            .field("cluster", &self.identity.name())
            .field("base_path", &self.identity.base_path())
            .field("nodes", &self.nodes)
            .finish_non_exhaustive()
    }
}

impl Drop for ClusterRunner {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(cluster = %self.identity.name(), error = %e, "failed to close cluster on drop");
        }
    }
}

fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
