//! In-process engine nodes.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quarry_types::{
    ClusterHealth, ClusterIdentity, ClusterStateSnapshot, DeleteResponse, GetResponse,
    IndexResponse, Query, SearchRequest, SearchResponse, Settings, keys, node_name,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::fabric::{Fabric, MemberSpec};
use crate::index::{ShardLayout, default_layout, index_settings_from_node};
use crate::server::{self, ServeContext, ServerHandle};
use crate::{Client, Engine, EngineError, EngineNode, EngineResult};

/// Engine whose nodes all live in the current process.
///
/// Nodes started with the same `cluster.name` share one cluster fabric, so a
/// single engine can host several independent clusters side by side.
#[derive(Default)]
pub struct LocalEngine {
    fabrics: Mutex<HashMap<String, Arc<Fabric>>>,
}

impl LocalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn fabric(&self, cluster_name: &str) -> EngineResult<Arc<Fabric>> {
        let mut fabrics = self
            .fabrics
            .lock()
            .map_err(|_| EngineError::internal("fabric registry lock poisoned"))?;
        Ok(Arc::clone(
            fabrics
                .entry(cluster_name.to_string())
                .or_insert_with(|| Arc::new(Fabric::new(cluster_name))),
        ))
    }
}

impl Engine for LocalEngine {
    fn start(
        &self,
        identity: &ClusterIdentity,
        ordinal: usize,
        settings: Settings,
    ) -> EngineResult<Arc<dyn EngineNode>> {
        let cluster_name = settings
            .get(keys::CLUSTER_NAME)
            .unwrap_or(identity.name())
            .to_string();
        let fabric = self.fabric(&cluster_name)?;
        Ok(Arc::new(LocalNode::start(fabric, identity, ordinal, settings)?))
    }
}

/// State shared between a node and the clients it hands out.
struct NodeShared {
    name: String,
    fabric: Arc<Fabric>,
    closed: AtomicBool,
    /// Index settings applied when this node creates an index.
    index_settings: Settings,
    defaults: ShardLayout,
}

impl NodeShared {
    fn ensure_open(&self) -> EngineResult<&Fabric> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::NodeClosed(self.name.clone()));
        }
        Ok(&self.fabric)
    }
}

/// One running (or closed) in-process node.
pub struct LocalNode {
    shared: Arc<NodeShared>,
    ordinal: usize,
    instance_id: Uuid,
    settings: Settings,
    client: Arc<dyn Client>,
    server: Mutex<Option<ServerHandle>>,
    http_addr: Option<SocketAddr>,
    transport_addr: SocketAddr,
}

impl LocalNode {
    #[instrument(skip_all, fields(cluster = %fabric.name(), ordinal = ordinal))]
    fn start(
        fabric: Arc<Fabric>,
        identity: &ClusterIdentity,
        ordinal: usize,
        settings: Settings,
    ) -> EngineResult<Self> {
        let name = settings
            .get(keys::NODE_NAME)
            .map_or_else(|| node_name(ordinal), str::to_string);
        let data_dir = settings
            .get(keys::PATH_DATA)
            .map_or_else(|| identity.node_data_dir(ordinal), PathBuf::from);
        fs::create_dir_all(&data_dir)?;

        let master_eligible = settings.get_bool(keys::NODE_MASTER, true)?;
        let data = settings.get_bool(keys::NODE_DATA, true)?;
        let minimum_master_nodes = settings.get_or(keys::MINIMUM_MASTER_NODES, 1usize)?;
        let allocation_delay = settings.get_duration_ms(keys::ALLOCATION_DELAY_MS, Duration::ZERO)?;
        let host = settings.get_or(keys::NETWORK_HOST, IpAddr::V4(Ipv4Addr::LOCALHOST))?;
        let http_enabled = settings.get_bool(keys::HTTP_ENABLED, true)?;
        let http_port = settings.get_or(keys::HTTP_PORT, 0u16)?;
        let transport_port = settings.get_or(keys::TRANSPORT_PORT, 0u16)?;

        let shared = Arc::new(NodeShared {
            name: name.clone(),
            fabric: Arc::clone(&fabric),
            closed: AtomicBool::new(false),
            index_settings: index_settings_from_node(&settings),
            defaults: default_layout(&settings)?,
        });
        let client: Arc<dyn Client> = Arc::new(LocalClient {
            shared: Arc::clone(&shared),
        });

        let server = server::start(
            http_enabled.then_some(SocketAddr::new(host, http_port)),
            SocketAddr::new(host, transport_port),
            ServeContext {
                client: Arc::clone(&client),
                node_name: name.clone(),
                cluster_name: fabric.name().to_string(),
            },
        )?;
        let http_addr = server.http_addr();
        let transport_addr = server.transport_addr();

        let mut effective = settings.to_builder();
        effective
            .put(keys::CLUSTER_NAME, fabric.name())
            .put(keys::NODE_NAME, &name)
            .put(keys::PATH_DATA, data_dir.display())
            .put(keys::TRANSPORT_PORT, transport_addr.port());
        if let Some(addr) = http_addr {
            effective.put(keys::HTTP_PORT, addr.port());
        }

        let instance_id = Uuid::new_v4();
        fabric.join(MemberSpec {
            ordinal,
            name: name.clone(),
            instance_id,
            master_eligible,
            data,
            minimum_master_nodes,
            allocation_delay,
            data_dir,
        })?;

        info!(node = %name, %transport_addr, ?http_addr, "node started");
        Ok(Self {
            shared,
            ordinal,
            instance_id,
            settings: effective.build(),
            client,
            server: Mutex::new(Some(server)),
            http_addr,
            transport_addr,
        })
    }
}

impl EngineNode for LocalNode {
    fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn client(&self) -> Arc<dyn Client> {
        Arc::clone(&self.client)
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn close(&self) -> EngineResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let server = self
            .server
            .lock()
            .map_err(|_| EngineError::internal("server lock poisoned"))?
            .take();
        let stopped = server.map_or(Ok(()), |mut server| server.shutdown());
        self.shared.fabric.leave(self.ordinal, self.instance_id)?;
        info!(node = %self.shared.name, "node closed");
        stopped
    }

    fn http_address(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    fn transport_address(&self) -> SocketAddr {
        self.transport_addr
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Client that serves requests from the cluster fabric through its node.
struct LocalClient {
    shared: Arc<NodeShared>,
}

impl LocalClient {
    fn fabric(&self) -> EngineResult<&Fabric> {
        self.shared.ensure_open()
    }

    /// Settings for an index this node creates: node defaults, then `explicit`.
    fn index_settings(&self, explicit: &Settings) -> Settings {
        let mut builder = self.shared.index_settings.to_builder();
        builder.put_all(explicit);
        builder.build()
    }
}

impl Client for LocalClient {
    fn create_index(&self, index: &str, settings: &Settings) -> EngineResult<()> {
        self.fabric()?
            .create_index(index, &self.index_settings(settings), self.shared.defaults)
    }

    fn put_mapping(&self, index: &str, doc_type: &str, mapping: &str) -> EngineResult<()> {
        self.fabric()?.put_mapping(index, doc_type, mapping)
    }

    fn index_exists(&self, index: &str) -> EngineResult<bool> {
        self.fabric()?.index_exists(index)
    }

    fn delete_index(&self, index: &str) -> EngineResult<()> {
        self.fabric()?.delete_index(index)
    }

    fn index(
        &self,
        index: &str,
        doc_type: &str,
        id: Option<&str>,
        source: &str,
    ) -> EngineResult<IndexResponse> {
        let fabric = self.fabric()?;
        fabric.index_doc(
            index,
            doc_type,
            id,
            source,
            (&self.shared.index_settings, self.shared.defaults),
        )
    }

    fn get(&self, index: &str, doc_type: &str, id: &str) -> EngineResult<GetResponse> {
        self.fabric()?.get_doc(index, doc_type, id)
    }

    fn delete(&self, index: &str, doc_type: &str, id: &str) -> EngineResult<DeleteResponse> {
        self.fabric()?.delete_doc(index, doc_type, id)
    }

    fn search(&self, request: &SearchRequest) -> EngineResult<SearchResponse> {
        self.fabric()?.search(request)
    }

    fn count(
        &self,
        index: Option<&str>,
        doc_type: Option<&str>,
        query: &Query,
    ) -> EngineResult<u64> {
        self.fabric()?.count(index, doc_type, query)
    }

    fn refresh(&self, index: Option<&str>) -> EngineResult<()> {
        self.fabric()?.refresh(index)
    }

    fn flush(&self, index: Option<&str>) -> EngineResult<()> {
        self.fabric()?.flush(index)
    }

    fn optimize(&self, index: Option<&str>, only_expunge_deletes: bool) -> EngineResult<()> {
        self.fabric()?.optimize(index, only_expunge_deletes)
    }

    fn cluster_health(&self, index: Option<&str>) -> EngineResult<ClusterHealth> {
        self.fabric()?.health(index)
    }

    fn cluster_state(&self) -> EngineResult<ClusterStateSnapshot> {
        self.fabric()?.state_snapshot()
    }
}
