//! Engine capability traits.
//!
//! The cluster orchestrator only talks to nodes through these traits:
//! - [`Engine`] launches node instances
//! - [`EngineNode`] is one running (or closed) instance
//! - [`Client`] is the document/index/health API a node exposes
//!
//! [`crate::LocalEngine`] is the in-process implementation; tests can plug in
//! their own engines behind the same seams.

use std::net::SocketAddr;
use std::sync::Arc;

use quarry_types::{
    ClusterHealth, ClusterIdentity, ClusterStateSnapshot, DeleteResponse, GetResponse,
    IndexResponse, Query, SearchRequest, SearchResponse, Settings,
};
use uuid::Uuid;

use crate::EngineResult;

/// Launches engine node instances.
pub trait Engine: Send + Sync {
    /// Starts a node for slot `ordinal` of the cluster named by `identity`.
    ///
    /// `settings` are the node's effective settings; the returned node may
    /// extend them (for example with the ports it actually bound).
    fn start(
        &self,
        identity: &ClusterIdentity,
        ordinal: usize,
        settings: Settings,
    ) -> EngineResult<Arc<dyn EngineNode>>;
}

/// One engine instance.
pub trait EngineNode: Send + Sync {
    /// Unique per instance; a restarted slot gets a new id.
    fn instance_id(&self) -> Uuid;

    fn name(&self) -> &str;

    /// Effective settings, including bound ports.
    fn settings(&self) -> &Settings;

    /// Client that routes through this node.
    fn client(&self) -> Arc<dyn Client>;

    fn is_closed(&self) -> bool;

    /// Stops the node. Closing an already closed node is a no-op.
    fn close(&self) -> EngineResult<()>;

    /// Address of the HTTP endpoint, `None` when HTTP is disabled.
    fn http_address(&self) -> Option<SocketAddr>;

    /// Address of the native transport endpoint.
    fn transport_address(&self) -> SocketAddr;
}

/// Document, index and cluster API of a node.
///
/// Operations taking `index: Option<&str>` apply to every index when `None`.
pub trait Client: Send + Sync {
    fn create_index(&self, index: &str, settings: &Settings) -> EngineResult<()>;

    /// Stores the JSON `mapping` for `doc_type`; the index must exist.
    fn put_mapping(&self, index: &str, doc_type: &str, mapping: &str) -> EngineResult<()>;

    fn index_exists(&self, index: &str) -> EngineResult<bool>;

    fn delete_index(&self, index: &str) -> EngineResult<()>;

    /// Indexes `source`; a missing `id` is generated. Creates the index on
    /// demand.
    fn index(
        &self,
        index: &str,
        doc_type: &str,
        id: Option<&str>,
        source: &str,
    ) -> EngineResult<IndexResponse>;

    /// Realtime get, independent of refresh.
    fn get(&self, index: &str, doc_type: &str, id: &str) -> EngineResult<GetResponse>;

    fn delete(&self, index: &str, doc_type: &str, id: &str) -> EngineResult<DeleteResponse>;

    /// Searches the last refreshed view of the data.
    fn search(&self, request: &SearchRequest) -> EngineResult<SearchResponse>;

    fn count(&self, index: Option<&str>, doc_type: Option<&str>, query: &Query)
    -> EngineResult<u64>;

    /// Makes every indexed change visible to search.
    fn refresh(&self, index: Option<&str>) -> EngineResult<()>;

    /// Refreshes and persists segments when the store is on disk.
    fn flush(&self, index: Option<&str>) -> EngineResult<()>;

    /// Merges segments; `only_expunge_deletes` only drops deletions.
    fn optimize(&self, index: Option<&str>, only_expunge_deletes: bool) -> EngineResult<()>;

    fn cluster_health(&self, index: Option<&str>) -> EngineResult<ClusterHealth>;

    fn cluster_state(&self) -> EngineResult<ClusterStateSnapshot>;
}
