//! Shared state of one in-process cluster.
//!
//! Every node of a cluster joins the same [`Fabric`]. The fabric tracks
//! membership, runs master election, computes shard allocation and health,
//! and owns the index data that any node answers from.
//!
//! # Election
//!
//! Election is sticky: a running master-eligible master keeps its role.
//! Otherwise the lowest-ordinal running master-eligible node wins, provided
//! at least `minimum_master_nodes` master-eligible nodes are running.
//!
//! # Allocation
//!
//! Each index has `shards` primaries with `replicas` copies each. A shard can
//! place at most one copy per running data node. Primaries initialise for the
//! allocation delay after index creation; replicas initialise for the same
//! delay after index creation or the last topology change.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use quarry_types::{
    ClusterHealth, ClusterStateSnapshot, DeleteResponse, GetResponse, HealthState, IndexResponse,
    MemberInfo, Query, SearchRequest, SearchResponse, Settings, StorageMode, keys,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::index::{IndexState, ShardLayout};
use crate::query::sort_hits;
use crate::{EngineError, EngineResult};

/// Static description of a member, captured when its instance starts.
#[derive(Debug, Clone)]
pub(crate) struct MemberSpec {
    pub(crate) ordinal: usize,
    pub(crate) name: String,
    pub(crate) instance_id: Uuid,
    pub(crate) master_eligible: bool,
    pub(crate) data: bool,
    pub(crate) minimum_master_nodes: usize,
    pub(crate) allocation_delay: Duration,
    pub(crate) data_dir: PathBuf,
}

#[derive(Debug)]
struct Member {
    spec: MemberSpec,
    running: bool,
}

#[derive(Debug)]
struct FabricState {
    members: BTreeMap<usize, Member>,
    master: Option<usize>,
    topology_changed_at: Instant,
    indices: BTreeMap<String, IndexState>,
}

/// Cluster-wide state shared by every node of one cluster.
#[derive(Debug)]
pub(crate) struct Fabric {
    name: String,
    state: RwLock<FabricState>,
}

/// Shard counts of one index at one instant.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ShardCounts {
    active_primary: u32,
    active: u32,
    initializing: u32,
    unassigned: u32,
}

impl Fabric {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(FabricState {
                members: BTreeMap::new(),
                master: None,
                topology_changed_at: Instant::now(),
                indices: BTreeMap::new(),
            }),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> EngineResult<RwLockReadGuard<'_, FabricState>> {
        self.state
            .read()
            .map_err(|_| EngineError::internal("fabric lock poisoned"))
    }

    fn write(&self) -> EngineResult<RwLockWriteGuard<'_, FabricState>> {
        self.state
            .write()
            .map_err(|_| EngineError::internal("fabric lock poisoned"))
    }

    // ========================================================================
    // Membership
    // ========================================================================

    /// Registers a started instance, replacing whatever held its slot.
    pub(crate) fn join(&self, spec: MemberSpec) -> EngineResult<()> {
        let mut state = self.write()?;
        info!(
            cluster = %self.name,
            node = %spec.name,
            instance = %spec.instance_id,
            "node joined"
        );
        state.members.insert(
            spec.ordinal,
            Member {
                spec,
                running: true,
            },
        );
        state.topology_changed_at = Instant::now();
        state.elect(&self.name);
        Ok(())
    }

    /// Marks the instance as gone. Stale instances of a restarted slot are
    /// ignored.
    pub(crate) fn leave(&self, ordinal: usize, instance_id: Uuid) -> EngineResult<()> {
        let mut state = self.write()?;
        let Some(member) = state.members.get_mut(&ordinal) else {
            return Ok(());
        };
        if member.spec.instance_id != instance_id || !member.running {
            return Ok(());
        }
        member.running = false;
        info!(cluster = %self.name, node = %member.spec.name, "node left");
        state.topology_changed_at = Instant::now();
        state.elect(&self.name);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn master_name(&self) -> EngineResult<Option<String>> {
        let state = self.read()?;
        Ok(state.master_spec().map(|spec| spec.name.clone()))
    }

    pub(crate) fn state_snapshot(&self) -> EngineResult<ClusterStateSnapshot> {
        let state = self.read()?;
        Ok(ClusterStateSnapshot {
            cluster_name: self.name.clone(),
            master_node: state.master_spec().map(|spec| spec.name.clone()),
            nodes: state
                .members
                .values()
                .map(|m| MemberInfo {
                    ordinal: m.spec.ordinal,
                    name: m.spec.name.clone(),
                    running: m.running,
                    master_eligible: m.spec.master_eligible,
                    data: m.spec.data,
                })
                .collect(),
            indices: state.indices.keys().cloned().collect(),
        })
    }

    // ========================================================================
    // Indices
    // ========================================================================

    pub(crate) fn create_index(
        &self,
        index: &str,
        settings: &Settings,
        defaults: ShardLayout,
    ) -> EngineResult<()> {
        let mut state = self.write()?;
        state.require_master()?;
        if state.indices.contains_key(index) {
            return Err(EngineError::IndexAlreadyExists(index.to_string()));
        }
        let layout = ShardLayout::from_settings(settings, defaults)?;
        info!(
            cluster = %self.name,
            index,
            shards = layout.shards,
            replicas = layout.replicas,
            "index created"
        );
        state
            .indices
            .insert(index.to_string(), IndexState::new(index, layout, settings.clone()));
        Ok(())
    }

    pub(crate) fn delete_index(&self, index: &str) -> EngineResult<()> {
        let mut state = self.write()?;
        state.require_master()?;
        if state.indices.remove(index).is_none() {
            return Err(EngineError::IndexNotFound(index.to_string()));
        }
        info!(cluster = %self.name, index, "index deleted");
        Ok(())
    }

    pub(crate) fn index_exists(&self, index: &str) -> EngineResult<bool> {
        Ok(self.read()?.indices.contains_key(index))
    }

    pub(crate) fn put_mapping(&self, index: &str, doc_type: &str, mapping: &str) -> EngineResult<()> {
        let mut state = self.write()?;
        state.require_master()?;
        state.index_mut(index)?.put_mapping(doc_type, mapping)
    }

    /// Indexes a document, creating the index with `auto_create` settings
    /// when it does not exist yet.
    pub(crate) fn index_doc(
        &self,
        index: &str,
        doc_type: &str,
        id: Option<&str>,
        source: &str,
        auto_create: (&Settings, ShardLayout),
    ) -> EngineResult<IndexResponse> {
        let mut state = self.write()?;
        state.require_master()?;
        if !state.indices.contains_key(index) {
            let (settings, defaults) = auto_create;
            let layout = ShardLayout::from_settings(settings, defaults)?;
            debug!(cluster = %self.name, index, "auto-creating index");
            state
                .indices
                .insert(index.to_string(), IndexState::new(index, layout, settings.clone()));
        }
        state.index_mut(index)?.index(doc_type, id, source)
    }

    pub(crate) fn get_doc(&self, index: &str, doc_type: &str, id: &str) -> EngineResult<GetResponse> {
        let state = self.read()?;
        state.require_master()?;
        Ok(state.index(index)?.get(doc_type, id))
    }

    pub(crate) fn delete_doc(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
    ) -> EngineResult<DeleteResponse> {
        let mut state = self.write()?;
        state.require_master()?;
        Ok(state.index_mut(index)?.delete(doc_type, id))
    }

    pub(crate) fn search(&self, request: &SearchRequest) -> EngineResult<SearchResponse> {
        let started = Instant::now();
        let state = self.read()?;
        state.require_master()?;

        let mut hits = Vec::new();
        for idx in state.targets(request.index.as_deref())? {
            idx.collect_hits(request, &mut hits);
        }
        if let Some(sort) = &request.sort {
            sort_hits(&mut hits, sort, |(_, doc)| *doc);
        }

        let total_hits = hits.len() as u64;
        let page = hits
            .into_iter()
            .skip(request.from)
            .take(request.size)
            .map(|(hit, _)| hit)
            .collect();

        Ok(SearchResponse {
            took_ms: started.elapsed().as_millis() as u64,
            timed_out: false,
            total_hits,
            hits: page,
        })
    }

    pub(crate) fn count(
        &self,
        index: Option<&str>,
        doc_type: Option<&str>,
        query: &Query,
    ) -> EngineResult<u64> {
        let state = self.read()?;
        state.require_master()?;
        Ok(state
            .targets(index)?
            .map(|idx| idx.count(doc_type, query))
            .sum())
    }

    pub(crate) fn refresh(&self, index: Option<&str>) -> EngineResult<()> {
        let mut state = self.write()?;
        state.require_master()?;
        for idx in state.targets_mut(index)? {
            idx.refresh();
        }
        Ok(())
    }

    /// Refreshes, then writes on-disk indices to every running data node.
    pub(crate) fn flush(&self, index: Option<&str>) -> EngineResult<()> {
        let mut state = self.write()?;
        state.require_master()?;
        let data_dirs = state.data_dirs();
        for idx in state.targets_mut(index)? {
            idx.refresh();
            persist_if_fs(idx, &data_dirs)?;
        }
        Ok(())
    }

    pub(crate) fn optimize(&self, index: Option<&str>, only_expunge_deletes: bool) -> EngineResult<()> {
        let mut state = self.write()?;
        state.require_master()?;
        let data_dirs = state.data_dirs();
        for idx in state.targets_mut(index)? {
            let expunged = idx.deleted_docs();
            idx.optimize(only_expunge_deletes);
            debug!(index = idx.name(), expunged, only_expunge_deletes, "segments merged");
            persist_if_fs(idx, &data_dirs)?;
        }
        Ok(())
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub(crate) fn health(&self, index: Option<&str>) -> EngineResult<ClusterHealth> {
        let state = self.read()?;
        let now = Instant::now();
        let running = state.members.values().filter(|m| m.running);
        let number_of_nodes = running.clone().count() as u32;
        let number_of_data_nodes = running.filter(|m| m.spec.data).count() as u32;

        let mut health = ClusterHealth {
            cluster_name: self.name.clone(),
            status: HealthState::Green,
            timed_out: false,
            number_of_nodes,
            number_of_data_nodes,
            active_primary_shards: 0,
            active_shards: 0,
            initializing_shards: 0,
            unassigned_shards: 0,
        };

        let delay = state
            .master_spec()
            .map_or(Duration::ZERO, |spec| spec.allocation_delay);
        let scoped: Vec<&IndexState> = match index {
            Some(name) => match state.indices.get(name) {
                Some(idx) => vec![idx],
                None => {
                    health.status = HealthState::Red;
                    return Ok(health);
                }
            },
            None => state.indices.values().collect(),
        };

        for idx in scoped {
            let (status, counts) =
                allocate(idx, number_of_data_nodes, state.topology_changed_at, delay, now);
            health.status = health.status.min(status);
            health.active_primary_shards += counts.active_primary;
            health.active_shards += counts.active;
            health.initializing_shards += counts.initializing;
            health.unassigned_shards += counts.unassigned;
        }

        if state.master.is_none() {
            health.status = HealthState::Red;
        }
        Ok(health)
    }
}

impl FabricState {
    fn master_spec(&self) -> Option<&MemberSpec> {
        self.master
            .and_then(|ordinal| self.members.get(&ordinal))
            .filter(|m| m.running)
            .map(|m| &m.spec)
    }

    fn require_master(&self) -> EngineResult<()> {
        self.master_spec().map(|_| ()).ok_or(EngineError::NoMaster)
    }

    fn elect(&mut self, cluster: &str) {
        let eligible: Vec<&Member> = self
            .members
            .values()
            .filter(|m| m.running && m.spec.master_eligible)
            .collect();
        let quorum = eligible
            .iter()
            .map(|m| m.spec.minimum_master_nodes)
            .max()
            .unwrap_or(1);

        let previous = self.master;
        let sticky = previous.filter(|ordinal| eligible.iter().any(|m| m.spec.ordinal == *ordinal));
        self.master = if eligible.len() < quorum {
            None
        } else {
            sticky.or_else(|| eligible.first().map(|m| m.spec.ordinal))
        };

        if self.master != previous {
            match self.master.and_then(|o| self.members.get(&o)) {
                Some(master) => info!(cluster, master = %master.spec.name, "master elected"),
                None => warn!(cluster, eligible = eligible.len(), quorum, "no master elected"),
            }
        }
    }

    fn data_dirs(&self) -> Vec<PathBuf> {
        self.members
            .values()
            .filter(|m| m.running && m.spec.data)
            .map(|m| m.spec.data_dir.clone())
            .collect()
    }

    fn index(&self, name: &str) -> EngineResult<&IndexState> {
        self.indices
            .get(name)
            .ok_or_else(|| EngineError::IndexNotFound(name.to_string()))
    }

    fn index_mut(&mut self, name: &str) -> EngineResult<&mut IndexState> {
        self.indices
            .get_mut(name)
            .ok_or_else(|| EngineError::IndexNotFound(name.to_string()))
    }

    /// Indices addressed by an optional name; `None` means all.
    fn targets(&self, index: Option<&str>) -> EngineResult<impl Iterator<Item = &IndexState>> {
        let selected: Vec<&IndexState> = match index {
            Some(name) => vec![self.index(name)?],
            None => self.indices.values().collect(),
        };
        Ok(selected.into_iter())
    }

    fn targets_mut(
        &mut self,
        index: Option<&str>,
    ) -> EngineResult<impl Iterator<Item = &mut IndexState>> {
        let selected: Vec<&mut IndexState> = match index {
            Some(name) => vec![self.index_mut(name)?],
            None => self.indices.values_mut().collect(),
        };
        Ok(selected.into_iter())
    }
}

fn store_type(settings: &Settings) -> StorageMode {
    settings
        .get(keys::STORE_TYPE)
        .and_then(StorageMode::from_setting)
        .unwrap_or_default()
}

fn persist_if_fs(idx: &IndexState, data_dirs: &[PathBuf]) -> EngineResult<()> {
    if store_type(idx.settings()) != StorageMode::Fs {
        return Ok(());
    }
    for dir in data_dirs {
        let path = idx.persist(dir)?;
        debug!(path = %path.display(), "segment written");
    }
    Ok(())
}

/// Health and shard counts of one index.
fn allocate(
    idx: &IndexState,
    data_nodes: u32,
    topology_changed_at: Instant,
    delay: Duration,
    now: Instant,
) -> (HealthState, ShardCounts) {
    let ShardLayout { shards, replicas } = idx.layout;
    let copies = 1 + replicas;
    let assignable = copies.min(data_nodes);
    let mut counts = ShardCounts {
        unassigned: shards * (copies - assignable),
        ..ShardCounts::default()
    };
    if assignable == 0 {
        return (HealthState::Red, counts);
    }

    let primaries_ready = now >= idx.created_at + delay;
    let replicas_ready = now >= idx.created_at.max(topology_changed_at) + delay;
    let replica_copies = shards * (assignable - 1);

    if primaries_ready {
        counts.active_primary = shards;
        counts.active += shards;
    } else {
        counts.initializing += shards;
    }
    if replicas_ready {
        counts.active += replica_copies;
    } else {
        counts.initializing += replica_copies;
    }

    let status = if !primaries_ready {
        HealthState::Red
    } else if counts.unassigned > 0 || counts.initializing > 0 {
        HealthState::Yellow
    } else {
        HealthState::Green
    };
    (status, counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(ordinal: usize) -> MemberSpec {
        MemberSpec {
            ordinal,
            name: quarry_types::node_name(ordinal),
            instance_id: Uuid::new_v4(),
            master_eligible: true,
            data: true,
            minimum_master_nodes: 1,
            allocation_delay: Duration::ZERO,
            data_dir: PathBuf::from(format!("/tmp/quarry-fabric-test/node_{}", ordinal + 1)),
        }
    }

    fn layout(shards: u32, replicas: u32) -> ShardLayout {
        ShardLayout { shards, replicas }
    }

    #[test]
    fn first_joiner_keeps_master_role() {
        let fabric = Fabric::new("c");
        fabric.join(spec(2)).unwrap();
        fabric.join(spec(0)).unwrap();
        fabric.join(spec(1)).unwrap();
        // Node 3 was elected alone and stays master.
        assert_eq!(fabric.master_name().unwrap().as_deref(), Some("Node 3"));
    }

    #[test]
    fn master_is_sticky_and_fails_over() {
        let fabric = Fabric::new("c");
        let first = spec(0);
        let first_id = first.instance_id;
        fabric.join(first).unwrap();
        fabric.join(spec(1)).unwrap();
        fabric.join(spec(2)).unwrap();
        assert_eq!(fabric.master_name().unwrap().as_deref(), Some("Node 1"));

        fabric.leave(0, first_id).unwrap();
        assert_eq!(fabric.master_name().unwrap().as_deref(), Some("Node 2"));

        fabric.join(spec(0)).unwrap();
        assert_eq!(fabric.master_name().unwrap().as_deref(), Some("Node 2"));
    }

    #[test]
    fn stale_instance_leave_is_ignored() {
        let fabric = Fabric::new("c");
        fabric.join(spec(0)).unwrap();
        fabric.leave(0, Uuid::new_v4()).unwrap();
        assert_eq!(fabric.master_name().unwrap().as_deref(), Some("Node 1"));
    }

    #[test]
    fn quorum_blocks_election() {
        let fabric = Fabric::new("c");
        let mut a = spec(0);
        a.minimum_master_nodes = 2;
        fabric.join(a).unwrap();
        assert_eq!(fabric.master_name().unwrap(), None);
        assert_eq!(fabric.health(None).unwrap().status, HealthState::Red);
        assert!(matches!(
            fabric.create_index("i", &Settings::default(), layout(1, 0)),
            Err(EngineError::NoMaster)
        ));

        fabric.join(spec(1)).unwrap();
        assert_eq!(fabric.master_name().unwrap().as_deref(), Some("Node 1"));
    }

    #[test]
    fn non_eligible_nodes_never_become_master() {
        let fabric = Fabric::new("c");
        let mut a = spec(0);
        a.master_eligible = false;
        fabric.join(a).unwrap();
        fabric.join(spec(1)).unwrap();
        assert_eq!(fabric.master_name().unwrap().as_deref(), Some("Node 2"));
    }

    #[test]
    fn health_without_indices_is_green() {
        let fabric = Fabric::new("c");
        fabric.join(spec(0)).unwrap();
        let health = fabric.health(None).unwrap();
        assert_eq!(health.status, HealthState::Green);
        assert_eq!(health.number_of_nodes, 1);
    }

    #[test]
    fn single_node_with_replicas_stays_yellow() {
        let fabric = Fabric::new("c");
        fabric.join(spec(0)).unwrap();
        fabric
            .create_index("i", &Settings::default(), layout(2, 1))
            .unwrap();
        let health = fabric.health(Some("i")).unwrap();
        assert_eq!(health.status, HealthState::Yellow);
        assert_eq!(health.active_primary_shards, 2);
        assert_eq!(health.unassigned_shards, 2);
    }

    #[test]
    fn two_nodes_allocate_every_replica() {
        let fabric = Fabric::new("c");
        fabric.join(spec(0)).unwrap();
        fabric.join(spec(1)).unwrap();
        fabric
            .create_index("i", &Settings::default(), layout(3, 1))
            .unwrap();
        let health = fabric.health(Some("i")).unwrap();
        assert_eq!(health.status, HealthState::Green);
        assert_eq!(health.active_shards, 6);
    }

    #[test]
    fn allocation_delay_initialises_shards() {
        let fabric = Fabric::new("c");
        let mut a = spec(0);
        a.allocation_delay = Duration::from_secs(3600);
        fabric.join(a).unwrap();
        fabric.join(spec(1)).unwrap();
        fabric
            .create_index("i", &Settings::default(), layout(1, 1))
            .unwrap();
        let health = fabric.health(Some("i")).unwrap();
        assert_eq!(health.status, HealthState::Red);
        assert_eq!(health.initializing_shards, 2);
    }

    #[test]
    fn missing_index_health_is_red() {
        let fabric = Fabric::new("c");
        fabric.join(spec(0)).unwrap();
        assert_eq!(
            fabric.health(Some("nope")).unwrap().status,
            HealthState::Red
        );
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let fabric = Fabric::new("c");
        fabric.join(spec(0)).unwrap();
        fabric
            .create_index("i", &Settings::default(), layout(1, 0))
            .unwrap();
        assert!(matches!(
            fabric.create_index("i", &Settings::default(), layout(1, 0)),
            Err(EngineError::IndexAlreadyExists(name)) if name == "i"
        ));
    }

    #[test]
    fn search_pages_and_sorts_across_indices() {
        let fabric = Fabric::new("c");
        fabric.join(spec(0)).unwrap();
        let auto = (&Settings::default(), layout(1, 0));
        for i in 1..=25 {
            let index = if i % 2 == 0 { "even" } else { "odd" };
            fabric
                .index_doc(index, "t", Some(&i.to_string()), &format!(r#"{{"order":{i}}}"#), auto)
                .unwrap();
        }
        fabric.refresh(None).unwrap();

        let request = SearchRequest::all_indices()
            .sort(quarry_types::Sort::field("order"))
            .page(5, 10);
        let response = fabric.search(&request).unwrap();
        assert_eq!(response.total_hits, 25);
        assert_eq!(response.hits.len(), 10);
        assert_eq!(response.hits[0].id, "6");

        assert_eq!(fabric.count(Some("odd"), None, &Query::MatchAll).unwrap(), 13);
    }

    #[test]
    fn flush_persists_fs_indices_on_data_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let fabric = Fabric::new("c");
        let mut a = spec(0);
        a.data_dir = dir.path().join("node_1");
        fabric.join(a).unwrap();

        let settings = Settings::builder().put(keys::STORE_TYPE, "fs").build();
        fabric.create_index("disk", &settings, layout(1, 0)).unwrap();
        fabric
            .create_index("mem", &Settings::default(), layout(1, 0))
            .unwrap();
        fabric.flush(None).unwrap();

        assert!(dir.path().join("node_1/indices/disk/segments.json").exists());
        assert!(!dir.path().join("node_1/indices/mem").exists());
    }
}
