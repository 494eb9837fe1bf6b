//! Ordered table of node slots.

use std::sync::Arc;

use quarry_engine::Client;

use crate::node::NodeHandle;
use crate::{Error, Result};

/// Every slot of the cluster, indexed by ordinal.
///
/// The shape is fixed once the cluster is built; only the state behind each
/// handle changes.
#[derive(Debug, Default)]
pub struct MembershipTable {
    nodes: Vec<Arc<NodeHandle>>,
}

impl MembershipTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends the next slot. Handles must arrive in ordinal order.
    pub(crate) fn push(&mut self, node: NodeHandle) {
        debug_assert_eq!(node.ordinal(), self.nodes.len());
        self.nodes.push(Arc::new(node));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, ordinal: usize) -> Result<&Arc<NodeHandle>> {
        self.nodes.get(ordinal).ok_or(Error::IndexOutOfRange {
            ordinal,
            len: self.nodes.len(),
        })
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<NodeHandle>> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<NodeHandle>> {
        self.nodes.iter()
    }

    /// Running slots in ordinal order.
    pub fn running(&self) -> impl Iterator<Item = &Arc<NodeHandle>> {
        self.nodes.iter().filter(|node| !node.is_closed())
    }

    /// First running slot.
    pub fn first_running(&self) -> Result<&Arc<NodeHandle>> {
        self.running().next().ok_or(Error::NoRunningNode)
    }

    /// The running slot the cluster elected as master.
    pub fn master(&self, client: &dyn Client) -> Result<&Arc<NodeHandle>> {
        let master = client.cluster_state()?.master_node.ok_or(Error::NoMaster)?;
        self.running()
            .find(|node| node.name() == master)
            .ok_or(Error::NoMaster)
    }

    /// The first running slot that is not the elected master.
    pub fn non_master(&self, client: &dyn Client) -> Result<&Arc<NodeHandle>> {
        let master = client.cluster_state()?.master_node.ok_or(Error::NoMaster)?;
        self.running()
            .find(|node| node.name() != master)
            .ok_or(Error::NoMaster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use quarry_engine::{Engine, LocalEngine};
    use quarry_types::ClusterIdentity;
    use std::collections::HashSet;
    use tempfile::TempDir;

    use crate::RunnerConfig;

    fn table(temp: &TempDir, name: &str, count: usize) -> MembershipTable {
        let identity = ClusterIdentity::new(name, temp.path());
        let engine: Arc<dyn Engine> = Arc::new(LocalEngine::new());
        let config = RunnerConfig::new().with_http(false);
        let mut table = MembershipTable::new();
        for ordinal in 0..count {
            let node_config = config.node_config(&identity, ordinal);
            table.push(
                NodeHandle::launch(Arc::clone(&engine), identity.clone(), node_config).unwrap(),
            );
        }
        table
    }

    #[test]
    fn test_lookup_by_ordinal_and_name() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp, "lookup", 3);

        assert_eq!(table.len(), 3);
        assert_eq!(table.get(2).unwrap().name(), "Node 3");
        assert!(matches!(
            table.get(3),
            Err(Error::IndexOutOfRange { ordinal: 3, len: 3 })
        ));
        assert_eq!(table.by_name("Node 2").unwrap().ordinal(), 1);
        assert!(table.by_name("Node 4").is_none());
    }

    #[test]
    fn test_master_and_non_master_differ() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp, "roles", 3);
        let client = table.first_running().unwrap().client().unwrap();

        let master = table.master(client.as_ref()).unwrap();
        let non_master = table.non_master(client.as_ref()).unwrap();
        assert_eq!(master.ordinal(), 0);
        assert_eq!(non_master.ordinal(), 1);

        master.close().unwrap();
        let client = table.first_running().unwrap().client().unwrap();
        let master = table.master(client.as_ref()).unwrap();
        let non_master = table.non_master(client.as_ref()).unwrap();
        assert_eq!(master.ordinal(), 1);
        assert_eq!(non_master.ordinal(), 2);
        assert_eq!(table.running().count(), 2);
    }

    #[test]
    fn test_single_node_has_no_non_master() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp, "lonely", 1);
        let client = table.get(0).unwrap().client().unwrap();

        assert_eq!(table.master(client.as_ref()).unwrap().ordinal(), 0);
        assert!(matches!(
            table.non_master(client.as_ref()),
            Err(Error::NoMaster)
        ));
    }

    #[test]
    fn test_first_running_skips_closed() {
        let temp = TempDir::new().unwrap();
        let table = table(&temp, "skip", 2);

        table.get(0).unwrap().close().unwrap();
        assert_eq!(table.first_running().unwrap().ordinal(), 1);
        table.get(1).unwrap().close().unwrap();
        assert!(matches!(table.first_running(), Err(Error::NoRunningNode)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_slots_have_distinct_ordinals_and_names(count in 1usize..6) {
            let temp = TempDir::new().unwrap();
            let table = table(&temp, "prop", count);

            prop_assert_eq!(table.len(), count);
            let names: HashSet<_> = table.iter().map(|node| node.name().to_string()).collect();
            prop_assert_eq!(names.len(), count);
            for (ordinal, node) in table.iter().enumerate() {
                prop_assert_eq!(node.ordinal(), ordinal);
                prop_assert_eq!(table.by_name(node.name()).map(|n| n.ordinal()), Some(ordinal));
            }
        }
    }
}
