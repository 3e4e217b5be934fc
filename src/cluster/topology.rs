//! NodeSet and DiskSet topology index.
//!
//! Nodes are grouped into NodeSets per disk type; each NodeSet carves its
//! disks into DiskSets, the copy-set granules handed to allocation. A node
//! belongs to at most one NodeSet, a disk to at most one DiskSet, and every
//! DiskSet draws only from its own NodeSet.
//!
//! All structures live behind a single topology mutex, which is the last
//! lock in the crate-wide order (after store, node and disk locks), so any
//! handler may take it while holding entity locks.

use crate::config::CopySetConfig;
use crate::error::{BedrockError, Result};
use crate::types::{
    DiskId, DiskSetId, DiskType, NodeId, NodeInfo, NodeSetId, NodeSetInfo, TopologyInfo,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// One copy-set bucket of disks within a NodeSet.
#[derive(Debug, Default)]
struct DiskSet {
    disks: BTreeMap<DiskId, NodeId>,
    /// How many disks each node contributes.
    per_node: BTreeMap<NodeId, usize>,
}

/// One fault-isolation bucket of nodes.
#[derive(Debug)]
struct NodeSet {
    id: NodeSetId,
    /// Member nodes and their racks.
    nodes: BTreeMap<NodeId, String>,
    disk_sets: BTreeMap<DiskSetId, DiskSet>,
}

impl NodeSet {
    fn rack_count(&self, rack: &str) -> usize {
        self.nodes.values().filter(|r| r.as_str() == rack).count()
    }
}

#[derive(Default)]
struct TopoInner {
    cur_node_set_id: NodeSetId,
    cur_disk_set_id: DiskSetId,
    node_sets: HashMap<DiskType, BTreeMap<NodeSetId, NodeSet>>,
}

impl TopoInner {
    fn set_mut(&mut self, disk_type: DiskType, id: NodeSetId) -> &mut NodeSet {
        self.node_sets
            .entry(disk_type)
            .or_default()
            .entry(id)
            .or_insert_with(|| NodeSet {
                id,
                nodes: BTreeMap::new(),
                disk_sets: BTreeMap::new(),
            })
    }
}

/// Topology index over all NodeSets and DiskSets.
#[derive(Default)]
pub struct TopologyIndex {
    inner: Mutex<TopoInner>,
}

impl TopologyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick (or create) the NodeSet a new node should join.
    ///
    /// Among sets of the node's disk type with spare capacity, the one with
    /// the fewest members wins; rack-aware mode additionally skips sets that
    /// already hold `node_set_rack_cap` nodes of the candidate's rack. When
    /// nothing fits, a fresh set is allocated past the current cursor.
    pub fn alloc_node_set_id(
        &self,
        info: &NodeInfo,
        copy_set_cfg: &CopySetConfig,
        rack_aware: bool,
    ) -> NodeSetId {
        let mut inner = self.inner.lock();

        let mut best: Option<(NodeSetId, usize)> = None;
        if let Some(sets) = inner.node_sets.get(&info.disk_type) {
            for set in sets.values() {
                if set.nodes.len() >= copy_set_cfg.node_set_cap {
                    continue;
                }
                if rack_aware && set.rack_count(&info.rack) >= copy_set_cfg.node_set_rack_cap {
                    continue;
                }
                match best {
                    Some((_, count)) if count <= set.nodes.len() => {}
                    _ => best = Some((set.id, set.nodes.len())),
                }
            }
        }

        if let Some((id, _)) = best {
            return id;
        }

        inner.cur_node_set_id += 1;
        let id = inner.cur_node_set_id;
        inner.set_mut(info.disk_type, id);
        debug!(node_set_id = id, disk_type = %info.disk_type, "allocated new node set");
        id
    }

    /// Whether the given NodeSet exists for the disk type.
    pub fn validate_node_set_id(&self, disk_type: DiskType, id: NodeSetId) -> Result<()> {
        let inner = self.inner.lock();
        let exists = inner
            .node_sets
            .get(&disk_type)
            .map(|sets| sets.contains_key(&id))
            .unwrap_or(false);
        if exists {
            Ok(())
        } else {
            Err(BedrockError::IllegalArgument(format!(
                "node set {} does not exist for {}",
                id, disk_type
            )))
        }
    }

    /// Register a node in its NodeSet. Creates the set when replaying a node
    /// that carried a pre-assigned id.
    pub fn add_node_to_node_set(&self, info: &NodeInfo) {
        let mut inner = self.inner.lock();
        if info.node_set_id > inner.cur_node_set_id {
            inner.cur_node_set_id = info.node_set_id;
        }
        inner
            .set_mut(info.disk_type, info.node_set_id)
            .nodes
            .insert(info.node_id, info.rack.clone());
    }

    /// Remove a dropped node from its NodeSet.
    pub fn remove_node_from_node_set(&self, info: &NodeInfo) {
        let mut inner = self.inner.lock();
        if let Some(sets) = inner.node_sets.get_mut(&info.disk_type) {
            if let Some(set) = sets.get_mut(&info.node_set_id) {
                set.nodes.remove(&info.node_id);
            }
        }
    }

    /// Place a disk into a DiskSet of its node's NodeSet.
    ///
    /// Among the set's DiskSets with spare capacity whose per-node quota is
    /// not exhausted for this node, the smallest wins; otherwise a new
    /// DiskSet is opened.
    pub fn add_disk_to_disk_set(
        &self,
        disk_type: DiskType,
        node_set_id: NodeSetId,
        disk_id: DiskId,
        node_id: NodeId,
        copy_set_cfg: &CopySetConfig,
    ) -> DiskSetId {
        let mut inner = self.inner.lock();
        let cursor = inner.cur_disk_set_id;
        let set = inner.set_mut(disk_type, node_set_id);

        let mut best: Option<(DiskSetId, usize)> = None;
        for (id, disk_set) in &set.disk_sets {
            if disk_set.disks.len() >= copy_set_cfg.disk_set_cap {
                continue;
            }
            let contributed = disk_set.per_node.get(&node_id).copied().unwrap_or(0);
            if contributed >= copy_set_cfg.disk_count_per_node_in_disk_set {
                continue;
            }
            match best {
                Some((_, count)) if count <= disk_set.disks.len() => {}
                _ => best = Some((*id, disk_set.disks.len())),
            }
        }

        let disk_set_id = match best {
            Some((id, _)) => id,
            None => {
                let id = cursor + 1;
                set.disk_sets.insert(id, DiskSet::default());
                id
            }
        };

        let disk_set = set.disk_sets.entry(disk_set_id).or_default();
        disk_set.disks.insert(disk_id, node_id);
        *disk_set.per_node.entry(node_id).or_insert(0) += 1;

        if disk_set_id > inner.cur_disk_set_id {
            inner.cur_disk_set_id = disk_set_id;
        }
        disk_set_id
    }

    /// Remove a disk from its DiskSet (drain or repair completion).
    pub fn remove_disk_from_disk_set(
        &self,
        disk_type: DiskType,
        node_set_id: NodeSetId,
        disk_id: DiskId,
    ) {
        let mut inner = self.inner.lock();
        let Some(sets) = inner.node_sets.get_mut(&disk_type) else {
            return;
        };
        let Some(set) = sets.get_mut(&node_set_id) else {
            return;
        };
        for disk_set in set.disk_sets.values_mut() {
            if let Some(node_id) = disk_set.disks.remove(&disk_id) {
                if let Some(count) = disk_set.per_node.get_mut(&node_id) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        disk_set.per_node.remove(&node_id);
                    }
                }
                return;
            }
        }
    }

    /// Current NodeSet id cursor.
    pub fn node_set_id_cursor(&self) -> NodeSetId {
        self.inner.lock().cur_node_set_id
    }

    /// Current DiskSet id cursor.
    pub fn disk_set_id_cursor(&self) -> DiskSetId {
        self.inner.lock().cur_disk_set_id
    }

    /// Full dump for topology queries.
    pub fn topology_info(&self) -> TopologyInfo {
        let inner = self.inner.lock();
        let mut out = TopologyInfo {
            cur_node_set_id: inner.cur_node_set_id,
            cur_disk_set_id: inner.cur_disk_set_id,
            all_node_sets: HashMap::new(),
        };

        for (disk_type, sets) in &inner.node_sets {
            let by_id = out
                .all_node_sets
                .entry(disk_type.to_string())
                .or_default();
            for set in sets.values() {
                let mut info = NodeSetInfo {
                    id: set.id,
                    number: set.nodes.len(),
                    nodes: set.nodes.keys().copied().collect(),
                    disk_sets: HashMap::new(),
                };
                for (disk_set_id, disk_set) in &set.disk_sets {
                    info.disk_sets
                        .insert(*disk_set_id, disk_set.disks.keys().copied().collect());
                }
                by_id.insert(set.id, info);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeRole, NodeStatus};

    fn node(node_id: NodeId, rack: &str) -> NodeInfo {
        NodeInfo {
            node_id,
            host: format!("h{}", node_id),
            idc: "z0".to_string(),
            rack: rack.to_string(),
            disk_type: DiskType::Hdd,
            role: NodeRole::BlobNode,
            status: NodeStatus::Normal,
            node_set_id: 0,
        }
    }

    fn small_cfg() -> CopySetConfig {
        CopySetConfig {
            node_set_cap: 2,
            node_set_rack_cap: 1,
            disk_set_cap: 4,
            disk_count_per_node_in_disk_set: 2,
        }
    }

    #[test]
    fn test_alloc_prefers_smallest_set_with_capacity() {
        let topo = TopologyIndex::new();
        let cfg = small_cfg();

        let mut n1 = node(1, "r1");
        n1.node_set_id = topo.alloc_node_set_id(&n1, &cfg, false);
        topo.add_node_to_node_set(&n1);
        assert_eq!(n1.node_set_id, 1);

        let mut n2 = node(2, "r2");
        n2.node_set_id = topo.alloc_node_set_id(&n2, &cfg, false);
        topo.add_node_to_node_set(&n2);
        assert_eq!(n2.node_set_id, 1);

        // Set 1 is full; a third node opens set 2.
        let mut n3 = node(3, "r3");
        n3.node_set_id = topo.alloc_node_set_id(&n3, &cfg, false);
        topo.add_node_to_node_set(&n3);
        assert_eq!(n3.node_set_id, 2);
    }

    #[test]
    fn test_rack_aware_skips_full_racks() {
        let topo = TopologyIndex::new();
        let cfg = small_cfg();

        let mut n1 = node(1, "r1");
        n1.node_set_id = topo.alloc_node_set_id(&n1, &cfg, true);
        topo.add_node_to_node_set(&n1);

        // Same rack: set 1 already holds one r1 node, rack cap is 1.
        let mut n2 = node(2, "r1");
        n2.node_set_id = topo.alloc_node_set_id(&n2, &cfg, true);
        topo.add_node_to_node_set(&n2);
        assert_ne!(n2.node_set_id, n1.node_set_id);

        // Different rack still fits in set 1.
        let mut n3 = node(3, "r2");
        n3.node_set_id = topo.alloc_node_set_id(&n3, &cfg, true);
        assert_eq!(n3.node_set_id, n1.node_set_id);
    }

    #[test]
    fn test_disk_set_per_node_quota() {
        let topo = TopologyIndex::new();
        let cfg = small_cfg();

        let mut n1 = node(1, "r1");
        n1.node_set_id = topo.alloc_node_set_id(&n1, &cfg, false);
        topo.add_node_to_node_set(&n1);

        let ds1 = topo.add_disk_to_disk_set(DiskType::Hdd, n1.node_set_id, 10, 1, &cfg);
        let ds2 = topo.add_disk_to_disk_set(DiskType::Hdd, n1.node_set_id, 11, 1, &cfg);
        assert_eq!(ds1, ds2);

        // Third disk of the same node exceeds disk_count_per_node_in_disk_set.
        let ds3 = topo.add_disk_to_disk_set(DiskType::Hdd, n1.node_set_id, 12, 1, &cfg);
        assert_ne!(ds3, ds1);
    }

    #[test]
    fn test_remove_disk_releases_quota() {
        let topo = TopologyIndex::new();
        let cfg = small_cfg();

        let mut n1 = node(1, "r1");
        n1.node_set_id = topo.alloc_node_set_id(&n1, &cfg, false);
        topo.add_node_to_node_set(&n1);

        let ds1 = topo.add_disk_to_disk_set(DiskType::Hdd, n1.node_set_id, 10, 1, &cfg);
        topo.add_disk_to_disk_set(DiskType::Hdd, n1.node_set_id, 11, 1, &cfg);
        topo.remove_disk_from_disk_set(DiskType::Hdd, n1.node_set_id, 10);

        // Quota freed: the next disk lands back in the first set.
        let ds3 = topo.add_disk_to_disk_set(DiskType::Hdd, n1.node_set_id, 12, 1, &cfg);
        assert_eq!(ds3, ds1);
    }

    #[test]
    fn test_validate_node_set_id() {
        let topo = TopologyIndex::new();
        let cfg = small_cfg();

        assert!(topo.validate_node_set_id(DiskType::Hdd, 1).is_err());

        let n1 = node(1, "r1");
        let id = topo.alloc_node_set_id(&n1, &cfg, false);
        assert!(topo.validate_node_set_id(DiskType::Hdd, id).is_ok());
        assert!(topo.validate_node_set_id(DiskType::Ssd, id).is_err());
    }

    #[test]
    fn test_topology_info_dump() {
        let topo = TopologyIndex::new();
        let cfg = small_cfg();

        let mut n1 = node(1, "r1");
        n1.node_set_id = topo.alloc_node_set_id(&n1, &cfg, false);
        topo.add_node_to_node_set(&n1);
        topo.add_disk_to_disk_set(DiskType::Hdd, n1.node_set_id, 10, 1, &cfg);

        let info = topo.topology_info();
        assert_eq!(info.cur_node_set_id, 1);
        assert_eq!(info.cur_disk_set_id, 1);
        let sets = info.all_node_sets.get("HDD").unwrap();
        assert_eq!(sets.get(&1).unwrap().nodes, vec![1]);
    }
}
