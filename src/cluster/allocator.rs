//! Placement allocator and capacity estimation.
//!
//! The allocator is a three-level weighted tree (IDC, rack, host) rebuilt
//! from a disk snapshot on a fixed cadence and published behind an atomic
//! pointer swap. Each level's weight is the sum of free allocation units
//! below it; selection descends the tree with weighted random choice
//! without replacement, honoring host- and rack-awareness.
//!
//! The writable-space estimator answers "how many full stripes can the
//! cluster still accept": per IDC it loads each host's free-item tokens
//! into a max-heap and repeatedly packs one stripe from the top
//! `idc_su_count` hosts, draining ten units per round so hosts with uneven
//! free space are averaged rather than greedily exhausted.

use crate::cluster::store::{DiskRecord, EntityStore};
use crate::config::ManagerConfig;
use crate::error::{BedrockError, Result};
use crate::types::{DiskId, DiskStatInfo, DiskStatus, HeartbeatPayload, SpaceStatInfo};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Units drained from each stripe slot per packing round.
const STRIPE_ROUND_ITEMS: u64 = 10;

/// Leaf bucket: one host and its allocatable disks.
pub struct NodeAlloc {
    pub host: String,
    /// Disambiguated rack key `{idc}-{rack}`.
    pub rack: String,
    /// Sum of free allocation units across the disks.
    pub weight: u64,
    /// Sum of free bytes across the disks.
    pub free: u64,
    pub disks: Vec<Arc<DiskRecord>>,
}

impl NodeAlloc {
    fn eligible_disks(&self, used: &HashSet<DiskId>) -> Vec<&Arc<DiskRecord>> {
        self.disks
            .iter()
            .filter(|d| !used.contains(&d.disk_id) && d.read().is_writable())
            .collect()
    }
}

/// Mid-level bucket: one rack.
pub struct RackAlloc {
    pub rack: String,
    pub weight: u64,
    pub nodes: Vec<Arc<NodeAlloc>>,
}

/// Top-level bucket: one IDC.
pub struct IdcAlloc {
    pub idc: String,
    pub weight: u64,
    pub racks: HashMap<String, RackAlloc>,
    pub nodes: Vec<Arc<NodeAlloc>>,
}

impl IdcAlloc {
    /// Pick `count` disks from this IDC, at most one per host (host-aware)
    /// and one per rack (rack-aware).
    fn alloc(
        &self,
        count: usize,
        used_disks: &mut HashSet<DiskId>,
        host_aware: bool,
        rack_aware: bool,
    ) -> Result<Vec<DiskId>> {
        let mut rng = rand::thread_rng();
        let mut picked = Vec::with_capacity(count);
        let mut used_hosts: HashSet<&str> = HashSet::new();
        let mut used_racks: HashSet<&str> = HashSet::new();

        for _ in 0..count {
            let candidates: Vec<&Arc<NodeAlloc>> = self
                .nodes
                .iter()
                .filter(|n| n.weight > 0)
                .filter(|n| !host_aware || !used_hosts.contains(n.host.as_str()))
                .filter(|n| !rack_aware || !used_racks.contains(n.rack.as_str()))
                .filter(|n| !n.eligible_disks(used_disks).is_empty())
                .collect();

            if candidates.is_empty() {
                return Err(BedrockError::NoEnoughSpace(format!(
                    "idc {} exhausted after {} of {} picks",
                    self.idc,
                    picked.len(),
                    count
                )));
            }

            // Weighted choice without replacement.
            let total: u64 = candidates.iter().map(|n| n.weight).sum();
            let mut point = rng.gen_range(0..total);
            let mut chosen = candidates[candidates.len() - 1];
            for &node in &candidates {
                if point < node.weight {
                    chosen = node;
                    break;
                }
                point -= node.weight;
            }

            let eligible = chosen.eligible_disks(used_disks);
            let disk = eligible
                .choose(&mut rng)
                .ok_or_else(|| BedrockError::NoEnoughSpace(format!("idc {} host drained", self.idc)))?;

            picked.push(disk.disk_id);
            used_disks.insert(disk.disk_id);
            used_hosts.insert(chosen.host.as_str());
            used_racks.insert(chosen.rack.as_str());
        }
        Ok(picked)
    }
}

/// Published allocator snapshot for one disk type.
pub struct AllocatorTree {
    pub idcs: HashMap<String, IdcAlloc>,
    host_aware: bool,
    rack_aware: bool,
    tolerate_buffer: u64,
    total_weight: u64,
}

impl AllocatorTree {
    /// An empty tree; every allocation reports exhaustion.
    pub fn empty() -> Self {
        Self {
            idcs: HashMap::new(),
            host_aware: true,
            rack_aware: false,
            tolerate_buffer: 0,
            total_weight: 0,
        }
    }

    /// Select `count` disks across all IDCs, balanced by IDC weight.
    pub fn alloc(&self, count: usize, excludes: &HashSet<DiskId>) -> Result<Vec<DiskId>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if self.total_weight < count as u64 + self.tolerate_buffer {
            return Err(BedrockError::NoEnoughSpace(format!(
                "weight {} cannot cover {} items",
                self.total_weight, count
            )));
        }

        let quotas = self.idc_quotas(count);
        let mut used_disks = excludes.clone();
        let mut out = Vec::with_capacity(count);
        for (idc, quota) in quotas {
            if quota == 0 {
                continue;
            }
            let idc_alloc = self
                .idcs
                .get(&idc)
                .ok_or_else(|| BedrockError::NoEnoughSpace(format!("idc {} absent", idc)))?;
            out.extend(idc_alloc.alloc(quota, &mut used_disks, self.host_aware, self.rack_aware)?);
        }
        Ok(out)
    }

    /// Apportion a request across IDCs proportionally to weight, using
    /// largest remainders for the leftovers.
    fn idc_quotas(&self, count: usize) -> Vec<(String, usize)> {
        let total: u64 = self.idcs.values().map(|i| i.weight).sum();
        if total == 0 {
            return Vec::new();
        }

        let mut quotas: Vec<(String, usize, u64)> = self
            .idcs
            .values()
            .filter(|idc| idc.weight > 0)
            .map(|idc| {
                let exact = count as u64 * idc.weight;
                let share = (exact / total) as usize;
                let remainder = exact % total;
                (idc.idc.clone(), share, remainder)
            })
            .collect();

        let assigned: usize = quotas.iter().map(|(_, share, _)| share).sum();
        let mut leftover = count.saturating_sub(assigned);

        quotas.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
        for quota in quotas.iter_mut() {
            if leftover == 0 {
                break;
            }
            quota.1 += 1;
            leftover -= 1;
        }

        quotas.into_iter().map(|(idc, share, _)| (idc, share)).collect()
    }
}

/// Result of one allocator rebuild.
pub struct AllocatorBuild {
    pub tree: AllocatorTree,
    pub space: SpaceStatInfo,
}

/// Build the allocator tree and space statistics from a disk snapshot.
///
/// Locality prefers the owning node's record over the disk's own fields
/// (legacy disks carry their own). Disks that are abnormal, readonly or
/// expired are counted in the statistics but excluded from the tree.
pub fn build(
    disks: &[Arc<DiskRecord>],
    store: &EntityStore,
    cfg: &ManagerConfig,
) -> AllocatorBuild {
    struct HostAccum {
        idc: String,
        rack: String,
        weight: u64,
        free: u64,
        disks: Vec<Arc<DiskRecord>>,
    }

    let mut space = SpaceStatInfo::default();
    let mut stat_by_idc: HashMap<String, DiskStatInfo> = HashMap::new();
    let mut hosts: HashMap<String, HostAccum> = HashMap::new();

    for disk in disks {
        // Node lookup stays outside the disk lock.
        let node_id = disk.read().info.node_id;
        let node_locality = store.get_node(node_id).map(|n| {
            let state = n.read();
            (
                state.info.idc.clone(),
                state.info.rack.clone(),
                state.info.host.clone(),
            )
        });

        let state = disk.read();
        let (idc, rack, host) = match &node_locality {
            Some((idc, rack, host)) => (idc.clone(), rack.clone(), host.clone()),
            None => (
                state.info.idc.clone(),
                state.info.rack.clone(),
                state.info.host.clone(),
            ),
        };

        let stat = stat_by_idc.entry(idc.clone()).or_insert_with(|| DiskStatInfo {
            idc: idc.clone(),
            ..Default::default()
        });

        let free = state.info.heartbeat.free();
        let size = state.info.heartbeat.size();
        let disk_free_items = state.info.heartbeat.weight_items();
        match state.info.heartbeat {
            HeartbeatPayload::BlobNode {
                free_chunk_cnt,
                max_chunk_cnt,
                ..
            } => {
                stat.total_free_chunk += free_chunk_cnt;
                stat.total_oversold_free_chunk += disk_free_items;
                stat.total_chunk += max_chunk_cnt;
            }
            HeartbeatPayload::ShardNode {
                free_shard_cnt,
                max_shard_cnt,
                ..
            } => {
                stat.total_free_shard += free_shard_cnt;
                stat.total_shard += max_shard_cnt;
            }
        }

        // Racks may repeat across IDCs; key them together.
        let rack = format!("{}-{}", idc, rack);

        space.total_disk += 1;
        stat.total += 1;
        if state.info.readonly {
            stat.readonly += 1;
        }
        match state.info.status {
            DiskStatus::Broken => stat.broken += 1,
            DiskStatus::Repairing => stat.repairing += 1,
            DiskStatus::Repaired => stat.repaired += 1,
            DiskStatus::Dropped => stat.dropped += 1,
            DiskStatus::Normal => {}
        }
        if state.dropping {
            stat.dropping += 1;
        }

        if state.info.status != DiskStatus::Normal {
            continue;
        }
        space.total_space += size;
        if state.info.readonly {
            // Dropping disks are readonly by precondition; they land here.
            space.readonly_space += free;
            continue;
        }
        space.free_space += free;
        stat.available += 1;

        if state.is_expired() {
            stat.expired += 1;
            continue;
        }

        let accum = hosts.entry(host.clone()).or_insert_with(|| HostAccum {
            idc: idc.clone(),
            rack: rack.clone(),
            weight: 0,
            free: 0,
            disks: Vec::new(),
        });
        accum.weight += disk_free_items;
        accum.free += free;
        accum.disks.push(disk.clone());
    }

    // Freeze host accumulators and hang them off their rack and IDC.
    let mut idc_nodes: HashMap<String, Vec<Arc<NodeAlloc>>> = HashMap::new();
    let mut rack_nodes: HashMap<String, (String, Vec<Arc<NodeAlloc>>)> = HashMap::new();
    for (host, accum) in hosts {
        let node = Arc::new(NodeAlloc {
            host,
            rack: accum.rack.clone(),
            weight: accum.weight,
            free: accum.free,
            disks: accum.disks,
        });
        idc_nodes.entry(accum.idc.clone()).or_default().push(node.clone());
        rack_nodes
            .entry(accum.rack.clone())
            .or_insert_with(|| (accum.idc.clone(), Vec::new()))
            .1
            .push(node);
    }

    let mut idcs = HashMap::new();
    let mut total_weight = 0u64;
    for idc in &cfg.idcs {
        let nodes = idc_nodes.get(idc).cloned().unwrap_or_default();
        let weight: u64 = nodes.iter().map(|n| n.weight).sum();
        let racks = rack_nodes
            .iter()
            .filter(|(_, (owner, _))| owner == idc)
            .map(|(rack, (_, nodes))| {
                let rack_weight: u64 = nodes.iter().map(|n| n.weight).sum();
                (
                    rack.clone(),
                    RackAlloc {
                        rack: rack.clone(),
                        weight: rack_weight,
                        nodes: nodes.clone(),
                    },
                )
            })
            .collect();

        total_weight += weight;
        idcs.insert(
            idc.clone(),
            IdcAlloc {
                idc: idc.clone(),
                weight,
                racks,
                nodes,
            },
        );
    }

    space.used_space = space
        .total_space
        .saturating_sub(space.free_space)
        .saturating_sub(space.readonly_space);
    space.writable_space = calculate_writable(&idc_nodes, cfg);

    let mut stats: Vec<DiskStatInfo> = stat_by_idc.into_values().collect();
    stats.sort_by(|a, b| a.idc.cmp(&b.idc));
    space.disk_stat_infos = stats;

    debug!(
        idcs = idcs.len(),
        total_weight,
        writable = space.writable_space,
        "allocator rebuilt"
    );

    AllocatorBuild {
        tree: AllocatorTree {
            idcs,
            host_aware: cfg.host_aware,
            rack_aware: cfg.rack_aware,
            tolerate_buffer: cfg.alloc_tolerate_buffer,
            total_weight,
        },
        space,
    }
}

/// Stripe-count estimate across IDCs, in bytes.
fn calculate_writable(idc_nodes: &HashMap<String, Vec<Arc<NodeAlloc>>>, cfg: &ManagerConfig) -> u64 {
    if idc_nodes.is_empty() || cfg.idcs.is_empty() {
        return 0;
    }
    let (code_mode, su_count) = cfg.max_su_code_mode();
    let idc_su_count = su_count / cfg.idcs.len();
    let item_size = cfg.item_size();
    if idc_su_count == 0 || item_size == 0 {
        return 0;
    }

    if cfg.host_aware {
        // Pack stripes from a max-heap of per-host tokens, draining ten per
        // round so uneven hosts are averaged instead of greedily exhausted.
        let pack = |nodes: &[Arc<NodeAlloc>]| -> u64 {
            let mut lefts: BinaryHeap<u64> = nodes
                .iter()
                .map(|n| n.free / item_size)
                .filter(|count| *count > 0)
                .collect();
            let mut stripes = 0u64;
            let mut round = Vec::with_capacity(idc_su_count);
            while lefts.len() >= idc_su_count {
                round.clear();
                for _ in 0..idc_su_count {
                    if let Some(top) = lefts.pop() {
                        round.push(top);
                    }
                }
                stripes += STRIPE_ROUND_ITEMS;
                for &count in &round {
                    if count > STRIPE_ROUND_ITEMS {
                        lefts.push(count - STRIPE_ROUND_ITEMS);
                    }
                }
            }
            stripes
        };

        let min_stripes = idc_nodes
            .values()
            .map(|nodes| pack(nodes))
            .min()
            .unwrap_or(0);
        return min_stripes * code_mode.n as u64 * item_size;
    }

    let min_items = idc_nodes
        .values()
        .map(|nodes| nodes.iter().map(|n| n.free / item_size).sum::<u64>())
        .min()
        .unwrap_or(0);
    min_items / idc_su_count as u64 * code_mode.n as u64 * item_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::store::{disk_filter_key, DiskRecord, NodeRecord};
    use crate::types::{
        CodeMode, DiskInfo, DiskType, HeartbeatPayload, NodeInfo, NodeRole, NodeStatus,
    };
    use std::time::Duration;

    const ITEM: u64 = 1024;

    fn test_cfg() -> ManagerConfig {
        let mut cfg = ManagerConfig::development();
        cfg.idcs = vec!["z0".to_string(), "z1".to_string(), "z2".to_string()];
        cfg.code_modes = vec![CodeMode::EC6P3L3];
        cfg.chunk_size = ITEM;
        cfg
    }

    fn populate(store: &EntityStore, cfg: &ManagerConfig, hosts_per_idc: usize, free: u64) {
        let mut node_id = 0;
        let mut disk_id = 0;
        for idc in &cfg.idcs {
            for h in 0..hosts_per_idc {
                node_id += 1;
                disk_id += 1;
                let host = format!("{}-h{}", idc, h);
                let node = NodeInfo {
                    node_id,
                    host: host.clone(),
                    idc: idc.clone(),
                    rack: format!("r{}", h),
                    disk_type: DiskType::Hdd,
                    role: NodeRole::BlobNode,
                    status: NodeStatus::Normal,
                    node_set_id: 1,
                };
                store.insert_node(Arc::new(NodeRecord::new(node)));

                let info = DiskInfo {
                    disk_id,
                    node_id,
                    host: host.clone(),
                    path: "/d0".to_string(),
                    idc: idc.clone(),
                    rack: format!("r{}", h),
                    status: DiskStatus::Normal,
                    readonly: false,
                    heartbeat: HeartbeatPayload::blob_node(free, free * 2, ITEM),
                };
                let key = disk_filter_key(&info.host, &info.path);
                store.insert_disk(Arc::new(DiskRecord::new(info, Duration::from_secs(60))));
                store.add_disk_filter(key);
            }
        }
    }

    #[test]
    fn test_writable_host_aware_uniform() {
        let cfg = test_cfg();
        let store = EntityStore::new();
        // 4 hosts per IDC, one disk each with 10 items free; EC6P3L3 means
        // idc_su_count = 12 / 3 = 4, so each IDC packs 10 stripes.
        populate(&store, &cfg, 4, 10 * ITEM);

        let built = build(&store.all_disks(), &store, &cfg);
        assert_eq!(built.space.writable_space, 10 * 6 * ITEM);
        assert_eq!(built.space.total_disk, 12);
    }

    #[test]
    fn test_writable_non_host_aware_sum() {
        let mut cfg = test_cfg();
        cfg.host_aware = false;
        let store = EntityStore::new();
        populate(&store, &cfg, 4, 10 * ITEM);

        // 40 tokens per IDC / 4 per stripe = 10 stripes.
        let built = build(&store.all_disks(), &store, &cfg);
        assert_eq!(built.space.writable_space, 10 * 6 * ITEM);
    }

    #[test]
    fn test_writable_limited_by_poorest_idc() {
        let cfg = test_cfg();
        let store = EntityStore::new();
        populate(&store, &cfg, 4, 10 * ITEM);

        // Drain one IDC's hosts to 0 free: its heap never reaches
        // idc_su_count tokens, so the whole cluster reports 0.
        for disk in store.all_disks() {
            let idc = disk.read().info.idc.clone();
            if idc == "z2" {
                disk.write().info.heartbeat = HeartbeatPayload::blob_node(0, 20 * ITEM, ITEM);
            }
        }
        let built = build(&store.all_disks(), &store, &cfg);
        assert_eq!(built.space.writable_space, 0);
    }

    #[test]
    fn test_readonly_disk_moves_to_readonly_space() {
        let cfg = test_cfg();
        let store = EntityStore::new();
        populate(&store, &cfg, 4, 10 * ITEM);

        let baseline = build(&store.all_disks(), &store, &cfg);
        store.get_disk(1).unwrap().write().info.readonly = true;
        let built = build(&store.all_disks(), &store, &cfg);

        assert_eq!(built.space.readonly_space, 10 * ITEM);
        assert_eq!(built.space.free_space + 10 * ITEM, baseline.space.free_space);
        assert!(built.space.writable_space <= baseline.space.writable_space);
    }

    #[test]
    fn test_abnormal_disks_counted_not_allocatable() {
        let cfg = test_cfg();
        let store = EntityStore::new();
        populate(&store, &cfg, 2, 10 * ITEM);

        store.get_disk(1).unwrap().write().info.status = DiskStatus::Broken;
        let built = build(&store.all_disks(), &store, &cfg);

        let z0 = built
            .space
            .disk_stat_infos
            .iter()
            .find(|s| s.idc == "z0")
            .unwrap();
        assert_eq!(z0.broken, 1);
        assert_eq!(z0.available, 1);

        // The broken disk is not in the tree.
        let z0_alloc = built.tree.idcs.get("z0").unwrap();
        let total_disks: usize = z0_alloc.nodes.iter().map(|n| n.disks.len()).sum();
        assert_eq!(total_disks, 1);
    }

    #[test]
    fn test_alloc_host_aware_no_duplicate_hosts() {
        let cfg = test_cfg();
        let store = EntityStore::new();
        populate(&store, &cfg, 4, 10 * ITEM);

        let built = build(&store.all_disks(), &store, &cfg);
        let picked = built.tree.alloc(9, &HashSet::new()).unwrap();
        assert_eq!(picked.len(), 9);

        let mut hosts = HashSet::new();
        for disk_id in &picked {
            let host = store.get_disk(*disk_id).unwrap().read().info.host.clone();
            assert!(hosts.insert(host), "host repeated in one stripe");
        }
    }

    #[test]
    fn test_alloc_balances_across_idcs() {
        let cfg = test_cfg();
        let store = EntityStore::new();
        populate(&store, &cfg, 4, 10 * ITEM);

        let built = build(&store.all_disks(), &store, &cfg);
        let picked = built.tree.alloc(12, &HashSet::new()).unwrap();

        let mut per_idc: HashMap<String, usize> = HashMap::new();
        for disk_id in &picked {
            let idc = store.get_disk(*disk_id).unwrap().read().info.idc.clone();
            *per_idc.entry(idc).or_insert(0) += 1;
        }
        // Equal weights: every IDC contributes its full host count.
        assert_eq!(per_idc.get("z0"), Some(&4));
        assert_eq!(per_idc.get("z1"), Some(&4));
        assert_eq!(per_idc.get("z2"), Some(&4));
    }

    #[test]
    fn test_alloc_exhaustion() {
        let cfg = test_cfg();
        let store = EntityStore::new();
        populate(&store, &cfg, 1, 10 * ITEM);

        let built = build(&store.all_disks(), &store, &cfg);
        // Host-aware: only 3 hosts exist cluster-wide.
        let err = built.tree.alloc(6, &HashSet::new()).unwrap_err();
        assert!(matches!(err, BedrockError::NoEnoughSpace(_)));
    }

    #[test]
    fn test_alloc_respects_excludes() {
        let cfg = test_cfg();
        let store = EntityStore::new();
        populate(&store, &cfg, 2, 10 * ITEM);

        let excludes: HashSet<DiskId> = [1, 2].into_iter().collect();
        let built = build(&store.all_disks(), &store, &cfg);
        let picked = built.tree.alloc(3, &excludes).unwrap();
        for disk_id in &picked {
            assert!(!excludes.contains(disk_id));
        }
    }

    #[test]
    fn test_empty_tree_reports_no_space() {
        let tree = AllocatorTree::empty();
        assert!(matches!(
            tree.alloc(1, &HashSet::new()),
            Err(BedrockError::NoEnoughSpace(_))
        ));
    }
}
