//! Core type definitions for the Bedrock cluster manager.
//!
//! This module contains the fundamental data types shared across the
//! manager: disk and node identifiers, the disk status ladder, heartbeat
//! payloads, and the statistics structs published to API consumers.
//!
//! # Key Types
//!
//! - [`DiskStatus`]: the five-step disk lifecycle with its transition ladder
//! - [`HeartbeatPayload`]: per-disk capacity report from blob or shard nodes
//! - [`DiskInfo`] / [`NodeInfo`]: registration records for disks and nodes
//! - [`CodeMode`]: erasure coding parameters `(n, m, l)` used in capacity math
//!
//! # Type Aliases
//!
//! - [`DiskId`] = `u32`: disk identifier issued by the scope allocator
//! - [`NodeId`] = `u32`: node identifier; `0` is [`INVALID_NODE_ID`] (legacy disks)
//! - [`NodeSetId`] / [`DiskSetId`] = `u32`: topology bucket identifiers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a disk.
pub type DiskId = u32;

/// Unique identifier for a node.
pub type NodeId = u32;

/// Identifier of a NodeSet (fault-isolation bucket of nodes).
pub type NodeSetId = u32;

/// Identifier of a DiskSet (copy-set bucket of disks).
pub type DiskSetId = u32;

/// Sentinel node id carried by legacy disks registered before node records
/// existed.
pub const INVALID_NODE_ID: NodeId = 0;

/// Sentinel meaning "no NodeSet assigned yet"; the topology index allocates
/// a real one on AddNode.
pub const NULL_NODE_SET_ID: NodeSetId = 0;

/// Sentinel meaning "no DiskSet assigned yet".
pub const NULL_DISK_SET_ID: DiskSetId = 0;

/// Disk lifecycle status.
///
/// Transitions walk the ladder one step at a time
/// (`Normal → Broken → Repairing → Repaired`), with `Dropped` reachable
/// from any state. Backward transitions are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskStatus {
    /// Healthy and accepting writes.
    Normal,
    /// Reported broken; repair not started.
    Broken,
    /// Data repair in progress.
    Repairing,
    /// Repair finished; disk no longer holds live data.
    Repaired,
    /// Administratively removed. Terminal.
    Dropped,
}

impl DiskStatus {
    /// Position on the transition ladder.
    pub fn ordinal(self) -> u8 {
        match self {
            DiskStatus::Normal => 0,
            DiskStatus::Broken => 1,
            DiskStatus::Repairing => 2,
            DiskStatus::Repaired => 3,
            DiskStatus::Dropped => 4,
        }
    }

    /// Whether a disk in this status still occupies its `(host, path)` slot.
    pub fn need_filter(self) -> bool {
        matches!(
            self,
            DiskStatus::Normal | DiskStatus::Broken | DiskStatus::Repairing
        )
    }
}

impl std::fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiskStatus::Normal => "normal",
            DiskStatus::Broken => "broken",
            DiskStatus::Repairing => "repairing",
            DiskStatus::Repaired => "repaired",
            DiskStatus::Dropped => "dropped",
        };
        write!(f, "{}", s)
    }
}

/// Node lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Normal,
    Dropped,
}

impl NodeStatus {
    pub fn is_using(self) -> bool {
        matches!(self, NodeStatus::Normal)
    }
}

/// Physical media class of a node's disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiskType {
    Hdd,
    Ssd,
    Nvme,
}

impl std::fmt::Display for DiskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiskType::Hdd => "HDD",
            DiskType::Ssd => "SSD",
            DiskType::Nvme => "NVMe",
        };
        write!(f, "{}", s)
    }
}

/// Role a node plays in the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Stores blob chunks.
    BlobNode,
    /// Stores shard replicas.
    ShardNode,
}

/// Capacity report carried by a disk heartbeat.
///
/// Blob nodes and shard nodes report different allocation units; the two
/// variants are matched wherever the unit count matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeartbeatPayload {
    BlobNode {
        /// Free bytes on the disk.
        free: u64,
        /// Total bytes on the disk.
        size: u64,
        /// Free chunk slots.
        free_chunk_cnt: u64,
        /// Free chunk slots including the oversold allowance.
        oversold_free_chunk_cnt: u64,
        /// Total chunk slots.
        max_chunk_cnt: u64,
    },
    ShardNode {
        free: u64,
        size: u64,
        free_shard_cnt: u64,
        max_shard_cnt: u64,
    },
}

impl HeartbeatPayload {
    /// A blob-node report with chunk counts derived from sizes.
    pub fn blob_node(free: u64, size: u64, chunk_size: u64) -> Self {
        let free_chunk_cnt = if chunk_size == 0 { 0 } else { free / chunk_size };
        let max_chunk_cnt = if chunk_size == 0 { 0 } else { size / chunk_size };
        HeartbeatPayload::BlobNode {
            free,
            size,
            free_chunk_cnt,
            oversold_free_chunk_cnt: free_chunk_cnt,
            max_chunk_cnt,
        }
    }

    /// A shard-node report with shard counts derived from sizes.
    pub fn shard_node(free: u64, size: u64, shard_size: u64) -> Self {
        let free_shard_cnt = if shard_size == 0 { 0 } else { free / shard_size };
        let max_shard_cnt = if shard_size == 0 { 0 } else { size / shard_size };
        HeartbeatPayload::ShardNode {
            free,
            size,
            free_shard_cnt,
            max_shard_cnt,
        }
    }

    /// Free bytes reported by the disk.
    pub fn free(&self) -> u64 {
        match *self {
            HeartbeatPayload::BlobNode { free, .. } => free,
            HeartbeatPayload::ShardNode { free, .. } => free,
        }
    }

    /// Total bytes reported by the disk.
    pub fn size(&self) -> u64 {
        match *self {
            HeartbeatPayload::BlobNode { size, .. } => size,
            HeartbeatPayload::ShardNode { size, .. } => size,
        }
    }

    /// Free allocation units (chunks or shards) without oversold allowance.
    pub fn free_items(&self) -> u64 {
        match *self {
            HeartbeatPayload::BlobNode { free_chunk_cnt, .. } => free_chunk_cnt,
            HeartbeatPayload::ShardNode { free_shard_cnt, .. } => free_shard_cnt,
        }
    }

    /// Allocation weight: blob disks may oversell chunk slots, so the weight
    /// takes the larger of the plain and oversold free counts.
    pub fn weight_items(&self) -> u64 {
        match *self {
            HeartbeatPayload::BlobNode {
                free_chunk_cnt,
                oversold_free_chunk_cnt,
                ..
            } => free_chunk_cnt.max(oversold_free_chunk_cnt),
            HeartbeatPayload::ShardNode { free_shard_cnt, .. } => free_shard_cnt,
        }
    }

    /// Total allocation units.
    pub fn max_items(&self) -> u64 {
        match *self {
            HeartbeatPayload::BlobNode { max_chunk_cnt, .. } => max_chunk_cnt,
            HeartbeatPayload::ShardNode { max_shard_cnt, .. } => max_shard_cnt,
        }
    }
}

/// Registration record for a disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub disk_id: DiskId,
    /// Owning node, or [`INVALID_NODE_ID`] for legacy disks.
    pub node_id: NodeId,
    pub host: String,
    pub path: String,
    pub idc: String,
    pub rack: String,
    pub status: DiskStatus,
    pub readonly: bool,
    /// Latest capacity report.
    pub heartbeat: HeartbeatPayload,
}

/// Registration record for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub host: String,
    pub idc: String,
    pub rack: String,
    pub disk_type: DiskType,
    pub role: NodeRole,
    pub status: NodeStatus,
    /// NodeSet membership; [`NULL_NODE_SET_ID`] until assigned.
    pub node_set_id: NodeSetId,
}

/// Erasure coding scheme: `n` data, `m` parity and `l` local-parity units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMode {
    pub n: usize,
    pub m: usize,
    pub l: usize,
}

impl CodeMode {
    /// 6+6, two-way recoverable without local parity.
    pub const EC6P6: Self = Self { n: 6, m: 6, l: 0 };

    /// 6+3+3, the default three-IDC layout (12 units, 4 per IDC).
    pub const EC6P3L3: Self = Self { n: 6, m: 3, l: 3 };

    /// 15+12, cost-optimized for large clusters.
    pub const EC15P12: Self = Self { n: 15, m: 12, l: 0 };

    /// Total stripe units `n + m + l`.
    pub fn total_units(&self) -> usize {
        self.n + self.m + self.l
    }
}

/// Heartbeat edge notification: a disk went silent or came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub disk_id: DiskId,
    pub is_alive: bool,
}

/// Per-IDC disk population statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskStatInfo {
    pub idc: String,
    pub total: u64,
    pub total_chunk: u64,
    pub total_free_chunk: u64,
    pub total_oversold_free_chunk: u64,
    pub total_shard: u64,
    pub total_free_shard: u64,
    /// Disks usable for allocation (normal, writable).
    pub available: u64,
    pub readonly: u64,
    pub expired: u64,
    pub broken: u64,
    pub repairing: u64,
    pub repaired: u64,
    pub dropping: u64,
    pub dropped: u64,
}

/// Cluster-wide space statistics for one disk type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceStatInfo {
    pub total_disk: u64,
    pub total_space: u64,
    pub free_space: u64,
    pub used_space: u64,
    pub readonly_space: u64,
    /// Bytes the cluster can still accept as full stripes.
    pub writable_space: u64,
    pub disk_stat_infos: Vec<DiskStatInfo>,
}

/// Snapshot of one NodeSet for topology queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSetInfo {
    pub id: NodeSetId,
    pub number: usize,
    pub nodes: Vec<NodeId>,
    pub disk_sets: HashMap<DiskSetId, Vec<DiskId>>,
}

/// Full topology dump: every NodeSet per disk type plus the id cursors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyInfo {
    pub cur_node_set_id: NodeSetId,
    pub cur_disk_set_id: DiskSetId,
    pub all_node_sets: HashMap<String, HashMap<NodeSetId, NodeSetInfo>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordinals() {
        assert_eq!(DiskStatus::Normal.ordinal(), 0);
        assert_eq!(DiskStatus::Broken.ordinal(), 1);
        assert_eq!(DiskStatus::Repairing.ordinal(), 2);
        assert_eq!(DiskStatus::Repaired.ordinal(), 3);
        assert_eq!(DiskStatus::Dropped.ordinal(), 4);
    }

    #[test]
    fn test_need_filter() {
        assert!(DiskStatus::Normal.need_filter());
        assert!(DiskStatus::Broken.need_filter());
        assert!(DiskStatus::Repairing.need_filter());
        assert!(!DiskStatus::Repaired.need_filter());
        assert!(!DiskStatus::Dropped.need_filter());
    }

    #[test]
    fn test_blob_heartbeat_weight_uses_oversold() {
        let hb = HeartbeatPayload::BlobNode {
            free: 100,
            size: 200,
            free_chunk_cnt: 10,
            oversold_free_chunk_cnt: 14,
            max_chunk_cnt: 20,
        };
        assert_eq!(hb.free_items(), 10);
        assert_eq!(hb.weight_items(), 14);
    }

    #[test]
    fn test_shard_heartbeat_counts() {
        let hb = HeartbeatPayload::shard_node(64, 128, 16);
        assert_eq!(hb.free_items(), 4);
        assert_eq!(hb.max_items(), 8);
        assert_eq!(hb.weight_items(), 4);
    }

    #[test]
    fn test_code_mode_units() {
        assert_eq!(CodeMode::EC6P3L3.total_units(), 12);
        assert_eq!(CodeMode::EC15P12.total_units(), 27);
    }
}
