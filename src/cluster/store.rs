//! In-memory index of all disk and node records.
//!
//! The store keeps the identity maps (`disk_id -> DiskRecord`,
//! `node_id -> NodeRecord`) behind one reader-writer lock, while every
//! record carries its own lock for field mutation. The lock order across
//! the crate is: store meta lock, then node lock, then disk lock, then
//! topology lock. Callers that need a node's disks snapshot the record
//! pointers under the node read lock and release it before touching any
//! disk lock; no two locks of the same kind are ever held at once.

use crate::error::{BedrockError, Result};
use crate::types::{DiskId, DiskInfo, DiskStatus, DiskType, NodeId, NodeInfo, INVALID_NODE_ID};
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Mutable state of one disk, guarded by the record's lock.
#[derive(Debug)]
pub struct DiskState {
    pub info: DiskInfo,
    /// Administrative drain in progress. Orthogonal to `info.status`.
    pub dropping: bool,
    /// Heartbeat deadline; a disk past it is expired.
    pub expire_at: Instant,
    /// Previous deadline, kept for edge detection in the heartbeat sweep.
    pub last_expire_at: Instant,
    /// The sweep already reported this disk as expired.
    pub notified_expired: bool,
}

impl DiskState {
    /// Whether this disk still occupies its `(host, path)` slot.
    pub fn need_filter(&self) -> bool {
        self.info.status.need_filter()
    }

    /// Whether the heartbeat deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expire_at
    }

    /// A disk accepts new writes only when normal, writable, not draining
    /// and heartbeating.
    pub fn is_writable(&self) -> bool {
        self.info.status == DiskStatus::Normal
            && !self.info.readonly
            && !self.dropping
            && !self.is_expired()
    }

    pub fn filter_key(&self) -> String {
        disk_filter_key(&self.info.host, &self.info.path)
    }
}

/// A disk record: immutable id plus lock-guarded state.
#[derive(Debug)]
pub struct DiskRecord {
    pub disk_id: DiskId,
    state: RwLock<DiskState>,
}

impl DiskRecord {
    pub fn new(info: DiskInfo, expire_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            disk_id: info.disk_id,
            state: RwLock::new(DiskState {
                info,
                dropping: false,
                expire_at: now + expire_interval,
                last_expire_at: now + expire_interval,
                notified_expired: false,
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, DiskState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, DiskState> {
        self.state.write()
    }
}

/// Mutable state of one node, guarded by the record's lock.
#[derive(Debug)]
pub struct NodeState {
    pub info: NodeInfo,
    /// Administrative drain in progress.
    pub dropping: bool,
    /// Disks owned by this node. Values are shared with the store's disk map.
    pub disks: HashMap<DiskId, Arc<DiskRecord>>,
}

impl NodeState {
    pub fn is_using(&self) -> bool {
        self.info.status.is_using()
    }

    pub fn filter_key(&self) -> String {
        node_filter_key(&self.info.host, self.info.disk_type)
    }
}

/// A node record: immutable id plus lock-guarded state.
#[derive(Debug)]
pub struct NodeRecord {
    pub node_id: NodeId,
    state: RwLock<NodeState>,
}

impl NodeRecord {
    pub fn new(info: NodeInfo) -> Self {
        Self {
            node_id: info.node_id,
            state: RwLock::new(NodeState {
                info,
                dropping: false,
                disks: HashMap::new(),
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write()
    }
}

/// Uniqueness key for a disk's `(host, path)` slot.
pub fn disk_filter_key(host: &str, path: &str) -> String {
    format!("{}-{}", host, path)
}

/// Uniqueness key for a node's `(host, disk_type)` slot.
pub fn node_filter_key(host: &str, disk_type: DiskType) -> String {
    format!("{}-{}", host, disk_type)
}

#[derive(Default)]
struct IdentityMaps {
    disks: HashMap<DiskId, Arc<DiskRecord>>,
    nodes: HashMap<NodeId, Arc<NodeRecord>>,
}

/// The shared entity index.
#[derive(Default)]
pub struct EntityStore {
    // Single meta lock over both identity maps.
    maps: RwLock<IdentityMaps>,
    /// `(host, path)` slots for disks and `(host, disk_type)` slots for
    /// nodes; disk entries store [`INVALID_NODE_ID`].
    filter: DashMap<String, NodeId>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_disk(&self, disk_id: DiskId) -> Option<Arc<DiskRecord>> {
        self.maps.read().disks.get(&disk_id).cloned()
    }

    pub fn get_node(&self, node_id: NodeId) -> Option<Arc<NodeRecord>> {
        self.maps.read().nodes.get(&node_id).cloned()
    }

    /// Shallow copy of all disk record pointers; callers iterate without
    /// holding the meta lock.
    pub fn all_disks(&self) -> Vec<Arc<DiskRecord>> {
        let maps = self.maps.read();
        maps.disks.values().cloned().collect()
    }

    /// Shallow copy of all node record pointers.
    pub fn all_nodes(&self) -> Vec<Arc<NodeRecord>> {
        let maps = self.maps.read();
        maps.nodes.values().cloned().collect()
    }

    pub fn disk_count(&self) -> usize {
        self.maps.read().disks.len()
    }

    pub fn insert_disk(&self, disk: Arc<DiskRecord>) {
        self.maps.write().disks.insert(disk.disk_id, disk);
    }

    pub fn insert_node(&self, node: Arc<NodeRecord>) {
        self.maps.write().nodes.insert(node.node_id, node);
    }

    /// Claim a disk's `(host, path)` slot.
    pub fn add_disk_filter(&self, key: String) {
        self.filter.insert(key, INVALID_NODE_ID);
    }

    /// Claim a node's `(host, disk_type)` slot.
    pub fn add_node_filter(&self, key: String, node_id: NodeId) {
        self.filter.insert(key, node_id);
    }

    pub fn remove_filter(&self, key: &str) {
        self.filter.remove(key);
    }

    pub fn filter_contains(&self, key: &str) -> bool {
        self.filter.contains_key(key)
    }

    /// Check whether a disk registration may proceed.
    ///
    /// Re-registration of a legacy disk is compatible when the existing
    /// record carries no node id, the request does, and the registering
    /// node's `(host, idc, rack)` all match the stored locality. Any other
    /// existing record is a duplicate; a foreign `(host, path)` claim is an
    /// illegal argument.
    pub fn check_disk_dup(
        &self,
        disk_id: DiskId,
        disk_info: &DiskInfo,
        node_info: &NodeInfo,
    ) -> Result<()> {
        if let Some(existing) = self.get_disk(disk_id) {
            let state = existing.read();
            if state.info.node_id == INVALID_NODE_ID
                && disk_info.node_id != INVALID_NODE_ID
                && state.info.host == node_info.host
                && state.info.idc == node_info.idc
                && state.info.rack == node_info.rack
            {
                return Ok(());
            }
            warn!(disk_id, "disk exists");
            return Err(BedrockError::AlreadyExists(format!("disk {}", disk_id)));
        }

        let key = disk_filter_key(&node_info.host, &disk_info.path);
        if self.filter.contains_key(&key) {
            warn!(disk_id, host = %node_info.host, path = %disk_info.path, "host and path duplicated");
            return Err(BedrockError::IllegalArgument(format!(
                "duplicated host {} and path {}",
                node_info.host, disk_info.path
            )));
        }
        Ok(())
    }

    /// Look up a node occupying the same `(host, disk_type)` slot.
    pub fn check_node_dup(&self, node_info: &NodeInfo) -> Option<NodeId> {
        let key = node_filter_key(&node_info.host, node_info.disk_type);
        self.filter.get(&key).map(|entry| *entry.value())
    }
}
