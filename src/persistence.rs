//! Durable storage contract for disk and node records.
//!
//! The manager treats its backing store as an opaque key-value collaborator:
//! one blob per disk under `disk/{disk_id}`, one per node under
//! `node/{node_id}`, and membership markers under `dropping_disk/{disk_id}`
//! and `dropping_node/{node_id}`. Each call is a synchronous, durable
//! single-entity write; consistency across calls is not required, so the
//! state machine orders its in-memory mutations after the persistence call
//! succeeds.
//!
//! [`MemoryPersistence`] is the in-process implementation used by tests and
//! development setups.

use crate::error::{BedrockError, Result};
use crate::types::{DiskId, DiskInfo, DiskStatus, NodeId, NodeInfo};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

/// Durable single-entity writes for the cluster manager.
///
/// Callers hold entity locks across these calls; implementations must not
/// call back into the manager.
pub trait Persistence: Send + Sync {
    /// Write the full disk record.
    fn update_disk(&self, disk: &DiskInfo) -> Result<()>;

    /// Write only the status column of a disk record.
    fn update_disk_status(&self, disk_id: DiskId, status: DiskStatus) -> Result<()>;

    /// Insert a new disk record.
    fn add_disk(&self, disk: &DiskInfo) -> Result<()>;

    /// Write the full node record.
    fn update_node(&self, node: &NodeInfo) -> Result<()>;

    /// Record a disk in the dropping list.
    fn add_dropping_disk(&self, disk_id: DiskId) -> Result<()>;

    /// Record a node in the dropping list.
    fn add_dropping_node(&self, node_id: NodeId) -> Result<()>;

    /// Whether the disk is currently in the dropping list.
    fn is_dropping_disk(&self, disk_id: DiskId) -> Result<bool>;

    /// Whether the node is currently in the dropping list.
    fn is_dropping_node(&self, node_id: NodeId) -> Result<bool>;

    /// Finalize a drop: mark the disk dropped and clear its dropping entry.
    fn dropped_disk(&self, disk_id: DiskId) -> Result<()>;

    /// Finalize a drop: mark the node dropped and clear its dropping entry.
    fn dropped_node(&self, node_id: NodeId) -> Result<()>;

    /// Flush any buffered writes. The periodic flush loop calls this; a
    /// write-through backend may leave it as the default no-op.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory [`Persistence`] backend.
#[derive(Default)]
pub struct MemoryPersistence {
    inner: Mutex<MemoryTables>,
    /// When set, every write fails with this message. Test hook.
    fail_writes: Mutex<Option<String>>,
}

#[derive(Default)]
struct MemoryTables {
    disks: BTreeMap<DiskId, DiskInfo>,
    nodes: BTreeMap<NodeId, NodeInfo>,
    dropping_disks: BTreeSet<DiskId>,
    dropping_nodes: BTreeSet<NodeId>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make all subsequent writes fail, to exercise rollback paths.
    pub fn fail_writes(&self, reason: &str) {
        *self.fail_writes.lock() = Some(reason.to_string());
    }

    /// Clear a previous [`Self::fail_writes`].
    pub fn heal(&self) {
        *self.fail_writes.lock() = None;
    }

    /// Stored disk record, if any.
    pub fn disk(&self, disk_id: DiskId) -> Option<DiskInfo> {
        self.inner.lock().disks.get(&disk_id).cloned()
    }

    /// Stored node record, if any.
    pub fn node(&self, node_id: NodeId) -> Option<NodeInfo> {
        self.inner.lock().nodes.get(&node_id).cloned()
    }

    fn check_writable(&self) -> Result<()> {
        match &*self.fail_writes.lock() {
            Some(reason) => Err(BedrockError::Persistence(reason.clone())),
            None => Ok(()),
        }
    }
}

impl Persistence for MemoryPersistence {
    fn update_disk(&self, disk: &DiskInfo) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().disks.insert(disk.disk_id, disk.clone());
        Ok(())
    }

    fn update_disk_status(&self, disk_id: DiskId, status: DiskStatus) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        match inner.disks.get_mut(&disk_id) {
            Some(disk) => {
                disk.status = status;
                Ok(())
            }
            None => Err(BedrockError::Persistence(format!(
                "disk {} not in table",
                disk_id
            ))),
        }
    }

    fn add_disk(&self, disk: &DiskInfo) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().disks.insert(disk.disk_id, disk.clone());
        Ok(())
    }

    fn update_node(&self, node: &NodeInfo) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().nodes.insert(node.node_id, node.clone());
        Ok(())
    }

    fn add_dropping_disk(&self, disk_id: DiskId) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().dropping_disks.insert(disk_id);
        Ok(())
    }

    fn add_dropping_node(&self, node_id: NodeId) -> Result<()> {
        self.check_writable()?;
        self.inner.lock().dropping_nodes.insert(node_id);
        Ok(())
    }

    fn is_dropping_disk(&self, disk_id: DiskId) -> Result<bool> {
        Ok(self.inner.lock().dropping_disks.contains(&disk_id))
    }

    fn is_dropping_node(&self, node_id: NodeId) -> Result<bool> {
        Ok(self.inner.lock().dropping_nodes.contains(&node_id))
    }

    fn dropped_disk(&self, disk_id: DiskId) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.dropping_disks.remove(&disk_id);
        if let Some(disk) = inner.disks.get_mut(&disk_id) {
            disk.status = DiskStatus::Dropped;
        }
        Ok(())
    }

    fn dropped_node(&self, node_id: NodeId) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.dropping_nodes.remove(&node_id);
        if let Some(node) = inner.nodes.get_mut(&node_id) {
            node.status = crate::types::NodeStatus::Dropped;
        }
        Ok(())
    }
}
