//! Replicated state machine for cluster mutations.
//!
//! Every handler runs in two modes. Pre-check (`is_commit = false`) rejects
//! early with a precise error and mutates nothing. Commit
//! (`is_commit = true`) is the apply path of the consensus log: it must be
//! idempotent, and precondition violations are downgraded to warnings (the
//! leader already validated them; failing a replayed apply would diverge
//! replicas). Drain handlers additionally deposit commit-path errors into
//! the pending-entry map for the originating proposer.
//!
//! Lock discipline: node metadata needed inside a disk critical section is
//! read before the disk lock is taken (disk type and node-set id are
//! immutable after registration), and disk-id lists are snapshotted under
//! the node read lock before any disk lock is touched.

use crate::cluster::ops::{ClusterOp, OpKind, PendingEntries};
use crate::cluster::store::{node_filter_key, DiskRecord, EntityStore, NodeRecord};
use crate::cluster::topology::TopologyIndex;
use crate::config::ManagerConfig;
use crate::error::{BedrockError, Result};
use crate::persistence::Persistence;
use crate::types::{
    DiskId, DiskInfo, DiskStatus, DiskType, HeartbeatPayload, NodeId, NodeInfo, NodeSetId,
    NodeStatus, NULL_NODE_SET_ID,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Commit and pre-check handlers over the shared cluster index.
pub struct StateMachine {
    store: Arc<EntityStore>,
    topology: Arc<TopologyIndex>,
    persistence: Arc<dyn Persistence>,
    pending: Arc<PendingEntries>,
    cfg: Arc<ManagerConfig>,
}

impl StateMachine {
    pub fn new(
        store: Arc<EntityStore>,
        topology: Arc<TopologyIndex>,
        persistence: Arc<dyn Persistence>,
        pending: Arc<PendingEntries>,
        cfg: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            store,
            topology,
            persistence,
            pending,
            cfg,
        }
    }

    /// Apply one committed log entry.
    pub fn apply(&self, data: &[u8]) -> Result<()> {
        let op: ClusterOp = bincode::deserialize(data)?;
        self.apply_op(op)
    }

    /// Apply one committed operation.
    pub fn apply_op(&self, op: ClusterOp) -> Result<()> {
        debug!(kind = %op.kind(), "applying cluster op");
        match op {
            ClusterOp::AddNode(info) => self.apply_add_node(info),
            ClusterOp::AddDisk(info) => self.apply_add_disk(info),
            ClusterOp::SetDiskStatus { disk_id, status } => {
                self.set_status(disk_id, status, true)
            }
            ClusterOp::SwitchReadonly { disk_id, readonly } => {
                self.apply_switch_readonly(disk_id, readonly)
            }
            ClusterOp::DroppingDisk { disk_id } => {
                self.apply_dropping_disk(disk_id, true).map(|_| ())
            }
            ClusterOp::DroppedDisk { disk_id } => self.apply_dropped_disk(disk_id),
            ClusterOp::DroppingNode { node_id } => {
                self.apply_dropping_node(node_id, true).map(|_| ())
            }
            ClusterOp::DroppedNode { node_id } => self.apply_dropped_node(node_id),
            ClusterOp::Heartbeat { disk_id, payload } => self.apply_heartbeat(disk_id, payload),
        }
    }

    /// Validate an operation before it is proposed. No state changes.
    pub fn precheck(&self, op: &ClusterOp) -> Result<()> {
        match op {
            ClusterOp::AddNode(_) | ClusterOp::AddDisk(_) => Ok(()),
            ClusterOp::SetDiskStatus { disk_id, status } => {
                self.set_status(*disk_id, *status, false)
            }
            ClusterOp::SwitchReadonly { disk_id, .. }
            | ClusterOp::DroppedDisk { disk_id }
            | ClusterOp::Heartbeat { disk_id, .. } => {
                self.store
                    .get_disk(*disk_id)
                    .map(|_| ())
                    .ok_or(BedrockError::DiskNotFound(*disk_id))
            }
            ClusterOp::DroppingDisk { disk_id } => {
                self.apply_dropping_disk(*disk_id, false).map(|_| ())
            }
            ClusterOp::DroppingNode { node_id } => {
                self.apply_dropping_node(*node_id, false).map(|_| ())
            }
            ClusterOp::DroppedNode { node_id } => self
                .store
                .get_node(*node_id)
                .map(|_| ())
                .ok_or(BedrockError::NodeNotFound(*node_id)),
        }
    }

    /// Add a node to the cluster index, allocating a NodeSet when none was
    /// pre-assigned.
    pub fn apply_add_node(&self, info: NodeInfo) -> Result<()> {
        // Concurrent double check.
        if self.store.get_node(info.node_id).is_some() {
            return Ok(());
        }

        let mut info = info;
        if info.node_set_id == NULL_NODE_SET_ID {
            info.node_set_id = self.topology.alloc_node_set_id(
                &info,
                &self.cfg.copy_set_config(info.disk_type),
                self.cfg.rack_aware,
            );
        }
        info.status = NodeStatus::Normal;

        self.persistence.update_node(&info).map_err(|e| {
            error!(node_id = info.node_id, %e, "add node failed to persist");
            e
        })?;

        self.topology.add_node_to_node_set(&info);
        let key = node_filter_key(&info.host, info.disk_type);
        let node_id = info.node_id;
        self.store.insert_node(Arc::new(NodeRecord::new(info)));
        self.store.add_node_filter(key, node_id);
        Ok(())
    }

    /// Register a disk, placing it into a DiskSet of its node's NodeSet.
    pub fn apply_add_disk(&self, info: DiskInfo) -> Result<()> {
        // Concurrent double check; the compatible re-registration case also
        // lands here and leaves the existing record untouched.
        if self.store.get_disk(info.disk_id).is_some() {
            return Ok(());
        }

        let node = self.store.get_node(info.node_id);
        self.persistence.add_disk(&info).map_err(|e| {
            error!(disk_id = info.disk_id, %e, "add disk failed to persist");
            e
        })?;

        if let Some(node) = &node {
            let (disk_type, node_set_id) = node_meta(node);
            self.topology.add_disk_to_disk_set(
                disk_type,
                node_set_id,
                info.disk_id,
                info.node_id,
                &self.cfg.copy_set_config(disk_type),
            );
        }

        let key = crate::cluster::store::disk_filter_key(&info.host, &info.path);
        let record = Arc::new(DiskRecord::new(info, self.cfg.heartbeat_expire_interval));
        self.store.insert_disk(record.clone());
        if let Some(node) = &node {
            node.write().disks.insert(record.disk_id, record);
        }
        self.store.add_disk_filter(key);
        Ok(())
    }

    /// Walk the disk status ladder.
    ///
    /// Forward steps of exactly one are allowed, plus the jump to `Dropped`
    /// from anywhere. A dropping disk only accepts `Dropped`. Violations are
    /// errors in pre-check and warnings in commit.
    pub fn set_status(&self, disk_id: DiskId, status: DiskStatus, is_commit: bool) -> Result<()> {
        let disk = self
            .store
            .get_disk(disk_id)
            .ok_or(BedrockError::DiskNotFound(disk_id))?;

        {
            let state = disk.read();
            if state.info.status != status {
                // A dropping disk will end up Dropped; nothing else is legal.
                if state.dropping && status != DiskStatus::Dropped {
                    if !is_commit {
                        return Err(BedrockError::ChangeDiskStatusNotAllow {
                            disk_id,
                            from: state.info.status,
                            to: status,
                        });
                    }
                    warn!(disk_id, "disk is dropping, can't set disk status");
                    return Ok(());
                }

                let before = state.info.status.ordinal();
                let after = status.ordinal();
                if before > after || (after - before > 1 && status != DiskStatus::Dropped) {
                    if !is_commit {
                        return Err(BedrockError::ChangeDiskStatusNotAllow {
                            disk_id,
                            from: state.info.status,
                            to: status,
                        });
                    }
                    // Log replay: the leader validated this already.
                    warn!(
                        disk_id,
                        from = %state.info.status,
                        to = %status,
                        "disallowed status change skipped in replay"
                    );
                    return Ok(());
                }
            }
        }

        if !is_commit {
            return Ok(());
        }

        // Node metadata is read before the disk write lock; disk type and
        // node-set id never change after registration.
        let node_id = disk.read().info.node_id;
        let node_meta = self.store.get_node(node_id).map(|n| node_meta(&n));

        let mut state = disk.write();
        // Concurrent double check.
        if state.info.status == status {
            return Ok(());
        }

        let persisted = if status == DiskStatus::Dropped {
            self.persistence.dropped_disk(disk_id)
        } else {
            self.persistence.update_disk_status(disk_id, status)
        };
        persisted.map_err(|e| {
            error!(disk_id, %e, "set status failed to persist");
            e
        })?;

        state.info.status = status;
        // A dropped disk is no longer draining.
        if status == DiskStatus::Dropped {
            state.dropping = false;
        }
        if !state.need_filter() {
            self.store.remove_filter(&state.filter_key());
            if let Some((disk_type, node_set_id)) = node_meta {
                self.topology
                    .remove_disk_from_disk_set(disk_type, node_set_id, disk_id);
            }
        }
        Ok(())
    }

    /// Flip the readonly bit, rolling the in-memory bit back when the write
    /// does not persist.
    pub fn apply_switch_readonly(&self, disk_id: DiskId, readonly: bool) -> Result<()> {
        let disk = self
            .store
            .get_disk(disk_id)
            .ok_or(BedrockError::DiskNotFound(disk_id))?;

        {
            let state = disk.read();
            if state.info.readonly == readonly {
                return Ok(());
            }
        }

        let mut state = disk.write();
        state.info.readonly = readonly;
        if let Err(e) = self.persistence.update_disk(&state.info) {
            state.info.readonly = !readonly;
            return Err(e);
        }
        Ok(())
    }

    /// Start draining a disk. Returns `true` when the disk is already
    /// dropping (the operation is a no-op).
    pub fn apply_dropping_disk(&self, disk_id: DiskId, is_commit: bool) -> Result<bool> {
        let disk = self
            .store
            .get_disk(disk_id)
            .ok_or(BedrockError::DiskNotFound(disk_id))?;

        if disk.read().dropping {
            return Ok(true);
        }

        let precondition = {
            let state = disk.read();
            // Only a normal, readonly disk may enter the dropping list.
            if state.info.status != DiskStatus::Normal || !state.info.readonly {
                Err(BedrockError::DiskAbnormalOrNotReadOnly(disk_id))
            } else {
                Ok(())
            }
        };
        if let Err(e) = precondition {
            warn!(disk_id, "disk is not normal or not readonly, can't drop");
            if !is_commit {
                return Err(e);
            }
            self.pending.deposit(OpKind::DroppingDisk, disk_id, e);
            return Ok(false);
        }
        if !is_commit {
            return Ok(false);
        }

        self.persistence.add_dropping_disk(disk_id)?;

        let node_id = {
            let mut state = disk.write();
            state.dropping = true;
            state.info.node_id
        };
        // Remove the disk from its DiskSet now, so a node expanded during
        // the drain places new disks correctly.
        if let Some(node) = self.store.get_node(node_id) {
            let (disk_type, node_set_id) = node_meta(&node);
            self.topology
                .remove_disk_from_disk_set(disk_type, node_set_id, disk_id);
        }
        Ok(false)
    }

    /// Finish a disk drain: transition to `Dropped` and clear the dropping
    /// marker. A missing dropping-list entry means a concurrent drop
    /// finished first; that is not an error.
    pub fn apply_dropped_disk(&self, disk_id: DiskId) -> Result<()> {
        let exists = self.persistence.is_dropping_disk(disk_id)?;
        if !exists {
            return Ok(());
        }

        let result = self.set_status(disk_id, DiskStatus::Dropped, true);
        if let Err(e) = &result {
            error!(disk_id, %e, "dropped disk failed to set status");
        }

        if let Some(disk) = self.store.get_disk(disk_id) {
            disk.write().dropping = false;
        }
        result
    }

    /// Start draining a node: cascade `DroppingDisk` over its normal disks.
    /// Returns `true` when the node is already dropping or dropped.
    pub fn apply_dropping_node(&self, node_id: NodeId, is_commit: bool) -> Result<bool> {
        let node = self
            .store
            .get_node(node_id)
            .ok_or(BedrockError::NodeNotFound(node_id))?;

        {
            let state = node.read();
            if !state.is_using() || state.dropping {
                return Ok(true);
            }
        }

        // Snapshot the disk records under the node read lock; disk locks are
        // only taken after it is released.
        let disk_records: Vec<Arc<DiskRecord>> = {
            let state = node.read();
            state.disks.values().cloned().collect()
        };

        for disk in &disk_records {
            // Abnormal disks resolve through the repair pipeline; dropped and
            // repaired ones are no longer in use.
            if disk.read().info.status != DiskStatus::Normal {
                continue;
            }
            if let Err(e) = self.apply_dropping_disk(disk.disk_id, is_commit) {
                if !is_commit {
                    return Err(e);
                }
                self.pending.deposit(OpKind::DroppingNode, node_id, e);
                return Ok(false);
            }
        }
        if !is_commit {
            return Ok(false);
        }

        self.persistence.add_dropping_node(node_id)?;
        node.write().dropping = true;
        Ok(false)
    }

    /// Finish a node drain once every disk has left the filterable states.
    ///
    /// A disk still in use is logged and the apply returns `Ok`: failing a
    /// replayed apply would diverge replicas, so the drain is simply retried
    /// by a later `DroppedNode` proposal.
    pub fn apply_dropped_node(&self, node_id: NodeId) -> Result<()> {
        let exists = self.persistence.is_dropping_node(node_id)?;
        if !exists {
            return Ok(());
        }

        let node = self
            .store
            .get_node(node_id)
            .ok_or(BedrockError::NodeNotFound(node_id))?;

        let disk_records: Vec<Arc<DiskRecord>> = {
            let state = node.read();
            state.disks.values().cloned().collect()
        };
        for disk in &disk_records {
            if disk.read().need_filter() {
                error!(node_id, disk_id = disk.disk_id, "node has disk in use");
                return Ok(());
            }
        }

        let mut state = node.write();
        self.persistence.dropped_node(node_id).map_err(|e| {
            error!(node_id, %e, "dropped node failed to persist");
            e
        })?;
        state.info.status = NodeStatus::Dropped;
        state.dropping = false;
        self.topology.remove_node_from_node_set(&state.info);
        Ok(())
    }

    /// Record a capacity report and push the heartbeat deadline forward.
    pub fn apply_heartbeat(&self, disk_id: DiskId, payload: HeartbeatPayload) -> Result<()> {
        let disk = self
            .store
            .get_disk(disk_id)
            .ok_or(BedrockError::DiskNotFound(disk_id))?;

        let mut state = disk.write();
        state.info.heartbeat = payload;
        state.last_expire_at = state.expire_at;
        state.expire_at = Instant::now() + self.cfg.heartbeat_expire_interval;
        Ok(())
    }
}

fn node_meta(node: &Arc<NodeRecord>) -> (DiskType, NodeSetId) {
    let state = node.read();
    (state.info.disk_type, state.info.node_set_id)
}
