//! Replicated cluster operations and the pending-entry bridge.
//!
//! Every mutation of the cluster index is a [`ClusterOp`] proposed to the
//! consensus log and applied by the state machine. [`PendingEntries`]
//! bridges the asymmetry between the synchronous RPC response and the
//! asynchronous apply: drain handlers register a `(kind, id)` key before
//! proposing, the commit handler deposits any precondition failure under
//! that key, and the proposer collects it after the propose call returns.

use crate::error::BedrockError;
use crate::types::{DiskId, DiskInfo, DiskStatus, HeartbeatPayload, NodeId, NodeInfo};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Operations replicated through the consensus log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterOp {
    AddNode(NodeInfo),
    AddDisk(DiskInfo),
    SetDiskStatus {
        disk_id: DiskId,
        status: DiskStatus,
    },
    SwitchReadonly {
        disk_id: DiskId,
        readonly: bool,
    },
    DroppingDisk {
        disk_id: DiskId,
    },
    DroppedDisk {
        disk_id: DiskId,
    },
    DroppingNode {
        node_id: NodeId,
    },
    DroppedNode {
        node_id: NodeId,
    },
    Heartbeat {
        disk_id: DiskId,
        payload: HeartbeatPayload,
    },
}

impl ClusterOp {
    pub fn kind(&self) -> OpKind {
        match self {
            ClusterOp::AddNode(_) => OpKind::AddNode,
            ClusterOp::AddDisk(_) => OpKind::AddDisk,
            ClusterOp::SetDiskStatus { .. } => OpKind::SetDiskStatus,
            ClusterOp::SwitchReadonly { .. } => OpKind::SwitchReadonly,
            ClusterOp::DroppingDisk { .. } => OpKind::DroppingDisk,
            ClusterOp::DroppedDisk { .. } => OpKind::DroppedDisk,
            ClusterOp::DroppingNode { .. } => OpKind::DroppingNode,
            ClusterOp::DroppedNode { .. } => OpKind::DroppedNode,
            ClusterOp::Heartbeat { .. } => OpKind::Heartbeat,
        }
    }
}

/// Discriminant of a [`ClusterOp`], used for pending-entry keys and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    AddNode,
    AddDisk,
    SetDiskStatus,
    SwitchReadonly,
    DroppingDisk,
    DroppedDisk,
    DroppingNode,
    DroppedNode,
    Heartbeat,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OpKind::AddNode => "add-node",
            OpKind::AddDisk => "add-disk",
            OpKind::SetDiskStatus => "set-disk-status",
            OpKind::SwitchReadonly => "switch-readonly",
            OpKind::DroppingDisk => "disk-dropping",
            OpKind::DroppedDisk => "disk-dropped",
            OpKind::DroppingNode => "node-dropping",
            OpKind::DroppedNode => "node-dropped",
            OpKind::Heartbeat => "heartbeat",
        };
        write!(f, "{}", s)
    }
}

/// Key identifying one in-flight proposal's error slot.
pub type PendingKey = (OpKind, u32);

/// Error slots for in-flight proposals.
///
/// Only registered keys ever receive a deposit: replayed log entries from
/// other proposers find no slot and their errors stay local to the apply
/// path.
#[derive(Default)]
pub struct PendingEntries {
    entries: DashMap<PendingKey, Option<BedrockError>>,
}

impl PendingEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an empty slot before proposing.
    pub fn register(&self, kind: OpKind, id: u32) {
        self.entries.insert((kind, id), None);
    }

    /// Deposit an error for the proposer, if a slot is open.
    pub fn deposit(&self, kind: OpKind, id: u32, err: BedrockError) {
        if let Some(mut slot) = self.entries.get_mut(&(kind, id)) {
            *slot.value_mut() = Some(err);
        }
    }

    /// Close the slot and collect whatever the apply deposited.
    pub fn take(&self, kind: OpKind, id: u32) -> Option<BedrockError> {
        self.entries.remove(&(kind, id)).and_then(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deposit_requires_registration() {
        let pending = PendingEntries::new();

        // No slot: the deposit is dropped.
        pending.deposit(OpKind::DroppingDisk, 1, BedrockError::DiskNotFound(1));
        assert!(pending.take(OpKind::DroppingDisk, 1).is_none());

        pending.register(OpKind::DroppingDisk, 1);
        pending.deposit(OpKind::DroppingDisk, 1, BedrockError::DiskNotFound(1));
        assert_eq!(
            pending.take(OpKind::DroppingDisk, 1),
            Some(BedrockError::DiskNotFound(1))
        );

        // Slot consumed.
        assert!(pending.take(OpKind::DroppingDisk, 1).is_none());
    }

    #[test]
    fn test_keys_are_disjoint() {
        let pending = PendingEntries::new();
        pending.register(OpKind::DroppingDisk, 1);
        pending.register(OpKind::DroppingNode, 1);

        pending.deposit(OpKind::DroppingNode, 1, BedrockError::NodeIsDropping(1));
        assert!(pending.take(OpKind::DroppingDisk, 1).is_none());
        assert_eq!(
            pending.take(OpKind::DroppingNode, 1),
            Some(BedrockError::NodeIsDropping(1))
        );
    }

    #[test]
    fn test_op_round_trip_encoding() {
        let op = ClusterOp::SetDiskStatus {
            disk_id: 9,
            status: DiskStatus::Broken,
        };
        let bytes = bincode::serialize(&op).unwrap();
        let decoded: ClusterOp = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.kind(), OpKind::SetDiskStatus);
    }
}
