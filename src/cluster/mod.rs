//! Cluster management core.
//!
//! This module holds the replicated disk/node index and everything that
//! feeds off it:
//! - Entity store with per-record locks and the host/path uniqueness filter
//! - NodeSet/DiskSet topology index
//! - Replicated state machine (pre-check and commit handlers)
//! - Placement allocator and writable-space estimation
//! - Heartbeat-expiry monitor with edge-triggered events

pub mod allocator;
mod heartbeat;
mod manager;
mod ops;
mod state_machine;
mod store;
mod topology;

pub use heartbeat::{heartbeat_change_disks, refresh_expire_time, HeartbeatMonitor};
pub use manager::Manager;
pub use ops::{ClusterOp, OpKind, PendingEntries};
pub use state_machine::StateMachine;
pub use store::{
    disk_filter_key, node_filter_key, DiskRecord, DiskState, EntityStore, NodeRecord, NodeState,
};
pub use topology::TopologyIndex;
