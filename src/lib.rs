//! Bedrock - the cluster disk & node manager of a distributed blob store.
//!
//! Bedrock is the authoritative, replicated in-memory index over every
//! physical node and disk in a blob-storage cluster. It decides which disks
//! are writable, which are draining, which have failed, and groups nodes
//! and disks into fault-tolerance buckets used by allocation.
//!
//! # Features
//!
//! - **Replicated State Machine**: every mutation flows propose → commit
//!   through a consensus log, with idempotent apply handlers.
//! - **Disk Lifecycle**: a strict status ladder
//!   (`Normal → Broken → Repairing → Repaired → Dropped`) with orthogonal
//!   readonly and dropping markers.
//! - **Topology Engine**: NodeSet/DiskSet buckets with rack-aware and
//!   host-aware placement limits.
//! - **Capacity Estimation**: writable-space prediction via stripe packing
//!   over per-host free-space tokens.
//! - **Heartbeat Monitoring**: edge-triggered alive/expired events.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Bedrock                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Propose Side: pre-check | consensus log | pending entries  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Index: EntityStore | TopologyIndex | host/path filter      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Read Side: Allocator | SpaceStat | HeartbeatMonitor        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Collaborators: Persistence | ScopeAllocator | Proposer     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use bedrock::cluster::Manager;
//! use bedrock::config::ManagerConfig;
//! use bedrock::persistence::MemoryPersistence;
//! use bedrock::raft::LoopbackProposer;
//! use bedrock::scope::MemoryScopeAllocator;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> bedrock::Result<()> {
//!     let manager = Manager::new(
//!         ManagerConfig::development(),
//!         Arc::new(MemoryPersistence::new()),
//!         Arc::new(MemoryScopeAllocator::new()),
//!     )?;
//!     manager.set_proposer(Arc::new(LoopbackProposer::new(manager.state_machine())));
//!     manager.start_background_tasks();
//!     // ... serve RPCs ...
//!     manager.close().await;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod persistence;
pub mod raft;
pub mod scope;
pub mod types;

// Re-exports
pub use error::{BedrockError, Result};
pub use types::*;
