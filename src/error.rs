//! Error types for the Bedrock cluster manager.
//!
//! This module provides a unified error type [`BedrockError`] for all
//! manager operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Lookup**: disk or node absent
//! - **Registration**: duplicates and illegal locality arguments
//! - **Lifecycle**: status-ladder and drain precondition violations
//! - **Allocation**: placement cannot be satisfied
//! - **Collaborators**: persistence and raft failures, surfaced verbatim
//!
//! Pre-check errors are returned synchronously to the caller. Commit-path
//! errors are logged (and, for drain operations, deposited into the
//! pending-entry map) rather than failing the raft apply.

use crate::types::{DiskId, DiskStatus, NodeId};
use thiserror::Error;

/// Main error type for manager operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BedrockError {
    // Lookup errors
    #[error("Disk not found: {0}")]
    DiskNotFound(DiskId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    // Registration errors
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    // Lifecycle errors
    #[error("Disk {disk_id} status change {from} -> {to} not allowed")]
    ChangeDiskStatusNotAllow {
        disk_id: DiskId,
        from: DiskStatus,
        to: DiskStatus,
    },

    #[error("Disk {0} is abnormal or not read-only, cannot drop")]
    DiskAbnormalOrNotReadOnly(DiskId),

    #[error("Node {0} is already dropping or dropped")]
    NodeIsDropping(NodeId),

    // Allocation errors
    #[error("No enough space: {0}")]
    NoEnoughSpace(String),

    // Collaborator errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // Configuration errors
    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // Encoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BedrockError {
    /// Check if error is retryable.
    ///
    /// Raft failures (leader change, timeout) and exhausted allocations are
    /// transient: the caller may re-propose, or wait for the next allocator
    /// rebuild.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BedrockError::Raft(_) | BedrockError::NoEnoughSpace(_) | BedrockError::Cancelled(_)
        )
    }
}

impl From<bincode::Error> for BedrockError {
    fn from(e: bincode::Error) -> Self {
        BedrockError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for BedrockError {
    fn from(e: serde_json::Error) -> Self {
        BedrockError::Serialization(e.to_string())
    }
}

/// Result type alias for manager operations.
pub type Result<T> = std::result::Result<T, BedrockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(BedrockError::Raft("not leader".into()).is_retryable());
        assert!(BedrockError::NoEnoughSpace("hdd".into()).is_retryable());
        assert!(!BedrockError::DiskNotFound(1).is_retryable());
        assert!(!BedrockError::AlreadyExists("disk 1".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = BedrockError::ChangeDiskStatusNotAllow {
            disk_id: 7,
            from: DiskStatus::Repairing,
            to: DiskStatus::Normal,
        };
        assert_eq!(
            err.to_string(),
            "Disk 7 status change repairing -> normal not allowed"
        );
    }
}
