//! Consensus seam for replicated cluster mutations.
//!
//! The manager only needs two hooks from the replication layer: `propose`
//! (submit an encoded operation and wait until it is committed and applied)
//! and the apply callback, which the embedding process wires to
//! [`StateMachine::apply`](crate::cluster::StateMachine::apply).
//! Implementations must tolerate replayed applies after leader changes;
//! every commit handler is idempotent for that reason.
//!
//! [`LoopbackProposer`] short-circuits the log and applies operations
//! directly, standing in for the consensus layer in tests and single-node
//! development setups.

use crate::cluster::StateMachine;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Submit an operation to the replicated log.
#[async_trait]
pub trait Proposer: Send + Sync {
    /// Propose an encoded operation; returns once the entry is committed
    /// and applied on this replica.
    async fn propose(&self, data: Vec<u8>) -> Result<()>;
}

/// A proposer that applies operations immediately, without a log.
pub struct LoopbackProposer {
    state_machine: Arc<StateMachine>,
}

impl LoopbackProposer {
    pub fn new(state_machine: Arc<StateMachine>) -> Self {
        Self { state_machine }
    }
}

#[async_trait]
impl Proposer for LoopbackProposer {
    async fn propose(&self, data: Vec<u8>) -> Result<()> {
        self.state_machine.apply(&data)
    }
}
