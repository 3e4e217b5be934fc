//! The cluster manager facade.
//!
//! `Manager` wires the entity store, topology index, state machine and
//! allocator together, owns the background loops (allocator rebuild, flush)
//! and exposes the propose-side and query APIs. Mutations flow through the
//! consensus seam: the manager pre-checks, proposes, then collects any
//! commit-path error the apply deposited under the operation's pending key.

use crate::cluster::allocator::{self, AllocatorTree};
use crate::cluster::heartbeat::{self, HeartbeatMonitor};
use crate::cluster::ops::{ClusterOp, OpKind, PendingEntries};
use crate::cluster::state_machine::StateMachine;
use crate::cluster::store::{DiskRecord, EntityStore};
use crate::cluster::topology::TopologyIndex;
use crate::config::ManagerConfig;
use crate::error::{BedrockError, Result};
use crate::persistence::Persistence;
use crate::raft::Proposer;
use crate::scope::ScopeAllocator;
use crate::types::{
    DiskId, DiskInfo, DiskStatus, DiskType, HeartbeatEvent, HeartbeatPayload, NodeId, NodeInfo,
    SpaceStatInfo, TopologyInfo, INVALID_NODE_ID, NULL_NODE_SET_ID,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// The authoritative disk and node index of the cluster.
pub struct Manager {
    cfg: Arc<ManagerConfig>,
    store: Arc<EntityStore>,
    topology: Arc<TopologyIndex>,
    state_machine: Arc<StateMachine>,
    pending: Arc<PendingEntries>,
    persistence: Arc<dyn Persistence>,
    scope: Arc<dyn ScopeAllocator>,
    proposer: RwLock<Option<Arc<dyn Proposer>>>,
    // Published snapshots; swapped whole so readers never see a half-built
    // tree.
    allocators: RwLock<Arc<HashMap<DiskType, AllocatorTree>>>,
    space_stats: RwLock<Arc<HashMap<DiskType, SpaceStatInfo>>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(
        cfg: ManagerConfig,
        persistence: Arc<dyn Persistence>,
        scope: Arc<dyn ScopeAllocator>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        let store = Arc::new(EntityStore::new());
        let topology = Arc::new(TopologyIndex::new());
        let pending = Arc::new(PendingEntries::new());
        let state_machine = Arc::new(StateMachine::new(
            store.clone(),
            topology.clone(),
            persistence.clone(),
            pending.clone(),
            cfg.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Arc::new(Self {
            cfg,
            store,
            topology,
            state_machine,
            pending,
            persistence,
            scope,
            proposer: RwLock::new(None),
            allocators: RwLock::new(Arc::new(HashMap::new())),
            space_stats: RwLock::new(Arc::new(HashMap::new())),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// The apply-side handle for the consensus layer.
    pub fn state_machine(&self) -> Arc<StateMachine> {
        self.state_machine.clone()
    }

    /// Wire the consensus layer in. Until then, every mutation fails with a
    /// raft error.
    pub fn set_proposer(&self, proposer: Arc<dyn Proposer>) {
        *self.proposer.write() = Some(proposer);
    }

    async fn propose(&self, op: ClusterOp) -> Result<()> {
        let proposer = self
            .proposer
            .read()
            .clone()
            .ok_or_else(|| BedrockError::Raft("proposer not set".to_string()))?;
        let data = bincode::serialize(&op)?;
        proposer.propose(data).await
    }

    /// Spawn the allocator-rebuild, flush and heartbeat-sweep loops.
    pub fn start_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();

        let mgr = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(mgr.cfg.refresh_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => mgr.rebuild_allocator(),
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("allocator refresh loop stopped");
        }));

        let mgr = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(mgr.cfg.flush_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = mgr.persistence.flush() {
                            // Next cycle retries.
                            error!(%e, "flush failed");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("flush loop stopped");
        }));

        let monitor = HeartbeatMonitor::new(
            self.store.clone(),
            self.cfg.heartbeat_expire_interval,
            self.cfg.heartbeat_expire_interval,
        );
        let shutdown_rx = self.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(monitor.run(shutdown_rx)));
    }

    /// Signal the background loops and wait for them to finish.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks = {
            let mut guard = self.tasks.lock();
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(%e, "background task aborted");
                }
            }
        }
        info!("cluster manager closed");
    }

    // --- identifier allocation -------------------------------------------

    /// Allocate an unused disk id.
    pub async fn alloc_disk_id(&self) -> Result<DiskId> {
        let (_, top) = self.scope.alloc(&self.cfg.disk_id_scope_name, 1).await?;
        Ok(top)
    }

    /// Allocate an unused node id.
    pub async fn alloc_node_id(&self) -> Result<NodeId> {
        let (_, top) = self.scope.alloc(&self.cfg.node_id_scope_name, 1).await?;
        Ok(top)
    }

    // --- propose-side API ------------------------------------------------

    /// Validate a registration's topology claims.
    pub fn validate_node_info(&self, info: &NodeInfo) -> Result<()> {
        if info.node_set_id != NULL_NODE_SET_ID {
            self.topology
                .validate_node_set_id(info.disk_type, info.node_set_id)?;
        }
        Ok(())
    }

    /// Register a node. Re-registration of the same `(host, disk_type)`
    /// returns the existing id.
    pub async fn add_node(&self, info: NodeInfo) -> Result<NodeId> {
        self.validate_node_info(&info)?;
        if let Some(existing) = self.store.check_node_dup(&info) {
            return Ok(existing);
        }

        let mut info = info;
        if info.node_id == INVALID_NODE_ID {
            info.node_id = self.alloc_node_id().await?;
        }
        let node_id = info.node_id;
        self.propose(ClusterOp::AddNode(info)).await?;
        Ok(node_id)
    }

    /// Register a disk under an existing node.
    pub async fn add_disk(&self, info: DiskInfo) -> Result<DiskId> {
        let node = self
            .store
            .get_node(info.node_id)
            .ok_or(BedrockError::NodeNotFound(info.node_id))?;
        let node_info = {
            let state = node.read();
            if state.dropping || !state.is_using() {
                return Err(BedrockError::NodeIsDropping(info.node_id));
            }
            state.info.clone()
        };

        let mut info = info;
        if info.disk_id == 0 {
            info.disk_id = self.alloc_disk_id().await?;
        }
        self.store.check_disk_dup(info.disk_id, &info, &node_info)?;

        let disk_id = info.disk_id;
        self.propose(ClusterOp::AddDisk(info)).await?;
        Ok(disk_id)
    }

    /// Walk a disk along the status ladder.
    pub async fn set_disk_status(&self, disk_id: DiskId, status: DiskStatus) -> Result<()> {
        self.state_machine.set_status(disk_id, status, false)?;
        self.propose(ClusterOp::SetDiskStatus { disk_id, status }).await
    }

    /// Flip a disk's readonly bit.
    pub async fn switch_readonly(&self, disk_id: DiskId, readonly: bool) -> Result<()> {
        self.store
            .get_disk(disk_id)
            .ok_or(BedrockError::DiskNotFound(disk_id))?;
        self.propose(ClusterOp::SwitchReadonly { disk_id, readonly })
            .await
    }

    /// Start draining a disk. No-op when the disk is already dropping.
    pub async fn dropping_disk(&self, disk_id: DiskId) -> Result<()> {
        if self.state_machine.apply_dropping_disk(disk_id, false)? {
            return Ok(());
        }

        self.pending.register(OpKind::DroppingDisk, disk_id);
        let proposed = self.propose(ClusterOp::DroppingDisk { disk_id }).await;
        let deposited = self.pending.take(OpKind::DroppingDisk, disk_id);
        proposed?;
        match deposited {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Finish a disk drain once its data has been migrated.
    pub async fn dropped_disk(&self, disk_id: DiskId) -> Result<()> {
        self.store
            .get_disk(disk_id)
            .ok_or(BedrockError::DiskNotFound(disk_id))?;
        self.propose(ClusterOp::DroppedDisk { disk_id }).await
    }

    /// Start draining a node and all of its normal disks.
    pub async fn dropping_node(&self, node_id: NodeId) -> Result<()> {
        if self.state_machine.apply_dropping_node(node_id, false)? {
            return Ok(());
        }

        self.pending.register(OpKind::DroppingNode, node_id);
        let proposed = self.propose(ClusterOp::DroppingNode { node_id }).await;
        let deposited = self.pending.take(OpKind::DroppingNode, node_id);
        proposed?;
        match deposited {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Finish a node drain once every disk has left the filterable states.
    pub async fn dropped_node(&self, node_id: NodeId) -> Result<()> {
        self.store
            .get_node(node_id)
            .ok_or(BedrockError::NodeNotFound(node_id))?;
        self.propose(ClusterOp::DroppedNode { node_id }).await
    }

    /// Record a disk heartbeat. Applied directly: heartbeats for known
    /// disks do not need the log.
    pub fn heartbeat(&self, disk_id: DiskId, payload: HeartbeatPayload) -> Result<()> {
        self.state_machine.apply_heartbeat(disk_id, payload)
    }

    // --- query API -------------------------------------------------------

    pub fn disk_info(&self, disk_id: DiskId) -> Result<DiskInfo> {
        let disk = self
            .store
            .get_disk(disk_id)
            .ok_or(BedrockError::DiskNotFound(disk_id))?;
        let info = disk.read().info.clone();
        Ok(info)
    }

    pub fn node_info(&self, node_id: NodeId) -> Result<NodeInfo> {
        let node = self
            .store
            .get_node(node_id)
            .ok_or(BedrockError::NodeNotFound(node_id))?;
        let info = node.read().info.clone();
        Ok(info)
    }

    /// Whether a disk accepts new writes.
    pub fn is_disk_writable(&self, disk_id: DiskId) -> Result<bool> {
        let disk = self
            .store
            .get_disk(disk_id)
            .ok_or(BedrockError::DiskNotFound(disk_id))?;
        let writable = disk.read().is_writable();
        Ok(writable)
    }

    /// Whether a disk is being drained.
    pub fn is_dropping_disk(&self, disk_id: DiskId) -> Result<bool> {
        let disk = self
            .store
            .get_disk(disk_id)
            .ok_or(BedrockError::DiskNotFound(disk_id))?;
        let dropping = disk.read().dropping;
        Ok(dropping)
    }

    /// Whether the next heartbeat would advance the deadline by less than
    /// `notify_interval`; callers rate-limit upstream notifications with it.
    pub fn is_frequent_heartbeat(
        &self,
        disk_id: DiskId,
        notify_interval: Duration,
    ) -> Result<bool> {
        let disk = self
            .store
            .get_disk(disk_id)
            .ok_or(BedrockError::DiskNotFound(disk_id))?;

        let state = disk.read();
        let new_expire_at = Instant::now() + self.cfg.heartbeat_expire_interval;
        Ok(new_expire_at.saturating_duration_since(state.expire_at) < notify_interval)
    }

    /// Space statistics snapshot for one disk type.
    pub fn stat(&self, disk_type: DiskType) -> SpaceStatInfo {
        let stats = self.space_stats.read().clone();
        stats.get(&disk_type).cloned().unwrap_or_default()
    }

    /// Topology dump: NodeSets, DiskSets and id cursors.
    pub fn topology_info(&self) -> TopologyInfo {
        self.topology.topology_info()
    }

    /// Heartbeat edges since the last sweep.
    pub fn heartbeat_change_disks(&self) -> Vec<HeartbeatEvent> {
        heartbeat::heartbeat_change_disks(&self.store, self.cfg.heartbeat_expire_interval)
    }

    /// Reset every disk's heartbeat deadline; called on leader change.
    pub fn refresh_expire_time(&self) {
        heartbeat::refresh_expire_time(&self.store, self.cfg.heartbeat_expire_interval);
    }

    /// Select `count` writable disks of the given type for one stripe.
    pub fn alloc_chunks(
        &self,
        disk_type: DiskType,
        count: usize,
        excludes: &HashSet<DiskId>,
    ) -> Result<Vec<DiskId>> {
        let allocators = self.allocators.read().clone();
        let tree = allocators
            .get(&disk_type)
            .ok_or_else(|| BedrockError::NoEnoughSpace(format!("no {} disks", disk_type)))?;
        let picked = tree.alloc(count, excludes)?;
        self.validate_alloc_ret(&picked)?;
        Ok(picked)
    }

    /// Post-allocation invariant check: host-aware placement never returns
    /// two disks of one host; otherwise no disk repeats.
    pub fn validate_alloc_ret(&self, disks: &[DiskId]) -> Result<()> {
        if self.cfg.host_aware {
            let mut selected_hosts = HashSet::new();
            for disk_id in disks {
                let disk = self
                    .store
                    .get_disk(*disk_id)
                    .ok_or(BedrockError::DiskNotFound(*disk_id))?;
                let host = disk.read().info.host.clone();
                if !selected_hosts.insert(host) {
                    return Err(BedrockError::Internal(format!(
                        "duplicated host in selected disks: {:?}",
                        disks
                    )));
                }
            }
            return Ok(());
        }

        let mut selected = HashSet::new();
        for disk_id in disks {
            if !selected.insert(*disk_id) {
                return Err(BedrockError::Internal(format!(
                    "duplicated disk in selected disks: {:?}",
                    disks
                )));
            }
        }
        Ok(())
    }

    /// Rebuild the allocator trees and space statistics from the current
    /// disk population. Runs on the refresh cadence and may be called
    /// directly after bulk registration.
    pub fn rebuild_allocator(&self) {
        let disks = self.store.all_disks();
        let mut by_type: HashMap<DiskType, Vec<Arc<DiskRecord>>> = HashMap::new();
        for disk in disks {
            let node_id = disk.read().info.node_id;
            let disk_type = self
                .store
                .get_node(node_id)
                .map(|n| n.read().info.disk_type)
                // Legacy disks predate node records and are HDD.
                .unwrap_or(DiskType::Hdd);
            by_type.entry(disk_type).or_default().push(disk);
        }

        let mut allocators = HashMap::new();
        let mut stats = HashMap::new();
        for (disk_type, disks) in by_type {
            let built = allocator::build(&disks, &self.store, &self.cfg);
            allocators.insert(disk_type, built.tree);
            stats.insert(disk_type, built.space);
        }

        *self.allocators.write() = Arc::new(allocators);
        *self.space_stats.write() = Arc::new(stats);
    }
}
