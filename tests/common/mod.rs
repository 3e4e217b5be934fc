//! Common test utilities for integration tests.

use bedrock::cluster::Manager;
use bedrock::config::ManagerConfig;
use bedrock::persistence::MemoryPersistence;
use bedrock::raft::LoopbackProposer;
use bedrock::scope::MemoryScopeAllocator;
use bedrock::types::{
    DiskId, DiskInfo, DiskStatus, DiskType, HeartbeatPayload, NodeId, NodeInfo, NodeRole,
    NodeStatus, INVALID_NODE_ID, NULL_NODE_SET_ID,
};
use std::sync::Arc;
use std::time::Duration;

/// Allocation unit used across the integration tests (1 MiB).
pub const ITEM_SIZE: u64 = 1024 * 1024;

/// Initialize test logging once; respects `RUST_LOG`.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A manager wired to in-memory collaborators and a loopback log.
pub struct ClusterFixture {
    pub manager: Arc<Manager>,
    pub persistence: Arc<MemoryPersistence>,
}

/// Builder for [`ClusterFixture`].
pub struct FixtureBuilder {
    cfg: ManagerConfig,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        let mut cfg = ManagerConfig::development();
        cfg.chunk_size = ITEM_SIZE;
        Self { cfg }
    }

    pub fn heartbeat_expire(mut self, interval: Duration) -> Self {
        self.cfg.heartbeat_expire_interval = interval;
        self
    }

    pub fn host_aware(mut self, host_aware: bool) -> Self {
        self.cfg.host_aware = host_aware;
        self
    }

    pub fn rack_aware(mut self, rack_aware: bool) -> Self {
        self.cfg.rack_aware = rack_aware;
        self
    }

    pub fn build(self) -> ClusterFixture {
        init_tracing();
        let persistence = Arc::new(MemoryPersistence::new());
        let manager = Manager::new(
            self.cfg,
            persistence.clone(),
            Arc::new(MemoryScopeAllocator::new()),
        )
        .expect("valid fixture config");
        manager.set_proposer(Arc::new(LoopbackProposer::new(manager.state_machine())));
        ClusterFixture {
            manager,
            persistence,
        }
    }
}

impl Default for FixtureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A blob-node registration for `host` in `idc`/`rack`, id assigned by the
/// manager.
pub fn node_info(host: &str, idc: &str, rack: &str) -> NodeInfo {
    NodeInfo {
        node_id: INVALID_NODE_ID,
        host: host.to_string(),
        idc: idc.to_string(),
        rack: rack.to_string(),
        disk_type: DiskType::Hdd,
        role: NodeRole::BlobNode,
        status: NodeStatus::Normal,
        node_set_id: NULL_NODE_SET_ID,
    }
}

/// A normal, writable disk with `free` bytes reported.
pub fn disk_info(
    disk_id: DiskId,
    node_id: NodeId,
    host: &str,
    path: &str,
    idc: &str,
    rack: &str,
    free: u64,
) -> DiskInfo {
    DiskInfo {
        disk_id,
        node_id,
        host: host.to_string(),
        path: path.to_string(),
        idc: idc.to_string(),
        rack: rack.to_string(),
        status: DiskStatus::Normal,
        readonly: false,
        heartbeat: HeartbeatPayload::blob_node(free, free * 2, ITEM_SIZE),
    }
}

/// Register one host with a node and one disk per given path. Returns the
/// node id and the disk ids in path order.
pub async fn register_host(
    fixture: &ClusterFixture,
    host: &str,
    idc: &str,
    rack: &str,
    paths: &[&str],
    free: u64,
) -> (NodeId, Vec<DiskId>) {
    let node_id = fixture
        .manager
        .add_node(node_info(host, idc, rack))
        .await
        .expect("add node");

    let mut disk_ids = Vec::with_capacity(paths.len());
    for path in paths {
        let disk_id = fixture
            .manager
            .add_disk(disk_info(0, node_id, host, path, idc, rack, free))
            .await
            .expect("add disk");
        disk_ids.push(disk_id);
    }
    (node_id, disk_ids)
}
