//! Configuration module for Bedrock.

use crate::error::{BedrockError, Result};
use crate::types::{CodeMode, DiskType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the cluster manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How often the allocator and space statistics are rebuilt.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// A disk with no heartbeat for this long is considered expired.
    #[serde(with = "humantime_serde")]
    pub heartbeat_expire_interval: Duration,
    /// How often dirty expire metadata is flushed to persistence.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Spread stripes across racks (at most one disk per rack per stripe).
    pub rack_aware: bool,
    /// Spread stripes across hosts (at most one disk per host per stripe).
    pub host_aware: bool,
    /// Free-item headroom the allocator keeps in reserve before reporting
    /// exhaustion.
    pub alloc_tolerate_buffer: u64,
    /// IDC names; top-level failure domains.
    pub idcs: Vec<String>,
    /// Configured erasure coding modes; the largest one drives capacity math.
    pub code_modes: Vec<CodeMode>,
    /// Allocation unit for blob disks, in bytes.
    pub chunk_size: u64,
    /// Allocation unit for shard disks, in bytes; 0 when unused.
    pub shard_size: u64,
    /// Scope name the disk-id allocator draws from.
    pub disk_id_scope_name: String,
    /// Scope name the node-id allocator draws from.
    pub node_id_scope_name: String,
    /// Topology bucket limits per disk type.
    pub copy_set_configs: HashMap<DiskType, CopySetConfig>,
}

/// NodeSet/DiskSet capacity limits for one disk type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CopySetConfig {
    /// Maximum nodes per NodeSet.
    pub node_set_cap: usize,
    /// Maximum nodes of one rack per NodeSet (rack-aware mode).
    pub node_set_rack_cap: usize,
    /// Maximum disks per DiskSet.
    pub disk_set_cap: usize,
    /// Maximum disks a single node may contribute to one DiskSet.
    pub disk_count_per_node_in_disk_set: usize,
}

impl Default for CopySetConfig {
    fn default() -> Self {
        Self {
            node_set_cap: 108,
            node_set_rack_cap: 6,
            disk_set_cap: 27,
            disk_count_per_node_in_disk_set: 3,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            heartbeat_expire_interval: Duration::from_secs(60),
            flush_interval: Duration::from_secs(600),
            rack_aware: false,
            host_aware: true,
            alloc_tolerate_buffer: 0,
            idcs: Vec::new(),
            code_modes: vec![CodeMode::EC6P3L3],
            chunk_size: 16 * 1024 * 1024 * 1024,
            shard_size: 0,
            disk_id_scope_name: "disk-id".to_string(),
            node_id_scope_name: "node-id".to_string(),
            copy_set_configs: HashMap::new(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BedrockError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| BedrockError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.idcs.is_empty() {
            return Err(BedrockError::InvalidConfig {
                field: "idcs".to_string(),
                reason: "at least one IDC is required".to_string(),
            });
        }

        if self.code_modes.is_empty() {
            return Err(BedrockError::InvalidConfig {
                field: "code_modes".to_string(),
                reason: "at least one code mode is required".to_string(),
            });
        }

        if self.chunk_size == 0 && self.shard_size == 0 {
            return Err(BedrockError::InvalidConfig {
                field: "chunk_size".to_string(),
                reason: "one of chunk_size or shard_size must be non-zero".to_string(),
            });
        }

        if self.heartbeat_expire_interval.is_zero() {
            return Err(BedrockError::InvalidConfig {
                field: "heartbeat_expire_interval".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }

        for (disk_type, cs) in &self.copy_set_configs {
            if cs.node_set_cap == 0 || cs.disk_set_cap == 0 || cs.disk_count_per_node_in_disk_set == 0
            {
                return Err(BedrockError::InvalidConfig {
                    field: format!("copy_set_configs.{}", disk_type),
                    reason: "caps must be non-zero".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Allocation unit size: chunk size for blob clusters, shard size
    /// otherwise.
    pub fn item_size(&self) -> u64 {
        if self.chunk_size != 0 {
            self.chunk_size
        } else {
            self.shard_size
        }
    }

    /// The configured code mode with the largest stripe, and its unit count.
    /// Capacity math always assumes the widest stripe.
    pub fn max_su_code_mode(&self) -> (CodeMode, usize) {
        let mut best = self.code_modes[0];
        let mut su_count = best.total_units();
        for mode in &self.code_modes[1..] {
            if mode.total_units() > su_count {
                best = *mode;
                su_count = mode.total_units();
            }
        }
        (best, su_count)
    }

    /// Topology limits for a disk type, falling back to defaults.
    pub fn copy_set_config(&self, disk_type: DiskType) -> CopySetConfig {
        self.copy_set_configs
            .get(&disk_type)
            .copied()
            .unwrap_or_default()
    }

    /// Create a minimal development configuration: three IDCs, short
    /// heartbeat expiry, small chunk size.
    pub fn development() -> Self {
        let mut copy_set_configs = HashMap::new();
        copy_set_configs.insert(
            DiskType::Hdd,
            CopySetConfig {
                node_set_cap: 12,
                node_set_rack_cap: 4,
                disk_set_cap: 12,
                disk_count_per_node_in_disk_set: 3,
            },
        );

        Self {
            refresh_interval: Duration::from_secs(5),
            heartbeat_expire_interval: Duration::from_secs(10),
            flush_interval: Duration::from_secs(30),
            rack_aware: false,
            host_aware: true,
            alloc_tolerate_buffer: 0,
            idcs: vec!["z0".to_string(), "z1".to_string(), "z2".to_string()],
            code_modes: vec![CodeMode::EC6P3L3],
            chunk_size: 16 * 1024 * 1024,
            shard_size: 0,
            disk_id_scope_name: "disk-id".to_string(),
            node_id_scope_name: "node-id".to_string(),
            copy_set_configs,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
