//! Monotonic identifier issuance.
//!
//! Disk and node ids are drawn from named scopes; the allocator guarantees
//! that every range it hands out is strictly above everything issued before
//! it, across restarts. The real backend replicates the cursor through the
//! consensus log; [`MemoryScopeAllocator`] is the in-process stand-in.

use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Monotonic id range allocator.
#[async_trait]
pub trait ScopeAllocator: Send + Sync {
    /// Allocate `count` ids from `scope`, returning `(base, top)`; the issued
    /// ids are `base + 1 ..= top`.
    async fn alloc(&self, scope: &str, count: u32) -> Result<(u32, u32)>;
}

/// In-memory [`ScopeAllocator`] with one cursor per scope name.
#[derive(Default)]
pub struct MemoryScopeAllocator {
    cursors: Mutex<HashMap<String, u32>>,
}

impl MemoryScopeAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScopeAllocator for MemoryScopeAllocator {
    async fn alloc(&self, scope: &str, count: u32) -> Result<(u32, u32)> {
        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(scope.to_string()).or_insert(0);
        let base = *cursor;
        *cursor += count;
        Ok((base, *cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ranges_are_monotonic() {
        let allocator = MemoryScopeAllocator::new();

        let (base, top) = allocator.alloc("disk-id", 1).await.unwrap();
        assert_eq!((base, top), (0, 1));

        let (base, top) = allocator.alloc("disk-id", 5).await.unwrap();
        assert_eq!((base, top), (1, 6));
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let allocator = MemoryScopeAllocator::new();

        allocator.alloc("disk-id", 10).await.unwrap();
        let (base, top) = allocator.alloc("node-id", 1).await.unwrap();
        assert_eq!((base, top), (0, 1));
    }
}
