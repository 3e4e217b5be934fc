//! Heartbeat expiry detection with edge-triggered notifications.
//!
//! The sweep compares each disk's heartbeat deadline against the clock and
//! emits [`HeartbeatEvent`]s on edges only: one `alive = false` when a
//! filterable disk first passes its deadline, one `alive = true` when its
//! heartbeat resumes after an outage. Levels are never re-reported, and a
//! disk that has been silent for more than twice the expiry interval is
//! treated as already notified (it died before a restart; the refresh after
//! leader election covers it).

use crate::cluster::store::EntityStore;
use crate::types::HeartbeatEvent;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Scan all disks and collect heartbeat edges since the previous sweep.
pub fn heartbeat_change_disks(
    store: &EntityStore,
    expire_interval: Duration,
) -> Vec<HeartbeatEvent> {
    let now = Instant::now();
    let mut events = Vec::new();

    for disk in store.all_disks() {
        let (expired_edge, recovered_edge) = {
            let state = disk.read();
            if state.is_expired() && state.need_filter() {
                // Long-dead disks were notified before a restart.
                if now.saturating_duration_since(state.expire_at) >= expire_interval * 2 {
                    continue;
                }
                (!state.notified_expired, false)
            } else {
                let gap = state
                    .expire_at
                    .saturating_duration_since(state.last_expire_at);
                (false, gap > expire_interval)
            }
        };

        if expired_edge {
            let mut state = disk.write();
            // Re-check under the write lock; a heartbeat may have landed.
            if state.is_expired() && state.need_filter() && !state.notified_expired {
                state.notified_expired = true;
                warn!(disk_id = disk.disk_id, "disk heartbeat expired");
                events.push(HeartbeatEvent {
                    disk_id: disk.disk_id,
                    is_alive: false,
                });
            }
        } else if recovered_edge {
            let mut state = disk.write();
            let gap = state
                .expire_at
                .saturating_duration_since(state.last_expire_at);
            if gap > expire_interval {
                // Collapse the gap so the recovery is reported once.
                state.last_expire_at = state.expire_at;
                state.notified_expired = false;
                info!(disk_id = disk.disk_id, "disk heartbeat recovered");
                events.push(HeartbeatEvent {
                    disk_id: disk.disk_id,
                    is_alive: true,
                });
            }
        }
    }

    events
}

/// Uniformly reset every disk's heartbeat deadline.
///
/// Called when this replica becomes leader: follower lag would otherwise
/// read as a wave of false expirations.
pub fn refresh_expire_time(store: &EntityStore, expire_interval: Duration) {
    let now = Instant::now();
    for disk in store.all_disks() {
        let mut state = disk.write();
        state.expire_at = now + expire_interval;
        state.last_expire_at = now + expire_interval;
        state.notified_expired = false;
    }
}

/// Timer-driven heartbeat sweep.
pub struct HeartbeatMonitor {
    store: Arc<EntityStore>,
    expire_interval: Duration,
    check_interval: Duration,
    on_event: Option<Box<dyn Fn(HeartbeatEvent) + Send + Sync>>,
}

impl HeartbeatMonitor {
    pub fn new(store: Arc<EntityStore>, expire_interval: Duration, check_interval: Duration) -> Self {
        Self {
            store,
            expire_interval,
            check_interval,
            on_event: None,
        }
    }

    /// Set a callback invoked for every edge event.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(HeartbeatEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Box::new(callback));
        self
    }

    /// Run the sweep until shutdown.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.check_interval);
        info!("heartbeat monitor starting");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let events = heartbeat_change_disks(&self.store, self.expire_interval);
                    if !events.is_empty() {
                        debug!(count = events.len(), "heartbeat edges detected");
                    }
                    if let Some(ref callback) = self.on_event {
                        for event in events {
                            callback(event);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("heartbeat monitor shutting down");
                    break;
                }
            }
        }
    }
}
