//! Flood deduplication
//!
//! Meshtastic floods every packet through the mesh, so a listener hears the
//! same packet id once per relaying neighbor. The [`DedupFilter`] records each
//! packet id in the shared store with a flood-expiry window and reports
//! whether this is the first sighting.
//!
//! The record is created with an atomic test-and-set, so when several
//! exporters share one Redis store exactly one of them processes a given
//! packet. Markers are never refreshed by repeat sightings: the window is
//! measured from the first one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::config::DedupConfig;
use crate::error::Result;
use crate::store::ExpiringStore;

/// Store key for a packet id marker
pub fn dedup_key(packet_id: u32) -> String {
    format!("dedup:{}", packet_id)
}

/// Dedup statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Total packet ids checked
    pub total_checks: u64,
    /// First sightings (passed through)
    pub new_packets: u64,
    /// Repeat sightings (blocked)
    pub duplicates_blocked: u64,
}

impl DedupStats {
    /// Get the duplicate rate (0.0 to 1.0)
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.duplicates_blocked as f64 / self.total_checks as f64
        }
    }
}

#[derive(Debug, Default)]
struct AtomicDedupStats {
    total_checks: AtomicU64,
    new_packets: AtomicU64,
    duplicates_blocked: AtomicU64,
}

/// First-sighting filter over an [`ExpiringStore`]
#[derive(Clone)]
pub struct DedupFilter {
    store: Arc<dyn ExpiringStore>,
    flood_expire_time: Duration,
    stats: Arc<AtomicDedupStats>,
}

impl DedupFilter {
    /// Create a filter with the given flood-expiry window
    pub fn new(store: Arc<dyn ExpiringStore>, flood_expire_time: Duration) -> Self {
        Self {
            store,
            flood_expire_time,
            stats: Arc::new(AtomicDedupStats::default()),
        }
    }

    /// Create from dedup configuration
    pub fn from_config(store: Arc<dyn ExpiringStore>, config: &DedupConfig) -> Self {
        Self::new(store, config.flood_expire_time)
    }

    /// Returns `true` exactly once per packet id per expiry window
    ///
    /// Store failures propagate; the caller decides whether to skip the
    /// packet.
    pub async fn is_new_packet(&self, packet_id: u32) -> Result<bool> {
        let created = self
            .store
            .set_if_absent(&dedup_key(packet_id), self.flood_expire_time)
            .await?;

        self.stats.total_checks.fetch_add(1, Ordering::Relaxed);
        if created {
            self.stats.new_packets.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.duplicates_blocked.fetch_add(1, Ordering::Relaxed);
            trace!(packet_id, "Duplicate packet");
        }
        Ok(created)
    }

    /// Flood-expiry window
    pub fn flood_expire_time(&self) -> Duration {
        self.flood_expire_time
    }

    /// Snapshot of the filter statistics
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            total_checks: self.stats.total_checks.load(Ordering::Relaxed),
            new_packets: self.stats.new_packets.load(Ordering::Relaxed),
            duplicates_blocked: self.stats.duplicates_blocked.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DedupFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupFilter")
            .field("backend", &self.store.backend())
            .field("flood_expire_time", &self.flood_expire_time)
            .field("stats", &self.stats())
            .finish()
    }
}
