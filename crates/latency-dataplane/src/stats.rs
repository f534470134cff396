//! Node statistics.
//!
//! Lock-free counters the management plane snapshots. The node itself never
//! drops a packet, so the named error-counter array carries only the
//! placeholder entry.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Names for the node's error counters.
pub const ERROR_STRINGS: [&str; 1] = ["Currently not used"];

/// Per-worker node counters.
#[derive(Debug, Default)]
pub struct NodeStats {
    /// Packets handed to the node.
    pub packets: AtomicU64,
    /// Packets forwarded without flow processing.
    pub skipped: AtomicU64,
    /// Flows admitted.
    pub flows_created: AtomicU64,
    /// Flows reclaimed by the timer wheel.
    pub flows_expired: AtomicU64,
    /// Table lookups that found a flow.
    pub lookup_hits: AtomicU64,
    /// Table lookups that missed.
    pub lookup_misses: AtomicU64,
    /// RTT samples emitted.
    pub samples: AtomicU64,
    /// Error counters, indexed per `ERROR_STRINGS`.
    pub errors: [AtomicU64; ERROR_STRINGS.len()],
}

impl NodeStats {
    #[inline(always)]
    pub(crate) fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_hit(&self) {
        self.lookup_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_miss(&self) {
        self.lookup_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters at once.
    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            flows_created: self.flows_created.load(Ordering::Relaxed),
            flows_expired: self.flows_expired.load(Ordering::Relaxed),
            lookup_hits: self.lookup_hits.load(Ordering::Relaxed),
            lookup_misses: self.lookup_misses.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
        }
    }
}

/// Non-atomic counter snapshot, serializable for counter export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStatsSnapshot {
    /// Packets handed to the node.
    pub packets: u64,
    /// Packets forwarded without flow processing.
    pub skipped: u64,
    /// Flows admitted.
    pub flows_created: u64,
    /// Flows reclaimed by the timer wheel.
    pub flows_expired: u64,
    /// Table lookups that found a flow.
    pub lookup_hits: u64,
    /// Table lookups that missed.
    pub lookup_misses: u64,
    /// RTT samples emitted.
    pub samples: u64,
}
