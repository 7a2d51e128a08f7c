//! Packet counters.
//!
//! Every stage that drops or consumes a packet bumps one counter. Counters
//! only increase; take a [`CounterSnapshot`] to report them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Point-in-time copy of [`PacketCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    /// Measurement notifications taken off the event channel.
    pub received: u64,
    /// Complete readings produced by a decoder.
    pub decoded: u64,
    /// Packets dropped for a failed checksum.
    pub corrupt: u64,
    /// Packets a decoder rejected.
    pub malformed: u64,
    /// Events lost to event channel overflow.
    pub dropped: u64,
    /// End-of-transfer signals seen.
    pub end_of_transfer: u64,
}

impl CounterSnapshot {
    /// Packets that were lost or rejected.
    pub fn discarded(&self) -> u64 {
        self.corrupt + self.malformed + self.dropped
    }
}

/// Thread-safe packet counters shared by a session and its decoder gate.
#[derive(Debug, Default)]
pub struct PacketCounters {
    received: AtomicU64,
    decoded: AtomicU64,
    corrupt: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
    end_of_transfer: AtomicU64,
}

impl PacketCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create zeroed counters wrapped in an `Arc`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt(&self) {
        self.corrupt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` events lost to overflow.
    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_end_of_transfer(&self) {
        self.end_of_transfer.fetch_add(1, Ordering::Relaxed);
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn corrupt(&self) -> u64 {
        self.corrupt.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn end_of_transfer(&self) -> u64 {
        self.end_of_transfer.load(Ordering::Relaxed)
    }

    /// Get a snapshot of the current counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received(),
            decoded: self.decoded(),
            corrupt: self.corrupt(),
            malformed: self.malformed(),
            dropped: self.dropped(),
            end_of_transfer: self.end_of_transfer(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let counters = PacketCounters::new();
        counters.record_received();
        counters.record_received();
        counters.record_decoded();
        counters.record_corrupt();
        counters.record_dropped(7);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.decoded, 1);
        assert_eq!(snapshot.corrupt, 1);
        assert_eq!(snapshot.dropped, 7);
        assert_eq!(snapshot.malformed, 0);
        assert_eq!(snapshot.discarded(), 8);
    }

    #[test]
    fn test_shared_counters_across_threads() {
        let counters = PacketCounters::shared();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        counters.record_malformed();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counters.malformed(), 400);
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = CounterSnapshot {
            received: 3,
            end_of_transfer: 1,
            ..Default::default()
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"end_of_transfer\":1"));
        let parsed: CounterSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
