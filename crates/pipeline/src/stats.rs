//! Frame-conservation ledger shared by every pipeline stage.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters proving that every captured frame is accounted for:
/// captured = encoded + dropped (inference, monotonicity, encode) + drained.
#[derive(Default)]
pub struct FrameStats {
    pub captured: AtomicU64,
    pub encoded: AtomicU64,
    pub dropped_inference: AtomicU64,
    pub dropped_monotonicity: AtomicU64,
    pub dropped_encode: AtomicU64,
    pub drained_on_stop: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub encoded: u64,
    pub dropped_inference: u64,
    pub dropped_monotonicity: u64,
    pub dropped_encode: u64,
    pub drained_on_stop: u64,
}

impl StatsSnapshot {
    /// Frames whose fate is recorded. Equal to `captured` at any quiescent
    /// point.
    pub fn accounted(&self) -> u64 {
        self.encoded
            + self.dropped_inference
            + self.dropped_monotonicity
            + self.dropped_encode
            + self.drained_on_stop
    }
}

impl FrameStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::SeqCst),
            encoded: self.encoded.load(Ordering::SeqCst),
            dropped_inference: self.dropped_inference.load(Ordering::SeqCst),
            dropped_monotonicity: self.dropped_monotonicity.load(Ordering::SeqCst),
            dropped_encode: self.dropped_encode.load(Ordering::SeqCst),
            drained_on_stop: self.drained_on_stop.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sums_every_outcome() {
        let stats = FrameStats::default();
        stats.captured.store(10, Ordering::SeqCst);
        stats.encoded.store(6, Ordering::SeqCst);
        stats.dropped_inference.store(2, Ordering::SeqCst);
        stats.dropped_monotonicity.store(1, Ordering::SeqCst);
        stats.drained_on_stop.store(1, Ordering::SeqCst);

        let snap = stats.snapshot();
        assert_eq!(snap.accounted(), snap.captured);
    }
}
