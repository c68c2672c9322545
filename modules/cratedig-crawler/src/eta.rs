//! Moving estimate of per-unit crawl latency for progress ETAs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cratedig_common::Stage;

/// Seed estimates until real samples arrive: expanding an item's listing is
/// usually one page, a full collection crawl a little more.
const STAGE1_SEED_MS: u64 = 2_000;
const STAGE2_SEED_MS: u64 = 3_000;

/// Exponentially-weighted per-stage latency estimate. Thread-safe via
/// atomics; workers record samples concurrently.
pub struct EtaTracker {
    stage1_ms: AtomicU64,
    stage2_ms: AtomicU64,
}

impl EtaTracker {
    pub fn new() -> Self {
        Self {
            stage1_ms: AtomicU64::new(STAGE1_SEED_MS),
            stage2_ms: AtomicU64::new(STAGE2_SEED_MS),
        }
    }

    fn cell(&self, stage: Stage) -> &AtomicU64 {
        match stage {
            Stage::Stage1 => &self.stage1_ms,
            Stage::Stage2 | Stage::Done => &self.stage2_ms,
        }
    }

    /// Fold a completed unit's latency into the estimate: 70% history,
    /// 30% new sample.
    pub fn record(&self, stage: Stage, elapsed: Duration) {
        let sample = elapsed.as_millis() as u64;
        let cell = self.cell(stage);
        let old = cell.load(Ordering::Relaxed);
        cell.store((old * 7 + sample * 3) / 10, Ordering::Relaxed);
    }

    /// Seconds until `count_left` units drain at the current per-unit rate.
    pub fn estimate_secs(&self, stage: Stage, count_left: i64) -> i64 {
        let per_unit_ms = self.cell(stage).load(Ordering::Relaxed) as i64;
        per_unit_ms.saturating_mul(count_left.max(0)) / 1_000
    }
}

impl Default for EtaTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_give_nonzero_estimates() {
        let eta = EtaTracker::new();
        assert_eq!(eta.estimate_secs(Stage::Stage1, 10), 20);
        assert_eq!(eta.estimate_secs(Stage::Stage2, 10), 30);
    }

    #[test]
    fn estimate_tracks_progress() {
        let eta = EtaTracker::new();
        let at_ten = eta.estimate_secs(Stage::Stage1, 10);
        let at_three = eta.estimate_secs(Stage::Stage1, 3);
        assert!(at_three < at_ten);
        assert_eq!(eta.estimate_secs(Stage::Stage1, 0), 0);
    }

    #[test]
    fn samples_pull_the_estimate_toward_observed_latency() {
        let eta = EtaTracker::new();
        for _ in 0..20 {
            eta.record(Stage::Stage1, Duration::from_millis(500));
        }
        let estimate = eta.estimate_secs(Stage::Stage1, 10);
        assert!(estimate <= 6, "estimate {estimate}s should approach 5s");

        // Stage 2 is tracked independently.
        assert_eq!(eta.estimate_secs(Stage::Stage2, 10), 30);
    }
}
