//! Load accounting for rebalancing.
//!
//! Shards count operations per lock inside a fixed measurement window and
//! report the counts when the window rolls over. The master folds each
//! report into an exponentially weighted estimate per shard.
//!
//! Both sides are driven only by committed entries: the window clock is the
//! entry's commit timestamp, so every replica rolls at the same entry and
//! produces the same report.

use serde::{Deserialize, Serialize};

/// Shard-side measurement window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrequencyWindow {
    /// Commit timestamp that opened the current window; 0 before the first
    /// counted operation.
    pub start_ms: u64,
}

impl FrequencyWindow {
    /// Advance the window if `now_ms` is at least one period past its start.
    /// Returns `true` when the caller should snapshot and reset counters.
    pub fn roll(&mut self, now_ms: u64, period_ms: u64) -> bool {
        if self.start_ms == 0 {
            self.start_ms = now_ms;
            return false;
        }
        if now_ms.saturating_sub(self.start_ms) < period_ms {
            return false;
        }
        self.start_ms = now_ms;
        true
    }
}

/// Master-side moving load estimate for one shard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadEstimate {
    pub value: f64,
    pub samples: u64,
}

impl LoadEstimate {
    /// Fold one reported window total into the estimate. The first sample
    /// replaces the zero default.
    pub fn observe(&mut self, sample: f64, alpha: f64) {
        let alpha = alpha.clamp(0.0, 1.0);
        self.value = if self.samples == 0 {
            sample
        } else {
            alpha * sample + (1.0 - alpha) * self.value
        };
        self.samples = self.samples.saturating_add(1);
    }

    /// Shift load between shards after a migration so the next plan does not
    /// move the same work twice.
    pub fn shift(&mut self, delta: f64) {
        self.value = (self.value + delta).max(0.0);
    }
}
