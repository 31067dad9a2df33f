use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// A monotonic counter that can also report the change since it was last asked.
///
/// The cumulative value is read with [`get`](Self::get). [`get_sub`](Self::get_sub) returns the amount the counter
/// has grown since the previous `get_sub` call, and moves the baseline forward in the same step, which is what
/// periodic rate reporting wants.
#[derive(Debug, Default)]
pub struct DeltaCounter {
    total: AtomicU64,
    baseline: AtomicU64,
}

impl DeltaCounter {
    /// Increments the counter by `n`.
    pub fn increment(&self, n: u64) {
        self.total.fetch_add(n, Relaxed);
    }

    /// Returns the cumulative value.
    pub fn get(&self) -> u64 {
        self.total.load(Relaxed)
    }

    /// Returns the growth since the previous call, and advances the baseline.
    pub fn get_sub(&self) -> u64 {
        let current = self.total.load(Relaxed);
        let previous = self.baseline.swap(current, Relaxed);
        current.saturating_sub(previous)
    }
}

/// Counters kept by each aggregator.
#[derive(Debug, Default)]
pub struct AggregatorCounters {
    pub(crate) received: DeltaCounter,
    pub(crate) sent: DeltaCounter,
    pub(crate) dropped: DeltaCounter,
}

impl AggregatorCounters {
    /// Samples accepted by at least one compute.
    pub fn received(&self) -> &DeltaCounter {
        &self.received
    }

    /// Aggregate lines handed to the output sink.
    pub fn sent(&self) -> &DeltaCounter {
        &self.sent
    }

    /// Samples or emissions that were dropped.
    pub fn dropped(&self) -> &DeltaCounter {
        &self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_reports_delta_since_last_read() {
        let counter = DeltaCounter::default();
        assert_eq!(counter.get_sub(), 0);

        counter.increment(5);
        assert_eq!(counter.get(), 5);
        assert_eq!(counter.get_sub(), 5);
        assert_eq!(counter.get_sub(), 0);

        counter.increment(2);
        counter.increment(1);
        assert_eq!(counter.get_sub(), 3);
        assert_eq!(counter.get(), 8);
    }

    #[test]
    fn cumulative_read_does_not_move_baseline() {
        let counter = DeltaCounter::default();
        counter.increment(4);
        assert_eq!(counter.get(), 4);
        assert_eq!(counter.get(), 4);
        assert_eq!(counter.get_sub(), 4);
    }
}
