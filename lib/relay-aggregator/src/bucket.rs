use std::collections::TryReserveError;

/// A single time window's running accumulator.
///
/// Buckets are owned by an invocation's ring and are reset in place once flushed, so the raw sample allocation, when
/// there is one, is reused by the next window landing in the same ring slot.
#[derive(Debug)]
pub(crate) struct Bucket {
    start: i64,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    entries: Vec<f64>,
}

impl Bucket {
    pub fn new(start: i64) -> Self {
        Self {
            start,
            count: 0,
            sum: 0.0,
            min: 0.0,
            max: 0.0,
            entries: Vec::new(),
        }
    }

    pub const fn start(&self) -> i64 {
        self.start
    }

    pub const fn count(&self) -> u64 {
        self.count
    }

    pub const fn sum(&self) -> f64 {
        self.sum
    }

    pub const fn min(&self) -> f64 {
        self.min
    }

    pub const fn max(&self) -> f64 {
        self.max
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Raw samples recorded in this window, in arrival order until [`sorted_entries`](Self::sorted_entries) is used.
    pub fn entries(&self) -> &[f64] {
        &self.entries
    }

    /// Sorts the raw samples in place and returns them.
    pub fn sorted_entries(&mut self) -> &[f64] {
        self.entries.sort_unstable_by(f64::total_cmp);
        &self.entries
    }

    /// Records a sample.
    ///
    /// When `keep_raw` is set, room for the raw value is reserved before anything else is updated, so an allocation
    /// failure leaves the bucket exactly as it was.
    pub fn record(&mut self, value: f64, keep_raw: bool) -> Result<(), TryReserveError> {
        if keep_raw {
            self.entries.try_reserve(1)?;
            self.entries.push(value);
        }

        if self.count == 0 {
            self.sum = value;
            self.min = value;
            self.max = value;
        } else {
            self.sum += value;
            if value < self.min {
                self.min = value;
            }
            if value > self.max {
                self.max = value;
            }
        }
        self.count += 1;

        Ok(())
    }

    /// Clears the bucket and moves it to a new window start, keeping its raw sample allocation.
    pub fn reset(&mut self, start: i64) {
        self.start = start;
        self.count = 0;
        self.sum = 0.0;
        self.min = 0.0;
        self.max = 0.0;
        self.entries.clear();
    }
}
