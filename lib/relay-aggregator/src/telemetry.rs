use std::time::Duration;

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

use crate::error::DropReason;

/// Internal telemetry of a single aggregator.
#[derive(Clone)]
pub(crate) struct Telemetry {
    active_invocations: Gauge,
    invocations_expired: Counter,
    samples_dropped: [Counter; DropReason::ALL.len()],
    emissions: Counter,
    flush_duration: Histogram,
}

impl Telemetry {
    pub fn new(aggregator: &str) -> Self {
        let aggregator = aggregator.to_string();

        Self {
            active_invocations: gauge!("aggregator_active_invocations", "aggregator" => aggregator.clone()),
            invocations_expired: counter!("aggregator_invocations_expired_total", "aggregator" => aggregator.clone()),
            samples_dropped: DropReason::ALL.map(|reason| {
                counter!(
                    "aggregator_samples_dropped_total",
                    "aggregator" => aggregator.clone(),
                    "reason" => reason.as_str()
                )
            }),
            emissions: counter!("aggregator_emissions_total", "aggregator" => aggregator.clone()),
            flush_duration: histogram!("aggregator_flush_duration_seconds", "aggregator" => aggregator),
        }
    }

    pub fn set_active_invocations(&self, active: usize) {
        self.active_invocations.set(active as f64);
    }

    pub fn increment_invocations_expired(&self, expired: usize) {
        self.invocations_expired.increment(expired as u64);
    }

    pub fn increment_samples_dropped(&self, reason: DropReason) {
        self.samples_dropped[reason as usize].increment(1);
    }

    pub fn increment_emissions(&self) {
        self.emissions.increment(1);
    }

    pub fn record_flush_duration(&self, duration: Duration) {
        self.flush_duration.record(duration.as_secs_f64());
    }
}
