use serde::Deserialize;

use crate::{
    aggregator::{Aggregator, TimestampPolicy, DEFAULT_TABLE_CAPACITY_BITS},
    error::AggregatorError,
};

const fn default_table_capacity_bits() -> u8 {
    DEFAULT_TABLE_CAPACITY_BITS
}

/// A statistic computed by an aggregator.
#[derive(Clone, Debug, Deserialize)]
pub struct ComputeConfiguration {
    /// Statistic specifier, such as `sum` or `percentile95`.
    pub kind: String,

    /// Output name template.
    pub write_to: String,
}

/// Aggregator configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct AggregatorConfiguration {
    /// Name used in logs and telemetry.
    ///
    /// Defaults to a generated name.
    #[serde(default)]
    pub name: Option<String>,

    /// Window length, in seconds.
    pub interval: u32,

    /// How long windows accept samples, in seconds from their start.
    pub expire: u32,

    /// Which instant of a window is reported as the timestamp of its aggregates.
    ///
    /// Defaults to the end of the window.
    #[serde(default)]
    pub timestamp: TimestampPolicy,

    /// Capacity of each compute's invocation table, as a power-of-two exponent.
    ///
    /// Defaults to 12.
    #[serde(default = "default_table_capacity_bits")]
    pub table_capacity_bits: u8,

    /// Prefix of the zero-valued sample emitted when a new series is created.
    #[serde(default)]
    pub stub: Option<String>,

    /// Statistics to compute.
    pub computes: Vec<ComputeConfiguration>,
}

impl AggregatorConfiguration {
    /// Builds the configured aggregator.
    ///
    /// # Errors
    ///
    /// If any setting is invalid, an error is returned.
    pub fn build(&self) -> Result<Aggregator, AggregatorError> {
        let mut aggregator = Aggregator::new(self.interval, self.expire, self.timestamp)?;
        aggregator.set_table_capacity(self.table_capacity_bits)?;
        if let Some(name) = &self.name {
            aggregator.set_name(name.as_str());
        }
        if let Some(stub) = &self.stub {
            aggregator.set_stub(stub.as_str());
        }
        for compute in &self.computes {
            aggregator.add_compute(&compute.write_to, &compute.kind)?;
        }

        Ok(aggregator)
    }
}
