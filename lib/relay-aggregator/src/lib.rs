//! Statistical aggregation engine.
//!
//! Samples routed to an [`Aggregator`] are grouped into fixed time windows per distinct output name, and once a window
//! has closed, and its grace period for late samples has passed, one line per configured statistic is emitted to an
//! [`OutputSink`]. An [`AggregatorEngine`] owns a set of aggregators, drives their periodic flushing from a dedicated
//! worker thread, and swaps in reloaded sets between flush passes.
#![deny(missing_docs)]

use std::time::SystemTime;

mod aggregator;
pub use self::aggregator::{Aggregator, FlushSummary, TimestampPolicy, DEFAULT_TABLE_CAPACITY_BITS};

mod bucket;

mod compute;
pub use self::compute::ComputeKind;

mod config;
pub use self::config::{AggregatorConfiguration, ComputeConfiguration};

mod counter;
pub use self::counter::{AggregatorCounters, DeltaCounter};

mod engine;
pub use self::engine::{AggregatorEngine, AggregatorSet, DEFAULT_TICK_INTERVAL};

mod error;
pub use self::error::{
    AggregatorError, DropReason, MAX_BUCKET_COUNT, MAX_TABLE_CAPACITY_BITS, MIN_TABLE_CAPACITY_BITS,
};

mod invocation;

mod sink;
pub use self::sink::{format_line, OutputSink, SinkError};

mod telemetry;

mod template;
pub use self::template::NameTemplate;

/// Returns the current Unix timestamp, in seconds.
pub fn unix_timestamp() -> i64 {
    let since_unix_epoch = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    since_unix_epoch.as_secs() as i64
}
