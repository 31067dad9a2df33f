use snafu::Snafu;

/// Smallest supported invocation table capacity, as a power-of-two exponent.
pub const MIN_TABLE_CAPACITY_BITS: u8 = 1;

/// Largest supported invocation table capacity, as a power-of-two exponent.
pub const MAX_TABLE_CAPACITY_BITS: u8 = 24;

/// Largest number of windows an invocation may retain, `ceil(expire / interval) + 2`.
pub const MAX_BUCKET_COUNT: usize = 256;

/// An aggregator error.
///
/// Configuration problems are reported synchronously when an aggregator is being set up. Failures that happen while
/// samples flow through a running aggregator are never reported as errors: they are absorbed and show up in the
/// `dropped` counter instead.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum AggregatorError {
    /// The aggregation interval was zero.
    #[snafu(display("Aggregation interval must be greater than zero."))]
    ZeroInterval,

    /// The expiry was shorter than the aggregation interval.
    #[snafu(display("Expire ({}s) must be greater than or equal to the interval ({}s).", expire, interval))]
    ExpireBeforeInterval {
        /// Configured interval, in seconds.
        interval: u32,

        /// Configured expiry, in seconds.
        expire: u32,
    },

    /// The expiry spanned more windows than an invocation may retain.
    #[snafu(display(
        "Expire ({}s) over interval ({}s) needs {} windows per series, more than the maximum of {}.",
        expire,
        interval,
        buckets,
        MAX_BUCKET_COUNT
    ))]
    TooManyBuckets {
        /// Configured interval, in seconds.
        interval: u32,

        /// Configured expiry, in seconds.
        expire: u32,

        /// Windows the configuration would need.
        buckets: usize,
    },

    /// The statistic specifier was not recognized.
    #[snafu(display("Unknown compute type '{}'.", kind))]
    UnknownComputeKind {
        /// The specifier as given.
        kind: String,
    },

    /// The percentile given in a `percentile<N>` specifier was outside of [0, 100].
    #[snafu(display("Percentile {} in '{}' is out of range (0-100).", percentile, kind))]
    PercentileOutOfRange {
        /// The specifier as given.
        kind: String,

        /// The parsed percentile.
        percentile: u64,
    },

    /// The invocation table capacity exponent was outside of the supported range.
    #[snafu(display(
        "Invocation table capacity of 2^{} is unsupported (expected 2^{}..=2^{}).",
        bits,
        MIN_TABLE_CAPACITY_BITS,
        MAX_TABLE_CAPACITY_BITS
    ))]
    InvalidTableCapacity {
        /// Requested capacity exponent.
        bits: u8,
    },

    /// The output name template could not be parsed.
    #[snafu(display("Invalid metric name template '{}': {}", template, reason))]
    InvalidTemplate {
        /// The template as given.
        template: String,

        /// Why the template was rejected.
        reason: &'static str,
    },

    /// The engine was asked to start while its worker was already running.
    #[snafu(display("Aggregator worker is already running."))]
    AlreadyRunning,

    /// The worker thread could not be spawned.
    #[snafu(display("Failed to spawn aggregator worker thread."))]
    SpawnWorker {
        /// Error source.
        source: std::io::Error,
    },
}

/// Why a sample, or an emission derived from it, was dropped.
///
/// All reasons feed the same `dropped` counter; the distinction only shows up in telemetry and trace logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// The sample line did not carry a usable value or timestamp.
    Unparseable,

    /// The sample belongs to a window that has already been flushed.
    TooOld,

    /// The sample belongs to a window too far in the future.
    TooNew,

    /// Memory for the raw sample could not be reserved.
    OutOfMemory,

    /// The output sink was full.
    SinkFull,

    /// The output sink was closed.
    SinkClosed,

    /// No output sink was attached yet.
    NoSink,
}

impl DropReason {
    /// Returns the label used for this reason in telemetry.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unparseable => "unparseable",
            Self::TooOld => "too_old",
            Self::TooNew => "too_new",
            Self::OutOfMemory => "out_of_memory",
            Self::SinkFull => "sink_full",
            Self::SinkClosed => "sink_closed",
            Self::NoSink => "no_sink",
        }
    }

    pub(crate) const ALL: [DropReason; 7] = [
        Self::Unparseable,
        Self::TooOld,
        Self::TooNew,
        Self::OutOfMemory,
        Self::SinkFull,
        Self::SinkClosed,
        Self::NoSink,
    ];
}
