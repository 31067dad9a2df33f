use std::{
    ops::Range,
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering::Relaxed},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Instant,
};

use rand::Rng as _;
use serde::Deserialize;
use snafu::ensure;
use tracing::{debug, trace, warn};

use crate::{
    compute::{Compute, ComputeKind},
    counter::AggregatorCounters,
    error::{
        AggregatorError, DropReason, ExpireBeforeInterval, InvalidTableCapacity, TooManyBuckets, ZeroInterval,
        MAX_BUCKET_COUNT, MAX_TABLE_CAPACITY_BITS, MIN_TABLE_CAPACITY_BITS,
    },
    invocation::{hash_name, Grid, Invocation},
    sink::{format_line, OutputSink, SinkError},
    telemetry::Telemetry,
    template::NameTemplate,
    unix_timestamp,
};

/// Default invocation table capacity, as a power-of-two exponent.
pub const DEFAULT_TABLE_CAPACITY_BITS: u8 = 12;

static AGGREGATOR_ID: AtomicUsize = AtomicUsize::new(0);

/// Which instant of a window is reported as the timestamp of its aggregate.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum TimestampPolicy {
    /// Start of the window.
    Start,

    /// Midpoint of the window.
    Middle,

    /// End of the window.
    #[default]
    End,
}

/// Result of a single flush pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlushSummary {
    /// Aggregate lines produced, whether or not the sink accepted them.
    pub emitted: usize,

    /// Invocations reclaimed after expiring.
    pub expired: usize,
}

struct AggregationState {
    computes: Vec<Compute>,
    name_buf: String,
}

/// A parsed sample line.
#[derive(Debug, PartialEq)]
struct Sample<'a> {
    name: &'a str,
    value: f64,
    timestamp: i64,
}

impl<'a> Sample<'a> {
    /// Parses `<name> <value> [<timestamp>]`, where the name ends at `first_space`.
    ///
    /// A missing timestamp means the sample was taken at `now`.
    fn parse(line: &'a str, first_space: usize, now: i64) -> Option<Self> {
        let name = line.get(..first_space)?;
        let mut fields = line.get(first_space..)?.split_ascii_whitespace();

        let value = fields.next()?.parse::<f64>().ok().filter(|v| v.is_finite())?;
        let timestamp = match fields.next() {
            None => now,
            Some(raw) => match raw.parse::<i64>() {
                Ok(timestamp) => timestamp,
                Err(_) => raw.parse::<f64>().ok().filter(|t| t.is_finite())?.trunc() as i64,
            },
        };

        Some(Self { name, value, timestamp })
    }
}

/// A statistical aggregator.
///
/// An aggregator groups the samples routed to it into fixed windows of `interval` seconds, per distinct output name,
/// and emits one line per configured statistic once each window is due. Windows stay open for late samples until
/// `expire` seconds after they started.
///
/// All live state sits behind a single lock, taken once per sample and once per flush pass. Lines are formatted while
/// the lock is held and handed to the output sink after it is released.
pub struct Aggregator {
    name: String,
    interval: u32,
    expire: u32,
    grid: Grid,
    timestamp_policy: TimestampPolicy,
    stub: Option<String>,
    table_capacity_bits: u8,
    state: Mutex<AggregationState>,
    next_flush: AtomicI64,
    counters: AggregatorCounters,
    sink: RwLock<Option<Arc<dyn OutputSink>>>,
    telemetry: Telemetry,
}

impl Aggregator {
    /// Creates a new `Aggregator` with no computes.
    ///
    /// # Errors
    ///
    /// If `interval` is zero, `expire` is shorter than `interval`, or `expire` spans more than
    /// [`MAX_BUCKET_COUNT`](crate::MAX_BUCKET_COUNT) windows, an error is returned.
    pub fn new(interval: u32, expire: u32, timestamp_policy: TimestampPolicy) -> Result<Self, AggregatorError> {
        ensure!(interval > 0, ZeroInterval);
        ensure!(expire >= interval, ExpireBeforeInterval { interval, expire });

        let grid = Grid::new(interval, expire);
        ensure!(
            grid.bucket_count() <= MAX_BUCKET_COUNT,
            TooManyBuckets {
                interval,
                expire,
                buckets: grid.bucket_count()
            }
        );

        let name = format!("aggregator-{}", AGGREGATOR_ID.fetch_add(1, Relaxed));
        let telemetry = Telemetry::new(&name);

        Ok(Self {
            name,
            interval,
            expire,
            grid,
            timestamp_policy,
            stub: None,
            table_capacity_bits: DEFAULT_TABLE_CAPACITY_BITS,
            state: Mutex::new(AggregationState {
                computes: Vec::new(),
                name_buf: String::new(),
            }),
            next_flush: AtomicI64::new(i64::MIN),
            counters: AggregatorCounters::default(),
            sink: RwLock::new(None),
            telemetry,
        })
    }

    /// Adds a statistic, written to the output name `template`.
    ///
    /// # Errors
    ///
    /// If the kind specifier is not recognized, or the template is malformed, an error is returned.
    pub fn add_compute(&mut self, template: &str, kind: &str) -> Result<(), AggregatorError> {
        let kind = kind.parse::<ComputeKind>()?;
        let template = NameTemplate::parse(template)?;

        let bits = self.table_capacity_bits;
        self.state_mut().computes.push(Compute::new(kind, template, bits));
        Ok(())
    }

    /// Sets the stub prefix.
    ///
    /// Once set, every newly created invocation immediately emits a zero-valued sample named `<stub><name>`.
    pub fn set_stub(&mut self, stub: impl Into<String>) {
        self.stub = Some(stub.into());
    }

    /// Sets the name used to label this aggregator in logs and telemetry.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.telemetry = Telemetry::new(&self.name);
    }

    /// Sets the capacity of each compute's invocation table to `2^bits` chains.
    ///
    /// Tables of computes that were already added are recreated empty.
    ///
    /// # Errors
    ///
    /// If `bits` is outside of the supported range, an error is returned.
    pub fn set_table_capacity(&mut self, bits: u8) -> Result<(), AggregatorError> {
        ensure!(
            (MIN_TABLE_CAPACITY_BITS..=MAX_TABLE_CAPACITY_BITS).contains(&bits),
            InvalidTableCapacity { bits }
        );

        self.table_capacity_bits = bits;
        for compute in &mut self.state_mut().computes {
            *compute = Compute::new(compute.kind(), compute.template().clone(), bits);
        }
        Ok(())
    }

    /// Returns the name of this aggregator.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the window length, in seconds.
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Returns how long windows accept samples, in seconds from their start.
    pub fn expire(&self) -> u32 {
        self.expire
    }

    /// Returns the timestamp policy.
    pub fn timestamp_policy(&self) -> TimestampPolicy {
        self.timestamp_policy
    }

    /// Returns the stub prefix, if any.
    pub fn stub(&self) -> Option<&str> {
        self.stub.as_deref()
    }

    /// Returns the number of configured computes.
    pub fn num_computes(&self) -> usize {
        self.lock_state().computes.len()
    }

    /// Returns the number of live invocations across all computes.
    pub fn num_invocations(&self) -> usize {
        self.lock_state().computes.iter().map(|c| c.invocations.len()).sum()
    }

    /// Returns the received, sent, and dropped counters.
    pub fn counters(&self) -> &AggregatorCounters {
        &self.counters
    }

    /// Attaches the sink that emitted lines are handed to, replacing any previous one.
    pub fn attach_sink(&self, sink: Arc<dyn OutputSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Adds a sample to this aggregator, received now.
    ///
    /// See [`put_metric_at`](Self::put_metric_at).
    pub fn put_metric(&self, line: &str, first_space: usize, captures: &[Option<Range<usize>>]) {
        self.put_metric_at(unix_timestamp(), line, first_space, captures)
    }

    /// Adds a sample to this aggregator, received at `now`.
    ///
    /// `line` is a plaintext sample, `<name> <value> [<timestamp>]`, whose name ends at byte offset `first_space`.
    /// `captures` are the byte ranges of the capture groups within the name, as matched by the routing expression, and
    /// are used to expand the output name of each compute.
    ///
    /// This never fails: samples that cannot be used are counted as dropped.
    pub fn put_metric_at(&self, now: i64, line: &str, first_space: usize, captures: &[Option<Range<usize>>]) {
        let Some(sample) = Sample::parse(line, first_space, now) else {
            trace!(aggregator = %self.name, line, "Dropping unparseable sample.");
            self.record_drop(DropReason::Unparseable);
            return;
        };

        let mut stubs = Vec::new();
        let mut accepted = false;
        {
            let mut guard = self.lock_state();
            let AggregationState { computes, name_buf } = &mut *guard;

            for compute in computes.iter_mut() {
                if !compute.template().expand(sample.name, captures, name_buf) {
                    trace!(
                        aggregator = %self.name,
                        template = compute.template().as_str(),
                        metric = sample.name,
                        "Skipping compute: template refers to a missing capture group."
                    );
                    continue;
                }

                let name = name_buf.as_str();
                let hash = hash_name(name);
                let keep_raw = compute.kind().needs_raw_samples();

                let lookup = compute.invocations.try_get_or_insert_with(hash, name, || {
                    Invocation::new(name.to_string(), hash, now, self.splay(), &self.grid)
                });
                let (invocation, created) = match lookup {
                    Ok(found) => found,
                    Err(reason) => {
                        self.drop_sample(name, sample.timestamp, reason);
                        continue;
                    }
                };

                match invocation.record(now, sample.timestamp, sample.value, keep_raw, &self.grid) {
                    Ok(()) => {
                        accepted = true;
                        if created {
                            if let Some(stub) = &self.stub {
                                stubs.push(format_line(&format!("{}{}", stub, name), 0.0, now));
                            }
                        }
                    }
                    Err(reason) => {
                        if created {
                            compute.invocations.remove(hash, name);
                        }
                        self.drop_sample(name, sample.timestamp, reason);
                    }
                }
            }
        }

        if accepted {
            self.counters.received.increment(1);
        }
        if !stubs.is_empty() {
            self.emit(stubs);
        }
    }

    /// Returns `true` if a flush at `now` may produce something.
    pub fn is_due(&self, now: i64) -> bool {
        now >= self.next_flush.load(Relaxed)
    }

    /// Flushes every window that is due at `now` and reclaims expired invocations.
    pub fn flush_at(&self, now: i64) -> FlushSummary {
        let started = Instant::now();

        let mut lines = Vec::new();
        let mut expired = 0;
        let mut active = 0;
        {
            let mut state = self.lock_state();
            for compute in &mut state.computes {
                let kind = compute.kind();
                expired += compute.invocations.retain(|invocation| {
                    invocation.flush(now, &self.grid, |name, bucket| {
                        if let Some(value) = kind.compute(bucket) {
                            lines.push(format_line(name, value, self.emitted_timestamp(bucket.start())));
                        }
                    });
                    !invocation.sweep(now)
                });
                active += compute.invocations.len();
            }
        }
        self.next_flush.store(self.grid.next_flush_after(now), Relaxed);

        let summary = FlushSummary {
            emitted: lines.len(),
            expired,
        };
        if !lines.is_empty() {
            self.emit(lines);
        }

        self.telemetry.set_active_invocations(active);
        self.telemetry.increment_invocations_expired(expired);
        self.telemetry.record_flush_duration(started.elapsed());

        if summary.emitted > 0 || summary.expired > 0 {
            debug!(
                aggregator = %self.name,
                emitted = summary.emitted,
                expired = summary.expired,
                active,
                "Flushed aggregator."
            );
        }

        summary
    }

    fn emitted_timestamp(&self, start: i64) -> i64 {
        let interval = i64::from(self.interval);
        match self.timestamp_policy {
            TimestampPolicy::Start => start,
            TimestampPolicy::Middle => start + interval / 2,
            TimestampPolicy::End => start + interval,
        }
    }

    fn splay(&self) -> i64 {
        i64::from(rand::rng().random_range(0..self.interval))
    }

    fn emit(&self, lines: Vec<String>) {
        let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(sink) = sink else {
            for _ in &lines {
                self.record_drop(DropReason::NoSink);
            }
            return;
        };

        for line in lines {
            match sink.try_send(line) {
                Ok(()) => {
                    self.counters.sent.increment(1);
                    self.telemetry.increment_emissions();
                }
                Err(e) => {
                    if e == SinkError::Closed {
                        warn!(aggregator = %self.name, "Output sink is closed. Dropping aggregate.");
                    }
                    self.record_drop(e.drop_reason());
                }
            }
        }
    }

    fn drop_sample(&self, name: &str, timestamp: i64, reason: DropReason) {
        trace!(
            aggregator = %self.name,
            name,
            timestamp,
            reason = reason.as_str(),
            "Dropping sample."
        );
        self.record_drop(reason);
    }

    fn record_drop(&self, reason: DropReason) {
        self.counters.dropped.increment(1);
        self.telemetry.increment_samples_dropped(reason);
    }

    fn lock_state(&self) -> MutexGuard<'_, AggregationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&mut self) -> &mut AggregationState {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}
