//! Aggregator sets and the worker that flushes them.

use std::{
    sync::{mpsc, Arc, Mutex, PoisonError, RwLock},
    thread::{self, JoinHandle},
    time::Duration,
};

use arc_swap::ArcSwap;
use snafu::{ensure, ResultExt as _};
use tokio::{
    select,
    sync::oneshot,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::{
    aggregator::Aggregator,
    error::{AggregatorError, AlreadyRunning, SpawnWorker},
    sink::OutputSink,
    unix_timestamp,
};

/// Default interval between worker wakeups.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// An immutable set of aggregators.
///
/// A set is what the routing layer dispatches samples to, and what a configuration reload replaces as a whole.
#[derive(Default)]
pub struct AggregatorSet {
    aggregators: Vec<Arc<Aggregator>>,
}

impl AggregatorSet {
    /// Creates a new `AggregatorSet` from the given aggregators.
    pub fn new(aggregators: Vec<Aggregator>) -> Self {
        Self {
            aggregators: aggregators.into_iter().map(Arc::new).collect(),
        }
    }

    /// Returns the aggregators in this set.
    pub fn aggregators(&self) -> &[Arc<Aggregator>] {
        &self.aggregators
    }

    /// Returns the aggregator at `idx`, if any.
    pub fn get(&self, idx: usize) -> Option<&Arc<Aggregator>> {
        self.aggregators.get(idx)
    }

    /// Returns the number of aggregators.
    pub fn len(&self) -> usize {
        self.aggregators.len()
    }

    /// Returns `true` if the set holds no aggregators.
    pub fn is_empty(&self) -> bool {
        self.aggregators.is_empty()
    }

    /// Returns the number of computes across all aggregators.
    pub fn num_computes(&self) -> usize {
        self.aggregators.iter().map(|a| a.num_computes()).sum()
    }

    /// Total samples received.
    pub fn received(&self) -> u64 {
        self.aggregators.iter().map(|a| a.counters().received().get()).sum()
    }

    /// Samples received since the previous call.
    pub fn received_sub(&self) -> u64 {
        self.aggregators.iter().map(|a| a.counters().received().get_sub()).sum()
    }

    /// Total aggregate lines sent.
    pub fn sent(&self) -> u64 {
        self.aggregators.iter().map(|a| a.counters().sent().get()).sum()
    }

    /// Aggregate lines sent since the previous call.
    pub fn sent_sub(&self) -> u64 {
        self.aggregators.iter().map(|a| a.counters().sent().get_sub()).sum()
    }

    /// Total samples and aggregate lines dropped.
    pub fn dropped(&self) -> u64 {
        self.aggregators.iter().map(|a| a.counters().dropped().get()).sum()
    }

    /// Samples and aggregate lines dropped since the previous call.
    pub fn dropped_sub(&self) -> u64 {
        self.aggregators.iter().map(|a| a.counters().dropped().get_sub()).sum()
    }

    fn attach_sink(&self, sink: &Arc<dyn OutputSink>) {
        for aggregator in &self.aggregators {
            aggregator.attach_sink(Arc::clone(sink));
        }
    }

    fn flush_due(&self, now: i64) {
        for aggregator in &self.aggregators {
            if aggregator.is_due(now) {
                aggregator.flush_at(now);
            }
        }
    }
}

struct EngineState {
    current: ArcSwap<AggregatorSet>,
    pending: Mutex<Option<Arc<AggregatorSet>>>,
    sink: RwLock<Option<Arc<dyn OutputSink>>>,
}

impl EngineState {
    fn apply_pending(&self) {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(set) = pending {
            let previous = self.current.swap(set);
            debug!(
                previous_aggregators = previous.len(),
                aggregators = self.current.load().len(),
                "Applied aggregator reload."
            );
        }
    }
}

struct WorkerHandle {
    shutdown_tx: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

/// Drives a set of aggregators.
///
/// The engine owns the active [`AggregatorSet`] and a background worker that periodically flushes every aggregator
/// whose windows are due. The worker runs on a dedicated OS thread with its own single-threaded Tokio runtime, so
/// flushing never competes with the caller's executor.
///
/// Replacement sets are staged with [`schedule_reload`](Self::schedule_reload) and swapped in by the worker between
/// flush passes. Swapping replaces the set as a whole: no state carries over from the old aggregators.
pub struct AggregatorEngine {
    state: Arc<EngineState>,
    tick_interval: Duration,
    worker: Mutex<Option<WorkerHandle>>,
}

impl AggregatorEngine {
    /// Creates a new `AggregatorEngine` for the given set.
    pub fn new(set: AggregatorSet) -> Self {
        Self {
            state: Arc::new(EngineState {
                current: ArcSwap::from_pointee(set),
                pending: Mutex::new(None),
                sink: RwLock::new(None),
            }),
            tick_interval: DEFAULT_TICK_INTERVAL,
            worker: Mutex::new(None),
        }
    }

    /// Sets the interval between worker wakeups.
    ///
    /// Takes effect the next time the engine is started.
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    /// Starts the worker, with every emitted line going to `sink`.
    ///
    /// A reload scheduled before the engine was started is applied first.
    ///
    /// # Errors
    ///
    /// If the engine is already running, or the worker cannot be spawned, an error is returned.
    pub fn start(&self, sink: Arc<dyn OutputSink>) -> Result<(), AggregatorError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        ensure!(worker.is_none(), AlreadyRunning);

        *self.state.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&sink));
        if let Some(pending) = self.state.pending.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            pending.attach_sink(&sink);
        }
        self.state.apply_pending();
        self.state.current.load().attach_sink(&sink);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (init_tx, init_rx) = mpsc::sync_channel(1);
        let state = Arc::clone(&self.state);
        let tick_interval = self.tick_interval;

        let thread = thread::Builder::new()
            .name("aggregator-worker".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };

                if init_tx.send(Ok(())).is_err() {
                    return;
                }

                runtime.block_on(run_worker(state, tick_interval, shutdown_rx));
            })
            .context(SpawnWorker)?;

        // A closed channel means the thread died before reporting, which only a panic can cause.
        let init_result = init_rx.recv().unwrap_or_else(|_| {
            Err(std::io::Error::other("aggregator worker exited during initialization"))
        });
        if let Err(e) = init_result {
            let _ = thread.join();
            return Err(e).context(SpawnWorker);
        }

        info!(
            aggregators = self.num_aggregators(),
            computes = self.num_computes(),
            tick_interval_ms = tick_interval.as_millis() as u64,
            "Aggregator worker started."
        );

        *worker = Some(WorkerHandle { shutdown_tx, thread });
        Ok(())
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// Once this returns, the worker emits nothing further. Does nothing if the engine is not running.
    pub fn stop(&self) {
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(WorkerHandle { shutdown_tx, thread }) = handle else {
            return;
        };

        let _ = shutdown_tx.send(());
        if thread.join().is_err() {
            error!("Aggregator worker panicked.");
        }
        info!("Aggregator worker stopped.");
    }

    /// Returns `true` if the worker is running.
    pub fn is_running(&self) -> bool {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Stages `set` to replace the active set at the start of the next worker cycle.
    ///
    /// Stubs emitted by the new set before the swap reach the sink already attached to the engine. Scheduling again
    /// before the swap happens replaces the staged set.
    pub fn schedule_reload(&self, set: AggregatorSet) {
        if let Some(sink) = self.state.sink.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            set.attach_sink(sink);
        }

        debug!(aggregators = set.len(), "Scheduled aggregator reload.");
        *self.state.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(set));
    }

    /// Returns `true` if no reload is waiting to be applied.
    pub fn reload_complete(&self) -> bool {
        self.state
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Returns the active set.
    pub fn current(&self) -> Arc<AggregatorSet> {
        self.state.current.load_full()
    }

    /// Returns the number of aggregators in the active set.
    pub fn num_aggregators(&self) -> usize {
        self.state.current.load().len()
    }

    /// Returns the number of computes in the active set.
    pub fn num_computes(&self) -> usize {
        self.state.current.load().num_computes()
    }

    /// Total samples received by the active set.
    pub fn received(&self) -> u64 {
        self.state.current.load().received()
    }

    /// Samples received by the active set since the previous call.
    pub fn received_sub(&self) -> u64 {
        self.state.current.load().received_sub()
    }

    /// Total aggregate lines sent by the active set.
    pub fn sent(&self) -> u64 {
        self.state.current.load().sent()
    }

    /// Aggregate lines sent by the active set since the previous call.
    pub fn sent_sub(&self) -> u64 {
        self.state.current.load().sent_sub()
    }

    /// Total samples and lines dropped by the active set.
    pub fn dropped(&self) -> u64 {
        self.state.current.load().dropped()
    }

    /// Samples and lines dropped by the active set since the previous call.
    pub fn dropped_sub(&self) -> u64 {
        self.state.current.load().dropped_sub()
    }
}

impl Drop for AggregatorEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_worker(state: Arc<EngineState>, tick_interval: Duration, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut ticker = interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                state.apply_pending();
                state.current.load().flush_due(unix_timestamp());
            }
        }
    }

    debug!("Aggregator worker exiting.");
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crossbeam_queue::ArrayQueue;

    use super::*;
    use crate::aggregator::TimestampPolicy;

    fn summing(template: &str) -> Aggregator {
        let mut aggregator = Aggregator::new(1, 1, TimestampPolicy::Start).unwrap();
        aggregator.add_compute(template, "sum").unwrap();
        aggregator
    }

    fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn set_accessors() {
        let mut multi = Aggregator::new(60, 60, TimestampPolicy::End).unwrap();
        multi.add_compute("a", "sum").unwrap();
        multi.add_compute("b", "count").unwrap();
        let set = AggregatorSet::new(vec![multi, summing("c")]);

        assert_eq!(set.len(), 2);
        assert!(!set.is_empty());
        assert_eq!(set.num_computes(), 3);
        assert!(set.get(2).is_none());

        let now = 1_700_000_000;
        set.get(0).unwrap().put_metric_at(now, &format!("x 1 {}", now), 1, &[]);
        set.get(1).unwrap().put_metric_at(now, &format!("x 1 {}", now), 1, &[]);
        set.get(1).unwrap().put_metric_at(now, "x bogus", 1, &[]);
        assert_eq!(set.received(), 2);
        assert_eq!(set.received_sub(), 2);
        assert_eq!(set.received_sub(), 0);
        assert_eq!(set.dropped(), 1);
        assert_eq!(set.dropped_sub(), 1);
        assert_eq!(set.sent_sub(), 0);
    }

    #[test]
    fn reload_before_start_applies_at_start() {
        let engine = AggregatorEngine::new(AggregatorSet::default()).with_tick_interval(Duration::from_millis(10));
        assert_eq!(engine.num_aggregators(), 0);

        engine.schedule_reload(AggregatorSet::new(vec![summing("x")]));
        assert!(!engine.reload_complete());
        assert_eq!(engine.num_aggregators(), 0);

        let queue = Arc::new(ArrayQueue::<String>::new(16));
        engine.start(queue).unwrap();
        assert!(engine.reload_complete());
        assert_eq!(engine.num_aggregators(), 1);
        assert_eq!(engine.num_computes(), 1);

        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn start_twice_fails() {
        let engine = AggregatorEngine::new(AggregatorSet::default()).with_tick_interval(Duration::from_millis(10));
        let queue = Arc::new(ArrayQueue::<String>::new(16));

        engine.start(queue.clone()).unwrap();
        assert!(matches!(engine.start(queue), Err(AggregatorError::AlreadyRunning)));

        engine.stop();
        engine.stop();
    }

    #[test]
    fn worker_flushes_and_applies_reloads() {
        let engine = AggregatorEngine::new(AggregatorSet::new(vec![summing("old")]))
            .with_tick_interval(Duration::from_millis(10));
        let queue = Arc::new(ArrayQueue::<String>::new(64));
        engine.start(queue.clone()).unwrap();

        let now = unix_timestamp();
        engine.current().get(0).unwrap().put_metric_at(now, &format!("m 2 {}", now), 1, &[]);
        assert!(wait_for(|| !queue.is_empty()));
        assert_eq!(queue.pop(), Some(format!("old 2 {}\n", now)));

        engine.schedule_reload(AggregatorSet::new(vec![summing("new")]));
        assert!(wait_for(|| engine.reload_complete()));

        let now = unix_timestamp();
        engine.current().get(0).unwrap().put_metric_at(now, &format!("m 3 {}", now), 1, &[]);
        assert!(wait_for(|| !queue.is_empty()));
        assert_eq!(queue.pop(), Some(format!("new 3 {}\n", now)));

        engine.stop();
        assert_eq!(engine.sent(), 1);
        assert_eq!(engine.received(), 1);
        assert_eq!(engine.dropped(), 0);
    }

    #[test]
    fn reload_attaches_sink_for_stubs() {
        let engine = AggregatorEngine::new(AggregatorSet::default()).with_tick_interval(Duration::from_millis(10));
        let queue = Arc::new(ArrayQueue::<String>::new(16));
        engine.start(queue.clone()).unwrap();

        let mut stubbed = summing("x");
        stubbed.set_stub("stub.");
        let set = AggregatorSet::new(vec![stubbed]);
        let aggregator = Arc::clone(set.get(0).unwrap());
        engine.schedule_reload(set);

        let now = unix_timestamp();
        aggregator.put_metric_at(now, &format!("m 1 {}", now), 1, &[]);
        assert_eq!(queue.pop(), Some(format!("stub.x 0 {}\n", now)));

        engine.stop();
    }
}
