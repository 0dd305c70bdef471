//! Transaction aggregation pipeline.
//!
//! Completed traces are rolled up into wall-clock-aligned windows and handed
//! to the [`TransactionPointRepository`] asynchronously:
//!
//! ```text
//! trace threads → add() → FIFO queue → consumer task → Aggregates (window)
//!                  (mutex)                  │
//!                                           v  window closed
//!                                     tokio::spawn(flush) → repository.store()
//! ```
//!
//! The producer mutex is held only to stamp the capture time and enqueue, so
//! the queue is FIFO-ordered by capture time. The consumer relies on that
//! order: once it has seen (or idle-detected) a capture time past the
//! current window, no later enqueue can belong to that window, so the window
//! can be sealed and flushed without ever blocking producers.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::collector::repository::TransactionPointRepository;
use crate::collector::transaction_point::{TransactionPoint, TransactionPointBuilder};
use crate::config::AgentConfig;
use crate::trace::model::Trace;

/// Transaction type key for user-facing traces.
pub const FOREGROUND_TYPE: &str = "";

/// Transaction type key for background traces.
pub const BACKGROUND_TYPE: &str = "bg";

/// Rounds `now_millis` up to the next multiple of `interval_millis`.
fn align_up(now_millis: i64, interval_millis: i64) -> i64 {
    let quotient = now_millis / interval_millis;
    let remainder = now_millis % interval_millis;
    let div_ceil = if remainder != 0 && (remainder > 0) == (interval_millis > 0) {
        quotient + 1
    } else {
        quotient
    };
    div_ceil * interval_millis
}

/// A completed trace waiting to be folded, stamped at enqueue time.
struct PendingAggregation {
    capture_time: i64,
    trace: Trace,
    trace_will_be_stored: bool,
}

/// Rollups for one transaction type within one window.
#[derive(Default)]
struct TypeAggregates {
    overall: TransactionPointBuilder,
    per_transaction: HashMap<String, TransactionPointBuilder>,
}

impl TypeAggregates {
    fn add(&mut self, trace: &Trace, trace_will_be_stored: bool) {
        self.overall.add(trace.duration());
        let transaction_point = self
            .per_transaction
            .entry(trace.transaction_name().to_string())
            .or_default();
        transaction_point.add(trace.duration());
        if trace.error().is_some() {
            self.overall.add_to_error_count();
            transaction_point.add_to_error_count();
        }
        if trace_will_be_stored {
            self.overall.add_to_stored_trace_count();
            transaction_point.add_to_stored_trace_count();
        }
        self.overall.add_to_metrics(trace.root_metric());
        transaction_point.add_to_metrics(trace.root_metric());
        // profiles are merged per transaction only; an overall profile was
        // judged not worth the memory
        if let Some(profile) = trace.fine_profile() {
            transaction_point.add_to_profile(profile);
        }
    }
}

/// Mutable accumulator for one aggregation window.
///
/// Owned exclusively by the consumer task until the window closes, then
/// moved into the flush task; the move is what makes the consumer's writes
/// visible to the flusher.
struct Aggregates {
    capture_time: i64,
    by_type: HashMap<String, TypeAggregates>,
}

impl Aggregates {
    fn starting_at(now_millis: i64, interval_millis: i64) -> Self {
        Self {
            capture_time: align_up(now_millis, interval_millis),
            by_type: HashMap::new(),
        }
    }

    fn add(&mut self, trace: &Trace, trace_will_be_stored: bool) {
        let type_key = if trace.is_background() {
            BACKGROUND_TYPE
        } else {
            FOREGROUND_TYPE
        };
        self.by_type
            .entry(type_key.to_string())
            .or_default()
            .add(trace, trace_will_be_stored);
    }
}

/// State shared between producers and the consumer task.
struct AggregatorShared {
    /// Producer mutex and FIFO queue in one: holding the lock while reading
    /// the clock is what keeps the queue ordered by capture time.
    queue: Mutex<VecDeque<PendingAggregation>>,
    /// Wakes the consumer when something is enqueued.
    queue_ready: Notify,
    clock: Arc<dyn Clock>,
    interval_millis: i64,
    poll_grace: Duration,
}

/// Outcome of one consumer poll.
enum Polled {
    Item(PendingAggregation),
    TimedOut,
    Shutdown,
}

impl AggregatorShared {
    /// Pops the next pending trace, waiting up to `wait` for one to arrive.
    async fn poll(&self, wait: Duration, shutdown: &CancellationToken) -> Polled {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(pending) = self.queue.lock().pop_front() {
                return Polled::Item(pending);
            }
            tokio::select! {
                () = shutdown.cancelled() => return Polled::Shutdown,
                notified = tokio::time::timeout_at(deadline, self.queue_ready.notified()) => {
                    if notified.is_err() {
                        return Polled::TimedOut;
                    }
                    // notified; loop back to pop
                }
            }
        }
    }
}

/// Buckets completed traces into time-aligned windows and flushes sealed
/// windows to the repository.
///
/// One instance lives for the life of the agent. Producers (trace threads
/// completing traces) call [`add`](Self::add); a dedicated consumer task
/// folds traces into the current window and seals it when a later capture
/// time shows up or the window goes idle past its close time. Flushes run as
/// tasks on the runtime the aggregator was constructed on, so distinct
/// windows flush independently.
pub struct TransactionAggregator {
    shared: Arc<AggregatorShared>,
    shutdown: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionAggregator {
    /// Creates the aggregator and spawns its consumer task.
    ///
    /// Must be called from within a tokio runtime; window flushes are
    /// spawned onto the same runtime.
    #[must_use]
    pub fn new(
        config: &AgentConfig,
        repository: Arc<dyn TransactionPointRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shared = Arc::new(AggregatorShared {
            queue: Mutex::new(VecDeque::new()),
            queue_ready: Notify::new(),
            clock,
            interval_millis: config.aggregation_interval_millis(),
            poll_grace: config.queue_poll_grace(),
        });
        // the first window is opened here, not on the consumer task, so a
        // trace enqueued right after construction can never observe a
        // window older than its own capture time
        let initial_window =
            Aggregates::starting_at(shared.clock.now_millis(), shared.interval_millis);
        let shutdown = CancellationToken::new();
        let consumer = tokio::spawn(consumer_loop(
            Arc::clone(&shared),
            initial_window,
            repository,
            shutdown.clone(),
            config.consumer_task_name.clone(),
        ));
        Self {
            shared,
            shutdown,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Enqueues a completed trace for aggregation and returns the capture
    /// time stamped on it.
    ///
    /// Never blocks beyond the enqueue mutex; aggregation happens on the
    /// consumer task.
    pub fn add(&self, trace: Trace, trace_will_be_stored: bool) -> i64 {
        let capture_time = {
            let mut queue = self.shared.queue.lock();
            // the clock is read under the lock so queue order is capture
            // time order
            let capture_time = self.shared.clock.now_millis();
            queue.push_back(PendingAggregation {
                capture_time,
                trace,
                trace_will_be_stored,
            });
            capture_time
        };
        self.shared.queue_ready.notify_one();
        capture_time
    }

    /// Stops the consumer task and waits for it to exit.
    ///
    /// Traces enqueued but not yet folded, and the current unfinished
    /// window, are dropped; the pipeline favors never blocking the host
    /// over completeness at shutdown.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            if let Err(join_error) = consumer.await {
                error!("transaction aggregator consumer ended abnormally: {join_error}");
            }
        }
    }
}

async fn consumer_loop(
    shared: Arc<AggregatorShared>,
    mut current: Aggregates,
    repository: Arc<dyn TransactionPointRepository>,
    shutdown: CancellationToken,
    task_name: String,
) {
    debug!("transaction aggregator consumer '{task_name}' started");
    loop {
        let until_close = (current.capture_time - shared.clock.now_millis()).max(0);
        #[allow(clippy::cast_sign_loss)]
        let wait = Duration::from_millis(until_close as u64) + shared.poll_grace;
        match shared.poll(wait, &shutdown).await {
            Polled::Item(pending) => {
                if pending.capture_time > current.capture_time {
                    // seal before folding so no window ever receives a
                    // trace after a later window has been opened
                    let next =
                        Aggregates::starting_at(pending.capture_time, shared.interval_millis);
                    let sealed = mem::replace(&mut current, next);
                    spawn_flush(sealed, Arc::clone(&repository));
                }
                current.add(&pending.trace, pending.trace_will_be_stored);
            },
            Polled::TimedOut => maybe_close_window(&shared, &mut current, &repository),
            Polled::Shutdown => break,
        }
    }
    debug!("transaction aggregator consumer '{task_name}' stopped");
}

/// Idle path: seals the current window once its close time has passed and
/// nothing is queued.
///
/// Holding the producer mutex across the emptiness check and the clock read
/// is load-bearing: no producer can be mid-`add` with an older capture time
/// while the window is sealed.
fn maybe_close_window(
    shared: &AggregatorShared,
    current: &mut Aggregates,
    repository: &Arc<dyn TransactionPointRepository>,
) {
    let queue = shared.queue.lock();
    if !queue.is_empty() {
        // something crept in since the poll timed out; it will be picked up
        // right away and will force a seal itself if it belongs to a later
        // window
        return;
    }
    let now = shared.clock.now_millis();
    if now > current.capture_time {
        let next = Aggregates::starting_at(now, shared.interval_millis);
        let sealed = mem::replace(current, next);
        spawn_flush(sealed, Arc::clone(repository));
    }
}

fn spawn_flush(sealed: Aggregates, repository: Arc<dyn TransactionPointRepository>) {
    tokio::spawn(async move {
        flush(sealed, repository).await;
    });
}

/// Builds and stores every type bucket of a sealed window.
///
/// Store failures are logged and the remaining buckets still flush; points
/// are never retried.
async fn flush(sealed: Aggregates, repository: Arc<dyn TransactionPointRepository>) {
    let capture_time = sealed.capture_time;
    for (type_key, type_aggregates) in sealed.by_type {
        let overall = type_aggregates.overall.build(capture_time);
        let per_transaction: HashMap<String, TransactionPoint> = type_aggregates
            .per_transaction
            .into_iter()
            .map(|(name, builder)| (name, builder.build(capture_time)))
            .collect();
        if let Err(store_error) = repository.store(&type_key, overall, per_transaction).await {
            error!(
                "failed to store transaction points for window {capture_time} type '{type_key}': {store_error}"
            );
        }
    }
}
