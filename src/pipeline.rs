//! Bounded, batching delivery pipeline
//!
//! Decouples intercepted calls (hot path) from sink delivery (cold path). The
//! caller only performs a lock-free enqueue; a batcher thread groups records
//! and a fixed pool of worker threads hands each batch to the sink.
//!
//! # Design
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ CALLER THREADS (Hot Path)                                 │
//! │   intercepted call → offer(record) → queue.push()         │
//! └───────────────────────────────────────────────────────────┘
//!                          │
//!                          │ Lock-free ArrayQueue (bounded, lossy)
//!                          ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │ BATCHER THREAD                                            │
//! │   loop {                                                  │
//! │     drain queue into batch;                               │
//! │     batch full (or too old) → channel.send(batch);        │
//! │     park(idle_poll) when idle;                            │
//! │   }                                                       │
//! └───────────────────────────────────────────────────────────┘
//!                          │
//!                          │ crossbeam bounded channel
//!                          ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │ WORKER THREADS (workers)                                  │
//! │   for batch in channel { sink.record(&batch) }            │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Backpressure
//!
//! A full queue never blocks the caller. With [`OverflowPolicy::DropNewest`]
//! the offered record is discarded; with [`OverflowPolicy::DropOldest`] the
//! oldest queued record is evicted to make room. Both are counted in
//! [`PipelineStats::dropped`].
//!
//! # Ordering
//!
//! Records leave the queue in arrival order and a batch preserves that order.
//! Workers take batches off the channel in parallel but enter the sink one at
//! a time, in [`Batch::sequence`] order, so records from one caller thread
//! reach the sink in the order their calls completed.
//!
//! # Shutdown from a sink
//!
//! [`DeliveryPipeline::shutdown`] called on a pipeline thread (from inside a
//! sink) only closes the pipeline. Threads are joined by the next shutdown
//! from outside, or left to finish on their own if none follows.

use crate::invocation::InvocationRecord;
use crate::sink::{Batch, Sink};
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Which record is discarded when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the record being offered
    #[default]
    DropNewest,
    /// Evict the oldest queued record and enqueue the offered one
    DropOldest,
}

/// Pipeline sizing and flush behavior
///
/// # Example
/// ```
/// use shadowstack::pipeline::PipelineConfig;
///
/// let config = PipelineConfig::default().with_batch_size(20);
/// assert_eq!(config.capacity, 8192);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Maximum queued records before overflow (default: 8192)
    pub capacity: usize,

    /// Records per delivered batch (default: 100)
    pub batch_size: usize,

    /// Delivery threads (default: available parallelism)
    pub workers: usize,

    pub overflow: OverflowPolicy,

    /// Deliver a partial batch once its oldest record has waited this long
    ///
    /// `None` (default): a partial batch waits until it fills up or the
    /// pipeline shuts down.
    pub max_batch_latency: Option<Duration>,

    /// Batcher wait when the queue is empty (default: 10ms)
    pub idle_poll: Duration,

    /// Deliver the final partial batch on shutdown (default: true)
    pub flush_on_shutdown: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: 8192,
            batch_size: 100,
            workers: default_workers(),
            overflow: OverflowPolicy::DropNewest,
            max_batch_latency: None,
            idle_poll: Duration::from_millis(10),
            flush_on_shutdown: true,
        }
    }
}

/// One worker per available core, falling back to one
pub fn default_workers() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

impl PipelineConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_max_batch_latency(mut self, latency: Duration) -> Self {
        self.max_batch_latency = Some(latency);
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn with_flush_on_shutdown(mut self, flush: bool) -> Self {
        self.flush_on_shutdown = flush;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "capacity must be > 0".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "batch_size must be > 0".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(PipelineError::InvalidConfig(
                "workers must be > 0".to_string(),
            ));
        }
        if self.idle_poll.is_zero() {
            return Err(PipelineError::InvalidConfig(
                "idle_poll must be longer than zero".to_string(),
            ));
        }
        if self.max_batch_latency.is_some_and(|latency| latency.is_zero()) {
            return Err(PipelineError::InvalidConfig(
                "max_batch_latency must be longer than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of [`DeliveryPipeline::offer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Queued for delivery (with `DropOldest`, possibly by evicting another record)
    Accepted,
    /// Queue full, record discarded
    Dropped,
    /// Pipeline shut down, record discarded
    Closed,
}

#[derive(Debug, Default)]
struct Counters {
    offered: AtomicU64,
    accepted: AtomicU64,
    dropped: AtomicU64,
    rejected_closed: AtomicU64,
    batches_delivered: AtomicU64,
    records_delivered: AtomicU64,
    delivery_failures: AtomicU64,
}

struct Shared {
    queue: ArrayQueue<Arc<InvocationRecord>>,
    closed: AtomicBool,
    counters: Counters,
    turnstile: Turnstile,
    config: PipelineConfig,
}

/// Admits batches into the sink strictly by sequence number
#[derive(Debug, Default)]
struct Turnstile {
    next: Mutex<u64>,
    turn: Condvar,
}

impl Turnstile {
    fn wait_for(&self, sequence: u64) {
        let mut next = self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while *next != sequence {
            next = self
                .turn
                .wait(next)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn advance(&self) {
        let mut next = self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *next += 1;
        self.turn.notify_all();
    }
}

struct Threads {
    batcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Threads {
    fn contains_current(&self) -> bool {
        let current = thread::current().id();
        self.batcher.thread().id() == current
            || self.workers.iter().any(|handle| handle.thread().id() == current)
    }
}

/// Caller-owned delivery pipeline with explicit start/shutdown lifecycle
///
/// # Example
///
/// ```
/// use shadowstack::pipeline::{DeliveryPipeline, PipelineConfig};
/// use shadowstack::sink::MemorySink;
/// use std::sync::Arc;
///
/// let sink = Arc::new(MemorySink::new());
/// let pipeline = DeliveryPipeline::start(PipelineConfig::default(), sink).unwrap();
/// assert_eq!(pipeline.stats().offered, 0);
/// pipeline.shutdown();
/// ```
pub struct DeliveryPipeline {
    shared: Arc<Shared>,
    threads: Mutex<Option<Threads>>,
}

impl DeliveryPipeline {
    /// Validate `config` and spawn the batcher and worker threads
    pub fn start(config: PipelineConfig, sink: Arc<dyn Sink>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(config.capacity),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            turnstile: Turnstile::default(),
            config,
        });

        let (sender, receiver) = channel::bounded::<Batch>(shared.config.workers * 2);

        let mut workers = Vec::with_capacity(shared.config.workers);
        for index in 0..shared.config.workers {
            let shared = shared.clone();
            let receiver = receiver.clone();
            let sink = sink.clone();
            let spawned = thread::Builder::new()
                .name(format!("shadowstack-worker-{}", index))
                .spawn(move || Self::worker(&shared, &receiver, sink.as_ref()));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Workers already running exit once the sender is dropped
                    drop(sender);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }
        drop(receiver);

        let batcher_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name("shadowstack-batcher".to_string())
            .spawn(move || Self::batcher(&batcher_shared, &sender));
        let batcher = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                for handle in workers {
                    let _ = handle.join();
                }
                return Err(e.into());
            }
        };

        tracing::debug!(
            capacity = shared.config.capacity,
            batch_size = shared.config.batch_size,
            workers = shared.config.workers,
            overflow = ?shared.config.overflow,
            "delivery pipeline started"
        );

        Ok(Self {
            shared,
            threads: Mutex::new(Some(Threads { batcher, workers })),
        })
    }

    /// Enqueue a record without blocking (hot path)
    pub fn offer(&self, record: Arc<InvocationRecord>) -> Offer {
        let counters = &self.shared.counters;
        counters.offered.fetch_add(1, Ordering::Relaxed);

        if self.shared.closed.load(Ordering::SeqCst) {
            counters.rejected_closed.fetch_add(1, Ordering::Relaxed);
            return Offer::Closed;
        }

        match self.shared.config.overflow {
            OverflowPolicy::DropNewest => match self.shared.queue.push(record) {
                Ok(()) => {
                    counters.accepted.fetch_add(1, Ordering::Relaxed);
                    Offer::Accepted
                }
                Err(dropped) => {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(method = %dropped.method(), "queue full, record dropped");
                    Offer::Dropped
                }
            },
            OverflowPolicy::DropOldest => {
                counters.accepted.fetch_add(1, Ordering::Relaxed);
                if let Some(evicted) = self.shared.queue.force_push(record) {
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(method = %evicted.method(), "queue full, oldest record evicted");
                }
                Offer::Accepted
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Stop admitting records, drain the queue and join all threads
    ///
    /// Idempotent. Records offered concurrently with shutdown may be lost.
    /// On a pipeline thread this only closes the pipeline; see the module
    /// docs.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);

        let threads = {
            let mut slot = self
                .threads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(threads) = slot.as_ref() else {
                return;
            };
            threads.batcher.thread().unpark();
            if threads.contains_current() {
                // The batcher may be blocked sending to this very worker
                tracing::debug!("shutdown requested from a pipeline thread, not joining");
                return;
            }
            slot.take()
        };
        let Some(Threads { batcher, workers }) = threads else {
            return;
        };

        let _ = batcher.join();
        for handle in workers {
            let _ = handle.join();
        }

        let stats = self.stats();
        tracing::debug!(
            accepted = stats.accepted,
            dropped = stats.dropped,
            batches = stats.batches_delivered,
            records = stats.records_delivered,
            "delivery pipeline shut down"
        );
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.shared.counters;
        PipelineStats {
            offered: counters.offered.load(Ordering::Relaxed),
            accepted: counters.accepted.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            rejected_closed: counters.rejected_closed.load(Ordering::Relaxed),
            batches_delivered: counters.batches_delivered.load(Ordering::Relaxed),
            records_delivered: counters.records_delivered.load(Ordering::Relaxed),
            delivery_failures: counters.delivery_failures.load(Ordering::Relaxed),
            current_size: self.shared.queue.len(),
            capacity: self.shared.queue.capacity(),
        }
    }

    fn batcher(shared: &Shared, sender: &Sender<Batch>) {
        let config = &shared.config;
        let mut pending: Vec<Arc<InvocationRecord>> = Vec::with_capacity(config.batch_size);
        let mut oldest: Option<Instant> = None;
        let mut sequence = 0u64;

        let mut emit = |pending: &mut Vec<Arc<InvocationRecord>>, oldest: &mut Option<Instant>| {
            let records = std::mem::replace(pending, Vec::with_capacity(config.batch_size));
            *oldest = None;
            let batch = Batch::new(sequence, records);
            sequence += 1;
            if let Err(unsent) = sender.send(batch) {
                tracing::warn!(
                    sequence = unsent.0.sequence(),
                    size = unsent.0.len(),
                    "no delivery workers left, batch lost"
                );
            }
        };

        loop {
            // Read before draining so everything queued before close is seen
            let closing = shared.closed.load(Ordering::SeqCst);

            let mut drained = false;
            while let Some(record) = shared.queue.pop() {
                drained = true;
                if pending.is_empty() {
                    oldest = Some(Instant::now());
                }
                pending.push(record);
                if pending.len() >= config.batch_size {
                    emit(&mut pending, &mut oldest);
                }
            }

            if closing {
                if !pending.is_empty() {
                    if config.flush_on_shutdown {
                        emit(&mut pending, &mut oldest);
                    } else {
                        tracing::debug!(size = pending.len(), "discarding partial batch on shutdown");
                    }
                }
                break;
            }

            if let (Some(latency), Some(since)) = (config.max_batch_latency, oldest) {
                if since.elapsed() >= latency {
                    emit(&mut pending, &mut oldest);
                }
            }

            if !drained {
                // Woken early by shutdown
                thread::park_timeout(config.idle_poll);
            }
        }
    }

    fn worker(shared: &Shared, receiver: &Receiver<Batch>, sink: &dyn Sink) {
        for batch in receiver.iter() {
            shared.turnstile.wait_for(batch.sequence());
            Self::deliver(shared, sink, &batch);
            shared.turnstile.advance();
        }
    }

    fn deliver(shared: &Shared, sink: &dyn Sink, batch: &Batch) {
        let counters = &shared.counters;
        match panic::catch_unwind(AssertUnwindSafe(|| sink.record(batch))) {
            Ok(Ok(())) => {
                counters.batches_delivered.fetch_add(1, Ordering::Relaxed);
                counters
                    .records_delivered
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    sequence = batch.sequence(),
                    size = batch.len(),
                    error = %e,
                    "sink failed to record batch"
                );
            }
            Err(payload) => {
                counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                let fault = crate::invocation::CapturedFault::panic(payload.as_ref());
                tracing::warn!(
                    sequence = batch.sequence(),
                    size = batch.len(),
                    panic = %fault.message,
                    "sink panicked while recording batch"
                );
            }
        }
    }
}

impl Drop for DeliveryPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("config", &self.shared.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pipeline statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    pub offered: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub rejected_closed: u64,
    pub batches_delivered: u64,
    pub records_delivered: u64,
    pub delivery_failures: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl PipelineStats {
    /// Dropped records over offered records (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        if self.offered == 0 {
            0.0
        } else {
            self.dropped as f64 / self.offered as f64
        }
    }

    /// Queue utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.current_size as f64 / self.capacity as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InvocationContext;
    use crate::invocation::MethodId;
    use crate::sink::{FnSink, SinkError};
    use crate::value::Value;

    const METHOD: MethodId = MethodId::new("Svc", "call", "(i64) -> i64");

    fn record(n: i64) -> Arc<InvocationRecord> {
        Arc::new(InvocationRecord::new(
            METHOD,
            InvocationContext::with_id(format!("ctx-{}", n)),
            vec![Value::I64(n)],
            Value::I64(n),
            vec![Value::I64(n)],
            Value::I64(n),
            None,
            Duration::ZERO,
        ))
    }

    fn collecting() -> (Arc<Mutex<Vec<Batch>>>, Arc<dyn Sink>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let collected = batches.clone();
        let sink = FnSink::new(move |batch: &Batch| {
            collected.lock().unwrap().push(batch.clone());
            Ok(())
        });
        (batches, Arc::new(sink))
    }

    fn ints(batch: &Batch) -> Vec<i64> {
        batch
            .iter()
            .map(|r| r.reference_result().as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.capacity, 8192);
        assert_eq!(config.batch_size, 100);
        assert!(config.workers >= 1);
        assert_eq!(config.overflow, OverflowPolicy::DropNewest);
        assert_eq!(config.max_batch_latency, None);
        assert_eq!(config.idle_poll, Duration::from_millis(10));
        assert!(config.flush_on_shutdown);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        for config in [
            PipelineConfig::default().with_capacity(0),
            PipelineConfig::default().with_batch_size(0),
            PipelineConfig::default().with_workers(0),
            PipelineConfig::default().with_idle_poll(Duration::ZERO),
            PipelineConfig::default().with_max_batch_latency(Duration::ZERO),
        ] {
            assert!(matches!(
                config.validate(),
                Err(PipelineError::InvalidConfig(_))
            ));
        }
        let (_, sink) = collecting();
        assert!(DeliveryPipeline::start(PipelineConfig::default().with_batch_size(0), sink).is_err());
    }

    #[test]
    fn test_exact_batches_in_order() {
        let (batches, sink) = collecting();
        let pipeline = DeliveryPipeline::start(
            PipelineConfig::default().with_batch_size(5).with_workers(1),
            sink,
        )
        .unwrap();
        for n in 0..15 {
            assert_eq!(pipeline.offer(record(n)), Offer::Accepted);
        }
        pipeline.shutdown();

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 3);
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.sequence(), i as u64);
            let start = i as i64 * 5;
            assert_eq!(ints(batch), (start..start + 5).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_partial_batch_waits_without_latency_flush() {
        let (batches, sink) = collecting();
        let pipeline = DeliveryPipeline::start(
            PipelineConfig::default().with_batch_size(10).with_workers(1),
            sink,
        )
        .unwrap();
        for n in 0..3 {
            pipeline.offer(record(n));
        }
        thread::sleep(Duration::from_millis(100));
        assert!(batches.lock().unwrap().is_empty());

        pipeline.shutdown();
        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(ints(&batches[0]), vec![0, 1, 2]);
    }

    #[test]
    fn test_shutdown_without_flush_discards_partial_batch() {
        let (batches, sink) = collecting();
        let pipeline = DeliveryPipeline::start(
            PipelineConfig::default()
                .with_batch_size(10)
                .with_workers(1)
                .with_flush_on_shutdown(false),
            sink,
        )
        .unwrap();
        for n in 0..3 {
            pipeline.offer(record(n));
        }
        pipeline.shutdown();
        assert!(batches.lock().unwrap().is_empty());
        assert_eq!(pipeline.stats().records_delivered, 0);
    }

    #[test]
    fn test_max_latency_flushes_partial_batch() {
        let (batches, sink) = collecting();
        let pipeline = DeliveryPipeline::start(
            PipelineConfig::default()
                .with_batch_size(100)
                .with_workers(1)
                .with_max_batch_latency(Duration::from_millis(20)),
            sink,
        )
        .unwrap();
        pipeline.offer(record(1));
        pipeline.offer(record(2));

        let delivered = || -> Vec<i64> { batches.lock().unwrap().iter().flat_map(ints).collect() };
        let deadline = Instant::now() + Duration::from_secs(5);
        while delivered().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!pipeline.is_closed());
        assert_eq!(delivered(), vec![1, 2]);
        pipeline.shutdown();
    }

    #[test]
    fn test_drop_newest_when_full() {
        // Sink blocks until released so the pipeline backs up
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        let waiting = gate.clone();
        let sink: Arc<dyn Sink> = Arc::new(FnSink::new(move |_: &Batch| {
            let _open = waiting.lock().unwrap();
            Ok(())
        }));
        let pipeline = DeliveryPipeline::start(
            PipelineConfig::default()
                .with_capacity(4)
                .with_batch_size(1)
                .with_workers(1),
            sink,
        )
        .unwrap();

        let outcomes: Vec<Offer> = (0..200).map(|n| pipeline.offer(record(n))).collect();
        assert!(outcomes.contains(&Offer::Dropped));

        let stats = pipeline.stats();
        assert_eq!(stats.offered, 200);
        assert_eq!(stats.accepted + stats.dropped, 200);
        assert!(stats.drop_rate() > 0.0);

        drop(held);
        pipeline.shutdown();
        assert_eq!(pipeline.stats().records_delivered, pipeline.stats().accepted);
    }

    #[test]
    fn test_drop_oldest_keeps_newest() {
        let (batches, sink) = collecting();
        let pipeline = DeliveryPipeline::start(
            PipelineConfig::default()
                .with_capacity(3)
                .with_batch_size(3)
                .with_workers(1)
                .with_overflow(OverflowPolicy::DropOldest)
                .with_idle_poll(Duration::from_secs(60)),
            sink,
        )
        .unwrap();
        // Long idle poll: the batcher finds the queue empty once, then parks
        thread::sleep(Duration::from_millis(50));
        for n in 0..10 {
            assert_eq!(pipeline.offer(record(n)), Offer::Accepted);
        }
        assert_eq!(pipeline.stats().dropped, 7);
        assert_eq!(pipeline.stats().current_size, 3);
        assert_eq!(pipeline.stats().utilization(), 1.0);
        drop(pipeline);
        let delivered: Vec<i64> = batches.lock().unwrap().iter().flat_map(ints).collect();
        assert_eq!(delivered, vec![7, 8, 9]);
    }

    #[test]
    fn test_offer_after_shutdown_is_closed() {
        let (_, sink) = collecting();
        let pipeline = DeliveryPipeline::start(PipelineConfig::default(), sink).unwrap();
        pipeline.shutdown();
        pipeline.shutdown();
        assert!(pipeline.is_closed());
        assert_eq!(pipeline.offer(record(1)), Offer::Closed);
        assert_eq!(pipeline.stats().rejected_closed, 1);
    }

    #[test]
    fn test_sink_failure_and_panic_are_isolated() {
        let sink: Arc<dyn Sink> = Arc::new(FnSink::new(|batch: &Batch| match batch.sequence() {
            0 => Err(SinkError::Rejected("unavailable".to_string())),
            1 => panic!("sink exploded"),
            _ => Ok(()),
        }));
        let pipeline = DeliveryPipeline::start(
            PipelineConfig::default().with_batch_size(1).with_workers(1),
            sink,
        )
        .unwrap();
        for n in 0..4 {
            pipeline.offer(record(n));
        }
        pipeline.shutdown();

        let stats = pipeline.stats();
        assert_eq!(stats.delivery_failures, 2);
        assert_eq!(stats.batches_delivered, 2);
        assert_eq!(stats.records_delivered, 2);
    }

    #[test]
    fn test_batches_reach_sink_in_sequence_order_with_many_workers() {
        let arrived = Arc::new(Mutex::new(Vec::new()));
        let sink_arrived = arrived.clone();
        // Even batches are slow, so unordered workers would overtake them
        let sink: Arc<dyn Sink> = Arc::new(FnSink::new(move |batch: &Batch| {
            if batch.sequence() % 2 == 0 {
                thread::sleep(Duration::from_millis(20));
            }
            sink_arrived.lock().unwrap().push(batch.sequence());
            Ok(())
        }));
        let pipeline = DeliveryPipeline::start(
            PipelineConfig::default().with_batch_size(1).with_workers(4),
            sink,
        )
        .unwrap();
        for n in 0..20 {
            assert_eq!(pipeline.offer(record(n)), Offer::Accepted);
        }
        pipeline.shutdown();

        assert_eq!(*arrived.lock().unwrap(), (0..20).collect::<Vec<u64>>());
    }

    #[test]
    fn test_shutdown_from_inside_sink_does_not_deadlock() {
        let slot: Arc<Mutex<Option<Arc<DeliveryPipeline>>>> = Arc::new(Mutex::new(None));
        let (done_tx, done_rx) = channel::unbounded::<()>();
        let sink_slot = slot.clone();
        let sink: Arc<dyn Sink> = Arc::new(FnSink::new(move |batch: &Batch| {
            if batch.sequence() == 0 {
                // Let the batcher fill the channel before shutting down
                thread::sleep(Duration::from_millis(50));
                let pipeline = sink_slot.lock().unwrap().take();
                if let Some(pipeline) = pipeline {
                    pipeline.shutdown();
                    let _ = done_tx.send(());
                }
            }
            Ok(())
        }));
        let pipeline = Arc::new(
            DeliveryPipeline::start(
                PipelineConfig::default().with_batch_size(1).with_workers(2),
                sink,
            )
            .unwrap(),
        );
        *slot.lock().unwrap() = Some(pipeline.clone());
        for n in 0..50 {
            pipeline.offer(record(n));
        }

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(pipeline.is_closed());
        assert_eq!(pipeline.offer(record(99)), Offer::Closed);

        pipeline.shutdown();
        let stats = pipeline.stats();
        assert_eq!(stats.records_delivered, stats.accepted);
    }

    #[test]
    fn test_drop_rate_calculation() {
        let stats = PipelineStats {
            offered: 100,
            dropped: 5,
            current_size: 50,
            capacity: 1024,
            ..PipelineStats::default()
        };
        assert_eq!(stats.drop_rate(), 0.05);
        assert_eq!(stats.utilization(), 50.0 / 1024.0);
        assert_eq!(PipelineStats::default().drop_rate(), 0.0);
    }
}
