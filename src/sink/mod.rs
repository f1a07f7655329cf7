//! Delivery boundary: consumers of batches of invocation records
//!
//! The pipeline hands each complete [`Batch`] to one [`Sink`], exactly once.
//! Sinks own their retry and backoff policy; a failed delivery is logged and
//! counted by the pipeline and never reaches the intercepted caller.
//!
//! - [`FnSink`]: wraps a closure
//! - [`MemorySink`]: keeps records queued per (context, method) for replay lookups
//! - [`FanOut`]: delivers to several sinks that can be attached and detached
//! - [`JsonLinesSink`]: writes one JSON document per record

mod fanout;
mod json_lines;
mod memory;

pub use fanout::{FanOut, SinkId};
pub use json_lines::JsonLinesSink;
pub use memory::{InvocationSource, MemorySink};

use crate::invocation::InvocationRecord;
use std::sync::Arc;
use thiserror::Error;

/// Delivery failures reported by a sink
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink rejected batch: {0}")]
    Rejected(String),

    #[error("{failed} of {attached} fan-out sinks failed")]
    FanOut { failed: usize, attached: usize },

    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered group of records delivered together
#[derive(Debug, Clone)]
pub struct Batch {
    sequence: u64,
    records: Vec<Arc<InvocationRecord>>,
}

impl Batch {
    pub fn new(sequence: u64, records: Vec<Arc<InvocationRecord>>) -> Self {
        Batch { sequence, records }
    }

    /// Position of this batch in the pipeline's output, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn records(&self) -> &[Arc<InvocationRecord>] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InvocationRecord> {
        self.records.iter().map(Arc::as_ref)
    }
}

/// Consumer of delivered batches
pub trait Sink: Send + Sync {
    fn record(&self, batch: &Batch) -> Result<(), SinkError>;
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn record(&self, batch: &Batch) -> Result<(), SinkError> {
        self.as_ref().record(batch)
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn record(&self, batch: &Batch) -> Result<(), SinkError> {
        self.as_ref().record(batch)
    }
}

/// Sink backed by a closure
///
/// ```
/// use shadowstack::sink::{Batch, FnSink, Sink};
///
/// let sink = FnSink::new(|batch: &Batch| {
///     println!("got {} records", batch.len());
///     Ok(())
/// });
/// sink.record(&Batch::new(0, Vec::new())).unwrap();
/// ```
pub struct FnSink<F> {
    callback: F,
}

impl<F> FnSink<F>
where
    F: Fn(&Batch) -> Result<(), SinkError> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        FnSink { callback }
    }
}

impl<F> Sink for FnSink<F>
where
    F: Fn(&Batch) -> Result<(), SinkError> + Send + Sync,
{
    fn record(&self, batch: &Batch) -> Result<(), SinkError> {
        (self.callback)(batch)
    }
}

impl<F> std::fmt::Debug for FnSink<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnSink")
    }
}
