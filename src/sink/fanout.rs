// Explicit fan-out to several sinks with attach/detach

use super::{Batch, Sink, SinkError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Handle returned by [`FanOut::attach`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Delivers every batch to each attached sink in attachment order
///
/// A failing sink does not stop delivery to the others; the batch is reported
/// as failed once every sink has been tried.
#[derive(Default)]
pub struct FanOut {
    sinks: RwLock<Vec<(SinkId, Arc<dyn Sink>)>>,
    next_id: AtomicU64,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: Arc<dyn Sink>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, sink));
        id
    }

    /// Returns `false` if `id` was not attached
    pub fn detach(&self, id: SinkId) -> bool {
        let mut sinks = self
            .sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = sinks.len();
        sinks.retain(|(attached, _)| *attached != id);
        sinks.len() != before
    }

    pub fn len(&self) -> usize {
        self.sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Sink for FanOut {
    fn record(&self, batch: &Batch) -> Result<(), SinkError> {
        // Snapshot so a slow sink doesn't hold the lock against attach/detach
        let sinks: Vec<_> = self
            .sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let mut failed = 0;
        for (id, sink) in &sinks {
            if let Err(e) = sink.record(batch) {
                failed += 1;
                tracing::warn!(sink = id.0, sequence = batch.sequence(), error = %e, "fan-out sink failed");
            }
        }
        if failed > 0 {
            return Err(SinkError::FanOut {
                failed,
                attached: sinks.len(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for FanOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOut").field("attached", &self.len()).finish()
    }
}
