// In-memory sink and retrieval source
//
// Records are queued per (context id, method hash). `retrieve` pops the next
// record for the key, so repeated calls with identical arguments inside one
// context replay in the order they were recorded.

use super::{Batch, Sink, SinkError};
use crate::invocation::{InvocationKey, InvocationRecord};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

type BatchCallback = dyn Fn(&Batch) + Send + Sync;

/// Keyed lookup of recorded invocations
pub trait InvocationSource: Send + Sync {
    /// Next not-yet-consumed record for `key`, FIFO per key
    fn retrieve(&self, key: &InvocationKey) -> Option<Arc<InvocationRecord>>;
}

#[derive(Default)]
pub struct MemorySink {
    queues: Mutex<HashMap<InvocationKey, VecDeque<Arc<InvocationRecord>>>>,
    callback: Option<Box<BatchCallback>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also invoke `callback` after every stored batch
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: Fn(&Batch) + Send + Sync + 'static,
    {
        MemorySink {
            queues: Mutex::new(HashMap::new()),
            callback: Some(Box::new(callback)),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<InvocationKey, VecDeque<Arc<InvocationRecord>>>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records still queued for `key`
    pub fn pending(&self, key: &InvocationKey) -> usize {
        self.queues().get(key).map_or(0, VecDeque::len)
    }

    /// Records still queued across all keys
    pub fn len(&self) -> usize {
        self.queues().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<InvocationKey> {
        let mut keys: Vec<_> = self.queues().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Sink for MemorySink {
    fn record(&self, batch: &Batch) -> Result<(), SinkError> {
        {
            let mut queues = self.queues();
            for record in batch.records() {
                let key = record.key();
                tracing::trace!(
                    context = %key.context_id,
                    method_hash = %key.method_hash,
                    method = %record.method(),
                    "queueing record"
                );
                queues.entry(key).or_default().push_back(record.clone());
            }
        }
        if let Some(callback) = &self.callback {
            callback(batch);
        }
        Ok(())
    }
}

impl InvocationSource for MemorySink {
    fn retrieve(&self, key: &InvocationKey) -> Option<Arc<InvocationRecord>> {
        let mut queues = self.queues();
        let queue = queues.get_mut(key)?;
        let record = queue.pop_front();
        if queue.is_empty() {
            queues.remove(key);
        }
        record
    }
}

impl std::fmt::Debug for MemorySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySink")
            .field("pending", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InvocationContext;
    use crate::invocation::MethodId;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const GET: MethodId = MethodId::new("Store", "get", "(u64) -> Item");
    const PUT: MethodId = MethodId::new("Store", "put", "(Item) -> ()");

    fn record(context: &str, method: MethodId, result: i64) -> Arc<InvocationRecord> {
        Arc::new(InvocationRecord::new(
            method,
            InvocationContext::with_id(context),
            Vec::new(),
            Value::I64(result),
            Vec::new(),
            Value::I64(result),
            None,
            Duration::ZERO,
        ))
    }

    #[test]
    fn test_retrieve_is_fifo_per_key() {
        let sink = MemorySink::new();
        sink.record(&Batch::new(
            0,
            vec![
                record("ctx", GET, 1),
                record("ctx", PUT, 2),
                record("ctx", GET, 3),
                record("other", GET, 4),
            ],
        ))
        .unwrap();

        let key = InvocationKey::new("ctx", &GET);
        assert_eq!(sink.pending(&key), 2);
        assert_eq!(sink.retrieve(&key).unwrap().reference_result(), &Value::I64(1));
        assert_eq!(sink.retrieve(&key).unwrap().reference_result(), &Value::I64(3));
        assert!(sink.retrieve(&key).is_none());

        let other = InvocationKey::new("other", &GET);
        assert_eq!(sink.retrieve(&other).unwrap().reference_result(), &Value::I64(4));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_absent_key_is_none() {
        let sink = MemorySink::new();
        assert!(sink.retrieve(&InvocationKey::new("nope", &GET)).is_none());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_callback_sees_every_batch() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let sink = MemorySink::with_callback(move |batch| {
            counter.fetch_add(batch.len(), Ordering::SeqCst);
        });
        sink.record(&Batch::new(0, vec![record("a", GET, 1), record("b", GET, 2)]))
            .unwrap();
        sink.record(&Batch::new(1, vec![record("c", GET, 3)])).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(sink.keys().len(), 3);
    }
}
