// Shared fixtures for integration tests
//
// A person record with a nested employment record, a service trait with a
// real implementation and a recording decorator, and sinks that collect what
// the pipeline delivers.

#![allow(dead_code)]

use serde::Serialize;
use shadowstack::filter::{Tag, TagTable, TaggedFields};
use shadowstack::invocation::{InvocationRecord, MethodId};
use shadowstack::pipeline::{DeliveryPipeline, PipelineConfig};
use shadowstack::sink::{Batch, FnSink, Sink};
use shadowstack::{Interceptor, Proxy};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Baz {
    pub title: String,
    pub salary: f64,
    pub height: f32,
    pub id: u64,
}

impl TaggedFields for Baz {
    const TYPE_NAME: &'static str = "Baz";

    fn field_tags() -> Vec<(&'static str, Tag)> {
        vec![("height", Tag::Secret), ("id", Tag::Noise)]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Foo {
    pub first_name: String,
    pub last_name: String,
    pub age: i32,
    pub timestamp: u64,
    pub baz: Baz,
}

impl TaggedFields for Foo {
    const TYPE_NAME: &'static str = "Foo";

    fn field_tags() -> Vec<(&'static str, Tag)> {
        vec![("timestamp", Tag::Noise), ("last_name", Tag::Secret)]
    }
}

pub fn foo() -> Foo {
    Foo {
        first_name: "Bob".to_string(),
        last_name: "Smith".to_string(),
        age: 35,
        timestamp: 1_700_000_000,
        baz: Baz {
            title: "Pawn".to_string(),
            salary: 75000.0,
            height: 69.5,
            id: 1234,
        },
    }
}

/// Tags for both fixture types
pub fn fixture_tags() -> TagTable {
    TagTable::new().register::<Foo>().register::<Baz>()
}

#[derive(Debug, Error, PartialEq)]
#[error("not implemented: {0}")]
pub struct NotImplemented(pub String);

pub trait BarApi {
    fn do_something_shadowed(&self, foo: &Foo) -> String;
    fn do_something_bad(&self, foo: &Foo) -> Result<String, NotImplemented>;
    fn do_something_fatal(&self, foo: &Foo) -> String;
}

pub const DO_SOMETHING_SHADOWED: MethodId =
    MethodId::new("Bar", "do_something_shadowed", "(&Foo) -> String");
pub const DO_SOMETHING_BAD: MethodId = MethodId::new(
    "Bar",
    "do_something_bad",
    "(&Foo) -> Result<String, NotImplemented>",
);
pub const DO_SOMETHING_FATAL: MethodId =
    MethodId::new("Bar", "do_something_fatal", "(&Foo) -> String");

/// Real implementation; counts how often it is called
#[derive(Debug, Default)]
pub struct Bar {
    pub calls: AtomicUsize,
}

impl Bar {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl BarApi for Bar {
    fn do_something_shadowed(&self, foo: &Foo) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        format!("{} {} earns {}", foo.first_name, foo.last_name, foo.baz.salary)
    }

    fn do_something_bad(&self, foo: &Foo) -> Result<String, NotImplemented> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(NotImplemented(foo.first_name.clone()))
    }

    fn do_something_fatal(&self, _foo: &Foo) -> String {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("bar is on fire")
    }
}

/// Different implementation of the same API
#[derive(Debug, Default)]
pub struct OtherBar;

impl BarApi for OtherBar {
    fn do_something_shadowed(&self, _foo: &Foo) -> String {
        "other".to_string()
    }

    fn do_something_bad(&self, _foo: &Foo) -> Result<String, NotImplemented> {
        Ok("other".to_string())
    }

    fn do_something_fatal(&self, _foo: &Foo) -> String {
        "other".to_string()
    }
}

/// Recording decorator for any `BarApi` implementation
pub struct ShadowedBar<B> {
    inner: Interceptor<B>,
}

impl<B> Clone for ShadowedBar<B> {
    fn clone(&self) -> Self {
        ShadowedBar {
            inner: self.inner.clone(),
        }
    }
}

impl<B: BarApi + Send + Sync + 'static> Proxy for ShadowedBar<B> {
    type Target = B;

    fn from_interceptor(inner: Interceptor<B>) -> Self {
        ShadowedBar { inner }
    }
}

impl<B: BarApi + Send + Sync + 'static> BarApi for ShadowedBar<B> {
    fn do_something_shadowed(&self, foo: &Foo) -> String {
        self.inner
            .invoke(&DO_SOMETHING_SHADOWED, &[foo], |bar| bar.do_something_shadowed(foo))
    }

    fn do_something_bad(&self, foo: &Foo) -> Result<String, NotImplemented> {
        self.inner
            .try_invoke(&DO_SOMETHING_BAD, &[foo], |bar| bar.do_something_bad(foo))
    }

    fn do_something_fatal(&self, foo: &Foo) -> String {
        self.inner
            .invoke(&DO_SOMETHING_FATAL, &[foo], |bar| bar.do_something_fatal(foo))
    }
}

/// Every batch the pipeline delivered, in delivery order
#[derive(Clone, Default)]
pub struct Collected {
    batches: Arc<Mutex<Vec<Batch>>>,
}

impl Collected {
    pub fn sink(&self) -> Arc<dyn Sink> {
        let batches = self.batches.clone();
        Arc::new(FnSink::new(move |batch: &Batch| {
            batches.lock().unwrap().push(batch.clone());
            Ok(())
        }))
    }

    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(Batch::len).collect()
    }

    /// Records in the order the sink received them
    pub fn records(&self) -> Vec<InvocationRecord> {
        self.batches()
            .iter()
            .flat_map(|batch| batch.iter().cloned())
            .collect()
    }

    /// Batch sequence numbers in the order the sink received them
    pub fn arrival_sequences(&self) -> Vec<u64> {
        self.batches().iter().map(Batch::sequence).collect()
    }

    pub fn record_count(&self) -> usize {
        self.batches().iter().map(Batch::len).sum()
    }

    /// Poll until at least `count` records arrived or `timeout` passed
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.record_count() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.record_count() >= count
    }
}

pub fn start_pipeline(batch_size: usize, sink: Arc<dyn Sink>) -> Arc<DeliveryPipeline> {
    let config = PipelineConfig::default().with_batch_size(batch_size);
    Arc::new(DeliveryPipeline::start(config, sink).unwrap())
}

/// In-memory log output for asserting on diagnostics
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Subscriber writing plain-text logs into `buffer`
pub fn capture_logs(buffer: &LogBuffer) -> impl tracing::Subscriber + Send + Sync {
    let buffer = buffer.clone();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("shadowstack=trace"))
        .with_writer(move || buffer.clone())
        .with_ansi(false)
        .finish()
}

/// Install an env-driven subscriber once per test binary (RUST_LOG)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
