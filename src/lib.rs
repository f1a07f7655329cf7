//! Shadowstack - record live calls for shadow testing
//!
//! This library wraps a production object so that every call made through it
//! is recorded (arguments, result, error or panic, duration) without changing
//! what the caller sees. Each record carries two filtered copies of the call
//! data: a reference copy with secrets scrubbed and an evaluated copy with
//! secrets and noise scrubbed. Records are sampled by a throttle and handed to
//! a bounded, batching pipeline that delivers to a pluggable sink.
//!
//! ```
//! use shadowstack::{filter, noise, percent, record, secrets};
//! use shadowstack::pipeline::{DeliveryPipeline, PipelineConfig};
//! use shadowstack::sink::MemorySink;
//! use std::sync::Arc;
//!
//! let sink = Arc::new(MemorySink::new());
//! let pipeline = Arc::new(
//!     DeliveryPipeline::start(PipelineConfig::default().with_batch_size(20), sink).unwrap(),
//! );
//! let recorder = record(String::from("target"))
//!     .filtering_with(
//!         filter([
//!             noise().from("Foo").named(["timestamp"]),
//!             secrets().from("Foo").named(["last_name"]),
//!         ])
//!         .unwrap(),
//!     )
//!     .throttling_to(percent(1.0).unwrap())
//!     .sending_to(pipeline.clone());
//! assert!(recorder.interceptor::<String>().is_some());
//! pipeline.shutdown();
//! ```

pub mod config;
pub mod context;
pub mod filter;
pub mod interceptor;
pub mod invocation;
pub mod pipeline;
pub mod sink;
pub mod throttle;
pub mod value;

pub use filter::{filter, named, noise, secrets, tagged};
pub use interceptor::{record, Interceptor, Proxy, Recorder};
pub use throttle::{every, percent, rate};
