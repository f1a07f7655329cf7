//! Call interception: wrap a target and record every call made through it
//!
//! A [`Recorder`] collects the filter, throttle and pipeline for one target.
//! [`Recorder::interceptor`] checks at setup time that the target has the
//! requested type and hands out an [`Interceptor`]; a hand-written
//! decorator implementing [`Proxy`] routes each of its methods through
//! [`Interceptor::invoke`] or [`Interceptor::try_invoke`].
//!
//! # Example
//!
//! ```
//! use shadowstack::interceptor::{record, Interceptor, Proxy};
//! use shadowstack::invocation::MethodId;
//!
//! struct Greeter;
//! impl Greeter {
//!     fn greet(&self, name: &str) -> String {
//!         format!("hello {}", name)
//!     }
//! }
//!
//! const GREET: MethodId = MethodId::new("Greeter", "greet", "(&str) -> String");
//!
//! struct ShadowedGreeter(Interceptor<Greeter>);
//! impl Proxy for ShadowedGreeter {
//!     type Target = Greeter;
//!     fn from_interceptor(interceptor: Interceptor<Greeter>) -> Self {
//!         ShadowedGreeter(interceptor)
//!     }
//! }
//! impl ShadowedGreeter {
//!     fn greet(&self, name: &str) -> String {
//!         self.0.invoke(&GREET, &[&name], |g| g.greet(name))
//!     }
//! }
//!
//! let proxy: ShadowedGreeter = record(Greeter).build_proxy().unwrap();
//! assert_eq!(proxy.greet("Bob"), "hello Bob");
//! assert!(record(Greeter).build_proxy::<ShadowedString>().is_none());
//!
//! # struct ShadowedString;
//! # impl Proxy for ShadowedString {
//! #     type Target = String;
//! #     fn from_interceptor(_: Interceptor<String>) -> Self { ShadowedString }
//! # }
//! ```

use crate::context::InvocationContext;
use crate::filter::{CopyKind, ObjectFilter};
use crate::invocation::{CapturedFault, InvocationRecord, MethodId};
use crate::pipeline::{DeliveryPipeline, Offer};
use crate::throttle::Throttle;
use crate::value::{to_value, Value, ValueError};
use serde::Serialize;
use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, trace, warn};

/// Failure while observing a call; logged and never returned to the caller
#[derive(Error, Debug)]
pub enum InstrumentationError {
    #[error("Failed to capture {what}: {source}")]
    Capture {
        what: &'static str,
        #[source]
        source: ValueError,
    },

    #[error("Instrumentation panicked: {0}")]
    Panicked(String),
}

/// Anything that can be captured as an argument or result value
pub trait Capture {
    fn capture(&self) -> Result<Value, ValueError>;
}

impl<T: Serialize + ?Sized> Capture for T {
    fn capture(&self) -> Result<Value, ValueError> {
        to_value(self)
    }
}

/// A decorator built around an [`Interceptor`]
pub trait Proxy: Sized {
    /// Concrete type the wrapped target must have
    type Target: Send + Sync + 'static;

    fn from_interceptor(interceptor: Interceptor<Self::Target>) -> Self;
}

struct Observer {
    target_type: &'static str,
    filter: Arc<ObjectFilter>,
    throttle: Option<Arc<dyn Throttle>>,
    pipeline: Option<Arc<DeliveryPipeline>>,
}

/// Builder for interceptors around one target
pub struct Recorder {
    target: Arc<dyn Any + Send + Sync>,
    target_type: &'static str,
    filter: Arc<ObjectFilter>,
    throttle: Option<Arc<dyn Throttle>>,
    pipeline: Option<Arc<DeliveryPipeline>>,
}

/// Start recording calls against `target`
pub fn record<T: Send + Sync + 'static>(target: T) -> Recorder {
    Recorder::from_arc(Arc::new(target))
}

impl Recorder {
    /// Record calls against a target that is already shared
    pub fn from_arc<T: Send + Sync + 'static>(target: Arc<T>) -> Self {
        Recorder {
            target,
            target_type: std::any::type_name::<T>(),
            filter: Arc::new(ObjectFilter::default()),
            throttle: None,
            pipeline: None,
        }
    }

    pub fn filtering_with(mut self, filter: ObjectFilter) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    pub fn throttling_to<T: Throttle + 'static>(mut self, throttle: T) -> Self {
        self.throttle = Some(Arc::new(throttle));
        self
    }

    /// Share one throttle between several recorders
    pub fn throttling_to_shared(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn sending_to(mut self, pipeline: Arc<DeliveryPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn target_type(&self) -> &'static str {
        self.target_type
    }

    /// Interceptor for a target of type `T`, or `None` if the target has
    /// another type
    pub fn interceptor<T: Send + Sync + 'static>(&self) -> Option<Interceptor<T>> {
        let Ok(target) = self.target.clone().downcast::<T>() else {
            warn!(
                requested = std::any::type_name::<T>(),
                target = self.target_type,
                "incompatible proxy type for target, no proxy built"
            );
            return None;
        };
        Some(Interceptor {
            target,
            observer: Arc::new(Observer {
                target_type: self.target_type,
                filter: self.filter.clone(),
                throttle: self.throttle.clone(),
                pipeline: self.pipeline.clone(),
            }),
        })
    }

    pub fn build_proxy<P: Proxy>(&self) -> Option<P> {
        self.interceptor::<P::Target>().map(P::from_interceptor)
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("target_type", &self.target_type)
            .field("filters", &self.filter.len())
            .field("throttle", &self.throttle)
            .field("pipeline", &self.pipeline.is_some())
            .finish()
    }
}

/// Forwards calls to the target and records each one
pub struct Interceptor<T> {
    target: Arc<T>,
    observer: Arc<Observer>,
}

impl<T> Clone for Interceptor<T> {
    fn clone(&self) -> Self {
        Interceptor {
            target: self.target.clone(),
            observer: self.observer.clone(),
        }
    }
}

impl<T> fmt::Debug for Interceptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptor")
            .field("target_type", &self.observer.target_type)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Interceptor<T> {
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Forward an infallible call and record it
    pub fn invoke<R, F>(&self, method: &MethodId, arguments: &[&dyn Capture], call: F) -> R
    where
        R: Serialize,
        F: FnOnce(&T) -> R,
    {
        match self.try_invoke(method, arguments, |target| Ok::<R, Infallible>(call(target))) {
            Ok(result) => result,
            Err(never) => match never {},
        }
    }

    /// Forward a fallible call and record it
    ///
    /// The caller receives exactly what `call` produced: the same `Ok`, the
    /// same `Err`, or the same panic payload.
    pub fn try_invoke<R, E, F>(
        &self,
        method: &MethodId,
        arguments: &[&dyn Capture],
        call: F,
    ) -> Result<R, E>
    where
        R: Serialize,
        E: fmt::Display,
        F: FnOnce(&T) -> Result<R, E>,
    {
        let observing = self.observer.pipeline.is_some();

        // Captured up front: the call may change what the arguments look like
        let captured = if observing {
            Some(panic::catch_unwind(AssertUnwindSafe(|| capture_all(arguments))))
        } else {
            None
        };

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(&self.target)));
        let duration = start.elapsed();

        if let Some(captured) = captured {
            let observed = panic::catch_unwind(AssertUnwindSafe(|| {
                let arguments = captured.map_err(|payload| panic_error(payload.as_ref()))??;
                self.observer.observe(method, arguments, &outcome, duration)
            }));
            let failure = match observed {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(payload) => Some(panic_error(payload.as_ref())),
            };
            if let Some(e) = failure {
                error!(
                    method = method.name,
                    arguments = arguments.len(),
                    target = self.observer.target_type,
                    error = %e,
                    "instrumentation failed while recording call"
                );
            }
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

type Outcome<R, E> = std::thread::Result<Result<R, E>>;

impl Observer {
    fn observe<R, E>(
        &self,
        method: &MethodId,
        arguments: Vec<Value>,
        outcome: &Outcome<R, E>,
        duration: Duration,
    ) -> Result<(), InstrumentationError>
    where
        R: Serialize,
        E: fmt::Display,
    {
        let Some(pipeline) = &self.pipeline else {
            return Ok(());
        };

        let (result, fault) = match outcome {
            Ok(Ok(value)) => (
                to_value(value).map_err(|source| InstrumentationError::Capture {
                    what: "result",
                    source,
                })?,
                None,
            ),
            Ok(Err(e)) => (Value::Null, Some(CapturedFault::error(e))),
            Err(payload) => (Value::Null, Some(CapturedFault::panic(payload.as_ref()))),
        };

        let context = InvocationContext::current();
        let record = InvocationRecord::new(
            *method,
            context,
            self.filter.filter_arguments(&arguments, CopyKind::Reference),
            self.filter.filter_as_reference_copy(&result),
            self.filter.filter_arguments(&arguments, CopyKind::Evaluated),
            self.filter.filter_as_evaluated_copy(&result),
            fault,
            duration,
        );

        if self.throttle.as_ref().is_some_and(|t| t.reject()) {
            trace!(method = %method, "call rejected by throttle");
            return Ok(());
        }

        if pipeline.offer(Arc::new(record)) == Offer::Closed {
            trace!(method = %method, "pipeline closed, record discarded");
        }
        Ok(())
    }
}

fn capture_all(arguments: &[&dyn Capture]) -> Result<Vec<Value>, InstrumentationError> {
    arguments
        .iter()
        .map(|argument| argument.capture())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| InstrumentationError::Capture {
            what: "arguments",
            source,
        })
}

fn panic_error(payload: &(dyn Any + Send)) -> InstrumentationError {
    InstrumentationError::Panicked(CapturedFault::panic(payload).message)
}
