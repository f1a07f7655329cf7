//! Invocation records: the immutable unit moving through the pipeline
//!
//! An [`InvocationRecord`] captures one intercepted call: which method ran,
//! under which correlation context, the reference and evaluated copies of its
//! arguments and result, the fault it raised (if any), and how long it took.

use crate::context::InvocationContext;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use std::time::Duration;

/// Identity of an intercepted method
///
/// ```
/// use shadowstack::invocation::MethodId;
///
/// const LOOKUP: MethodId = MethodId::new("AccountService", "lookup", "(&str) -> Account");
/// assert_eq!(LOOKUP.identity_hash(), MethodId::new("AccountService", "lookup", "(&str) -> Account").identity_hash());
/// assert_ne!(LOOKUP.identity_hash(), MethodId::new("AccountService", "lookup", "(u64) -> Account").identity_hash());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MethodId {
    pub owner: &'static str,
    pub name: &'static str,
    pub signature: &'static str,
}

impl MethodId {
    pub const fn new(owner: &'static str, name: &'static str, signature: &'static str) -> Self {
        MethodId {
            owner,
            name,
            signature,
        }
    }

    /// FNV-1a hash of `owner::name::signature`, stable across processes
    pub fn identity_hash(&self) -> u64 {
        let mut hasher = fnv::FnvHasher::default();
        hasher.write(self.owner.as_bytes());
        hasher.write(b"::");
        hasher.write(self.name.as_bytes());
        hasher.write(b"::");
        hasher.write(self.signature.as_bytes());
        hasher.finish()
    }

    /// [`MethodId::identity_hash`] as a 16-character hex string
    pub fn hash_hex(&self) -> String {
        format!("{:016x}", self.identity_hash())
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}{}", self.owner, self.name, self.signature)
    }
}

/// Lookup key for recorded invocations: (context id, method hash)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvocationKey {
    pub context_id: String,
    pub method_hash: String,
}

impl InvocationKey {
    pub fn new(context_id: impl Into<String>, method: &MethodId) -> Self {
        InvocationKey {
            context_id: context_id.into(),
            method_hash: method.hash_hex(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.context_id.is_empty() && !self.method_hash.is_empty()
    }
}

/// How the original call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The call returned `Err(_)`
    Error,
    /// The call panicked
    Panic,
}

/// Description of the fault raised by the original call
///
/// The caller always receives the original error value or panic payload;
/// this is only the recorded description of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedFault {
    pub kind: FaultKind,
    pub type_name: String,
    pub message: String,
}

impl CapturedFault {
    pub fn error<E: fmt::Display + ?Sized>(error: &E) -> Self {
        CapturedFault {
            kind: FaultKind::Error,
            type_name: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
        }
    }

    /// Describe a panic payload as produced by `catch_unwind`
    pub fn panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        CapturedFault {
            kind: FaultKind::Panic,
            type_name: "panic".to_string(),
            message,
        }
    }
}

impl fmt::Display for CapturedFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.type_name, self.kind, self.message)
    }
}

/// One intercepted call, immutable after construction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvocationRecord {
    method: MethodId,
    context: InvocationContext,
    reference_arguments: Vec<Value>,
    reference_result: Value,
    evaluated_arguments: Vec<Value>,
    evaluated_result: Value,
    fault: Option<CapturedFault>,
    duration: Duration,
}

impl InvocationRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: MethodId,
        context: InvocationContext,
        reference_arguments: Vec<Value>,
        reference_result: Value,
        evaluated_arguments: Vec<Value>,
        evaluated_result: Value,
        fault: Option<CapturedFault>,
        duration: Duration,
    ) -> Self {
        InvocationRecord {
            method,
            context,
            reference_arguments,
            reference_result,
            evaluated_arguments,
            evaluated_result,
            fault,
            duration,
        }
    }

    pub fn method(&self) -> &MethodId {
        &self.method
    }

    pub fn context(&self) -> &InvocationContext {
        &self.context
    }

    pub fn reference_arguments(&self) -> &[Value] {
        &self.reference_arguments
    }

    pub fn reference_result(&self) -> &Value {
        &self.reference_result
    }

    pub fn evaluated_arguments(&self) -> &[Value] {
        &self.evaluated_arguments
    }

    pub fn evaluated_result(&self) -> &Value {
        &self.evaluated_result
    }

    pub fn fault(&self) -> Option<&CapturedFault> {
        self.fault.as_ref()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn key(&self) -> InvocationKey {
        InvocationKey::new(self.context.context_id(), &self.method)
    }

    /// Valid when the context is valid and both argument copies line up
    pub fn is_valid(&self) -> bool {
        self.context.is_valid() && self.reference_arguments.len() == self.evaluated_arguments.len()
    }
}

/// Request to replay a recorded call against a candidate implementation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShadowRequest {
    pub key: InvocationKey,
    pub context: InvocationContext,
    pub arguments: Vec<Value>,
}

impl ShadowRequest {
    /// Build a replay request from the reference copy of a recorded call
    pub fn from_record(record: &InvocationRecord) -> Self {
        ShadowRequest {
            key: record.key(),
            context: record.context().clone(),
            arguments: record.reference_arguments().to_vec(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.context.is_valid() && self.key.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METHOD: MethodId = MethodId::new("Bar", "do_something", "(&Foo) -> String");

    fn record(context: InvocationContext) -> InvocationRecord {
        InvocationRecord::new(
            METHOD,
            context,
            vec![Value::from("a")],
            Value::from("X"),
            vec![Value::from("")],
            Value::from("X"),
            None,
            Duration::from_micros(12),
        )
    }

    #[test]
    fn test_method_hash_is_deterministic() {
        assert_eq!(METHOD.identity_hash(), METHOD.identity_hash());
        assert_eq!(METHOD.hash_hex().len(), 16);
        assert_ne!(
            METHOD.identity_hash(),
            MethodId::new("Bar", "do_something_else", "(&Foo) -> String").identity_hash()
        );
    }

    #[test]
    fn test_method_display() {
        assert_eq!(METHOD.to_string(), "Bar::do_something(&Foo) -> String");
    }

    #[test]
    fn test_record_validity_follows_context() {
        assert!(record(InvocationContext::with_id("ctx")).is_valid());
        assert!(!record(InvocationContext::with_id("")).is_valid());
    }

    #[test]
    fn test_record_key() {
        let key = record(InvocationContext::with_id("ctx")).key();
        assert_eq!(key.context_id, "ctx");
        assert_eq!(key.method_hash, METHOD.hash_hex());
        assert!(key.is_valid());
    }

    #[test]
    fn test_fault_from_error_and_panic() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let fault = CapturedFault::error(&err);
        assert_eq!(fault.kind, FaultKind::Error);
        assert!(fault.type_name.ends_with("Error"));
        assert_eq!(fault.message, "disk on fire");

        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let fault = CapturedFault::panic(payload.as_ref());
        assert_eq!(fault.kind, FaultKind::Panic);
        assert_eq!(fault.message, "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(format!("boom {}", 2));
        assert_eq!(CapturedFault::panic(payload.as_ref()).message, "boom 2");
    }

    #[test]
    fn test_shadow_request_from_record() {
        let request = ShadowRequest::from_record(&record(InvocationContext::with_id("ctx")));
        assert!(request.is_valid());
        assert_eq!(request.arguments, vec![Value::from("a")]);
    }

    #[test]
    fn test_record_serializes() {
        let json = serde_json::to_value(record(InvocationContext::with_id("ctx"))).unwrap();
        assert_eq!(json["method"]["name"], "do_something");
        assert_eq!(json["context"]["context_id"], "ctx");
        assert_eq!(json["reference_result"], "X");
        assert!(json["fault"].is_null());
    }
}
