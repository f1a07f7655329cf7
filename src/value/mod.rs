//! Captured value model
//!
//! Every argument and result that passes through an [`Interceptor`] is
//! captured into an owned [`Value`] tree before filtering. Capturing is driven
//! by serde: any `T: Serialize` can be turned into a `Value` with
//! [`to_value`], and the serde struct name of each nested struct becomes the
//! declared type name that field filters are registered against.
//!
//! That name is the bare serde name, without the module path, so same-named
//! types from different modules share filter rules. A struct with
//! `#[serde(flatten)]` fields is serialized by serde as a map and captures as
//! [`Value::Map`] without a type name.
//!
//! ```
//! use serde::Serialize;
//! use shadowstack::value::{to_value, Value};
//!
//! #[derive(Serialize)]
//! struct Account {
//!     owner: String,
//!     balance: f64,
//! }
//!
//! let value = to_value(&Account { owner: "Bob".into(), balance: 12.5 }).unwrap();
//! assert_eq!(value.type_name(), Some("Account"));
//! assert_eq!(value.field("owner").and_then(Value::as_str), Some("Bob"));
//! assert_eq!(value.type_default().field("balance").and_then(Value::as_f64), Some(0.0));
//! ```
//!
//! [`Interceptor`]: crate::interceptor::Interceptor

mod ser;

use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::borrow::Cow;
use thiserror::Error;

pub use ser::{to_value, ValueSerializer};

/// Errors raised while capturing a value
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("Integer out of range for capture: {0}")]
    IntegerOutOfRange(String),

    #[error("Failed to capture value: {0}")]
    Custom(String),
}

impl serde::ser::Error for ValueError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        ValueError::Custom(msg.to_string())
    }
}

/// A struct-like value: declared type name plus ordered named fields
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub type_name: &'static str,
    pub fields: Vec<(Cow<'static, str>, Value)>,
}

impl Record {
    pub fn new(type_name: &'static str) -> Self {
        Record {
            type_name,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<Cow<'static, str>>, value: Value) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

/// Owned, self-contained capture of an argument or result
///
/// A `Value` never borrows from the data it was captured from, so copies
/// produced by the filter engine share no mutable state with the original
/// call data or with each other.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// `None`, `()` or an absent result
    #[default]
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Char(char),
    Str(String),
    Bytes(Vec<u8>),
    /// `Some(inner)`
    Some(Box<Value>),
    Seq(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Record(Record),
    /// An enum variant; unit variants carry `Null`
    Variant {
        type_name: &'static str,
        variant: &'static str,
        payload: Box<Value>,
    },
}

impl Value {
    /// The zero value of this value's shape
    ///
    /// Records keep their type and field names with every field defaulted.
    /// Options and enum variants have no meaningful zero and default to `Null`.
    pub fn type_default(&self) -> Value {
        match self {
            Value::Null | Value::Some(_) | Value::Variant { .. } => Value::Null,
            Value::Bool(_) => Value::Bool(false),
            Value::I64(_) => Value::I64(0),
            Value::U64(_) => Value::U64(0),
            Value::F64(_) => Value::F64(0.0),
            Value::Char(_) => Value::Char('\0'),
            Value::Str(_) => Value::Str(String::new()),
            Value::Bytes(_) => Value::Bytes(Vec::new()),
            Value::Seq(_) => Value::Seq(Vec::new()),
            Value::Map(_) => Value::Map(Vec::new()),
            Value::Record(record) => Value::Record(Record {
                type_name: record.type_name,
                fields: record
                    .fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.type_default()))
                    .collect(),
            }),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Declared type name of a record or enum variant
    pub fn type_name(&self) -> Option<&'static str> {
        match self {
            Value::Record(record) => Some(record.type_name),
            Value::Variant { type_name, .. } => Some(*type_name),
            _ => None,
        }
    }

    /// Look up a field of a record (through `Some` wrappers)
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(record) => record.field(name),
            Value::Some(inner) => inner.field(name),
            _ => None,
        }
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Value> {
        match self {
            Value::Record(record) => record.field_mut(name),
            Value::Some(inner) => inner.field_mut(name),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(i) => Some(*i),
            Value::U64(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(u) => Some(*u),
            Value::I64(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::F64(f)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::I64(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

// Records and variants encode as maps so that runtime field names survive
// formats that require `&'static str` keys for structs.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::I64(i) => serializer.serialize_i64(*i),
            Value::U64(u) => serializer.serialize_u64(*u),
            Value::F64(f) => serializer.serialize_f64(*f),
            Value::Char(c) => serializer.serialize_char(*c),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(bytes) => serializer.serialize_bytes(bytes),
            Value::Some(inner) => serializer.serialize_some(inner.as_ref()),
            Value::Seq(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Value::Record(record) => {
                let mut map = serializer.serialize_map(Some(record.fields.len()))?;
                for (name, value) in &record.fields {
                    map.serialize_entry(name.as_ref(), value)?;
                }
                map.end()
            }
            Value::Variant {
                variant, payload, ..
            } => {
                if payload.is_null() {
                    serializer.serialize_str(variant)
                } else {
                    let mut map = serializer.serialize_map(Some(1))?;
                    map.serialize_entry(variant, payload.as_ref())?;
                    map.end()
                }
            }
        }
    }
}
