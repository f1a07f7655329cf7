// Field-level filtering of captured call data
//
// Every recorded call is stored twice:
// - the reference copy ("what was actually passed/returned") has secrets
//   scrubbed and everything else intact;
// - the evaluated copy, used for equality checks against a candidate, has
//   both secrets and noise scrubbed.
//
// A field filter targets one declared type and selects fields either by name
// or by a marker tag from the tag table. The object filter groups field
// filters by type and walks captured values recursively.

mod field;
mod object;
mod tags;

pub use field::{
    named, noise, secrets, tagged, FieldFilter, FieldFilterBuilder, FieldPredicate, FieldRef,
    Transform,
};
pub use object::{filter, CopyKind, ObjectFilter, ObjectFilterBuilder};
pub use tags::{Tag, TagTable, TaggedFields};

use thiserror::Error;

/// Errors raised while building filters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("{policy} filter has no target type (call .from(\"TypeName\"))")]
    MissingTargetType { policy: &'static str },

    #[error("Name predicate for type {type_name} selects no fields")]
    EmptyNameSet { type_name: String },
}
