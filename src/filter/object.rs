// Object filter: applies the registered field filters to a captured value and
// produces the reference and evaluated copies.

use super::field::{FieldFilter, FieldFilterBuilder, FieldRef};
use super::tags::TagTable;
use super::FilterError;
use crate::value::{Record, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Which of the two filtered copies is being produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    /// Secrets scrubbed, everything else intact
    Reference,
    /// Secrets and noise scrubbed
    Evaluated,
}

/// Ordered field filters grouped by target type
///
/// An empty filter copies everything unchanged. Unregistered types are copied
/// structurally (nested registered types are still filtered), the same way
/// for both copy kinds.
#[derive(Debug, Clone, Default)]
pub struct ObjectFilter {
    by_type: HashMap<String, Vec<FieldFilter>>,
    tags: Arc<TagTable>,
    len: usize,
}

impl ObjectFilter {
    pub fn new(filters: Vec<FieldFilter>) -> Self {
        Self::with_tags(filters, TagTable::new())
    }

    pub fn with_tags(filters: Vec<FieldFilter>, tags: TagTable) -> Self {
        let len = filters.len();
        let mut by_type: HashMap<String, Vec<FieldFilter>> = HashMap::new();
        for filter in filters {
            by_type
                .entry(filter.type_name().to_string())
                .or_default()
                .push(filter);
        }
        ObjectFilter {
            by_type,
            tags: Arc::new(tags),
            len,
        }
    }

    pub fn builder() -> ObjectFilterBuilder {
        ObjectFilterBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn tags(&self) -> &TagTable {
        &self.tags
    }

    /// Filters registered for `type_name`, in declaration order
    pub fn filters_for(&self, type_name: &str) -> &[FieldFilter] {
        self.by_type.get(type_name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn filter_as_reference_copy(&self, value: &Value) -> Value {
        self.copy(value, CopyKind::Reference)
    }

    pub fn filter_as_evaluated_copy(&self, value: &Value) -> Value {
        self.copy(value, CopyKind::Evaluated)
    }

    /// Filter each argument independently; length and order are preserved
    pub fn filter_arguments(&self, arguments: &[Value], kind: CopyKind) -> Vec<Value> {
        arguments.iter().map(|arg| self.copy(arg, kind)).collect()
    }

    /// Both copies of `value`: `(reference, evaluated)`
    pub fn split(&self, value: &Value) -> (Value, Value) {
        (
            self.copy(value, CopyKind::Reference),
            self.copy(value, CopyKind::Evaluated),
        )
    }

    pub fn copy(&self, value: &Value, kind: CopyKind) -> Value {
        if self.is_empty() {
            return value.clone();
        }
        match value {
            Value::Record(record) => Value::Record(self.copy_record(record, kind)),
            Value::Some(inner) => Value::Some(Box::new(self.copy(inner, kind))),
            Value::Seq(items) => Value::Seq(self.filter_arguments(items, kind)),
            Value::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), self.copy(value, kind)))
                    .collect(),
            ),
            Value::Variant {
                type_name,
                variant,
                payload,
            } => Value::Variant {
                type_name: *type_name,
                variant: *variant,
                payload: Box::new(self.copy(payload, kind)),
            },
            scalar => scalar.clone(),
        }
    }

    fn copy_record(&self, record: &Record, kind: CopyKind) -> Record {
        let rules = self.filters_for(record.type_name);
        let fields = record
            .fields
            .iter()
            .map(|(name, value)| {
                let field = FieldRef {
                    type_name: record.type_name,
                    field_name: name,
                    value,
                    tags: &self.tags,
                };
                let copied = match rules.iter().find(|rule| rule.matches(&field)) {
                    Some(rule) => {
                        let transform = match kind {
                            CopyKind::Reference => rule.reference_transform(),
                            CopyKind::Evaluated => rule.evaluated_transform(),
                        };
                        transform.apply(value, |kept| self.copy(kept, kind))
                    }
                    None => self.copy(value, kind),
                };
                (name.clone(), copied)
            })
            .collect();
        Record {
            type_name: record.type_name,
            fields,
        }
    }
}

/// Collects field filter builders and a tag table into an [`ObjectFilter`]
#[derive(Debug, Clone, Default)]
pub struct ObjectFilterBuilder {
    filters: Vec<FieldFilterBuilder>,
    tags: TagTable,
}

impl ObjectFilterBuilder {
    pub fn with(mut self, filter: FieldFilterBuilder) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn tags(mut self, tags: TagTable) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn build(self) -> Result<ObjectFilter, FilterError> {
        let filters = self
            .filters
            .into_iter()
            .map(FieldFilterBuilder::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ObjectFilter::with_tags(filters, self.tags))
    }
}

/// Build an [`ObjectFilter`] from field filter builders
///
/// ```
/// use shadowstack::filter::{filter, noise, secrets};
///
/// let object_filter = filter([
///     noise().from("Foo").named(["timestamp"]),
///     secrets().from("Foo").named(["last_name"]),
/// ])
/// .unwrap();
/// assert_eq!(object_filter.len(), 2);
/// ```
pub fn filter<I>(builders: I) -> Result<ObjectFilter, FilterError>
where
    I: IntoIterator<Item = FieldFilterBuilder>,
{
    builders
        .into_iter()
        .fold(ObjectFilter::builder(), ObjectFilterBuilder::with)
        .build()
}
