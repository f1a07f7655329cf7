// Field filters: one (target type, field predicate, reference transform,
// evaluated transform) rule, plus the fluent builder used to declare it.

use super::tags::{Tag, TagTable};
use super::FilterError;
use crate::value::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// A field as seen by a predicate
#[derive(Debug, Clone, Copy)]
pub struct FieldRef<'a> {
    pub type_name: &'a str,
    pub field_name: &'a str,
    pub value: &'a Value,
    pub tags: &'a TagTable,
}

type PredicateFn = dyn Fn(&FieldRef<'_>) -> bool + Send + Sync;
type TransformFn = dyn Fn(&Value) -> Value + Send + Sync;

/// Selects which fields of the target type a filter applies to
#[derive(Clone)]
pub enum FieldPredicate {
    /// Field name is one of the set
    Named(HashSet<String>),
    /// Field carries the tag in the tag table
    Tagged(Tag),
    Custom(Arc<PredicateFn>),
}

impl FieldPredicate {
    pub fn matches(&self, field: &FieldRef<'_>) -> bool {
        match self {
            FieldPredicate::Named(names) => names.contains(field.field_name),
            FieldPredicate::Tagged(tag) => field.tags.has_tag(field.type_name, field.field_name, tag),
            FieldPredicate::Custom(predicate) => predicate(field),
        }
    }
}

impl fmt::Debug for FieldPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldPredicate::Named(names) => {
                let mut names: Vec<_> = names.iter().collect();
                names.sort();
                f.debug_tuple("Named").field(&names).finish()
            }
            FieldPredicate::Tagged(tag) => f.debug_tuple("Tagged").field(tag).finish(),
            FieldPredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Select fields by declared name
pub fn named<I, S>(names: I) -> FieldPredicate
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    FieldPredicate::Named(names.into_iter().map(Into::into).collect())
}

/// Select fields carrying `tag`
pub fn tagged(tag: impl Into<Tag>) -> FieldPredicate {
    FieldPredicate::Tagged(tag.into())
}

/// How a matched field's value is produced in one of the copies
#[derive(Clone)]
pub enum Transform {
    /// Keep the value (nested registered types are still filtered)
    Keep,
    /// Replace with the zero value of the field's shape
    TypeDefault,
    Custom(Arc<TransformFn>),
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Keep => f.write_str("Keep"),
            Transform::TypeDefault => f.write_str("TypeDefault"),
            Transform::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Transform {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Transform::Custom(Arc::new(f))
    }

    pub(crate) fn apply(&self, value: &Value, keep: impl FnOnce(&Value) -> Value) -> Value {
        match self {
            Transform::Keep => keep(value),
            Transform::TypeDefault => value.type_default(),
            Transform::Custom(transform) => transform(value),
        }
    }
}

/// One field-level rule
#[derive(Debug, Clone)]
pub struct FieldFilter {
    policy: &'static str,
    type_name: String,
    predicate: FieldPredicate,
    reference: Transform,
    evaluated: Transform,
}

impl FieldFilter {
    pub fn policy(&self) -> &'static str {
        self.policy
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn predicate(&self) -> &FieldPredicate {
        &self.predicate
    }

    pub fn reference_transform(&self) -> &Transform {
        &self.reference
    }

    pub fn evaluated_transform(&self) -> &Transform {
        &self.evaluated
    }

    pub fn matches(&self, field: &FieldRef<'_>) -> bool {
        field.type_name == self.type_name && self.predicate.matches(field)
    }
}

/// Fluent builder for a [`FieldFilter`]
///
/// ```
/// use shadowstack::filter::{named, noise, secrets};
///
/// let timestamp = noise().from("Foo").when(named(["timestamp"])).build().unwrap();
/// let salary = secrets().from("Baz").build().unwrap(); // fields tagged "secret"
/// assert_eq!(timestamp.policy(), "noise");
/// assert_eq!(salary.type_name(), "Baz");
/// ```
#[derive(Debug, Clone)]
pub struct FieldFilterBuilder {
    policy: &'static str,
    type_name: Option<String>,
    predicate: FieldPredicate,
    reference: Transform,
    evaluated: Transform,
}

impl FieldFilterBuilder {
    pub fn new(policy: &'static str, reference: Transform, evaluated: Transform) -> Self {
        FieldFilterBuilder {
            policy,
            type_name: None,
            predicate: FieldPredicate::Tagged(Tag::Custom(policy.to_string())),
            reference,
            evaluated,
        }
    }

    /// Declared type whose fields this filter inspects
    pub fn from(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn when(mut self, predicate: FieldPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn named<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.when(named(names))
    }

    pub fn tagged(self, tag: impl Into<Tag>) -> Self {
        self.when(tagged(tag))
    }

    pub fn matching<F>(self, predicate: F) -> Self
    where
        F: Fn(&FieldRef<'_>) -> bool + Send + Sync + 'static,
    {
        self.when(FieldPredicate::Custom(Arc::new(predicate)))
    }

    pub fn build(self) -> Result<FieldFilter, FilterError> {
        let type_name = self
            .type_name
            .filter(|name| !name.is_empty())
            .ok_or(FilterError::MissingTargetType {
                policy: self.policy,
            })?;
        if let FieldPredicate::Named(names) = &self.predicate {
            if names.is_empty() {
                return Err(FilterError::EmptyNameSet { type_name });
            }
        }
        Ok(FieldFilter {
            policy: self.policy,
            type_name,
            predicate: self.predicate,
            reference: self.reference,
            evaluated: self.evaluated,
        })
    }
}

/// Noise: kept in the reference copy, scrubbed in the evaluated copy.
/// Defaults to fields tagged [`Tag::Noise`].
pub fn noise() -> FieldFilterBuilder {
    FieldFilterBuilder::new("noise", Transform::Keep, Transform::TypeDefault).when(tagged(Tag::Noise))
}

/// Secrets: scrubbed in both copies. Defaults to fields tagged [`Tag::Secret`].
pub fn secrets() -> FieldFilterBuilder {
    FieldFilterBuilder::new("secret", Transform::TypeDefault, Transform::TypeDefault)
        .when(tagged(Tag::Secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field<'a>(type_name: &'a str, field_name: &'a str, tags: &'a TagTable) -> FieldRef<'a> {
        static NULL: Value = Value::Null;
        FieldRef {
            type_name,
            field_name,
            value: &NULL,
            tags,
        }
    }

    #[test]
    fn test_named_predicate() {
        let tags = TagTable::new();
        let predicate = named(["last_name", "salary"]);
        assert!(predicate.matches(&field("Foo", "last_name", &tags)));
        assert!(!predicate.matches(&field("Foo", "first_name", &tags)));
    }

    #[test]
    fn test_tagged_predicate_consults_table() {
        let tags = TagTable::new().tag("Foo", "timestamp", Tag::Noise);
        let predicate = tagged(Tag::Noise);
        assert!(predicate.matches(&field("Foo", "timestamp", &tags)));
        assert!(!predicate.matches(&field("Baz", "timestamp", &tags)));
    }

    #[test]
    fn test_filter_matches_only_its_type() {
        let tags = TagTable::new();
        let filter = secrets().from("Foo").named(["id"]).build().unwrap();
        assert!(filter.matches(&field("Foo", "id", &tags)));
        assert!(!filter.matches(&field("Baz", "id", &tags)));
    }

    #[test]
    fn test_default_predicates() {
        let tags = TagTable::new()
            .tag("Foo", "a", Tag::Noise)
            .tag("Foo", "b", Tag::Secret);
        let noisy = noise().from("Foo").build().unwrap();
        let secret = secrets().from("Foo").build().unwrap();
        assert!(noisy.matches(&field("Foo", "a", &tags)));
        assert!(!noisy.matches(&field("Foo", "b", &tags)));
        assert!(secret.matches(&field("Foo", "b", &tags)));
        assert!(!secret.matches(&field("Foo", "a", &tags)));
    }

    #[test]
    fn test_custom_predicate() {
        let tags = TagTable::new();
        let filter = secrets()
            .from("Foo")
            .matching(|f| f.field_name.starts_with("pw_"))
            .build()
            .unwrap();
        assert!(filter.matches(&field("Foo", "pw_hash", &tags)));
        assert!(!filter.matches(&field("Foo", "name", &tags)));
    }

    #[test]
    fn test_build_requires_type() {
        let err = noise().named(["a"]).build().unwrap_err();
        assert_eq!(err, FilterError::MissingTargetType { policy: "noise" });
    }

    #[test]
    fn test_build_rejects_empty_name_set() {
        let err = noise().from("Foo").named(Vec::<String>::new()).build().unwrap_err();
        assert_eq!(
            err,
            FilterError::EmptyNameSet {
                type_name: "Foo".to_string()
            }
        );
    }

    #[test]
    fn test_policy_transforms() {
        let noisy = noise().from("Foo").build().unwrap();
        assert!(matches!(noisy.reference_transform(), Transform::Keep));
        assert!(matches!(noisy.evaluated_transform(), Transform::TypeDefault));

        let secret = secrets().from("Foo").build().unwrap();
        assert!(matches!(secret.reference_transform(), Transform::TypeDefault));
        assert!(matches!(secret.evaluated_transform(), Transform::TypeDefault));
    }
}
