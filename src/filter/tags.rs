// Field tag table
//
// Stands in for field annotations: a mapping from (type name, field name) to
// the set of marker tags on that field. Built once at configuration time,
// read-only afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Marker tag on a field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Tag {
    /// Volatile data: kept in the reference copy, scrubbed in the evaluated copy
    Noise,
    /// Sensitive data: scrubbed in both copies
    Secret,
    Custom(String),
}

impl Tag {
    pub fn as_str(&self) -> &str {
        match self {
            Tag::Noise => "noise",
            Tag::Secret => "secret",
            Tag::Custom(name) => name,
        }
    }
}

impl From<String> for Tag {
    fn from(s: String) -> Self {
        match s.as_str() {
            "noise" => Tag::Noise,
            "secret" => Tag::Secret,
            _ => Tag::Custom(s),
        }
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag::from(s.to_string())
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.as_str().to_string()
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Types that declare their own field tags
///
/// ```
/// use shadowstack::filter::{Tag, TagTable, TaggedFields};
///
/// struct Employee;
///
/// impl TaggedFields for Employee {
///     const TYPE_NAME: &'static str = "Employee";
///
///     fn field_tags() -> Vec<(&'static str, Tag)> {
///         vec![("salary", Tag::Secret), ("last_seen", Tag::Noise)]
///     }
/// }
///
/// let table = TagTable::new().register::<Employee>();
/// assert!(table.has_tag("Employee", "salary", &Tag::Secret));
/// assert!(!table.has_tag("Employee", "salary", &Tag::Noise));
/// ```
pub trait TaggedFields {
    /// serde name of the type
    const TYPE_NAME: &'static str;

    fn field_tags() -> Vec<(&'static str, Tag)>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagTable {
    entries: HashMap<String, HashMap<String, HashSet<Tag>>>,
}

impl TagTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, type_name: &str, field: &str, tag: impl Into<Tag>) -> Self {
        self.insert(type_name, field, tag);
        self
    }

    pub fn register<T: TaggedFields>(mut self) -> Self {
        for (field, tag) in T::field_tags() {
            self.insert(T::TYPE_NAME, field, tag);
        }
        self
    }

    pub fn insert(&mut self, type_name: &str, field: &str, tag: impl Into<Tag>) {
        self.entries
            .entry(type_name.to_string())
            .or_default()
            .entry(field.to_string())
            .or_default()
            .insert(tag.into());
    }

    pub fn tags(&self, type_name: &str, field: &str) -> Option<&HashSet<Tag>> {
        self.entries.get(type_name).and_then(|fields| fields.get(field))
    }

    pub fn has_tag(&self, type_name: &str, field: &str, tag: &Tag) -> bool {
        self.tags(type_name, field)
            .is_some_and(|tags| tags.contains(tag))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge another table into this one
    pub fn extend(&mut self, other: TagTable) {
        for (type_name, fields) in other.entries {
            let target = self.entries.entry(type_name).or_default();
            for (field, tags) in fields {
                target.entry(field).or_default().extend(tags);
            }
        }
    }
}
