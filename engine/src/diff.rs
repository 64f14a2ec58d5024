//! Field diffs and the change units built from them.
//!
//! A [`FieldDiff`] is the set/unset delta propagated at every layer:
//! publications emit them, the merge box emits them, the local collection
//! reports them to observers.

use crate::{FieldName, Fields};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A set/unset delta applied to a document's fields.
///
/// A field never appears in both `set` and `unset`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    /// Fields to set to a new value
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub set: Fields,
    /// Fields to remove
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unset: BTreeSet<FieldName>,
}

impl FieldDiff {
    /// Create an empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field assignment, replacing any pending unset of it.
    pub fn set(mut self, field: impl Into<FieldName>, value: serde_json::Value) -> Self {
        let field = field.into();
        self.unset.remove(&field);
        self.set.insert(field, value);
        self
    }

    /// Add a field removal, replacing any pending assignment of it.
    pub fn unset(mut self, field: impl Into<FieldName>) -> Self {
        let field = field.into();
        self.set.remove(&field);
        self.unset.insert(field);
        self
    }

    /// Check if the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    /// All field names touched by this diff.
    pub fn fields(&self) -> impl Iterator<Item = &FieldName> {
        self.set.keys().chain(self.unset.iter())
    }

    /// Compute the minimal diff turning `old` into `new`.
    pub fn between(old: &Fields, new: &Fields) -> Self {
        let mut diff = FieldDiff::new();
        for (field, value) in new {
            if old.get(field) != Some(value) {
                diff.set.insert(field.clone(), value.clone());
            }
        }
        for field in old.keys() {
            if !new.contains_key(field) {
                diff.unset.insert(field.clone());
            }
        }
        diff
    }

    /// Apply this diff to a field map in place.
    pub fn apply(&self, fields: &mut Fields) {
        for (field, value) in &self.set {
            fields.insert(field.clone(), value.clone());
        }
        for field in &self.unset {
            fields.remove(field);
        }
    }
}

/// A change to a document as seen from downstream of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DocChange {
    /// The document appeared with these fields
    Added(Fields),
    /// Some fields of an existing document changed
    Changed(FieldDiff),
    /// The document disappeared
    Removed,
}

impl DocChange {
    /// Compute the change between two optional document states.
    ///
    /// Returns `None` when nothing visible changed.
    pub fn between(old: Option<&Fields>, new: Option<&Fields>) -> Option<Self> {
        match (old, new) {
            (None, None) => None,
            (None, Some(fields)) => Some(DocChange::Added(fields.clone())),
            (Some(_), None) => Some(DocChange::Removed),
            (Some(old), Some(new)) => {
                let diff = FieldDiff::between(old, new);
                (!diff.is_empty()).then_some(DocChange::Changed(diff))
            }
        }
    }
}

/// A single simulated write issued by a method body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DocWrite {
    /// Create the document with these fields
    Insert(Fields),
    /// Modify fields of the document if it exists
    Update(FieldDiff),
    /// Delete the document
    Remove,
}

impl DocWrite {
    /// Replay this write on top of a document state.
    pub fn replay(&self, doc: &mut Option<Fields>) {
        match self {
            DocWrite::Insert(fields) => *doc = Some(fields.clone()),
            DocWrite::Update(diff) => {
                if let Some(fields) = doc.as_mut() {
                    diff.apply(fields);
                }
            }
            DocWrite::Remove => *doc = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields_from_json;
    use serde_json::json;

    #[test]
    fn between_is_minimal() {
        let old = fields_from_json(json!({"a": 1, "b": 2, "c": 3}));
        let new = fields_from_json(json!({"a": 1, "b": 20, "d": 4}));

        let diff = FieldDiff::between(&old, &new);
        assert_eq!(diff.set, fields_from_json(json!({"b": 20, "d": 4})));
        assert_eq!(diff.unset, BTreeSet::from(["c".to_string()]));

        let mut applied = old.clone();
        diff.apply(&mut applied);
        assert_eq!(applied, new);
    }

    #[test]
    fn between_equal_is_empty() {
        let fields = fields_from_json(json!({"a": 1}));
        assert!(FieldDiff::between(&fields, &fields).is_empty());
    }

    #[test]
    fn set_and_unset_are_exclusive() {
        let diff = FieldDiff::new().set("a", json!(1)).unset("a");
        assert!(diff.set.is_empty());
        assert!(diff.unset.contains("a"));

        let diff = FieldDiff::new().unset("a").set("a", json!(2));
        assert!(diff.unset.is_empty());
        assert_eq!(diff.set["a"], json!(2));
    }

    #[test]
    fn doc_change_between_states() {
        let a = fields_from_json(json!({"x": 1}));
        let b = fields_from_json(json!({"x": 2}));

        assert_eq!(DocChange::between(None, None), None);
        assert_eq!(
            DocChange::between(None, Some(&a)),
            Some(DocChange::Added(a.clone()))
        );
        assert_eq!(DocChange::between(Some(&a), None), Some(DocChange::Removed));
        assert_eq!(DocChange::between(Some(&a), Some(&a)), None);
        assert_eq!(
            DocChange::between(Some(&a), Some(&b)),
            Some(DocChange::Changed(FieldDiff::new().set("x", json!(2))))
        );
    }

    #[test]
    fn replay_writes() {
        let mut doc = None;
        DocWrite::Update(FieldDiff::new().set("x", json!(1))).replay(&mut doc);
        assert_eq!(doc, None);

        DocWrite::Insert(fields_from_json(json!({"x": 1}))).replay(&mut doc);
        DocWrite::Update(FieldDiff::new().set("y", json!(2))).replay(&mut doc);
        assert_eq!(doc, Some(fields_from_json(json!({"x": 1, "y": 2}))));

        DocWrite::Remove.replay(&mut doc);
        assert_eq!(doc, None);
    }

    #[test]
    fn diff_serialization_skips_empty_parts() {
        let diff = FieldDiff::new().set("a", json!(1));
        assert_eq!(serde_json::to_string(&diff).unwrap(), r#"{"set":{"a":1}}"#);

        let parsed: FieldDiff = serde_json::from_str(r#"{"unset":["b"]}"#).unwrap();
        assert!(parsed.set.is_empty());
        assert!(parsed.unset.contains("b"));
    }
}
