//! The merge box: reconciles documents asserted by several subscriptions
//! into one visible document per id.
//!
//! # Algorithm
//!
//! Every `(collection, id)` has a [`MergeEntry`] holding one field snapshot
//! per subscription that currently asserts the document. The number of
//! snapshots is the entry's reference count; the entry is dropped exactly
//! when it reaches zero.
//!
//! Each field assertion is stamped with the sequence number of the event
//! that made it. The visible value of a field is the one carried by the
//! most recent assertion among the subscriptions still asserting that
//! field, so withdrawing the winner falls back to the next most recent one.
//!
//! Every event returns the minimal [`DocChange`] downstream consumers must
//! apply, or `None` when nothing visible changed.

use crate::{
    invariant_violated, CollectionName, DocChange, DocKey, DocumentId, FieldDiff, FieldName,
    Fields, SubscriptionId,
};
use std::collections::{BTreeMap, HashMap};

/// A single field value asserted by one subscription.
#[derive(Debug, Clone, PartialEq)]
struct Assertion {
    value: serde_json::Value,
    /// Emission order of the event that made this assertion
    seq: u64,
}

type Snapshot = BTreeMap<FieldName, Assertion>;

/// Per-document bookkeeping of which subscriptions assert which fields.
#[derive(Debug, Clone, Default)]
pub struct MergeEntry {
    snapshots: BTreeMap<SubscriptionId, Snapshot>,
}

impl MergeEntry {
    /// Number of subscriptions currently asserting the document.
    pub fn ref_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether `sub` currently asserts the document.
    pub fn is_asserted_by(&self, sub: &str) -> bool {
        self.snapshots.contains_key(sub)
    }

    /// Subscriptions asserting the document, in id order.
    pub fn subscribers(&self) -> impl Iterator<Item = &SubscriptionId> {
        self.snapshots.keys()
    }

    /// The fields last reported by `sub`.
    pub fn snapshot(&self, sub: &str) -> Option<Fields> {
        self.snapshots.get(sub).map(|snapshot| {
            snapshot
                .iter()
                .map(|(field, assertion)| (field.clone(), assertion.value.clone()))
                .collect()
        })
    }

    /// The subscription whose assertion of `field` is currently visible.
    pub fn owner(&self, field: &str) -> Option<&SubscriptionId> {
        self.snapshots
            .iter()
            .filter_map(|(sub, snapshot)| snapshot.get(field).map(|a| (sub, a.seq)))
            .max_by_key(|(_, seq)| *seq)
            .map(|(sub, _)| sub)
    }

    /// The visible value of a single field.
    fn winner(&self, field: &str) -> Option<&serde_json::Value> {
        self.snapshots
            .values()
            .filter_map(|snapshot| snapshot.get(field))
            .max_by_key(|assertion| assertion.seq)
            .map(|assertion| &assertion.value)
    }

    /// The merged document: union of asserted fields, most recent wins.
    pub fn visible(&self) -> Fields {
        let mut fields = Fields::new();
        for snapshot in self.snapshots.values() {
            for name in snapshot.keys() {
                if !fields.contains_key(name) {
                    if let Some(value) = self.winner(name) {
                        fields.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        fields
    }

    /// Capture the visible values of `fields` before a mutation.
    fn capture<'a>(
        &self,
        fields: impl IntoIterator<Item = &'a FieldName>,
    ) -> BTreeMap<FieldName, Option<serde_json::Value>> {
        fields
            .into_iter()
            .map(|name| (name.clone(), self.winner(name).cloned()))
            .collect()
    }

    /// Diff the captured values against the current visible values.
    fn diff_since(&self, before: BTreeMap<FieldName, Option<serde_json::Value>>) -> Option<FieldDiff> {
        let mut diff = FieldDiff::new();
        for (name, old) in before {
            match self.winner(&name) {
                Some(new) if old.as_ref() != Some(new) => {
                    diff.set.insert(name, new.clone());
                }
                None if old.is_some() => {
                    diff.unset.insert(name);
                }
                _ => {}
            }
        }
        (!diff.is_empty()).then_some(diff)
    }
}

fn stamp(fields: Fields, seq: u64) -> Snapshot {
    fields
        .into_iter()
        .map(|(name, value)| (name, Assertion { value, seq }))
        .collect()
}

/// Merges the result sets of all subscriptions into visible documents.
#[derive(Debug, Clone, Default)]
pub struct MergeBox {
    collections: HashMap<CollectionName, HashMap<DocumentId, MergeEntry>>,
    /// Last assigned emission sequence number
    sequence: u64,
}

impl MergeBox {
    /// Create an empty merge box.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// `sub` starts asserting document `id` with `fields`.
    ///
    /// # Panics
    ///
    /// If `sub` already asserts the document.
    pub fn added(
        &mut self,
        sub: &str,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Option<DocChange> {
        let seq = self.next_seq();
        let docs = self.collections.entry(collection.to_string()).or_default();

        match docs.get_mut(id) {
            None => {
                let mut entry = MergeEntry::default();
                entry
                    .snapshots
                    .insert(sub.to_string(), stamp(fields.clone(), seq));
                docs.insert(id.to_string(), entry);
                Some(DocChange::Added(fields))
            }
            Some(entry) => {
                if entry.is_asserted_by(sub) {
                    invariant_violated(
                        "merge box",
                        format_args!("subscription {sub} added {collection}/{id} twice"),
                    );
                }
                let before = entry.capture(fields.keys());
                entry.snapshots.insert(sub.to_string(), stamp(fields, seq));
                entry.diff_since(before).map(DocChange::Changed)
            }
        }
    }

    /// `sub` changed some fields of a document it asserts.
    ///
    /// # Panics
    ///
    /// If `sub` does not assert the document.
    pub fn changed(
        &mut self,
        sub: &str,
        collection: &str,
        id: &str,
        diff: &FieldDiff,
    ) -> Option<DocChange> {
        let seq = self.next_seq();
        let entry = self.entry_mut(sub, collection, id, "changed");

        let before = entry.capture(diff.fields());
        let snapshot = entry
            .snapshots
            .get_mut(sub)
            .unwrap_or_else(|| invariant_violated("merge box", format_args!("lost snapshot of {sub}")));
        for (name, value) in &diff.set {
            snapshot.insert(
                name.clone(),
                Assertion {
                    value: value.clone(),
                    seq,
                },
            );
        }
        for name in &diff.unset {
            snapshot.remove(name);
        }
        entry.diff_since(before).map(DocChange::Changed)
    }

    /// `sub` no longer asserts the document.
    ///
    /// # Panics
    ///
    /// If `sub` does not assert the document.
    pub fn removed(&mut self, sub: &str, collection: &str, id: &str) -> Option<DocChange> {
        let entry = self.entry_mut(sub, collection, id, "removed");

        let withdrawn = entry.snapshots.remove(sub).unwrap_or_default();
        if entry.snapshots.is_empty() {
            self.drop_entry(collection, id);
            return Some(DocChange::Removed);
        }

        // Re-capture as if the withdrawn snapshot were still in place.
        let before = withdrawn
            .iter()
            .map(|(name, withdrawn_assertion)| {
                let visible = entry
                    .snapshots
                    .values()
                    .filter_map(|snapshot| snapshot.get(name))
                    .chain(std::iter::once(withdrawn_assertion))
                    .max_by_key(|assertion| assertion.seq)
                    .map(|assertion| assertion.value.clone());
                (name.clone(), visible)
            })
            .collect();
        entry.diff_since(before).map(DocChange::Changed)
    }

    fn entry_mut(&mut self, sub: &str, collection: &str, id: &str, event: &str) -> &mut MergeEntry {
        match self
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
        {
            Some(entry) if entry.is_asserted_by(sub) => entry,
            _ => invariant_violated(
                "merge box",
                format_args!("subscription {sub} {event} {collection}/{id} without adding it"),
            ),
        }
    }

    fn drop_entry(&mut self, collection: &str, id: &str) {
        if let Some(docs) = self.collections.get_mut(collection) {
            docs.remove(id);
            if docs.is_empty() {
                self.collections.remove(collection);
            }
        }
    }

    /// Bookkeeping for a document, if any subscription asserts it.
    pub fn entry(&self, collection: &str, id: &str) -> Option<&MergeEntry> {
        self.collections
            .get(collection)
            .and_then(|docs| docs.get(id))
    }

    /// The merged document, if any subscription asserts it.
    pub fn get(&self, collection: &str, id: &str) -> Option<Fields> {
        self.entry(collection, id).map(MergeEntry::visible)
    }

    /// Reference count of a document (zero when absent).
    pub fn ref_count(&self, collection: &str, id: &str) -> usize {
        self.entry(collection, id).map_or(0, MergeEntry::ref_count)
    }

    /// All merged documents.
    pub fn documents(&self) -> impl Iterator<Item = (DocKey, Fields)> + '_ {
        self.collections.iter().flat_map(|(collection, docs)| {
            docs.iter()
                .map(move |(id, entry)| (DocKey::new(collection.clone(), id.clone()), entry.visible()))
        })
    }

    /// Number of documents across all collections.
    pub fn len(&self) -> usize {
        self.collections.values().map(HashMap::len).sum()
    }

    /// Check if no document is asserted.
    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields_from_json;
    use serde_json::json;

    fn f(value: serde_json::Value) -> Fields {
        fields_from_json(value)
    }

    #[test]
    fn first_add_emits_full_document() {
        let mut merge = MergeBox::new();
        let change = merge.added("s1", "posts", "1", f(json!({"title": "A"})));
        assert_eq!(change, Some(DocChange::Added(f(json!({"title": "A"})))));
        assert_eq!(merge.ref_count("posts", "1"), 1);
    }

    #[test]
    fn overlapping_add_emits_only_new_fields() {
        let mut merge = MergeBox::new();
        merge.added("s1", "posts", "1", f(json!({"title": "A", "body": "x"})));

        let change = merge.added("s2", "posts", "1", f(json!({"title": "A", "author": "X"})));
        assert_eq!(
            change,
            Some(DocChange::Changed(FieldDiff::new().set("author", json!("X"))))
        );
        assert_eq!(merge.ref_count("posts", "1"), 2);

        // Identical overlapping add is silent
        let change = merge.added("s3", "posts", "1", f(json!({"title": "A"})));
        assert_eq!(change, None);
        assert_eq!(merge.ref_count("posts", "1"), 3);
    }

    #[test]
    fn removal_falls_back_to_other_subscription() {
        let mut merge = MergeBox::new();
        merge.added("s1", "posts", "1", f(json!({"title": "old"})));
        merge.added("s2", "posts", "1", f(json!({"title": "new"})));
        assert_eq!(merge.get("posts", "1"), Some(f(json!({"title": "new"}))));
        assert_eq!(merge.entry("posts", "1").unwrap().owner("title").unwrap(), "s2");

        let change = merge.removed("s2", "posts", "1");
        assert_eq!(
            change,
            Some(DocChange::Changed(FieldDiff::new().set("title", json!("old"))))
        );
        assert_eq!(merge.get("posts", "1"), Some(f(json!({"title": "old"}))));
    }

    #[test]
    fn removing_loser_is_silent() {
        let mut merge = MergeBox::new();
        merge.added("s1", "posts", "1", f(json!({"title": "old"})));
        merge.added("s2", "posts", "1", f(json!({"title": "new"})));

        assert_eq!(merge.removed("s1", "posts", "1"), None);
        assert_eq!(merge.get("posts", "1"), Some(f(json!({"title": "new"}))));
    }

    #[test]
    fn last_removal_removes_document() {
        let mut merge = MergeBox::new();
        merge.added("s1", "posts", "1", f(json!({"title": "A"})));
        assert_eq!(merge.removed("s1", "posts", "1"), Some(DocChange::Removed));
        assert!(merge.entry("posts", "1").is_none());
        assert!(merge.is_empty());
    }

    #[test]
    fn change_by_loser_does_not_show() {
        let mut merge = MergeBox::new();
        merge.added("s1", "posts", "1", f(json!({"title": "A"})));
        merge.added("s2", "posts", "1", f(json!({"title": "B"})));

        // s1 re-asserts: it becomes the most recent assertion and wins
        let change = merge.changed("s1", "posts", "1", &FieldDiff::new().set("title", json!("C")));
        assert_eq!(
            change,
            Some(DocChange::Changed(FieldDiff::new().set("title", json!("C"))))
        );

        // s2 sets the value s1 already shows: nothing visible changes
        let change = merge.changed("s2", "posts", "1", &FieldDiff::new().set("title", json!("C")));
        assert_eq!(change, None);
        assert_eq!(merge.entry("posts", "1").unwrap().owner("title").unwrap(), "s2");
    }

    #[test]
    fn unset_falls_back_or_clears() {
        let mut merge = MergeBox::new();
        merge.added("s1", "posts", "1", f(json!({"title": "A", "tag": "x"})));
        merge.added("s2", "posts", "1", f(json!({"title": "B"})));

        let change = merge.changed("s2", "posts", "1", &FieldDiff::new().unset("title"));
        assert_eq!(
            change,
            Some(DocChange::Changed(FieldDiff::new().set("title", json!("A"))))
        );

        let change = merge.changed("s1", "posts", "1", &FieldDiff::new().unset("tag"));
        assert_eq!(change, Some(DocChange::Changed(FieldDiff::new().unset("tag"))));
        assert_eq!(merge.get("posts", "1"), Some(f(json!({"title": "A"}))));

        // Unsetting a field the subscription never asserted is silent
        assert_eq!(
            merge.changed("s2", "posts", "1", &FieldDiff::new().unset("missing")),
            None
        );
    }

    #[test]
    fn collections_are_independent() {
        let mut merge = MergeBox::new();
        merge.added("s1", "posts", "1", f(json!({"a": 1})));
        merge.added("s1", "users", "1", f(json!({"b": 2})));
        assert_eq!(merge.len(), 2);

        merge.removed("s1", "posts", "1");
        assert_eq!(merge.get("users", "1"), Some(f(json!({"b": 2}))));
        assert_eq!(merge.documents().count(), 1);
    }

    #[test]
    #[should_panic(expected = "added posts/1 twice")]
    fn double_add_is_fatal() {
        let mut merge = MergeBox::new();
        merge.added("s1", "posts", "1", Fields::new());
        merge.added("s1", "posts", "1", Fields::new());
    }

    #[test]
    #[should_panic(expected = "without adding it")]
    fn remove_without_add_is_fatal() {
        let mut merge = MergeBox::new();
        merge.added("s1", "posts", "1", Fields::new());
        merge.removed("s2", "posts", "1");
    }

    #[test]
    #[should_panic(expected = "without adding it")]
    fn change_unknown_document_is_fatal() {
        let mut merge = MergeBox::new();
        merge.changed("s1", "posts", "1", &FieldDiff::new().set("a", json!(1)));
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        const SUBS: [&str; 3] = ["s1", "s2", "s3"];
        const FIELDS: [&str; 3] = ["a", "b", "c"];

        #[derive(Debug, Clone)]
        enum Event {
            Add(usize, Vec<(usize, u8)>),
            Change(usize, Vec<(usize, Option<u8>)>),
            Remove(usize),
        }

        fn arb_event() -> impl Strategy<Value = Event> {
            prop_oneof![
                (0..3usize, prop::collection::vec((0..3usize, 0..3u8), 0..4))
                    .prop_map(|(s, fields)| Event::Add(s, fields)),
                (
                    0..3usize,
                    prop::collection::vec((0..3usize, prop::option::of(0..3u8)), 1..4)
                )
                    .prop_map(|(s, fields)| Event::Change(s, fields)),
                (0..3usize).prop_map(Event::Remove),
            ]
        }

        /// Independent model: per subscription, field -> (value, time set).
        #[derive(Default)]
        struct Model {
            snapshots: BTreeMap<usize, BTreeMap<usize, (u8, u64)>>,
            clock: u64,
        }

        impl Model {
            fn visible(&self) -> Option<Fields> {
                if self.snapshots.is_empty() {
                    return None;
                }
                let mut best: BTreeMap<usize, (u8, u64)> = BTreeMap::new();
                for snapshot in self.snapshots.values() {
                    for (field, (value, at)) in snapshot {
                        match best.get(field) {
                            Some((_, best_at)) if best_at > at => {}
                            _ => {
                                best.insert(*field, (*value, *at));
                            }
                        }
                    }
                }
                Some(
                    best.into_iter()
                        .map(|(field, (value, _))| (FIELDS[field].to_string(), json!(value)))
                        .collect(),
                )
            }
        }

        /// Apply a downstream change, asserting it is well-formed and not a no-op.
        fn apply_downstream(view: &mut Option<Fields>, change: DocChange) -> Result<(), TestCaseError> {
            match change {
                DocChange::Added(fields) => {
                    prop_assert!(view.is_none(), "added an already visible document");
                    *view = Some(fields);
                }
                DocChange::Removed => {
                    prop_assert!(view.is_some(), "removed an absent document");
                    *view = None;
                }
                DocChange::Changed(diff) => {
                    prop_assert!(!diff.is_empty(), "emitted an empty diff");
                    let doc = view.as_mut().ok_or_else(|| TestCaseError::fail("changed an absent document"))?;
                    for (name, value) in &diff.set {
                        prop_assert_ne!(doc.get(name), Some(value), "no-op set of {}", name);
                    }
                    for name in &diff.unset {
                        prop_assert!(doc.contains_key(name), "no-op unset of {}", name);
                    }
                    diff.apply(doc);
                }
            }
            Ok(())
        }

        proptest! {
            #[test]
            fn prop_merge_matches_model(events in prop::collection::vec(arb_event(), 1..40)) {
                let mut merge = MergeBox::new();
                let mut model = Model::default();
                let mut downstream: Option<Fields> = None;

                for event in events {
                    model.clock += 1;
                    let change = match event {
                        Event::Add(s, fields) => {
                            if model.snapshots.contains_key(&s) {
                                continue;
                            }
                            let snapshot: BTreeMap<usize, (u8, u64)> = fields
                                .iter()
                                .map(|(field, value)| (*field, (*value, model.clock)))
                                .collect();
                            let fields: Fields = snapshot
                                .iter()
                                .map(|(field, (value, _))| (FIELDS[*field].to_string(), json!(value)))
                                .collect();
                            model.snapshots.insert(s, snapshot);
                            merge.added(SUBS[s], "docs", "d", fields)
                        }
                        Event::Change(s, fields) => {
                            let Some(snapshot) = model.snapshots.get_mut(&s) else {
                                continue;
                            };
                            let mut diff = FieldDiff::new();
                            for (field, value) in fields {
                                diff = match value {
                                    Some(value) => diff.set(FIELDS[field], json!(value)),
                                    None => diff.unset(FIELDS[field]),
                                };
                            }
                            for (name, value) in &diff.set {
                                let field = FIELDS.iter().position(|f| f == name).unwrap();
                                let value = value.as_u64().unwrap() as u8;
                                snapshot.insert(field, (value, model.clock));
                            }
                            for name in &diff.unset {
                                let field = FIELDS.iter().position(|f| f == name).unwrap();
                                snapshot.remove(&field);
                            }
                            merge.changed(SUBS[s], "docs", "d", &diff)
                        }
                        Event::Remove(s) => {
                            if model.snapshots.remove(&s).is_none() {
                                continue;
                            }
                            merge.removed(SUBS[s], "docs", "d")
                        }
                    };

                    if let Some(change) = change {
                        apply_downstream(&mut downstream, change)?;
                    }

                    // Downstream view, merge box view and model agree
                    let expected = model.visible();
                    prop_assert_eq!(&merge.get("docs", "d"), &expected);
                    prop_assert_eq!(&downstream, &expected);

                    // Ref count equals the number of asserting subscriptions
                    prop_assert_eq!(merge.ref_count("docs", "d"), model.snapshots.len());
                    prop_assert_eq!(merge.entry("docs", "d").is_some(), !model.snapshots.is_empty());

                    // Visible field set is the union of asserted fields
                    if let Some(visible) = merge.get("docs", "d") {
                        let union: BTreeSet<String> = model
                            .snapshots
                            .values()
                            .flat_map(|s| s.keys().map(|f| FIELDS[*f].to_string()))
                            .collect();
                        let keys: BTreeSet<String> = visible.keys().cloned().collect();
                        prop_assert_eq!(keys, union);
                    }
                }
            }

            #[test]
            fn prop_most_recent_assertion_wins(first in 0..3usize, second in 0..3usize) {
                prop_assume!(first != second);
                let mut merge = MergeBox::new();
                merge.added(SUBS[first], "docs", "d", f(json!({"a": "first"})));
                merge.added(SUBS[second], "docs", "d", f(json!({"a": "second"})));
                prop_assert_eq!(merge.get("docs", "d"), Some(f(json!({"a": "second"}))));

                // Withdrawing the winner re-applies the rule
                merge.removed(SUBS[second], "docs", "d");
                prop_assert_eq!(merge.get("docs", "d"), Some(f(json!({"a": "first"}))));
            }
        }
    }
}
