//! Local collections - the reactive materialized view applications read.
//!
//! Every document is kept as a *base* layer, which is exactly what the merge
//! box asserts, plus an ordered stack of *overlays* holding the simulated
//! writes of pending method invocations. The visible document is the base
//! with the overlays replayed in invocation order.
//!
//! Only two parties write here: the merge box (through
//! [`LocalStore::apply_server`]) and method simulations (through
//! [`LocalStore::simulate`]). Observers see every visible change as a
//! minimal [`ChangeEvent`]; changes hidden behind an overlay, or undone
//! before anyone could see them, are never reported.

use crate::{
    error::Result, invariant_violated, CollectionName, DocChange, DocKey, DocWrite, Document,
    DocumentId, Error, FieldDiff, Fields, InvocationId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// A visible change to a local document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub collection: CollectionName,
    pub id: DocumentId,
    pub change: DocChange,
}

/// A simulated write attributed to an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedWrite {
    pub key: DocKey,
    pub write: DocWrite,
}

/// Callback invoked for every visible change.
pub type Observer = Box<dyn FnMut(&ChangeEvent) + Send>;

/// Handle returned by [`LocalStore::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// The layers of a single document.
#[derive(Debug, Clone, Default)]
struct Slot {
    base: Option<Fields>,
    overlays: Vec<(InvocationId, DocWrite)>,
    visible: Option<Fields>,
}

impl Slot {
    fn recompute(&mut self) {
        let mut doc = self.base.clone();
        for (_, write) in &self.overlays {
            write.replay(&mut doc);
        }
        self.visible = doc;
    }

    fn is_vacant(&self) -> bool {
        self.base.is_none() && self.overlays.is_empty()
    }
}

/// The documents of one collection.
#[derive(Debug, Clone, Default)]
pub struct LocalCollection {
    docs: BTreeMap<DocumentId, Slot>,
}

impl LocalCollection {
    /// Visible documents in id order.
    fn visible(&self) -> impl Iterator<Item = (&DocumentId, &Fields)> {
        self.docs
            .iter()
            .filter_map(|(id, slot)| slot.visible.as_ref().map(|fields| (id, fields)))
    }

    /// Count of visible documents.
    pub fn len(&self) -> usize {
        self.visible().count()
    }

    /// Check if no document is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The client-side store: all local collections plus their observers.
#[derive(Default)]
pub struct LocalStore {
    collections: BTreeMap<CollectionName, LocalCollection>,
    /// Documents carrying overlays, per invocation
    touched: HashMap<InvocationId, BTreeSet<DocKey>>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStore")
            .field("collections", &self.collections)
            .field("touched", &self.touched)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for visible changes.
    pub fn observe(&mut self, observer: impl FnMut(&ChangeEvent) + Send + 'static) -> ObserverId {
        self.next_observer += 1;
        let id = ObserverId(self.next_observer);
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    /// Get a visible document.
    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.visible(collection, id)
            .map(|fields| Document::new(id, fields.clone()))
    }

    fn visible(&self, collection: &str, id: &str) -> Option<&Fields> {
        self.collections
            .get(collection)
            .and_then(|c| c.docs.get(id))
            .and_then(|slot| slot.visible.as_ref())
    }

    /// Query visible documents in a collection.
    pub fn find(&self, collection: &str) -> LocalQuery<'_> {
        LocalQuery::new(self.collections.get(collection))
    }

    /// Get a collection by name.
    pub fn collection(&self, name: &str) -> Option<&LocalCollection> {
        self.collections.get(name)
    }

    /// Invocations that still have overlays on this document.
    pub fn pending_invocations(&self, collection: &str, id: &str) -> Vec<&InvocationId> {
        self.collections
            .get(collection)
            .and_then(|c| c.docs.get(id))
            .map(|slot| slot.overlays.iter().map(|(inv, _)| inv).collect())
            .unwrap_or_default()
    }

    /// Check if an invocation has overlays anywhere.
    pub fn has_overlays(&self, invocation: &str) -> bool {
        self.touched.contains_key(invocation)
    }

    /// Apply a change coming out of the merge box to the base layer.
    ///
    /// # Panics
    ///
    /// If the change does not fit the base layer: adding a document the
    /// merge box already reported, or changing/removing one it never did.
    pub fn apply_server(&mut self, collection: &str, id: &str, change: DocChange) {
        let key = DocKey::new(collection, id);
        let slot = self.slot_mut(&key);
        let before = slot.visible.clone();

        match change {
            DocChange::Added(fields) => {
                if slot.base.is_some() {
                    invariant_violated("local store", format_args!("server added {key} twice"));
                }
                slot.base = Some(fields);
            }
            DocChange::Changed(diff) => match slot.base.as_mut() {
                Some(base) => diff.apply(base),
                None => invariant_violated("local store", format_args!("server changed unknown {key}")),
            },
            DocChange::Removed => {
                if slot.base.take().is_none() {
                    invariant_violated("local store", format_args!("server removed unknown {key}"));
                }
            }
        }

        slot.recompute();
        self.refresh(&key, before);
    }

    /// Replace the whole base layer, reporting only the visible differences.
    pub fn reset_base(&mut self, documents: BTreeMap<DocKey, Fields>) {
        let mut keys: BTreeSet<DocKey> = self
            .collections
            .iter()
            .flat_map(|(collection, c)| {
                c.docs
                    .iter()
                    .filter(|(_, slot)| slot.base.is_some())
                    .map(move |(id, _)| DocKey::new(collection.clone(), id.clone()))
            })
            .collect();
        keys.extend(documents.keys().cloned());

        let mut documents = documents;
        for key in keys {
            let slot = self.slot_mut(&key);
            let before = slot.visible.clone();
            slot.base = documents.remove(&key);
            slot.recompute();
            self.refresh(&key, before);
        }
    }

    /// Start staging the simulated writes of an invocation.
    pub fn simulate(&mut self, invocation: &str) -> Simulation<'_> {
        Simulation {
            store: self,
            invocation: invocation.to_string(),
            before: BTreeMap::new(),
            writes: Vec::new(),
            finished: false,
        }
    }

    /// Undo every simulated write of an invocation.
    ///
    /// Each touched document goes back to the base layer plus the overlays
    /// of other pending invocations. Retracting an invocation without
    /// overlays (including one already retracted) is a no-op and returns
    /// false.
    pub fn retract(&mut self, invocation: &str) -> bool {
        let Some(keys) = self.touched.remove(invocation) else {
            return false;
        };
        for key in keys {
            let slot = self.slot_mut(&key);
            let before = slot.visible.clone();
            slot.overlays.retain(|(inv, _)| inv != invocation);
            slot.recompute();
            self.refresh(&key, before);
        }
        true
    }

    fn slot_mut(&mut self, key: &DocKey) -> &mut Slot {
        self.collections
            .entry(key.collection.clone())
            .or_default()
            .docs
            .entry(key.id.clone())
            .or_default()
    }

    fn push_overlay(&mut self, invocation: &str, key: &DocKey, write: DocWrite) {
        let slot = self.slot_mut(key);
        slot.overlays.push((invocation.to_string(), write));
        slot.recompute();
        self.touched
            .entry(invocation.to_string())
            .or_default()
            .insert(key.clone());
    }

    /// Drop overlays of an invocation without reporting anything.
    fn discard_overlays(&mut self, invocation: &str) {
        let Some(keys) = self.touched.remove(invocation) else {
            return;
        };
        for key in keys {
            let slot = self.slot_mut(&key);
            slot.overlays.retain(|(inv, _)| inv != invocation);
            slot.recompute();
            self.cleanup(&key);
        }
    }

    /// Report the visible change of a document since `before`.
    fn refresh(&mut self, key: &DocKey, before: Option<Fields>) {
        let after = self.visible(&key.collection, &key.id).cloned();
        if let Some(change) = DocChange::between(before.as_ref(), after.as_ref()) {
            let event = ChangeEvent {
                collection: key.collection.clone(),
                id: key.id.clone(),
                change,
            };
            for (_, observer) in &mut self.observers {
                observer(&event);
            }
        }
        self.cleanup(key);
    }

    fn cleanup(&mut self, key: &DocKey) {
        if let Some(collection) = self.collections.get_mut(&key.collection) {
            if collection.docs.get(&key.id).is_some_and(Slot::is_vacant) {
                collection.docs.remove(&key.id);
            }
            if collection.docs.is_empty() {
                self.collections.remove(&key.collection);
            }
        }
    }
}

/// Staged simulated writes of one invocation.
///
/// Writes are visible to reads through this handle immediately, but
/// observers only hear about them on [`Simulation::commit`]. Dropping the
/// handle without committing discards every staged write.
pub struct Simulation<'a> {
    store: &'a mut LocalStore,
    invocation: InvocationId,
    /// Visible state of each touched document before its first write
    before: BTreeMap<DocKey, Option<Fields>>,
    writes: Vec<SimulatedWrite>,
    finished: bool,
}

impl Simulation<'_> {
    /// The invocation the writes are attributed to.
    pub fn invocation_id(&self) -> &str {
        &self.invocation
    }

    /// Get a visible document, including staged writes.
    pub fn get(&self, collection: &str, id: &str) -> Option<Document> {
        self.store.get(collection, id)
    }

    /// All visible documents of a collection, including staged writes.
    pub fn find(&self, collection: &str) -> Vec<Document> {
        self.store.find(collection).all()
    }

    /// Insert a new document.
    pub fn insert(&mut self, collection: &str, document: Document) -> Result<()> {
        if self.store.visible(collection, &document.id).is_some() {
            return Err(Error::DocumentAlreadyExists {
                collection: collection.to_string(),
                id: document.id,
            });
        }
        let key = DocKey::new(collection, document.id);
        self.write(key, DocWrite::Insert(document.fields));
        Ok(())
    }

    /// Update a document. Returns false if it is not visible.
    pub fn update(&mut self, collection: &str, id: &str, diff: &FieldDiff) -> bool {
        if self.store.visible(collection, id).is_none() {
            return false;
        }
        if !diff.is_empty() {
            self.write(DocKey::new(collection, id), DocWrite::Update(diff.clone()));
        }
        true
    }

    /// Remove a document. Returns false if it is not visible.
    pub fn remove(&mut self, collection: &str, id: &str) -> bool {
        if self.store.visible(collection, id).is_none() {
            return false;
        }
        self.write(DocKey::new(collection, id), DocWrite::Remove);
        true
    }

    fn write(&mut self, key: DocKey, write: DocWrite) {
        if !self.before.contains_key(&key) {
            let visible = self.store.visible(&key.collection, &key.id).cloned();
            self.before.insert(key.clone(), visible);
        }
        self.store.push_overlay(&self.invocation, &key, write.clone());
        self.writes.push(SimulatedWrite { key, write });
    }

    /// Publish the staged writes to observers and return them.
    pub fn commit(mut self) -> Vec<SimulatedWrite> {
        self.finished = true;
        for (key, before) in std::mem::take(&mut self.before) {
            self.store.refresh(&key, before);
        }
        std::mem::take(&mut self.writes)
    }

    /// Discard all staged writes without notifying anyone.
    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        self.finished = true;
        self.store.discard_overlays(&self.invocation);
    }
}

impl Drop for Simulation<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

/// Builder for querying visible documents in a collection.
#[derive(Debug)]
pub struct LocalQuery<'a> {
    collection: Option<&'a LocalCollection>,
}

impl<'a> LocalQuery<'a> {
    fn new(collection: Option<&'a LocalCollection>) -> Self {
        Self { collection }
    }

    fn iter(&self) -> impl Iterator<Item = (&'a DocumentId, &'a Fields)> + 'a {
        self.collection.into_iter().flat_map(|c| c.visible())
    }

    /// Get all visible documents in id order.
    pub fn all(self) -> Vec<Document> {
        self.iter()
            .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
            .collect()
    }

    /// Get the first visible document.
    pub fn first(self) -> Option<Document> {
        self.iter()
            .next()
            .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
    }

    /// Count visible documents.
    pub fn count(self) -> usize {
        self.iter().count()
    }

    /// Filter documents by a predicate on their fields.
    pub fn filter<F>(self, predicate: F) -> Vec<Document>
    where
        F: Fn(&Fields) -> bool,
    {
        self.iter()
            .filter(|(_, fields)| predicate(fields))
            .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
            .collect()
    }
}
