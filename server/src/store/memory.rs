//! In-memory document store with live queries.
//!
//! Every document lives in its own slot behind its own mutex, so writes to
//! one document are atomic read-modify-writes while writes to different
//! documents never contend. Slots carry a version that grows with every
//! write and are never deleted, so a removed and re-inserted document keeps
//! counting.
//!
//! Observers are notified synchronously on the writing thread, after the
//! slot lock is released. Each observer remembers the last version it saw
//! per document and ignores anything older, which makes concurrent
//! notifications and the initial scan safe to interleave.

use super::query::Query;
use dashmap::DashMap;
use lagless_engine::{
    DocKey, Document, DocumentAccess, DocumentId, FieldDiff, Fields, MethodError,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Document store errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("document already exists: {0}")]
    DuplicateKey(DocKey),
}

impl From<StoreError> for MethodError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey(_) => MethodError::domain("duplicate-key", err.to_string()),
        }
    }
}

/// Callbacks of a live query.
pub trait ObserveCallbacks: Send + Sync {
    /// A document started matching.
    fn added(&self, id: &str, fields: &Fields);
    /// A matching document changed.
    fn changed(&self, id: &str, diff: &FieldDiff);
    /// A document stopped matching.
    fn removed(&self, id: &str);
}

#[derive(Debug, Default)]
struct Slot {
    version: u64,
    fields: Option<Fields>,
}

#[derive(Debug, Default)]
struct ObserverState {
    seen: HashMap<DocumentId, u64>,
    matched: HashMap<DocumentId, Fields>,
}

struct LiveObserver {
    query: Query,
    callbacks: Box<dyn ObserveCallbacks>,
    state: Mutex<ObserverState>,
}

impl LiveObserver {
    fn notify(&self, id: &str, version: u64, fields: Option<&Fields>) {
        let mut state = lock(&self.state);
        if state.seen.get(id).is_some_and(|seen| *seen >= version) {
            return;
        }
        state.seen.insert(id.to_string(), version);

        let now = fields
            .filter(|fields| self.query.matches(id, fields))
            .map(|fields| self.query.projected(fields));
        let before = match &now {
            Some(fields) => state.matched.insert(id.to_string(), fields.clone()),
            None => state.matched.remove(id),
        };

        // Delivered under the observer lock so callbacks see writes in
        // version order.
        match (before, now) {
            (None, Some(fields)) => self.callbacks.added(id, &fields),
            (Some(old), Some(new)) => {
                let diff = FieldDiff::between(&old, &new);
                if !diff.is_empty() {
                    self.callbacks.changed(id, &diff);
                }
            }
            (Some(_), None) => self.callbacks.removed(id),
            (None, None) => {}
        }
    }
}

#[derive(Default)]
struct Inner {
    docs: DashMap<DocKey, Arc<Mutex<Slot>>>,
    observers: DashMap<u64, Arc<LiveObserver>>,
    next_observer: AtomicU64,
}

/// The authoritative document store. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("documents", &self.inner.docs.len())
            .field("observers", &self.inner.observers.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a document's fields.
    pub fn get(&self, collection: &str, id: &str) -> Option<Fields> {
        let slot = self.existing_slot(&DocKey::new(collection, id))?;
        let fields = lock(&slot).fields.clone();
        fields
    }

    /// Prepare a live query.
    pub fn find(&self, query: Query) -> Cursor {
        Cursor {
            store: self.clone(),
            query,
        }
    }

    /// Insert a new document.
    pub fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        let key = DocKey::new(collection, document.id);
        let slot = self.slot(&key);
        let (version, fields) = {
            let mut slot = lock(&slot);
            if slot.fields.is_some() {
                return Err(StoreError::DuplicateKey(key));
            }
            slot.version += 1;
            slot.fields = Some(document.fields);
            (slot.version, slot.fields.clone())
        };
        self.notify(&key, version, fields.as_ref());
        Ok(())
    }

    /// Atomically apply a diff. Returns false if the document does not
    /// exist.
    pub fn update(&self, collection: &str, id: &str, diff: &FieldDiff) -> bool {
        let key = DocKey::new(collection, id);
        let Some(slot) = self.existing_slot(&key) else {
            return false;
        };
        let (version, fields) = {
            let mut slot = lock(&slot);
            let Some(fields) = slot.fields.as_mut() else {
                return false;
            };
            let before = fields.clone();
            diff.apply(fields);
            if *fields == before {
                return true;
            }
            slot.version += 1;
            (slot.version, slot.fields.clone())
        };
        self.notify(&key, version, fields.as_ref());
        true
    }

    /// Remove a document. Returns false if it does not exist.
    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let key = DocKey::new(collection, id);
        let Some(slot) = self.existing_slot(&key) else {
            return false;
        };
        let version = {
            let mut slot = lock(&slot);
            if slot.fields.take().is_none() {
                return false;
            }
            slot.version += 1;
            slot.version
        };
        self.notify(&key, version, None);
        true
    }

    /// Number of live documents in a collection.
    #[cfg(test)]
    pub fn count(&self, collection: &str) -> usize {
        self.find(Query::new(collection)).count()
    }

    fn slot(&self, key: &DocKey) -> Arc<Mutex<Slot>> {
        self.inner.docs.entry(key.clone()).or_default().clone()
    }

    fn existing_slot(&self, key: &DocKey) -> Option<Arc<Mutex<Slot>>> {
        self.inner.docs.get(key).map(|slot| slot.clone())
    }

    /// Slots of a collection, in id order.
    fn slots(&self, collection: &str) -> Vec<(DocumentId, Arc<Mutex<Slot>>)> {
        let mut slots: Vec<_> = self
            .inner
            .docs
            .iter()
            .filter(|entry| entry.key().collection == collection)
            .map(|entry| (entry.key().id.clone(), entry.value().clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    fn notify(&self, key: &DocKey, version: u64, fields: Option<&Fields>) {
        // Collected first: a callback may drop an observe handle.
        let observers: Vec<_> = self
            .inner
            .observers
            .iter()
            .filter(|entry| entry.query.collection == key.collection)
            .map(|entry| entry.value().clone())
            .collect();
        for observer in observers {
            observer.notify(&key.id, version, fields);
        }
    }

    fn observe(&self, query: Query, callbacks: Box<dyn ObserveCallbacks>) -> ObserveHandle {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        let observer = Arc::new(LiveObserver {
            query,
            callbacks,
            state: Mutex::new(ObserverState::default()),
        });
        // Registered before the scan so no write can slip between the two.
        self.inner.observers.insert(id, observer.clone());

        for (doc, slot) in self.slots(&observer.query.collection) {
            let (version, fields) = {
                let slot = lock(&slot);
                (slot.version, slot.fields.clone())
            };
            observer.notify(&doc, version, fields.as_ref());
        }

        ObserveHandle {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }
}

impl DocumentAccess for MemoryStore {
    fn find_one(&self, collection: &str, id: &str) -> Option<Fields> {
        self.get(collection, id)
    }

    fn find(&self, collection: &str) -> Vec<Document> {
        MemoryStore::find(self, Query::new(collection)).fetch()
    }

    fn insert(&mut self, collection: &str, document: Document) -> Result<(), MethodError> {
        Ok(MemoryStore::insert(self, collection, document)?)
    }

    fn update(&mut self, collection: &str, id: &str, diff: &FieldDiff) -> Result<bool, MethodError> {
        Ok(MemoryStore::update(self, collection, id, diff))
    }

    fn remove(&mut self, collection: &str, id: &str) -> Result<bool, MethodError> {
        Ok(MemoryStore::remove(self, collection, id))
    }
}

/// A query bound to a store.
#[derive(Debug, Clone)]
pub struct Cursor {
    store: MemoryStore,
    query: Query,
}

impl Cursor {
    pub fn collection(&self) -> &str {
        &self.query.collection
    }

    /// Current matching documents, projected, in id order.
    pub fn fetch(&self) -> Vec<Document> {
        self.store
            .slots(&self.query.collection)
            .into_iter()
            .filter_map(|(id, slot)| {
                let fields = lock(&slot).fields.clone()?;
                self.query
                    .matches(&id, &fields)
                    .then(|| Document::new(id, self.query.projected(&fields)))
            })
            .collect()
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.fetch().len()
    }

    /// Start a live query. Current matches are delivered as `added` before
    /// this returns; later writes arrive on the writing thread. Dropping the
    /// handle stops delivery.
    pub fn observe(&self, callbacks: impl ObserveCallbacks + 'static) -> ObserveHandle {
        self.store.observe(self.query.clone(), Box::new(callbacks))
    }
}

/// Keeps a live query running.
#[derive(Debug)]
#[must_use = "dropping the handle stops the live query"]
pub struct ObserveHandle {
    store: Weak<Inner>,
    id: u64,
}

impl ObserveHandle {
    /// Stop delivery.
    pub fn stop(self) {}
}

impl Drop for ObserveHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            inner.observers.remove(&self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
