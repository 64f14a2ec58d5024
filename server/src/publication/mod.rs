//! Publication registry.
//!
//! A publication is a named function run once per subscription. It either
//! returns cursors, which are observed and forwarded to the subscription
//! automatically, or takes full control and emits through the
//! [`Subscription`] handle itself.

mod subscription;

pub use subscription::{PublishError, Subscription};

use crate::store::{Cursor, MemoryStore, ObserveCallbacks};
use lagless_engine::{FieldDiff, Fields, MethodError};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// What a publication hands back.
#[derive(Debug)]
pub enum Publish {
    /// Observe these cursors and mark the subscription ready
    Cursors(Vec<Cursor>),
    /// The publication emits and marks ready on its own
    Manual,
}

/// Result of running a publication.
pub type PublishResult = Result<Publish, MethodError>;

/// A publication body.
pub type PublicationHandler =
    Arc<dyn Fn(&Subscription, &MemoryStore, &serde_json::Value) -> PublishResult + Send + Sync>;

/// Publications by name.
#[derive(Clone, Default)]
pub struct PublicationRegistry {
    publications: HashMap<String, PublicationHandler>,
}

impl fmt::Debug for PublicationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.publications.keys().collect();
        names.sort();
        f.debug_struct("PublicationRegistry")
            .field("publications", &names)
            .finish()
    }
}

impl PublicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publication, replacing any previous one of that name.
    pub fn publish<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Subscription, &MemoryStore, &serde_json::Value) -> PublishResult
            + Send
            + Sync
            + 'static,
    {
        self.publications.insert(name.into(), Arc::new(handler));
        self
    }

    /// Run the publication named by `sub` for it.
    ///
    /// Failures stop the subscription with the error.
    pub fn start(&self, sub: &Subscription, store: &MemoryStore, params: &serde_json::Value) {
        let Some(handler) = self.publications.get(sub.name()) else {
            tracing::warn!(sub_id = %sub.id(), name = %sub.name(), "Unknown publication");
            sub.stop(Some(MethodError::domain(
                "sub-not-found",
                format!("publication '{}' not found", sub.name()),
            )));
            return;
        };

        match handler(sub, store, params) {
            Ok(Publish::Cursors(cursors)) => {
                if let Err(error) = observe_cursors(sub, cursors) {
                    sub.stop(Some(error));
                    return;
                }
                sub.mark_ready();
            }
            Ok(Publish::Manual) => {}
            Err(error) => {
                tracing::debug!(sub_id = %sub.id(), name = %sub.name(), %error, "Publication failed");
                sub.stop(Some(error));
            }
        }
    }
}

fn observe_cursors(sub: &Subscription, cursors: Vec<Cursor>) -> Result<(), MethodError> {
    let mut collections = BTreeSet::new();
    for cursor in &cursors {
        if !collections.insert(cursor.collection()) {
            return Err(MethodError::domain(
                "duplicate-collection",
                format!("publication returned two cursors for '{}'", cursor.collection()),
            ));
        }
    }

    for cursor in cursors {
        let handle = cursor.observe(Forward {
            sub: sub.clone(),
            collection: cursor.collection().to_string(),
        });
        sub.on_stop(move || handle.stop());
    }
    Ok(())
}

/// Forwards a cursor's changes to a subscription.
struct Forward {
    sub: Subscription,
    collection: String,
}

impl ObserveCallbacks for Forward {
    fn added(&self, id: &str, fields: &Fields) {
        if let Err(e) = self.sub.emit_added(self.collection.as_str(), id, fields.clone()) {
            tracing::error!(sub_id = %self.sub.id(), "Observer emit failed: {}", e);
        }
    }

    fn changed(&self, id: &str, diff: &FieldDiff) {
        if let Err(e) = self.sub.emit_changed(self.collection.as_str(), id, diff.clone()) {
            tracing::error!(sub_id = %self.sub.id(), "Observer emit failed: {}", e);
        }
    }

    fn removed(&self, id: &str) {
        if let Err(e) = self.sub.emit_removed(self.collection.as_str(), id) {
            tracing::error!(sub_id = %self.sub.id(), "Observer emit failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Query;
    use crate::websocket::ServerMessage;
    use lagless_engine::{fields_from_json, Document};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn registry() -> PublicationRegistry {
        let mut registry = PublicationRegistry::new();
        registry
            .publish("all", |_, store, _| {
                Ok(Publish::Cursors(vec![store.find(Query::new("todos"))]))
            })
            .publish("twice", |_, store, _| {
                Ok(Publish::Cursors(vec![
                    store.find(Query::new("todos")),
                    store.find(Query::new("todos")),
                ]))
            })
            .publish("denied", |_, _, _| Err(MethodError::authorization("nope")))
            .publish("manual", |sub, _, params| {
                sub.emit_added("counters", "c", fields_from_json(params.clone()))
                    .map_err(|e| MethodError::domain("publish", e.to_string()))?;
                sub.mark_ready();
                Ok(Publish::Manual)
            });
        registry
    }

    fn start(name: &str, store: &MemoryStore) -> (Subscription, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = Subscription::new("s1", name, None, tx);
        registry().start(&sub, store, &json!({"n": 1}));
        (sub, rx)
    }

    #[test]
    fn cursor_publication_follows_the_store() {
        let store = MemoryStore::new();
        store
            .insert("todos", Document::new("t1", fields_from_json(json!({"title": "A"}))))
            .unwrap();

        let (sub, mut rx) = start("all", &store);
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], ServerMessage::Added { id, .. } if id == "t1"));
        assert!(matches!(&messages[1], ServerMessage::Ready { .. }));

        store.remove("todos", "t1");
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerMessage::Removed { .. }]
        ));

        // Stopping releases the observer
        store
            .insert("todos", Document::new("t2", Fields::new()))
            .unwrap();
        drain(&mut rx);
        sub.stop(None);
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 2);
        store
            .insert("todos", Document::new("t3", Fields::new()))
            .unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn failing_publication_stops_with_error() {
        let store = MemoryStore::new();
        let (sub, mut rx) = start("denied", &store);
        assert!(sub.is_stopped());
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::NoSub {
                id: "s1".into(),
                error: Some(MethodError::authorization("nope")),
            }]
        );
    }

    #[test]
    fn unknown_publication() {
        let store = MemoryStore::new();
        let (_, mut rx) = start("missing", &store);
        let messages = drain(&mut rx);
        assert!(matches!(
            &messages[..],
            [ServerMessage::NoSub { error: Some(e), .. }] if e.code() == Some("sub-not-found")
        ));
    }

    #[test]
    fn duplicate_cursor_collections_are_rejected() {
        let store = MemoryStore::new();
        let (sub, _) = start("twice", &store);
        assert!(sub.is_stopped());
    }

    #[test]
    fn manual_publication() {
        let store = MemoryStore::new();
        let (sub, mut rx) = start("manual", &store);
        assert!(sub.is_ready());
        let messages = drain(&mut rx);
        assert!(matches!(&messages[0], ServerMessage::Added { collection, .. } if collection == "counters"));
        assert_eq!(messages.len(), 2);
    }
}
