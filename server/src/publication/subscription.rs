//! The server side of one subscription, as seen by publication code.

use crate::websocket::{MessageSender, ServerMessage};
use lagless_engine::{
    CollectionName, DocKey, DocumentId, FieldDiff, Fields, MethodError, SubscriptionId, UserId,
};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Misuse of the publication author interface.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PublishError {
    #[error("{0} was already added by this subscription")]
    AlreadyAdded(DocKey),

    #[error("{0} was not added by this subscription")]
    NotAdded(DocKey),
}

type StopCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    /// Documents this subscription currently asserts
    documents: BTreeSet<DocKey>,
    ready: bool,
    stopped: bool,
    on_stop: Vec<StopCallback>,
}

struct Inner {
    id: SubscriptionId,
    name: String,
    user_id: Option<UserId>,
    sender: MessageSender,
    state: Mutex<State>,
}

/// Handle through which a publication emits its documents.
///
/// Cheap to clone; all clones refer to the same subscription. Every emit is
/// a no-op once the subscription stopped.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<Inner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("documents", &state.documents.len())
            .field("ready", &state.ready)
            .field("stopped", &state.stopped)
            .finish()
    }
}

impl Subscription {
    pub fn new(
        id: impl Into<SubscriptionId>,
        name: impl Into<String>,
        user_id: Option<UserId>,
        sender: MessageSender,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                name: name.into(),
                user_id,
                sender,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Identity of the subscriber.
    pub fn user_id(&self) -> Option<&str> {
        self.inner.user_id.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    pub fn is_stopped(&self) -> bool {
        self.state().stopped
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Sent while holding the state lock so that emits from concurrent
    // observers reach the client in the order they were tracked.
    fn send(&self, message: ServerMessage) {
        if self.inner.sender.send(message).is_err() {
            tracing::trace!(sub_id = %self.inner.id, "Subscriber connection closed");
        }
    }

    /// Start asserting a document.
    pub fn emit_added(
        &self,
        collection: impl Into<CollectionName>,
        id: impl Into<DocumentId>,
        fields: Fields,
    ) -> Result<(), PublishError> {
        let key = DocKey::new(collection, id);
        let mut state = self.state();
        if state.stopped {
            return Ok(());
        }
        if !state.documents.insert(key.clone()) {
            return Err(PublishError::AlreadyAdded(key));
        }
        self.send(ServerMessage::Added {
            sub: self.inner.id.clone(),
            collection: key.collection,
            id: key.id,
            fields,
        });
        Ok(())
    }

    /// Change fields of an asserted document. Empty diffs are dropped.
    pub fn emit_changed(
        &self,
        collection: impl Into<CollectionName>,
        id: impl Into<DocumentId>,
        diff: FieldDiff,
    ) -> Result<(), PublishError> {
        let key = DocKey::new(collection, id);
        let state = self.state();
        if state.stopped {
            return Ok(());
        }
        if !state.documents.contains(&key) {
            return Err(PublishError::NotAdded(key));
        }
        if diff.is_empty() {
            return Ok(());
        }
        self.send(ServerMessage::Changed {
            sub: self.inner.id.clone(),
            collection: key.collection,
            id: key.id,
            diff,
        });
        Ok(())
    }

    /// Stop asserting a document.
    pub fn emit_removed(
        &self,
        collection: impl Into<CollectionName>,
        id: impl Into<DocumentId>,
    ) -> Result<(), PublishError> {
        let key = DocKey::new(collection, id);
        let mut state = self.state();
        if state.stopped {
            return Ok(());
        }
        if !state.documents.remove(&key) {
            return Err(PublishError::NotAdded(key));
        }
        self.send(ServerMessage::Removed {
            sub: self.inner.id.clone(),
            collection: key.collection,
            id: key.id,
        });
        Ok(())
    }

    /// Signal that the initial result set is complete. Only the first call
    /// has an effect.
    pub fn mark_ready(&self) {
        let mut state = self.state();
        if state.ready || state.stopped {
            return;
        }
        state.ready = true;
        self.send(ServerMessage::Ready {
            subs: vec![self.inner.id.clone()],
        });
    }

    /// Run `callback` when the subscription stops; immediately if it
    /// already has.
    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.state();
        if state.stopped {
            drop(state);
            callback();
            return;
        }
        state.on_stop.push(Box::new(callback));
    }

    /// Stop the subscription: run the stop callbacks, withdraw every
    /// asserted document and tell the client, with `error` if the
    /// publication failed.
    pub fn stop(&self, error: Option<MethodError>) {
        let Some(documents) = self.halt() else {
            return;
        };
        tracing::debug!(
            sub_id = %self.inner.id,
            name = %self.inner.name,
            documents = documents.len(),
            error = ?error,
            "Subscription stopped"
        );
        for key in documents {
            self.send(ServerMessage::Removed {
                sub: self.inner.id.clone(),
                collection: key.collection,
                id: key.id,
            });
        }
        self.send(ServerMessage::NoSub {
            id: self.inner.id.clone(),
            error,
        });
    }

    /// Stop without telling the client, for a connection that is gone.
    pub fn close(&self) {
        self.halt();
    }

    /// Mark stopped and run the callbacks. Returns the documents that were
    /// asserted, or `None` if already stopped.
    fn halt(&self) -> Option<BTreeSet<DocKey>> {
        let (callbacks, documents) = {
            let mut state = self.state();
            if state.stopped {
                return None;
            }
            state.stopped = true;
            (
                std::mem::take(&mut state.on_stop),
                std::mem::take(&mut state.documents),
            )
        };
        for callback in callbacks {
            callback();
        }
        Some(documents)
    }
}
