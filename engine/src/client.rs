//! The sans-IO client state machine.
//!
//! [`Client`] owns the local store, the merge box, the subscriptions and
//! the in-flight invocations. It never touches a socket: the embedding
//! drains outgoing messages with [`Client::take_outgoing`], feeds incoming
//! ones to [`Client::handle_message`] and reports channel state through
//! [`Client::connect`] and [`Client::connection_lost`]. All processing
//! happens on the caller's thread, one message at a time.
//!
//! # Reconnect
//!
//! A connection loss leaves every unsettled invocation waiting. On the
//! next [`Client::connect`]:
//!
//! 1. Invocations sent before the loss are resent under the same id
//!    ([`ReconnectPolicy::Resend`]) or failed with
//!    [`MethodError::Connectivity`] ([`ReconnectPolicy::Fail`])
//! 2. Every live subscription is sent again under its id, and its data
//!    collects in a fresh merge box while the old base stays visible
//! 3. Terminal responses are held back until every resubscribed
//!    subscription is ready or stopped, then the fresh base is swapped in
//!    and the held responses are applied in arrival order
//!
//! Until a resent invocation settles, new simulations may not write to
//! the documents it touched.

use crate::{
    merge_box::MergeBox, method::MethodResult, protocol::ClientMessage, protocol::ServerMessage,
    reconcile::Outcome, reconcile::Reconciler, DocKey, DocChange, Document, DocumentAccess, Error,
    FieldDiff, Fields, IdGenerator, InvocationId, InvocationState, LocalStore, MethodContext,
    MethodError, MethodRegistry, Simulation, SubscriptionId, SubscriptionRecord, SubscriptionStatus,
    UserId, DEFAULT_MAX_CALL_DEPTH,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use uuid::Uuid;

/// What to do with invocations whose fate is unknown after a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconnectPolicy {
    /// Send them again under the same id (default)
    #[default]
    Resend,
    /// Fail them with a connectivity error
    Fail,
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Stable identity across reconnects; seeds id generation
    pub client_id: String,
    pub reconnect_policy: ReconnectPolicy,
    /// Limit on nested method calls
    pub max_call_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: Uuid::new_v4().simple().to_string(),
            reconnect_policy: ReconnectPolicy::default(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }
}

/// Something the application should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server accepted the session.
    Connected { session: String },
    /// An invocation reached its terminal state.
    MethodSettled { id: InvocationId, outcome: Outcome },
    /// A subscription's initial result set is complete.
    SubscriptionReady { id: SubscriptionId },
    /// A subscription ended.
    SubscriptionStopped {
        id: SubscriptionId,
        error: Option<MethodError>,
    },
    /// The server could not handle a message.
    ServerError { reason: String },
}

/// Handle returned by [`Client::invoke`].
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub id: InvocationId,
    /// The simulation's return value; `None` when the method has no local
    /// definition and goes to the server unsimulated
    pub optimistic: Option<serde_json::Value>,
}

/// A resubscription in progress.
#[derive(Debug, Default)]
struct Resync {
    merge: MergeBox,
    waiting: BTreeSet<SubscriptionId>,
    deferred: Vec<(InvocationId, Outcome)>,
}

/// The client side of a session.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    methods: MethodRegistry,
    user_id: Option<UserId>,
    store: LocalStore,
    merge: MergeBox,
    reconciler: Reconciler,
    subscriptions: BTreeMap<SubscriptionId, SubscriptionRecord>,
    outgoing: VecDeque<ClientMessage>,
    online: bool,
    /// Set once a connection has been lost, so the next connect resyncs
    lost: bool,
    resync: Option<Resync>,
    /// Documents touched by resent, unsettled invocations
    blocked: BTreeSet<DocKey>,
    /// Random per-instance prefix of invocation ids; two processes sharing
    /// a client id never reuse each other's ids
    instance: String,
    next_invocation: u64,
    next_subscription: u64,
}

impl Client {
    /// Create a disconnected client.
    pub fn new(config: ClientConfig, methods: MethodRegistry) -> Self {
        Self {
            config,
            methods,
            user_id: None,
            store: LocalStore::new(),
            merge: MergeBox::new(),
            reconciler: Reconciler::new(),
            subscriptions: BTreeMap::new(),
            outgoing: VecDeque::new(),
            online: false,
            lost: false,
            resync: None,
            blocked: BTreeSet::new(),
            instance: Uuid::new_v4().simple().to_string(),
            next_invocation: 0,
            next_subscription: 0,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// Identity method simulations run as.
    pub fn set_user_id(&mut self, user_id: Option<UserId>) {
        self.user_id = user_id;
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Mutable access for registering observers.
    pub fn store_mut(&mut self) -> &mut LocalStore {
        &mut self.store
    }

    pub fn merge_box(&self) -> &MergeBox {
        &self.merge
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Check if a reconnect resync is still collecting data.
    pub fn is_resyncing(&self) -> bool {
        self.resync.is_some()
    }

    pub fn subscription(&self, id: &str) -> Option<&SubscriptionRecord> {
        self.subscriptions.get(id)
    }

    pub fn invocation_state(&self, id: &str) -> Option<InvocationState> {
        self.reconciler.state(id)
    }

    pub fn pending_invocations(&self) -> Vec<InvocationId> {
        self.reconciler.pending_ids()
    }

    /// Drain the messages waiting to go to the server.
    pub fn take_outgoing(&mut self) -> Vec<ClientMessage> {
        let messages: Vec<_> = self.outgoing.drain(..).collect();
        for message in &messages {
            if let ClientMessage::Method { id, .. } = message {
                if let Some(record) = self.reconciler.get_mut(id) {
                    record.sent = true;
                }
            }
        }
        messages
    }

    /// Invoke a method.
    ///
    /// With a local definition the method is simulated first; its writes
    /// are visible when this returns. A simulation error fails the call
    /// immediately with nothing sent and nothing visible.
    pub fn invoke(&mut self, name: &str, args: serde_json::Value) -> Result<Invocation, MethodError> {
        self.next_invocation += 1;
        let id = format!("{}-{}", self.instance, self.next_invocation);
        let seed = format!("{}:{}", self.config.client_id, id);
        self.reconciler.begin(id.as_str(), name, args.clone(), seed.as_str());

        let optimistic = if self.methods.contains(name) {
            match self.simulate(&id, name, &seed, &args) {
                Ok(value) => Some(value),
                Err(error) => {
                    self.reconciler.abandon(&id);
                    let error = match error {
                        MethodError::Simulation { .. } => error,
                        other => MethodError::simulation(other.to_string()),
                    };
                    tracing::debug!(invocation_id = %id, method = %name, %error, "Simulation failed");
                    return Err(error);
                }
            }
        } else {
            None
        };

        self.reconciler.await_server(&id);
        if self.online {
            self.outgoing.push_back(ClientMessage::Method {
                id: id.clone(),
                method: name.to_string(),
                params: args,
                random_seed: Some(seed),
            });
        }
        Ok(Invocation { id, optimistic })
    }

    fn simulate(&mut self, id: &str, name: &str, seed: &str, args: &serde_json::Value) -> MethodResult {
        let def = self
            .methods
            .get(name)
            .ok_or_else(|| MethodError::not_found(name))?;
        let mut ids = IdGenerator::seeded(seed);
        let mut simulation = self.store.simulate(id);

        let result = {
            let mut access = SimulationAccess {
                simulation: &mut simulation,
                blocked: &self.blocked,
            };
            let mut ctx = MethodContext::new(
                id,
                true,
                self.user_id.as_deref(),
                &mut access,
                &mut ids,
                &self.methods,
            )
            .with_max_depth(self.config.max_call_depth);
            def.run(&mut ctx, args)
        };

        match result {
            Ok(value) => {
                let writes = simulation.commit();
                self.reconciler.simulated(id, writes);
                Ok(value)
            }
            Err(error) => {
                simulation.abort();
                Err(error)
            }
        }
    }

    /// Start a subscription.
    pub fn subscribe(&mut self, name: &str, params: serde_json::Value) -> SubscriptionId {
        self.next_subscription += 1;
        let id = format!("s{}", self.next_subscription);
        if self.online {
            self.outgoing.push_back(ClientMessage::Sub {
                id: id.clone(),
                name: name.to_string(),
                params: params.clone(),
            });
        }
        self.subscriptions
            .insert(id.clone(), SubscriptionRecord::new(id.as_str(), name, params));
        id
    }

    /// Stop a subscription. Its documents go away when the server's
    /// removals arrive.
    pub fn unsubscribe(&mut self, id: &str) -> crate::error::Result<()> {
        match self.subscriptions.get_mut(id) {
            Some(record) if !record.is_stopped() => {
                record.stop(None);
            }
            _ => return Err(Error::UnknownSubscription(id.to_string())),
        }
        if self.online {
            self.outgoing
                .push_back(ClientMessage::Unsub { id: id.to_string() });
        }
        Ok(())
    }

    /// The channel is (re)established.
    ///
    /// Queues the session handshake, resolves invocations left over from a
    /// lost connection and sends every live subscription and unsettled
    /// invocation.
    pub fn connect(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        if self.online {
            return events;
        }
        self.online = true;
        self.outgoing.push_back(ClientMessage::Connect {
            client_id: self.config.client_id.clone(),
        });

        if self.lost {
            self.recover_invocations(&mut events);
        }

        let mut resubscribed = BTreeSet::new();
        for record in self.subscriptions.values_mut().filter(|r| !r.is_stopped()) {
            record.status = SubscriptionStatus::Pending;
            resubscribed.insert(record.id.clone());
            self.outgoing.push_back(ClientMessage::Sub {
                id: record.id.clone(),
                name: record.name.clone(),
                params: record.params.clone(),
            });
        }

        for record in self.reconciler.pending_mut() {
            record.sent = false;
            self.outgoing.push_back(ClientMessage::Method {
                id: record.id.clone(),
                method: record.name.clone(),
                params: record.args.clone(),
                random_seed: Some(record.random_seed.clone()),
            });
        }

        if self.lost {
            tracing::debug!(subscriptions = resubscribed.len(), "Starting resync");
            self.resync = Some(Resync {
                waiting: resubscribed,
                ..Resync::default()
            });
            self.finish_resync_if_quiescent(&mut events);
        }
        events
    }

    fn recover_invocations(&mut self, events: &mut Vec<ClientEvent>) {
        let unresolved: Vec<InvocationId> = self
            .reconciler
            .pending()
            .filter(|r| r.sent)
            .map(|r| r.id.clone())
            .collect();

        match self.config.reconnect_policy {
            ReconnectPolicy::Resend => {
                for id in &unresolved {
                    if let Some(record) = self.reconciler.get_mut(id) {
                        record.resent = true;
                    }
                }
                self.refresh_blocked();
                tracing::debug!(count = unresolved.len(), "Resending invocations");
            }
            ReconnectPolicy::Fail => {
                for id in unresolved {
                    let outcome = Outcome::Failed {
                        error: MethodError::Connectivity,
                    };
                    self.settle(&id, outcome, events);
                }
            }
        }
    }

    /// The channel failed. Unsettled invocations keep waiting.
    pub fn connection_lost(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        if !self.online {
            return events;
        }
        tracing::debug!(pending = self.reconciler.pending_count(), "Connection lost");
        self.online = false;
        self.lost = true;
        self.outgoing.clear();

        // Responses already received still settle; the half-built base is
        // discarded and rebuilt on the next connect.
        if let Some(resync) = self.resync.take() {
            for (id, outcome) in resync.deferred {
                self.settle(&id, outcome, &mut events);
            }
        }
        events
    }

    /// Process one message from the server.
    pub fn handle_message(&mut self, message: ServerMessage) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        match message {
            ServerMessage::Connected { session } => {
                tracing::debug!(%session, "Session established");
                events.push(ClientEvent::Connected { session });
            }
            ServerMessage::Result { id, result } => {
                self.terminal(id, Outcome::Confirmed { result }, &mut events);
            }
            ServerMessage::MethodError { id, error } => {
                self.terminal(id, Outcome::Failed { error }, &mut events);
            }
            ServerMessage::Added {
                sub,
                collection,
                id,
                fields,
            } => {
                let change = self.merge_target().added(&sub, &collection, &id, fields);
                self.apply_merged(&collection, &id, change);
            }
            ServerMessage::Changed {
                sub,
                collection,
                id,
                diff,
            } => {
                let change = self.merge_target().changed(&sub, &collection, &id, &diff);
                self.apply_merged(&collection, &id, change);
            }
            ServerMessage::Removed { sub, collection, id } => {
                let change = self.merge_target().removed(&sub, &collection, &id);
                self.apply_merged(&collection, &id, change);
            }
            ServerMessage::Ready { subs } => {
                for id in subs {
                    if let Some(record) = self.subscriptions.get_mut(&id) {
                        if record.mark_ready() {
                            events.push(ClientEvent::SubscriptionReady { id: id.clone() });
                        }
                    }
                    if let Some(resync) = self.resync.as_mut() {
                        resync.waiting.remove(&id);
                    }
                }
                self.finish_resync_if_quiescent(&mut events);
            }
            ServerMessage::NoSub { id, error } => {
                if let Some(record) = self.subscriptions.get_mut(&id) {
                    record.stop(error.clone());
                    events.push(ClientEvent::SubscriptionStopped {
                        id: id.clone(),
                        error,
                    });
                }
                if let Some(resync) = self.resync.as_mut() {
                    resync.waiting.remove(&id);
                }
                self.finish_resync_if_quiescent(&mut events);
            }
            ServerMessage::Pong { .. } => {}
            ServerMessage::Error { reason } => {
                tracing::warn!(%reason, "Server rejected a message");
                events.push(ClientEvent::ServerError { reason });
            }
        }
        events
    }

    fn merge_target(&mut self) -> &mut MergeBox {
        match self.resync.as_mut() {
            Some(resync) => &mut resync.merge,
            None => &mut self.merge,
        }
    }

    fn apply_merged(&mut self, collection: &str, id: &str, change: Option<DocChange>) {
        if self.resync.is_some() {
            return;
        }
        if let Some(change) = change {
            self.store.apply_server(collection, id, change);
        }
    }

    fn terminal(&mut self, id: InvocationId, outcome: Outcome, events: &mut Vec<ClientEvent>) {
        match self.resync.as_mut() {
            Some(resync) => resync.deferred.push((id, outcome)),
            None => self.settle(&id, outcome, events),
        }
    }

    fn settle(&mut self, id: &str, outcome: Outcome, events: &mut Vec<ClientEvent>) {
        if let Some(outcome) = self.reconciler.settle(id, outcome, &mut self.store) {
            self.refresh_blocked();
            events.push(ClientEvent::MethodSettled {
                id: id.to_string(),
                outcome,
            });
        }
    }

    fn refresh_blocked(&mut self) {
        self.blocked = self
            .reconciler
            .pending()
            .filter(|r| r.resent)
            .flat_map(|r| r.simulated_writes.iter().map(|w| w.key.clone()))
            .collect();
    }

    fn finish_resync_if_quiescent(&mut self, events: &mut Vec<ClientEvent>) {
        if !self.resync.as_ref().is_some_and(|r| r.waiting.is_empty()) {
            return;
        }
        let Some(resync) = self.resync.take() else {
            return;
        };
        self.merge = resync.merge;
        self.store.reset_base(self.merge.documents().collect());
        tracing::debug!(
            documents = self.merge.len(),
            deferred = resync.deferred.len(),
            "Resync complete"
        );
        for (id, outcome) in resync.deferred {
            self.settle(&id, outcome, events);
        }
    }
}

/// Document access for a client-side simulation.
struct SimulationAccess<'s, 'a> {
    simulation: &'s mut Simulation<'a>,
    blocked: &'s BTreeSet<DocKey>,
}

impl SimulationAccess<'_, '_> {
    fn check_writable(&self, collection: &str, id: &str) -> Result<(), MethodError> {
        let key = DocKey::new(collection, id);
        if self.blocked.contains(&key) {
            return Err(Error::DocumentResyncing {
                collection: key.collection,
                id: key.id,
            }
            .into());
        }
        Ok(())
    }
}

impl DocumentAccess for SimulationAccess<'_, '_> {
    fn find_one(&self, collection: &str, id: &str) -> Option<Fields> {
        self.simulation.get(collection, id).map(|doc| doc.fields)
    }

    fn find(&self, collection: &str) -> Vec<Document> {
        self.simulation.find(collection)
    }

    fn insert(&mut self, collection: &str, document: Document) -> Result<(), MethodError> {
        self.check_writable(collection, &document.id)?;
        Ok(self.simulation.insert(collection, document)?)
    }

    fn update(&mut self, collection: &str, id: &str, diff: &FieldDiff) -> Result<bool, MethodError> {
        self.check_writable(collection, id)?;
        Ok(self.simulation.update(collection, id, diff))
    }

    fn remove(&mut self, collection: &str, id: &str) -> Result<bool, MethodError> {
        self.check_writable(collection, id)?;
        Ok(self.simulation.remove(collection, id))
    }
}
