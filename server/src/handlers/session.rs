//! One client session: the server side of a websocket connection.

use std::collections::HashMap;

use lagless_engine::{Outcome, SubscriptionId, UserId};

use crate::methods::Call;
use crate::publication::Subscription;
use crate::websocket::{decode, ClientMessage, MessageSender, ServerMessage};
use crate::AppState;

/// Handles the messages of one connection.
///
/// Methods are executed one at a time in arrival order. Dropping the
/// session stops all of its subscriptions.
pub struct Session {
    id: String,
    user_id: Option<UserId>,
    client_id: Option<String>,
    sender: MessageSender,
    state: AppState,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl Session {
    /// Register a new connection.
    pub fn new(state: AppState, user_id: Option<UserId>, sender: MessageSender) -> Self {
        let id = state.conn_manager.register(user_id.clone());
        Self {
            id,
            user_id,
            client_id: None,
            sender,
            state,
            subscriptions: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscriptions still running.
    pub fn live_subscriptions(&self) -> usize {
        self.subscriptions
            .values()
            .filter(|sub| !sub.is_stopped())
            .count()
    }

    fn send(&self, message: ServerMessage) {
        if self.sender.send(message).is_err() {
            tracing::trace!(session_id = %self.id, "Connection closed before reply");
        }
    }

    /// Handle one text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match decode(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                tracing::warn!(session_id = %self.id, "Invalid message: {}", e);
                self.send(ServerMessage::error(format!("Invalid message format: {}", e)));
            }
        }
    }

    /// Handle one client message.
    pub async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Connect { client_id } => {
                let connections = self.state.conn_manager.bind_client(&self.id, &client_id);
                tracing::debug!(session_id = %self.id, %client_id, connections, "Session started");
                self.client_id = Some(client_id);
                self.send(ServerMessage::Connected {
                    session: self.id.clone(),
                });
            }

            ClientMessage::Method {
                id,
                method,
                params,
                random_seed,
            } => {
                let call = Call {
                    client_id: self.client_id.clone().unwrap_or_else(|| self.id.clone()),
                    invocation_id: id.clone(),
                    name: method,
                    params,
                    random_seed,
                    user_id: self.user_id.clone(),
                };
                tracing::debug!(session_id = %self.id, invocation_id = %id, method = %call.name, "Method call");

                // Publication messages caused by the call are already queued
                // on this connection when the outcome is sent
                let reply = match self.state.dispatcher.execute(call).await {
                    Outcome::Confirmed { result } => ServerMessage::Result { id, result },
                    Outcome::Failed { error } => ServerMessage::MethodError { id, error },
                };
                self.send(reply);
            }

            ClientMessage::Sub { id, name, params } => {
                if self.subscriptions.get(&id).is_some_and(|sub| !sub.is_stopped()) {
                    tracing::warn!(session_id = %self.id, sub_id = %id, "Duplicate subscription id");
                    self.send(ServerMessage::error(format!(
                        "subscription '{id}' is already running"
                    )));
                    return;
                }

                let sub = Subscription::new(id.as_str(), name, self.user_id.clone(), self.sender.clone());
                self.subscriptions.insert(id, sub.clone());
                self.state
                    .publications
                    .start(&sub, &self.state.store, &params);
                tracing::debug!(
                    session_id = %self.id,
                    sub_id = %sub.id(),
                    name = %sub.name(),
                    ready = sub.is_ready(),
                    "Subscribed"
                );
            }

            ClientMessage::Unsub { id } => match self.subscriptions.remove(&id) {
                Some(sub) => sub.stop(None),
                None => self.send(ServerMessage::NoSub { id, error: None }),
            },

            ClientMessage::Ping { id } => self.send(ServerMessage::Pong { id }),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for sub in self.subscriptions.values() {
            sub.close();
        }
        self.state.conn_manager.unregister(&self.id);
    }
}
