//! Wire protocol shared by client and server.
//!
//! All messages are JSON objects tagged by `msg`, with snake_case names.

use crate::{
    CollectionName, DocumentId, FieldDiff, Fields, InvocationId, MethodError, SubscriptionId,
};
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a session.
    Connect {
        /// Stable identity of the client across reconnects
        client_id: String,
    },

    /// Invoke a method.
    Method {
        id: InvocationId,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
        /// Seed for deterministic id generation
        #[serde(default, skip_serializing_if = "Option::is_none")]
        random_seed: Option<String>,
    },

    /// Start a subscription.
    Sub {
        id: SubscriptionId,
        name: String,
        #[serde(default)]
        params: serde_json::Value,
    },

    /// Stop a subscription.
    Unsub { id: SubscriptionId },

    /// Keep-alive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Session established.
    Connected { session: String },

    /// A method completed.
    Result {
        id: InvocationId,
        #[serde(default)]
        result: serde_json::Value,
    },

    /// A method failed.
    MethodError { id: InvocationId, error: MethodError },

    /// A subscription started asserting a document.
    Added {
        sub: SubscriptionId,
        collection: CollectionName,
        id: DocumentId,
        #[serde(default)]
        fields: Fields,
    },

    /// A subscription changed fields of a document it asserts.
    Changed {
        sub: SubscriptionId,
        collection: CollectionName,
        id: DocumentId,
        diff: FieldDiff,
    },

    /// A subscription stopped asserting a document.
    Removed {
        sub: SubscriptionId,
        collection: CollectionName,
        id: DocumentId,
    },

    /// Subscriptions whose initial result set is complete.
    Ready { subs: Vec<SubscriptionId> },

    /// A subscription ended, after all its removals were sent.
    #[serde(rename = "nosub")]
    NoSub {
        id: SubscriptionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<MethodError>,
    },

    /// Response to ping.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// The last client message could not be handled.
    Error { reason: String },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(reason: impl Into<String>) -> Self {
        ServerMessage::Error {
            reason: reason.into(),
        }
    }
}
