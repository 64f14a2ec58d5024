//! WebSocket connection manager.
//!
//! Tracks live connections and which client each one belongs to.

use std::sync::Arc;

use dashmap::DashMap;
use lagless_engine::UserId;
use tokio::sync::mpsc;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Authenticated caller, if any
    pub user_id: Option<UserId>,
    /// Client identity announced in `connect`
    pub client_id: Option<String>,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Connection IDs by client ID.
    by_client_id: DashMap<String, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection. Returns the connection ID.
    pub fn register(&self, user_id: Option<UserId>) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                user_id: user_id.clone(),
                client_id: None,
            },
        );

        tracing::info!(conn_id = %conn_id, user_id = ?user_id, "WebSocket connection registered");

        conn_id
    }

    /// Record the client a connection belongs to.
    ///
    /// Returns how many live connections the client now has.
    pub fn bind_client(&self, conn_id: &str, client_id: &str) -> usize {
        let Some(mut conn) = self.connections.get_mut(conn_id) else {
            return 0;
        };
        if conn.client_id.as_deref() == Some(client_id) {
            drop(conn);
            return self.by_client_id.get(client_id).map_or(0, |ids| ids.len());
        }
        let previous = conn.client_id.replace(client_id.to_string());
        drop(conn);

        if let Some(previous) = previous {
            self.forget(&previous, conn_id);
        }
        let mut ids = self.by_client_id.entry(client_id.to_string()).or_default();
        ids.push(conn_id.to_string());
        ids.len()
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(client_id) = &conn.client_id {
                self.forget(client_id, conn_id);
            }
            tracing::info!(
                conn_id = %conn_id,
                user_id = ?conn.user_id,
                client_id = ?conn.client_id,
                "WebSocket connection unregistered"
            );
        }
    }

    fn forget(&self, client_id: &str, conn_id: &str) {
        if let Some(mut conn_ids) = self.by_client_id.get_mut(client_id) {
            conn_ids.retain(|id| id != conn_id);
            if conn_ids.is_empty() {
                drop(conn_ids);
                self.by_client_id.remove(client_id);
            }
        }
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of distinct clients connected.
    pub fn client_count(&self) -> usize {
        self.by_client_id.len()
    }
}
