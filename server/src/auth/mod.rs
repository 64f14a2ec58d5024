//! Caller identity for websocket connections.

mod middleware;

pub use middleware::AuthUser;
