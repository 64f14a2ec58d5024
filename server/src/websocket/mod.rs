//! WebSocket transport.
//!
//! Each connection gets an unbounded channel of [`ServerMessage`]s drained
//! by a writer task; sessions, subscriptions and the connection manager
//! all push into it.

mod manager;
mod protocol;

pub use manager::{ConnectionManager, MessageSender};
pub use protocol::*;
