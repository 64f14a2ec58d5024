//! Connection handlers.

mod session;
mod websocket;

pub use session::Session;
pub use websocket::handle_websocket_connection;
