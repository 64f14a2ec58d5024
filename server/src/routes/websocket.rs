//! WebSocket endpoint.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};

use crate::auth::AuthUser;
use crate::handlers::handle_websocket_connection;
use crate::AppState;

/// Create websocket routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/websocket", get(upgrade))
}

/// GET /websocket - Upgrade to a session. The bearer token decides the
/// caller identity for the whole connection.
async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>, auth: AuthUser) -> Response {
    ws.on_upgrade(move |socket| handle_websocket_connection(socket, state, auth.user_id))
}
