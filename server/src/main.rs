//! Lagless Server - publication and method server for live clients.
//!
//! Clients connect over a websocket, subscribe to publications that stream
//! documents from the in-memory store, and call methods whose writes flow
//! back to every matching subscription before the caller gets its answer.

mod app;
mod auth;
mod config;
mod error;
mod handlers;
mod methods;
mod publication;
mod routes;
mod store;
mod websocket;

use crate::config::Config;
use crate::error::AppError;
use crate::methods::MethodDispatcher;
use crate::publication::PublicationRegistry;
use crate::store::MemoryStore;
use crate::websocket::ConnectionManager;
use axum::Router;
use chrono::{DateTime, Utc};
use lagless_engine::MethodRegistry;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: MemoryStore,
    pub publications: Arc<PublicationRegistry>,
    pub dispatcher: MethodDispatcher,
    pub conn_manager: Arc<ConnectionManager>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, methods: MethodRegistry, publications: PublicationRegistry) -> Self {
        let store = MemoryStore::new();
        let dispatcher = MethodDispatcher::new(
            Arc::new(methods),
            store.clone(),
            config.result_cache_capacity,
        );
        Self {
            config: Arc::new(config),
            store,
            publications: Arc::new(publications),
            dispatcher,
            conn_manager: ConnectionManager::new_shared(),
            started_at: Utc::now(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lagless_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Lagless Server on {}:{}", config.host, config.port);
    if config.auth_secret.is_none() {
        tracing::warn!("AUTH_SECRET is not set; bearer tokens are taken as user ids");
    }

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config, app::methods(), app::publications());
    tracing::info!(
        methods = ?state.dispatcher.methods().names(),
        "Application registered"
    );

    let app = Router::new()
        .merge(routes::create_routes())
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
