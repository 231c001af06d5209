pub mod api;
pub mod collab;
pub mod config;
pub mod db;
pub mod error;
pub mod storage;

use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::collab::{DocumentRegistry, PersistenceBridge, Relay};
use crate::config::Config;
use crate::db::Database;
use crate::storage::{DocumentStorage, MemoryStorage};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn DocumentStorage>,
    pub relay: Relay,
    /// Cap on a single WebSocket message from a client
    pub max_message_size: usize,
}

impl AppState {
    pub fn new(storage: Arc<dyn DocumentStorage>, config: &Config) -> Self {
        let registry = Arc::new(DocumentRegistry::new(
            config.broadcast_capacity,
            config.evict_on_last_disconnect,
        ));
        let bridge = Arc::new(PersistenceBridge::new(Arc::clone(&storage)));
        Self {
            storage,
            relay: Relay::new(registry, bridge),
            max_message_size: config.max_message_size,
        }
    }
}

/// Build the router with all routes and layers
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(api::router())
        .merge(collab::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the server with the given configuration
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let storage: Arc<dyn DocumentStorage> = match &config.database_url {
        Some(url) => {
            // Initialize database
            let db = Database::connect(url).await?;

            // Run migrations
            db.migrate().await?;
            Arc::new(db)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, documents are kept in memory only");
            Arc::new(MemoryStorage::new())
        }
    };

    let state = AppState::new(storage, &config);
    let app = app(state);

    // Start the server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
