//! Router assembly and server lifecycle.

use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::handlers::{health_check, service_stats};
use crate::matchmaker::Matchmaker;
use crate::media::{EngineEvent, MediaEngine};
use crate::registry::ConnectionRegistry;
use crate::transports::TransportManager;
use crate::websocket::{websocket_handler, AppState};

/// Build the shared state, creating a media router when an engine is
/// attached. Without an engine the server runs as a pure signaling relay
/// and transport requests answer with an explicit error.
pub async fn build_state(config: Config, engine: Option<Arc<dyn MediaEngine>>) -> Result<AppState> {
    let registry = Arc::new(ConnectionRegistry::new());
    let matchmaker = Arc::new(Matchmaker::new(Arc::clone(&registry), config.match_policy));

    let (router, engine_events) = match engine {
        Some(engine) => {
            let router = engine.create_router(&config.media_codecs).await?;
            (Some(router), Some(engine.events()))
        }
        None => (None, None),
    };
    let transports = Arc::new(TransportManager::new(router, config.transport.clone()));

    Ok(AppState {
        registry,
        matchmaker,
        transports,
        config: Arc::new(config),
        engine_events,
    })
}

/// Assemble the HTTP/WebSocket router the way the service exposes it.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(service_stats))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Resolves when the process should stop accepting connections: Ctrl-C, or
/// the media engine reporting an unrecoverable worker failure. Existing
/// sessions drain; a dead engine must not keep serving new pairings.
pub async fn shutdown_signal(state: AppState) {
    let engine_fatal = async {
        match state.engine_events {
            Some(mut events) => {
                loop {
                    if *events.borrow() == EngineEvent::Fatal {
                        break;
                    }
                    if events.changed().await.is_err() {
                        // Engine dropped its sender; treat as fatal.
                        break;
                    }
                }
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown requested, draining");
        }
        _ = engine_fatal => {
            error!("media engine reported a fatal worker failure, draining and exiting");
        }
    }
}
