//! HTTP/WebSocket gateway (axum).
//!
//! Routes:
//! - `POST /chat` one complete reply
//! - `GET  /chat/ws` streamed replies over WebSocket
//! - `GET  /agents`, `GET /agents/{name}` agent listings
//! - `GET  /`, `GET /health` status

pub mod api;
pub mod protocol;
pub mod ws;

use anyhow::{Context, Result};
use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
};

use crate::config::GatewayConfig;
use crate::orchestrator::Orchestrator;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the gateway router with its middleware stack.
pub fn router(state: AppState, config: &GatewayConfig) -> Router {
    let app = Router::new()
        .route("/", get(api::handle_root))
        .route("/health", get(api::handle_health))
        .route("/chat", post(api::handle_chat))
        .route("/chat/", post(api::handle_chat))
        .route("/chat/ws", get(ws::handle_ws))
        .route("/agents", get(api::handle_list_agents))
        .route("/agents/", get(api::handle_list_agents))
        .route("/agents/{name}", get(api::handle_get_agent))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )));

    match cors_layer(&config.cors_origins) {
        Some(cors) => app.layer(cors),
        None => app,
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any),
    )
}

/// Bind and serve until Ctrl-C.
pub async fn run_gateway(config: &GatewayConfig, orchestrator: Arc<Orchestrator>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid gateway address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {addr}"))?;
    let local = listener.local_addr()?;

    let agents = orchestrator.registry().names().join(", ");
    tracing::info!(addr = %local, agents = %agents, "Gateway listening");

    let app = router(AppState { orchestrator }, config);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Gateway server error")?;
    Ok(())
}
