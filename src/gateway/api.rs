//! HTTP handlers: chat, agent listings and health.

use super::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

use crate::orchestrator::QueryRequest;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
    pub agent_used: String,
}

/// Use the caller's session id, or mint one when it is absent or blank.
pub(crate) fn resolve_session_id(session_id: Option<String>) -> String {
    session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// POST /chat: run one non-streamed turn
pub async fn handle_chat(
    State(state): State<AppState>,
    Json(body): Json<ChatRequest>,
) -> impl IntoResponse {
    let session_id = resolve_session_id(body.session_id);
    let request = QueryRequest {
        query: body.query,
        session_id,
        agent_name: body.agent_name,
        stream: false,
    };

    match state.orchestrator.handle_query(request).await {
        Ok(outcome) => {
            let response = outcome.reply.into_text().await;
            Json(ChatResponse {
                response,
                session_id: outcome.session_id,
                agent_used: outcome.agent,
            })
            .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Chat request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"detail": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// GET /agents: every agent that loads
pub async fn handle_list_agents(State(state): State<AppState>) -> impl IntoResponse {
    let agents = state.orchestrator.list_available_agents().await;
    let count = agents.len();
    Json(serde_json::json!({
        "agents": agents,
        "count": count,
    }))
}

/// GET /agents/{name}: one agent
pub async fn handle_get_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.agent_info(&name).await {
        Some(agent) => Json(agent).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("Agent '{name}' not found")})),
        )
            .into_response(),
    }
}

/// GET /: service banner
pub async fn handle_root() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Agora API is running",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "healthy",
    }))
}

/// GET /health: liveness plus registered agent names
pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let agents = state.orchestrator.registry().names();
    Json(serde_json::json!({
        "status": "healthy",
        "agents": agents,
    }))
}
