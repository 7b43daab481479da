//! Thin HTTP surface for `serve`: query, health, stats, and the two
//! admin operations. Request/response shaping beyond this lives outside
//! the core.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use scrivener_rag::chat::TurnRequest;
use scrivener_rag::error::RagError;
use scrivener_rag::types::{ConversationContext, DocumentFilters};

use crate::bootstrap::AppState;

pub async fn serve(state: AppState, addr: &str) -> Result<(), RagError> {
    let shared = Arc::new(state);
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/query", post(query))
        .route("/api/stats", get(stats))
        .route("/api/reindex", post(reindex))
        .route("/api/cache/flush", post(cache_flush))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(shared);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RagError::dependency("listener", e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RagError::internal(e.to_string()))
}

struct ApiError(RagError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            "validation_error" => StatusCode::UNPROCESSABLE_ENTITY,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" => StatusCode::CONFLICT,
            "dependency_unavailable" | "transient" => StatusCode::SERVICE_UNAVAILABLE,
            "cancelled" => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        if let RagError::Validation {
            field,
            action,
            invalid_programs,
            valid_programs,
            ..
        } = &self.0
        {
            if let Some(field) = field {
                body["field"] = field.clone().into();
            }
            if let Some(action) = action {
                body["action"] = action.clone().into();
            }
            if !invalid_programs.is_empty() {
                body["invalid_programs"] = invalid_programs.clone().into();
                body["valid_programs"] = valid_programs.clone().into();
            }
        }

        (status, Json(body)).into_response()
    }
}

impl From<RagError> for ApiError {
    fn from(e: RagError) -> Self {
        Self(e)
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    state.vector_index.health().await?;
    state.store.health().await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct QueryBody {
    query: String,
    conversation_id: Option<Uuid>,
    top_k: Option<usize>,
    recency_weight: Option<f32>,
    filters: Option<DocumentFilters>,
    audience: Option<String>,
    section: Option<String>,
    tone: Option<String>,
    custom_instructions: Option<String>,
    #[serde(default = "default_principal")]
    principal: String,
}

fn default_principal() -> String {
    "anonymous".to_string()
}

async fn query(
    State(state): State<Arc<AppState>>,
    Json(body): Json<QueryBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cancel = CancellationToken::new();
    let request = TurnRequest {
        conversation_id: body.conversation_id,
        query: body.query,
        top_k: body.top_k,
        recency_weight: body.recency_weight,
        context: ConversationContext {
            writing_style: None,
            audience: body.audience,
            section: body.section,
            tone: body.tone,
            filters: body.filters,
        },
        custom_instructions: body.custom_instructions,
        principal: body.principal,
    };

    let outcome = state.query_service.run_turn(&request, &cancel).await?;
    Ok(Json(serde_json::json!({
        "conversation_id": outcome.conversation_id,
        "text": outcome.result.text,
        "model": outcome.result.model,
        "output_tokens": outcome.result.output_tokens,
        "generation_ms": outcome.result.generation_ms,
        "citations": outcome.result.citations,
        "sources": outcome.sources,
    })))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cache = state.cache.metrics();
    Json(serde_json::json!({
        "cache": {
            "size": state.cache.len(),
            "hits": cache.hits,
            "misses": cache.misses,
            "evictions": cache.evictions,
            "invalidations": cache.invalidations,
            "total_queries": cache.total_queries,
            "hit_rate": cache.hit_rate(),
        },
        "counters": state.telemetry.snapshot(),
    }))
}

async fn reindex(State(state): State<Arc<AppState>>) -> Result<String, ApiError> {
    let indexed = state.processor.rebuild_keyword_index().await?;
    Ok(format!("Rebuilt keyword index over {} chunk(s)", indexed))
}

async fn cache_flush(State(state): State<Arc<AppState>>) -> String {
    state.cache.invalidate_all();
    "Query cache flushed".to_string()
}
