//! HTTP API for the shopping assistant.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Run one conversational turn |
//! | `POST` | `/threads` | Create an empty thread for a user |
//! | `GET`  | `/threads/{thread_id}` | Full stored state of a thread |
//! | `DELETE` | `/threads/{thread_id}` | Delete a thread |
//! | `GET`  | `/users/{user_id}` | User profile summary |
//! | `GET`  | `/users/{user_id}/threads` | A user's threads, newest first |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).
//!
//! A turn whose pipeline fails part-way still answers `200` with an
//! apology in `response_text`; only malformed requests are rejected.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::models::{ConversationState, ThreadSummary};
use crate::pipeline::{Orchestrator, TurnRequest, TurnResponse};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

/// Builds the router around an already-wired orchestrator.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/threads", post(handle_create_thread))
        .route(
            "/threads/{thread_id}",
            get(handle_get_thread).delete(handle_delete_thread),
        )
        .route("/users/{user_id}", get(handle_get_user))
        .route("/users/{user_id}/threads", get(handle_list_threads))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { orchestrator })
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::connect(config).await?;
    crate::migrate::apply_schema(&pool).await?;
    let orchestrator = Arc::new(Orchestrator::from_config(config, pool)?);

    let app = router(orchestrator);
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "stylist server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: err.to_string(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    thread_id: Option<String>,
    user_id: String,
    message: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<TurnResponse>, AppError> {
    if req.user_id.trim().is_empty() {
        return Err(bad_request("user_id must not be empty"));
    }
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let response = state
        .orchestrator
        .run_turn(TurnRequest {
            thread_id: req.thread_id,
            user_id: req.user_id,
            message: req.message,
        })
        .await
        .map_err(internal)?;
    Ok(Json(response))
}

// ============ Threads ============

#[derive(Deserialize)]
struct CreateThreadRequest {
    user_id: String,
}

#[derive(Serialize)]
struct CreateThreadResponse {
    thread_id: String,
}

async fn handle_create_thread(
    State(state): State<AppState>,
    Json(req): Json<CreateThreadRequest>,
) -> Result<(StatusCode, Json<CreateThreadResponse>), AppError> {
    if req.user_id.trim().is_empty() {
        return Err(bad_request("user_id must not be empty"));
    }
    let thread_id = state
        .orchestrator
        .create_thread(&req.user_id)
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(CreateThreadResponse { thread_id })))
}

async fn handle_get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<ConversationState>, AppError> {
    match state.orchestrator.store().get(&thread_id).await {
        Ok(Some(s)) => Ok(Json(s)),
        Ok(None) => Err(not_found(format!("thread not found: {}", thread_id))),
        Err(e) => Err(internal(e)),
    }
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn handle_delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = state
        .orchestrator
        .store()
        .delete(&thread_id)
        .await
        .map_err(internal)?;
    if !deleted {
        return Err(not_found(format!("thread not found: {}", thread_id)));
    }
    Ok(Json(DeleteResponse { deleted }))
}

#[derive(Serialize)]
struct ThreadListResponse {
    threads: Vec<ThreadSummary>,
}

async fn handle_list_threads(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<ThreadListResponse>, AppError> {
    let threads = state
        .orchestrator
        .store()
        .list_for_user(&user_id)
        .await
        .map_err(internal)?;
    Ok(Json(ThreadListResponse { threads }))
}

// ============ Users ============

/// Profile view without the raw vectors.
#[derive(Serialize)]
struct UserResponse {
    user_id: String,
    username: Option<String>,
    photo_refs: Vec<String>,
    has_preference_embeddings: bool,
    attributes: serde_json::Map<String, serde_json::Value>,
}

async fn handle_get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserResponse>, AppError> {
    let profile = state
        .orchestrator
        .users()
        .get_profile(&user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("user not found: {}", user_id)))?;

    Ok(Json(UserResponse {
        user_id: profile.user_id,
        username: profile.username,
        photo_refs: profile.photo_refs,
        has_preference_embeddings: profile.preference_embeddings.is_some(),
        attributes: profile.attributes,
    }))
}
