use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event, Sse},
    },
    routing::{delete, get, post},
};
use chrono::Utc;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use easel_bridge::{
    Bridge, PlacementRequest, PortSpec, ResultCallback, SessionRegistry, SessionSnapshot,
};

use crate::config::Config;

const SESSION_ID_MAX_LEN: usize = 128;

#[derive(Clone)]
pub struct AppState {
    config: Config,
    sessions: Arc<SessionRegistry>,
    started_at: chrono::DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let sessions = Arc::new(SessionRegistry::new(config.bridge_config()));
        Self {
            config,
            sessions,
            started_at: Utc::now(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/:session_id", delete(remove_session))
        .route("/v1/sessions/:session_id/stream", get(stream_commands))
        .route("/v1/sessions/:session_id/results", post(post_result))
        .route(
            "/v1/sessions/:session_id/interactions",
            post(begin_interaction),
        )
        .route(
            "/v1/sessions/:session_id/commands/delete",
            post(command_delete),
        )
        .route(
            "/v1/sessions/:session_id/commands/create",
            post(command_create),
        )
        .route(
            "/v1/sessions/:session_id/commands/variable",
            post(command_variable),
        )
        .route("/v1/sessions/:session_id/commands/edit", post(command_edit))
        .route(
            "/v1/sessions/:session_id/commands/replace",
            post(command_replace),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

enum ApiError {
    InvalidSessionId(String),
    InvalidBody(String),
    UnknownSession(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::InvalidSessionId(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "error": "invalid_session_id",
                    "message": message,
                })),
            )
                .into_response(),
            Self::InvalidBody(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "error": "invalid_body",
                    "message": message,
                })),
            )
                .into_response(),
            Self::UnknownSession(session_id) => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "unknown_session",
                    "message": format!("no session '{session_id}'"),
                })),
            )
                .into_response(),
        }
    }
}

fn validate_session_id(session_id: &str) -> Result<(), ApiError> {
    if session_id.is_empty() {
        return Err(ApiError::InvalidSessionId(
            "session id must not be empty".to_string(),
        ));
    }
    if session_id.len() > SESSION_ID_MAX_LEN {
        return Err(ApiError::InvalidSessionId(format!(
            "session id exceeds {SESSION_ID_MAX_LEN} characters"
        )));
    }
    let valid = session_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-');
    if !valid {
        return Err(ApiError::InvalidSessionId(
            "session id may only use letters, digits, '.', '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

/// Every surface resolves its session this way, so merely naming a
/// session brings it into existence.
fn session(state: &AppState, session_id: &str) -> Result<Arc<Bridge>, ApiError> {
    validate_session_id(session_id)?;
    Ok(state.sessions.get_or_create(session_id))
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError::InvalidBody(rejection.body_text())),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
    sessions: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        uptime_seconds,
        sessions: state.sessions.len(),
    })
}

#[derive(Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionSnapshot>,
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.sessions.snapshots(),
    })
}

/// The workspace client's push channel. Attaching supersedes any
/// previous attachment for the same session; the stream carries command
/// frames and idle heartbeats until the session is superseded or torn
/// down.
async fn stream_commands(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let bridge = session(&state, &session_id)?;
    let dispatch = bridge.attach_client();
    info!(session_id = %session_id, "workspace client attached");
    let frames = stream::unfold(dispatch, |mut dispatch| async move {
        let message = dispatch.next_message().await?;
        match Event::default().json_data(&message) {
            Ok(event) => Some((Ok(event), dispatch)),
            Err(err) => {
                error!(error = %err, "failed to encode push frame");
                None
            }
        }
    });
    Ok(Sse::new(frames))
}

async fn post_result(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<ResultCallback>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bridge = session(&state, &session_id)?;
    let callback = parse_body(body)?;
    let envelope = callback
        .into_envelope()
        .map_err(|err| ApiError::InvalidBody(err.to_string()))?;
    let disposition = bridge.accept_result(envelope);
    Ok(Json(serde_json::json!({
        "ok": true,
        "disposition": disposition.as_str(),
    })))
}

async fn begin_interaction(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let bridge = session(&state, &session_id)?;
    bridge.begin_interaction();
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn remove_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    validate_session_id(&session_id)?;
    if !state.sessions.remove(&session_id) {
        return Err(ApiError::UnknownSession(session_id));
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
struct DeleteCommandBody {
    block_id: String,
}

#[derive(Deserialize)]
struct CreateCommandBody {
    block_spec: String,
    #[serde(default)]
    placement: Option<PlacementRequest>,
}

#[derive(Deserialize)]
struct VariableCommandBody {
    variable_name: String,
}

#[derive(Deserialize)]
struct EditCommandBody {
    #[serde(default)]
    inputs: Vec<PortSpec>,
    #[serde(default)]
    outputs: Vec<PortSpec>,
}

#[derive(Deserialize)]
struct ReplaceCommandBody {
    block_id: String,
    block_spec: String,
}

#[derive(Serialize)]
struct CommandResponse {
    result: String,
}

async fn command_delete(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<DeleteCommandBody>, JsonRejection>,
) -> Result<Json<CommandResponse>, ApiError> {
    let bridge = session(&state, &session_id)?;
    let body = parse_body(body)?;
    let result = bridge.delete_block(&body.block_id).await;
    Ok(Json(CommandResponse { result }))
}

async fn command_create(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<CreateCommandBody>, JsonRejection>,
) -> Result<Json<CommandResponse>, ApiError> {
    let bridge = session(&state, &session_id)?;
    let body = parse_body(body)?;
    let result = bridge.create_block(&body.block_spec, body.placement).await;
    Ok(Json(CommandResponse { result }))
}

async fn command_variable(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<VariableCommandBody>, JsonRejection>,
) -> Result<Json<CommandResponse>, ApiError> {
    let bridge = session(&state, &session_id)?;
    let body = parse_body(body)?;
    let result = bridge.create_variable(&body.variable_name).await;
    Ok(Json(CommandResponse { result }))
}

async fn command_edit(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<EditCommandBody>, JsonRejection>,
) -> Result<Json<CommandResponse>, ApiError> {
    let bridge = session(&state, &session_id)?;
    let body = parse_body(body)?;
    let result = bridge.edit_interface(body.inputs, body.outputs).await;
    Ok(Json(CommandResponse { result }))
}

async fn command_replace(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Result<Json<ReplaceCommandBody>, JsonRejection>,
) -> Result<Json<CommandResponse>, ApiError> {
    let bridge = session(&state, &session_id)?;
    let body = parse_body(body)?;
    let result = bridge.replace_block(&body.block_id, &body.block_spec).await;
    Ok(Json(CommandResponse { result }))
}
