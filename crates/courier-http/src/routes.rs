//! HTTP route handlers for the session operations.
//!
//! Bodies are JSON. An empty body counts as `{}` so that a bare POST gets the
//! same "Missing id" answer as an explicit empty object. Errors are answered
//! with a status code and a plain-text message.

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use courier_core::{ErrorKind, SendRequest, SessionError, StartOutcome};

use super::SharedState;

/// Body of `POST /start-session` and `POST /logout`.
#[derive(Debug, Default, Deserialize)]
pub struct IdRequest {
    #[serde(default)]
    pub id: Option<String>,
}

/// Body of `POST /send-message`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_data: Option<String>,
}

impl From<SendMessageRequest> for SendRequest {
    fn from(body: SendMessageRequest) -> Self {
        SendRequest {
            id: body.id,
            to: body.to,
            message: body.message,
            file_name: body.file_name,
            file_data: body.file_data,
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: SessionError) -> Response {
    (status_for(error.kind()), error.to_string()).into_response()
}

/// Parse a JSON body, treating an empty one as the default value.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        log::debug!("Rejected malformed request body: {}", e);
        (StatusCode::BAD_REQUEST, format!("Invalid JSON body: {}", e)).into_response()
    })
}

/// Handler for POST /start-session
pub async fn start_session(State(state): State<Arc<SharedState>>, body: Bytes) -> Response {
    let request: IdRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let id = request.id.unwrap_or_default();
    log::debug!("HTTP start-session: {}", id);

    match state.controller.start_session(&id).await {
        Ok(StartOutcome::AlreadyAuthenticated) => {
            Json(json!({ "message": "Already authenticated" })).into_response()
        }
        Ok(StartOutcome::Qr(qr)) => Json(json!({ "qr": qr })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for POST /send-message
pub async fn send_message(State(state): State<Arc<SharedState>>, body: Bytes) -> Response {
    let request: SendMessageRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    log::debug!("HTTP send-message: {:?} -> {:?}", request.id, request.to);

    match state.controller.send_message(request.into()).await {
        Ok(()) => Json(json!({ "status": "sent" })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for POST /logout
pub async fn logout(State(state): State<Arc<SharedState>>, body: Bytes) -> Response {
    let request: IdRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let id = request.id.unwrap_or_default();
    log::debug!("HTTP logout: {}", id);

    match state.controller.logout(&id).await {
        Ok(()) => Json(json!({ "status": "logged out" })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Handler for GET /health
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}
