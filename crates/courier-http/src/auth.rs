//! Bearer token authentication middleware.
//!
//! When the server has no token configured every request passes. Otherwise
//! the request must carry `Authorization: Bearer <token>` or it is answered
//! with 401.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::SharedState;

/// Extract the bearer token from the Authorization header.
///
/// Returns None if the header is missing, not UTF-8, or uses another scheme.
fn extract_bearer_token<B>(req: &axum::http::Request<B>) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

pub async fn auth_middleware(
    State(state): State<Arc<SharedState>>,
    req: Request,
    next: Next,
) -> Response {
    if state.validate_token(extract_bearer_token(&req)) {
        next.run(req).await
    } else {
        log::debug!("Rejected unauthenticated request to {}", req.uri().path());
        (StatusCode::UNAUTHORIZED, "Invalid or missing authentication token").into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_bearer_token_valid() {
        let req = Request::builder()
            .header("Authorization", "Bearer test-token-123")
            .body(())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), Some("test-token-123"));
    }

    #[test]
    fn extract_bearer_token_missing() {
        let req = Request::builder().body(()).unwrap();
        assert_eq!(extract_bearer_token(&req), None);
    }

    #[test]
    fn extract_bearer_token_wrong_scheme() {
        let req = Request::builder()
            .header("Authorization", "Basic dXNlcjpwYXNz")
            .body(())
            .unwrap();
        assert_eq!(extract_bearer_token(&req), None);
    }
}
