//! Shared state for the HTTP server.
//!
//! Wraps the session controller and the server's own settings.

use courier_core::SessionController;
use std::sync::Arc;

/// Default request body limit, large enough for base64 attachments.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10_000_000;

/// Shared state available to all HTTP handlers.
pub struct SharedState {
    /// Drives every session operation.
    pub controller: Arc<SessionController>,
    /// Bearer token required on every route, if set.
    pub auth_token: Option<String>,
    /// Requests with a larger body are rejected with 413.
    pub max_body_bytes: usize,
}

impl SharedState {
    /// Create shared state with no authentication and the default body limit.
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self {
            controller,
            auth_token: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Whether `token` grants access. Always true when no token is configured.
    pub fn validate_token(&self, token: Option<&str>) -> bool {
        match &self.auth_token {
            None => true,
            Some(expected) => token == Some(expected.as_str()),
        }
    }
}
