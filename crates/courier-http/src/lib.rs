//! HTTP surface for Courier.
//!
//! Exposes start-session, send-message and logout as JSON POST routes over
//! a shared [`SessionController`](courier_core::SessionController).

mod auth;
mod routes;
mod state;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

pub use state::{SharedState, DEFAULT_MAX_BODY_BYTES};

/// Build the application router.
pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/start-session", post(routes::start_session).fallback(routes::not_found))
        .route("/send-message", post(routes::send_message).fallback(routes::not_found))
        .route("/logout", post(routes::logout).fallback(routes::not_found))
        .route("/health", get(routes::health).fallback(routes::not_found))
        .fallback(routes::not_found)
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::auth_middleware,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<SharedState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("HTTP server listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
