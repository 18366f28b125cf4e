//! The messaging-client collaborator.
//!
//! A [`MessagingClient`] is the component that actually speaks to the
//! messaging backend for one identity: it pairs, keeps credentials on disk,
//! sends messages and reports lifecycle changes as [`ClientEvent`]s. The
//! session controller only ever talks to it through this trait.

mod bridge;
mod message;
mod protocol;

pub use bridge::{BridgeClient, BridgeConfig, BridgeFactory};
pub use message::{infer_mime_type, OutgoingMessage};
pub use protocol::{BridgeCommand, BridgeEvent};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::session::SessionId;

/// Lifecycle notifications raised by a client on its own schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Authenticated and connected; messages can be sent.
    Ready,
    /// A pairing artifact (e.g. QR payload) the user must scan.
    Qr(String),
    /// The connection to the backend is gone for good.
    Disconnected(String),
    /// Authentication was rejected. Diagnostic only.
    AuthFailure(String),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Failed to spawn bridge: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Bridge I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bridge protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    SendFailed(String),

    #[error("Client is closed")]
    Closed,
}

/// One messaging account connection.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Start connecting. Completion is reported through events, not the
    /// return value: `Qr` zero or more times, then `Ready`.
    async fn initialize(&self) -> Result<(), ClientError>;

    /// Deliver `message` to `to`. Resolves once the backend accepted it.
    async fn send_message(&self, to: &str, message: OutgoingMessage) -> Result<(), ClientError>;

    /// Tear the connection down. Best-effort.
    async fn destroy(&self) -> Result<(), ClientError>;

    /// Subscribe to this client's lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;

    /// Where this identity's credentials are persisted, if anywhere.
    fn storage_dir(&self) -> Option<PathBuf>;
}

/// Builds a fresh client bound to one identity.
pub trait ClientFactory: Send + Sync {
    fn create(&self, id: &SessionId) -> Result<Arc<dyn MessagingClient>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_failed_displays_backend_message() {
        let error = ClientError::SendFailed("Evaluation failed: number not on network".to_string());
        assert_eq!(error.to_string(), "Evaluation failed: number not on network");
    }

    #[test]
    fn spawn_error_mentions_bridge() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let error = ClientError::Spawn(io);
        assert!(error.to_string().contains("Failed to spawn bridge"));
        assert!(error.to_string().contains("no such file"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let error: ClientError = io.into();
        assert!(matches!(error, ClientError::Io(_)));
    }
}
