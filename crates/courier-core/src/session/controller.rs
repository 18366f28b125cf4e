//! SessionController - start, send and logout, serialized per session id.
//!
//! The controller owns the registry and the client factory. Every operation
//! names a session id; operations on different ids never wait on each other,
//! while a second start or send on the same id is rejected with a conflict
//! instead of queuing.
//!
//! Teardown (explicit logout, a `Disconnected` event, or a failed
//! `initialize`) always goes through [`teardown`]: remove the registry entry
//! first, then destroy the client and delete its credential storage on a
//! best-effort basis.

use std::path::Path;
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

use super::registry::SessionRegistry;
use super::state::{PairingClaim, Session, SessionId};
use crate::client::{ClientError, ClientEvent, ClientFactory, OutgoingMessage};
use crate::paths::validate_path_component;

/// What a successful start request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The session is (or just became) ready; nothing to scan.
    AlreadyAuthenticated,
    /// A pairing artifact the caller must present to the user.
    Qr(String),
}

/// Broad error category, one per caller reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Conflict,
    NotFound,
    Internal,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Session initialization in progress")]
    InitializationInProgress(SessionId),

    #[error("Another message is being sent")]
    SendInProgress(SessionId),

    #[error("Session not found")]
    NotFound(SessionId),

    #[error("{0}")]
    Internal(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SessionError::InitializationInProgress(_) | SessionError::SendInProgress(_) => {
                ErrorKind::Conflict
            }
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<ClientError> for SessionError {
    fn from(error: ClientError) -> Self {
        SessionError::Internal(error.to_string())
    }
}

/// A send request as it arrives from a caller; every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub id: Option<String>,
    pub to: Option<String>,
    pub message: Option<String>,
    pub file_name: Option<String>,
    pub file_data: Option<String>,
}

impl SendRequest {
    /// Validate and split into session id, recipient and payload.
    ///
    /// Requires `id`, `to`, and at least one of `message` / `file_data`.
    /// Empty strings count as missing. Whenever `file_data` is present the
    /// payload is an attachment captioned with `message`.
    pub fn into_parts(self) -> Result<(SessionId, String, OutgoingMessage), SessionError> {
        let missing = || SessionError::InvalidRequest("Missing fields".to_string());

        let id = non_empty(self.id).ok_or_else(missing)?;
        let to = non_empty(self.to).ok_or_else(missing)?;
        let message = non_empty(self.message);

        let payload = match (non_empty(self.file_data), message) {
            (Some(data), caption) => {
                OutgoingMessage::attachment(non_empty(self.file_name), data, caption)
            }
            (None, Some(body)) => OutgoingMessage::text(body),
            (None, None) => return Err(missing()),
        };

        Ok((SessionId::new(id), to, payload))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_id(raw: &str) -> Result<SessionId, SessionError> {
    if raw.is_empty() {
        return Err(SessionError::InvalidRequest("Missing id".to_string()));
    }
    Ok(SessionId::new(raw))
}

/// Drives the per-session state machine on top of a [`SessionRegistry`].
pub struct SessionController {
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn ClientFactory>,
}

impl SessionController {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self::with_registry(Arc::new(SessionRegistry::new()), factory)
    }

    pub fn with_registry(registry: Arc<SessionRegistry>, factory: Arc<dyn ClientFactory>) -> Self {
        Self { registry, factory }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Look up a live session.
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.registry.get(&SessionId::new(id))
    }

    /// Start (or resume pairing for) the session `id`.
    ///
    /// Unseen ids get a new session and client; the call then waits for
    /// whichever comes first, a pairing artifact or ready. Ready sessions
    /// return immediately. A start already in flight for `id` is a conflict.
    /// There is no timeout: a silent client keeps the caller waiting.
    pub async fn start_session(&self, id: &str) -> Result<StartOutcome, SessionError> {
        let id = parse_id(id)?;
        validate_path_component(id.as_str()).map_err(SessionError::InvalidRequest)?;

        let (session, created) = self
            .registry
            .get_or_try_insert_with(&id, || -> Result<_, SessionError> {
                let client = self.factory.create(&id)?;
                Ok(Arc::new(Session::new(id.clone(), client)))
            })?;

        // Subscribe before anything can fire so neither race participant is missed.
        let events = session.client().subscribe();

        let _pairing = if created {
            log::info!("Created session {}", id);
            let pairing = session.adopt_pairing();
            spawn_event_listener(Arc::clone(&self.registry), &session);
            spawn_initialize(Arc::clone(&self.registry), &session);
            pairing
        } else {
            match session.try_begin_pairing() {
                PairingClaim::Ready => return Ok(StartOutcome::AlreadyAuthenticated),
                PairingClaim::Busy => return Err(SessionError::InitializationInProgress(id)),
                PairingClaim::Claimed(pairing) => pairing,
            }
        };

        race_pairing(&session, events).await
    }

    /// Send through a ready session. Sends on one session never overlap.
    pub async fn send_message(&self, request: SendRequest) -> Result<(), SessionError> {
        let (id, to, message) = request.into_parts()?;

        let session = self
            .registry
            .get(&id)
            .filter(|session| session.is_ready())
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;

        let _sending = session
            .try_begin_send()
            .ok_or_else(|| SessionError::SendInProgress(id.clone()))?;

        session
            .client()
            .send_message(&to, message)
            .await
            .map_err(|e| {
                log::warn!("Send through session {} failed: {}", id, e);
                SessionError::Internal(e.to_string())
            })
    }

    /// Tear the session down and delete its stored credentials.
    ///
    /// Reports success as soon as the registry entry is gone; destroy and
    /// storage cleanup failures are only logged.
    pub async fn logout(&self, id: &str) -> Result<(), SessionError> {
        let id = parse_id(id)?;
        let session = self
            .registry
            .remove(&id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;

        log::info!("Logging out session {}", id);
        teardown(session).await;
        Ok(())
    }
}

/// Wait for the first of a pairing artifact or ready.
///
/// Ready is recorded on the session before returning, so a caller told
/// "already authenticated" can send at once. The receiver is dropped on
/// return, which retracts the losing side.
async fn race_pairing(
    session: &Session,
    mut events: broadcast::Receiver<ClientEvent>,
) -> Result<StartOutcome, SessionError> {
    let id = &session.id;
    let closed = wait_closed(session.closed_signal());
    tokio::pin!(closed);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ClientEvent::Qr(qr)) => return Ok(StartOutcome::Qr(qr)),
                Ok(ClientEvent::Ready) => {
                    session.mark_ready();
                    return Ok(StartOutcome::AlreadyAuthenticated);
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Pairing wait for {} skipped {} events", id, skipped);
                }
                Err(RecvError::Closed) => return Err(SessionError::NotFound(id.clone())),
            },
            _ = &mut closed => {
                return Err(SessionError::NotFound(id.clone()));
            }
        }
    }
}

/// Resolves once the session is torn down (or its sender is gone).
async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Handle the session's lifecycle events for as long as it exists.
///
/// Holds only a weak reference, so a removed session is not kept alive.
fn spawn_event_listener(registry: Arc<SessionRegistry>, session: &Arc<Session>) {
    let mut events = session.client().subscribe();
    let weak = Arc::downgrade(session);
    let id = session.id.clone();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Session {} listener skipped {} events", id, skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(session) = weak.upgrade() else {
                break;
            };

            match event {
                ClientEvent::Ready => {
                    session.mark_ready();
                    log::info!("Session {} is ready", id);
                }
                ClientEvent::Disconnected(reason) => {
                    log::info!("Session {} disconnected: {}", id, reason);
                    if registry.remove_exact(&session) {
                        teardown(session).await;
                    }
                    break;
                }
                ClientEvent::AuthFailure(reason) => {
                    log::error!("Auth failure for {}: {}", id, reason);
                }
                ClientEvent::Qr(_) => {
                    log::debug!("Session {} issued a pairing code", id);
                }
            }
        }
    });
}

/// Bring the client up in the background. A failed bring-up tears the
/// session down so the id can be started again.
fn spawn_initialize(registry: Arc<SessionRegistry>, session: &Arc<Session>) {
    let client = Arc::clone(session.client());
    let weak: Weak<Session> = Arc::downgrade(session);
    let id = session.id.clone();

    tokio::spawn(async move {
        let Err(e) = client.initialize().await else {
            return;
        };
        log::error!("Failed to initialize session {}: {}", id, e);
        if let Some(session) = weak.upgrade() {
            if registry.remove_exact(&session) {
                teardown(session).await;
            }
        }
    });
}

/// Release everything a session owned. The caller has already removed it
/// from the registry.
async fn teardown(session: Arc<Session>) {
    session.mark_closed();

    if let Err(e) = session.client().destroy().await {
        log::warn!("Failed to destroy client for {}: {}", session.id, e);
    }

    if let Some(dir) = session.client().storage_dir() {
        remove_storage(&session.id, &dir).await;
    }
}

async fn remove_storage(id: &SessionId, dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => log::debug!("Removed session data for {} at {}", id, dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::error!("Failed to remove session data for {}: {}", id, e),
    }
}
