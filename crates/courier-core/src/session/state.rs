//! Per-session state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::client::MessagingClient;

/// Caller-supplied identifier for one messaging account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lifecycle flags, read and written together under one lock so that
/// check-and-set is atomic per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    /// The client is authenticated and connected
    pub ready: bool,
    /// A start request (bring-up or pairing wait) is in flight
    pub initializing: bool,
    /// A send is in flight
    pub sending: bool,
}

/// Result of trying to claim the pairing slot of an existing session.
pub enum PairingClaim<'a> {
    /// Nothing to do, the session is already authenticated.
    Ready,
    /// Another start request holds the slot.
    Busy,
    /// The slot is ours until the guard drops.
    Claimed(PairingGuard<'a>),
}

/// Clears `initializing` when dropped.
pub struct PairingGuard<'a> {
    session: &'a Session,
}

impl Drop for PairingGuard<'_> {
    fn drop(&mut self) {
        self.session.flags().initializing = false;
    }
}

/// Clears `sending` when dropped, however the send ended.
pub struct SendGuard<'a> {
    session: &'a Session,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.session.flags().sending = false;
    }
}

/// A messaging identity and the client bound to it.
///
/// The session owns its client exclusively; whoever removes the session from
/// the registry is responsible for destroying the client.
pub struct Session {
    pub id: SessionId,
    client: Arc<dyn MessagingClient>,
    flags: Mutex<SessionFlags>,
    closed: watch::Sender<bool>,
}

impl Session {
    /// A freshly created session: not ready, initializing, not sending.
    pub fn new(id: SessionId, client: Arc<dyn MessagingClient>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            client,
            flags: Mutex::new(SessionFlags {
                ready: false,
                initializing: true,
                sending: false,
            }),
            closed,
        }
    }

    pub fn client(&self) -> &Arc<dyn MessagingClient> {
        &self.client
    }

    fn flags(&self) -> MutexGuard<'_, SessionFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current flags.
    pub fn snapshot(&self) -> SessionFlags {
        *self.flags()
    }

    pub fn is_ready(&self) -> bool {
        self.flags().ready
    }

    /// The client reported ready.
    pub fn mark_ready(&self) {
        let mut flags = self.flags();
        flags.ready = true;
        flags.initializing = false;
    }

    /// Take ownership of the `initializing` flag set at creation.
    pub fn adopt_pairing(&self) -> PairingGuard<'_> {
        self.flags().initializing = true;
        PairingGuard { session: self }
    }

    /// Claim the pairing slot of an existing session.
    pub fn try_begin_pairing(&self) -> PairingClaim<'_> {
        let mut flags = self.flags();
        if flags.initializing {
            return PairingClaim::Busy;
        }
        if flags.ready {
            return PairingClaim::Ready;
        }
        flags.initializing = true;
        PairingClaim::Claimed(PairingGuard { session: self })
    }

    /// Claim the send lock, or `None` if a send is already in flight.
    pub fn try_begin_send(&self) -> Option<SendGuard<'_>> {
        let mut flags = self.flags();
        if flags.sending {
            return None;
        }
        flags.sending = true;
        Some(SendGuard { session: self })
    }

    /// Signal everyone waiting on this session that it is gone.
    pub fn mark_closed(&self) {
        self.closed.send_replace(true);
    }

    /// Receiver that flips to `true` once the session is torn down.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClient;

    fn session(id: &str) -> Session {
        Session::new(SessionId::new(id), Arc::new(FakeClient::new()))
    }

    mod session_id {
        use super::*;

        #[test]
        fn display_shows_inner_string() {
            let id = SessionId::new("acct-123");
            assert_eq!(format!("{}", id), "acct-123");
            assert_eq!(id.as_str(), "acct-123");
        }

        #[test]
        fn can_be_used_as_hashmap_key() {
            use std::collections::HashMap;
            let mut map = HashMap::new();
            map.insert(SessionId::from("a"), 1);
            assert_eq!(map.get(&SessionId::new("a")), Some(&1));
        }

        #[test]
        fn serializes_as_plain_string() {
            let json = serde_json::to_string(&SessionId::new("alice")).unwrap();
            assert_eq!(json, "\"alice\"");
            let back: SessionId = serde_json::from_str(&json).unwrap();
            assert_eq!(back, SessionId::new("alice"));
        }
    }

    mod flags {
        use super::*;

        #[test]
        fn new_session_is_initializing() {
            let session = session("a");
            assert_eq!(
                session.snapshot(),
                SessionFlags {
                    ready: false,
                    initializing: true,
                    sending: false
                }
            );
        }

        #[test]
        fn mark_ready_ends_initialization() {
            let session = session("a");
            session.mark_ready();

            let flags = session.snapshot();
            assert!(flags.ready);
            assert!(!flags.initializing);
        }

        #[test]
        fn adopted_pairing_clears_on_drop() {
            let session = session("a");
            {
                let _guard = session.adopt_pairing();
                assert!(session.snapshot().initializing);
            }
            assert!(!session.snapshot().initializing);
        }
    }

    mod pairing_claim {
        use super::*;

        #[test]
        fn busy_while_initializing() {
            let session = session("a");
            assert!(matches!(session.try_begin_pairing(), PairingClaim::Busy));
        }

        #[test]
        fn ready_session_needs_nothing() {
            let session = session("a");
            session.mark_ready();
            assert!(matches!(session.try_begin_pairing(), PairingClaim::Ready));
            assert!(!session.snapshot().initializing);
        }

        #[test]
        fn idle_session_can_be_claimed_once() {
            let session = session("a");
            drop(session.adopt_pairing());

            let first = session.try_begin_pairing();
            assert!(matches!(first, PairingClaim::Claimed(_)));
            assert!(session.snapshot().initializing);
            assert!(matches!(session.try_begin_pairing(), PairingClaim::Busy));

            drop(first);
            assert!(!session.snapshot().initializing);
        }
    }

    mod send_lock {
        use super::*;

        #[test]
        fn second_send_is_refused() {
            let session = session("a");
            let guard = session.try_begin_send();
            assert!(guard.is_some());
            assert!(session.snapshot().sending);
            assert!(session.try_begin_send().is_none());
        }

        #[test]
        fn released_on_drop() {
            let session = session("a");
            drop(session.try_begin_send());
            assert!(!session.snapshot().sending);
            assert!(session.try_begin_send().is_some());
        }

        #[test]
        fn independent_of_pairing() {
            let session = session("a");
            let _send = session.try_begin_send();
            assert!(matches!(session.try_begin_pairing(), PairingClaim::Busy));
            assert!(session.snapshot().sending);
        }
    }

    mod closed {
        use super::*;

        #[test]
        fn starts_open() {
            assert!(!*session("a").closed_signal().borrow());
        }

        #[tokio::test]
        async fn waiters_observe_close() {
            let session = session("a");
            let mut signal = session.closed_signal();

            session.mark_closed();

            assert!(signal.wait_for(|closed| *closed).await.is_ok());
        }
    }
}
