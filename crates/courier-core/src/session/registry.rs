//! SessionRegistry - the process-wide map from session id to session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::state::{Session, SessionId};

/// Thread-safe map of live sessions.
///
/// There is no iteration and no eviction: a session stays until someone
/// removes it. Operations on different ids are independent; the lock is
/// only held for the map mutation itself, never across I/O.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions().get(id).cloned()
    }

    /// Insert a session under its own id, returning whatever it replaced.
    pub fn put(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions().insert(session.id.clone(), session)
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions().remove(id)
    }

    /// Remove `session` only if it is still the entry registered under its id.
    pub fn remove_exact(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions();
        match sessions.get(&session.id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.id);
                true
            }
            _ => false,
        }
    }

    /// Look up `id`, creating and inserting it with `create` if absent.
    ///
    /// Lookup and insert happen under one lock, so of two concurrent callers
    /// for an unseen id exactly one creates. Returns the session and whether
    /// this call created it. `create` runs under the lock, so it must not
    /// block or do I/O.
    pub fn get_or_try_insert_with<E>(
        &self,
        id: &SessionId,
        create: impl FnOnce() -> Result<Arc<Session>, E>,
    ) -> Result<(Arc<Session>, bool), E> {
        let mut sessions = self.sessions();
        if let Some(existing) = sessions.get(id) {
            return Ok((Arc::clone(existing), false));
        }
        let session = create()?;
        sessions.insert(id.clone(), Arc::clone(&session));
        Ok((session, true))
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}
