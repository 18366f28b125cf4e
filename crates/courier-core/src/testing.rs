//! In-memory client doubles for exercising the session layer without a
//! bridge process. Enabled for this crate's tests and, through the
//! `test-util` feature, for dependents.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, OwnedMutexGuard};

use crate::client::{ClientError, ClientEvent, ClientFactory, MessagingClient, OutgoingMessage};
use crate::event_bus::ClientEventBus;
use crate::paths::session_storage_dir;
use crate::session::SessionId;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A scriptable [`MessagingClient`].
///
/// Events are pushed by the test with [`FakeClient::emit`]; sends are
/// recorded and can be held open or made to fail.
pub struct FakeClient {
    events: ClientEventBus,
    sent: Mutex<Vec<(String, OutgoingMessage)>>,
    send_error: Mutex<Option<String>>,
    send_gate: Arc<tokio::sync::Mutex<()>>,
    sends_started: AtomicUsize,
    initialize_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    fail_initialize: AtomicBool,
    fail_destroy: AtomicBool,
    storage_dir: Option<PathBuf>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self {
            events: ClientEventBus::new(),
            sent: Mutex::new(Vec::new()),
            send_error: Mutex::new(None),
            send_gate: Arc::new(tokio::sync::Mutex::new(())),
            sends_started: AtomicUsize::new(0),
            initialize_calls: AtomicUsize::new(0),
            destroy_calls: AtomicUsize::new(0),
            fail_initialize: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            storage_dir: None,
        }
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Publish an event as if the backend had produced it.
    pub fn emit(&self, event: ClientEvent) -> usize {
        self.events.emit(event)
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }

    /// Everything delivered so far, in order.
    pub fn sent(&self) -> Vec<(String, OutgoingMessage)> {
        lock(&self.sent).clone()
    }

    /// Make subsequent sends fail with `error`, or succeed again with `None`.
    pub fn fail_sends(&self, error: Option<&str>) {
        *lock(&self.send_error) = error.map(str::to_string);
    }

    pub fn fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Block every send until the returned guard is dropped.
    pub async fn hold_sends(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.send_gate).lock_owned().await
    }

    /// Sends that have entered the client, including ones still held.
    pub fn sends_started(&self) -> usize {
        self.sends_started.load(Ordering::SeqCst)
    }

    pub fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

impl Default for FakeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagingClient for FakeClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        self.initialize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(ClientError::Protocol("initialize refused".to_string()));
        }
        Ok(())
    }

    async fn send_message(&self, to: &str, message: OutgoingMessage) -> Result<(), ClientError> {
        self.sends_started.fetch_add(1, Ordering::SeqCst);
        let _gate = self.send_gate.lock().await;

        let error = lock(&self.send_error).clone();
        if let Some(error) = error {
            return Err(ClientError::SendFailed(error));
        }
        lock(&self.sent).push((to.to_string(), message));
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn storage_dir(&self) -> Option<PathBuf> {
        self.storage_dir.clone()
    }
}

/// A [`ClientFactory`] handing out [`FakeClient`]s and remembering the
/// latest one per id.
#[derive(Default)]
pub struct FakeFactory {
    clients: Mutex<HashMap<String, Arc<FakeClient>>>,
    created: AtomicUsize,
    fail_creates: AtomicBool,
    fail_initialize: AtomicBool,
    storage_root: Option<PathBuf>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clients get `{root}/session-{id}` as their storage directory.
    pub fn with_storage_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: Some(root.into()),
            ..Self::default()
        }
    }

    /// The most recently created client for `id`.
    pub fn client(&self, id: &str) -> Option<Arc<FakeClient>> {
        lock(&self.clients).get(id).cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Clients created from now on refuse to initialize.
    pub fn fail_initialize(&self, fail: bool) {
        self.fail_initialize.store(fail, Ordering::SeqCst);
    }
}

impl ClientFactory for FakeFactory {
    fn create(&self, id: &SessionId) -> Result<Arc<dyn MessagingClient>, ClientError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ClientError::Protocol("factory unavailable".to_string()));
        }

        let mut client = FakeClient::new();
        if let Some(root) = &self.storage_root {
            client = client.with_storage_dir(session_storage_dir(root, id.as_str()));
        }
        client.fail_initialize(self.fail_initialize.load(Ordering::SeqCst));

        let client = Arc::new(client);
        lock(&self.clients).insert(id.to_string(), Arc::clone(&client));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(client)
    }
}
