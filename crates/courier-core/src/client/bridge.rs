//! Process-backed messaging client.
//!
//! Each session gets its own bridge process (typically a small script around
//! a messaging library) speaking the JSON-lines protocol in
//! [`super::protocol`]. This module handles:
//! - Spawning the bridge with the session's credential directory
//! - Forwarding lifecycle events onto the client's event bus
//! - Matching send acknowledgements to pending sends
//! - Turning an unexpected exit into a `Disconnected` event
//! - Graceful destroy with a kill fallback

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{broadcast, oneshot, watch};

use super::protocol::{BridgeCommand, BridgeEvent};
use super::{ClientError, ClientEvent, ClientFactory, MessagingClient, OutgoingMessage};
use crate::event_bus::ClientEventBus;
use crate::logging::{log_line, open_transcript, TranscriptHandle};
use crate::paths::session_storage_dir;
use crate::session::SessionId;

const DEFAULT_DESTROY_TIMEOUT: Duration = Duration::from_secs(5);

type SendResult = Result<(), ClientError>;
type PendingSends = Arc<Mutex<HashMap<u64, oneshot::Sender<SendResult>>>>;

/// How to launch bridge processes.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bridge executable
    pub program: String,
    /// Arguments placed before `--session-id <id> --session-dir <dir>`
    pub args: Vec<String>,
    /// Root of per-identity credential storage
    pub data_dir: PathBuf,
    /// Directory for per-session transcripts (none = no transcripts)
    pub log_dir: Option<PathBuf>,
    /// How long destroy waits for a clean exit before killing
    pub destroy_timeout: Duration,
}

impl BridgeConfig {
    /// Build a config from a shell-style command line such as
    /// `node bridge.js --headless`.
    pub fn from_command_line(
        command_line: &str,
        data_dir: impl Into<PathBuf>,
    ) -> Result<Self, ClientError> {
        let mut parts = shlex::split(command_line)
            .ok_or_else(|| {
                ClientError::Protocol(format!("Invalid bridge command: {command_line}"))
            })?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| ClientError::Protocol("Bridge command is empty".to_string()))?;

        Ok(Self {
            program,
            args: parts.collect(),
            data_dir: data_dir.into(),
            log_dir: None,
            destroy_timeout: DEFAULT_DESTROY_TIMEOUT,
        })
    }

    /// Write per-session transcripts into `dir`.
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Override how long destroy waits before killing the bridge.
    pub fn destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = timeout;
        self
    }
}

/// Creates one [`BridgeClient`] per session.
pub struct BridgeFactory {
    config: Arc<BridgeConfig>,
}

impl BridgeFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl ClientFactory for BridgeFactory {
    fn create(&self, id: &SessionId) -> Result<Arc<dyn MessagingClient>, ClientError> {
        Ok(Arc::new(BridgeClient::new(
            id.clone(),
            Arc::clone(&self.config),
        )))
    }
}

/// Handles to a live bridge process.
struct RunningBridge {
    stdin: ChildStdin,
    /// Dropping or firing this kills the process.
    kill: oneshot::Sender<()>,
    exited: watch::Receiver<bool>,
}

/// A messaging client backed by a bridge process.
///
/// Constructing the client does no I/O; the transcript is opened and the
/// process spawned by [`MessagingClient::initialize`].
pub struct BridgeClient {
    id: SessionId,
    config: Arc<BridgeConfig>,
    events: Arc<ClientEventBus>,
    process: tokio::sync::Mutex<Option<RunningBridge>>,
    pending: PendingSends,
    next_request_id: AtomicU64,
    destroying: Arc<AtomicBool>,
    transcript: TranscriptHandle,
}

impl BridgeClient {
    pub fn new(id: SessionId, config: Arc<BridgeConfig>) -> Self {
        Self {
            id,
            config,
            events: Arc::new(ClientEventBus::new()),
            process: tokio::sync::Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            destroying: Arc::new(AtomicBool::new(false)),
            transcript: TranscriptHandle::default(),
        }
    }

    fn session_dir(&self) -> PathBuf {
        session_storage_dir(&self.config.data_dir, self.id.as_str())
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<SendResult>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write_command(
        &self,
        stdin: &mut ChildStdin,
        command: &BridgeCommand,
    ) -> Result<(), ClientError> {
        let line = command
            .to_line()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        log_line(&self.transcript, "STDIN", &line);
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    fn spawn_stdout_reader(&self, stdout: ChildStdout) {
        let id = self.id.clone();
        let events = Arc::clone(&self.events);
        let pending = Arc::clone(&self.pending);
        let transcript = Arc::clone(&self.transcript);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log_line(&transcript, "STDOUT", &line);
                match BridgeEvent::parse(&line) {
                    Ok(event) => dispatch_event(&id, &events, &pending, event),
                    Err(_) => log::debug!("bridge stdout [{}]: {}", id, line),
                }
            }
        });
    }

    fn spawn_stderr_reader(&self, stderr: ChildStderr) {
        let id = self.id.clone();
        let transcript = Arc::clone(&self.transcript);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log_line(&transcript, "STDERR", &line);
                log::debug!("bridge stderr [{}]: {}", id, line);
            }
        });
    }

    fn spawn_exit_watcher(
        &self,
        mut child: Child,
        kill: oneshot::Receiver<()>,
        exited: watch::Sender<bool>,
    ) {
        let id = self.id.clone();
        let events = Arc::clone(&self.events);
        let pending = Arc::clone(&self.pending);
        let destroying = Arc::clone(&self.destroying);

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill => {
                    if let Err(e) = child.kill().await {
                        log::warn!("Failed to kill bridge for {}: {}", id, e);
                    }
                    child.wait().await
                }
            };
            let description = match status {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            };

            // Mark exited before failing pending sends so a send racing with
            // the exit either sees the flag or gets drained here.
            exited.send_replace(true);
            let abandoned: Vec<_> = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .collect();
            for (_, tx) in abandoned {
                let _ = tx.send(Err(ClientError::Closed));
            }

            if destroying.load(Ordering::SeqCst) {
                log::info!("Bridge for session {} exited ({})", id, description);
            } else {
                log::warn!("Bridge for session {} exited unexpectedly ({})", id, description);
                events.emit(ClientEvent::Disconnected(format!(
                    "bridge exited: {description}"
                )));
            }
        });
    }
}

fn dispatch_event(
    id: &SessionId,
    events: &ClientEventBus,
    pending: &PendingSends,
    event: BridgeEvent,
) {
    match event {
        BridgeEvent::Qr { qr } => {
            events.emit(ClientEvent::Qr(qr));
        }
        BridgeEvent::Ready => {
            events.emit(ClientEvent::Ready);
        }
        BridgeEvent::Disconnected { reason } => {
            events.emit(ClientEvent::Disconnected(
                reason.unwrap_or_else(|| "unknown".to_string()),
            ));
        }
        BridgeEvent::AuthFailure { message } => {
            events.emit(ClientEvent::AuthFailure(message.unwrap_or_default()));
        }
        BridgeEvent::Sent { request_id } => resolve_send(id, pending, request_id, Ok(())),
        BridgeEvent::SendFailed { request_id, error } => resolve_send(
            id,
            pending,
            request_id,
            Err(ClientError::SendFailed(
                error.unwrap_or_else(|| "Send failed".to_string()),
            )),
        ),
    }
}

fn resolve_send(id: &SessionId, pending: &PendingSends, request_id: u64, result: SendResult) {
    let waiter = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&request_id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => log::warn!(
            "Bridge for session {} acknowledged unknown request {}",
            id,
            request_id
        ),
    }
}

#[async_trait]
impl MessagingClient for BridgeClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            return Err(ClientError::Protocol(
                "Bridge already initialized".to_string(),
            ));
        }
        if self.destroying.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        tokio::fs::create_dir_all(&self.config.data_dir).await?;
        open_transcript(&self.transcript, self.config.log_dir.as_deref(), self.id.as_str());

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .arg("--session-id")
            .arg(self.id.as_str())
            .arg("--session-dir")
            .arg(self.session_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ClientError::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Protocol("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Protocol("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClientError::Protocol("Failed to capture stderr".to_string()))?;

        log::info!(
            "Spawned bridge for session {} (pid {:?})",
            self.id,
            child.id()
        );

        self.spawn_stdout_reader(stdout);
        self.spawn_stderr_reader(stderr);

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        self.spawn_exit_watcher(child, kill_rx, exited_tx);

        let mut running = RunningBridge {
            stdin,
            kill: kill_tx,
            exited: exited_rx,
        };
        self.write_command(&mut running.stdin, &BridgeCommand::Initialize)
            .await?;
        *process = Some(running);
        Ok(())
    }

    async fn send_message(&self, to: &str, message: OutgoingMessage) -> Result<(), ClientError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut process = self.process.lock().await;
            let running = process.as_mut().ok_or(ClientError::Closed)?;
            if *running.exited.borrow() {
                return Err(ClientError::Closed);
            }
            self.pending().insert(request_id, tx);

            let command = BridgeCommand::Send {
                request_id,
                to: to.to_string(),
                message,
            };
            if let Err(e) = self.write_command(&mut running.stdin, &command).await {
                self.pending().remove(&request_id);
                return Err(e);
            }
        }

        rx.await.unwrap_or(Err(ClientError::Closed))
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        self.destroying.store(true, Ordering::SeqCst);

        let Some(running) = self.process.lock().await.take() else {
            return Ok(());
        };
        let RunningBridge {
            mut stdin,
            kill,
            mut exited,
        } = running;

        if let Err(e) = self.write_command(&mut stdin, &BridgeCommand::Destroy).await {
            log::debug!("Could not send destroy to bridge for {}: {}", self.id, e);
        }
        drop(stdin);

        let clean_exit = tokio::time::timeout(
            self.config.destroy_timeout,
            exited.wait_for(|done| *done),
        )
        .await
        .is_ok();

        if !clean_exit {
            log::warn!(
                "Bridge for session {} did not exit within {:?}, killing",
                self.id,
                self.config.destroy_timeout
            );
            let _ = kill.send(());
            let _ = exited.wait_for(|done| *done).await;
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    fn storage_dir(&self) -> Option<PathBuf> {
        Some(self.session_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Bridge that pairs on initialize, acknowledges every send and exits on destroy.
    const HAPPY_BRIDGE: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"type":"initialize"'*)
      echo "starting up"
      echo '{"type":"qr","qr":"2@test"}'
      echo '{"type":"ready"}'
      ;;
    *'"type":"send"'*)
      id=$(echo "$line" | sed 's/.*"requestId":\([0-9]*\).*/\1/')
      echo "{\"type\":\"sent\",\"requestId\":$id}"
      ;;
    *'"type":"destroy"'*)
      exit 0
      ;;
  esac
done
"#;

    /// Bridge that rejects every send.
    const FAILING_BRIDGE: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"type":"send"'*)
      id=$(echo "$line" | sed 's/.*"requestId":\([0-9]*\).*/\1/')
      echo "{\"type\":\"send_failed\",\"requestId\":$id,\"error\":\"number not registered\"}"
      ;;
    *'"type":"destroy"'*)
      exit 0
      ;;
  esac
done
"#;

    /// Bridge that dies right after initialize.
    const CRASHING_BRIDGE: &str = r#"
read -r line
exit 3
"#;

    /// Bridge that ignores destroy and must be killed.
    const STUBBORN_BRIDGE: &str = r#"
trap '' INT TERM
while true; do sleep 1; done
"#;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("bridge.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn client_for(script: &str, id: &str) -> (TempDir, BridgeClient) {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), script);
        let config = BridgeConfig {
            program: "sh".to_string(),
            args: vec![script.to_string_lossy().into_owned()],
            data_dir: dir.path().join("auth"),
            log_dir: Some(dir.path().join("logs")),
            destroy_timeout: Duration::from_millis(500),
        };
        let client = BridgeClient::new(SessionId::new(id), Arc::new(config));
        (dir, client)
    }

    async fn next_event(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    mod config {
        use super::*;

        #[test]
        fn from_command_line_splits_like_a_shell() {
            let config =
                BridgeConfig::from_command_line("node 'my bridge.js' --headless", "/data").unwrap();

            assert_eq!(config.program, "node");
            assert_eq!(config.args, vec!["my bridge.js", "--headless"]);
            assert_eq!(config.data_dir, PathBuf::from("/data"));
            assert!(config.log_dir.is_none());
            assert_eq!(config.destroy_timeout, DEFAULT_DESTROY_TIMEOUT);
        }

        #[test]
        fn from_command_line_rejects_empty() {
            assert!(BridgeConfig::from_command_line("   ", "/data").is_err());
        }

        #[test]
        fn from_command_line_rejects_unbalanced_quotes() {
            assert!(BridgeConfig::from_command_line("node 'bridge.js", "/data").is_err());
        }

        #[test]
        fn builder_methods() {
            let config = BridgeConfig::from_command_line("bridge", "/data")
                .unwrap()
                .log_dir("/logs")
                .destroy_timeout(Duration::from_secs(1));

            assert_eq!(config.log_dir, Some(PathBuf::from("/logs")));
            assert_eq!(config.destroy_timeout, Duration::from_secs(1));
        }
    }

    #[test]
    fn storage_dir_is_under_data_dir() {
        let config = BridgeConfig::from_command_line("bridge", "/data").unwrap();
        let client = BridgeClient::new(SessionId::new("alice"), Arc::new(config));

        assert_eq!(
            client.storage_dir(),
            Some(PathBuf::from("/data/session-alice"))
        );
    }

    #[test]
    fn factory_binds_client_to_id() {
        let config = BridgeConfig::from_command_line("bridge", "/data").unwrap();
        let factory = BridgeFactory::new(config);

        let client = factory.create(&SessionId::new("bob")).unwrap();
        assert_eq!(client.storage_dir(), Some(PathBuf::from("/data/session-bob")));
    }

    #[test]
    fn new_client_touches_nothing_on_disk() {
        let dir = tempdir().unwrap();
        let config = BridgeConfig::from_command_line("bridge", dir.path().join("auth"))
            .unwrap()
            .log_dir(dir.path().join("logs"));

        let _client = BridgeClient::new(SessionId::new("alice"), Arc::new(config));

        assert!(!dir.path().join("logs").exists());
        assert!(!dir.path().join("auth").exists());
    }

    #[tokio::test]
    async fn send_before_initialize_is_closed() {
        let config = BridgeConfig::from_command_line("bridge", "/data").unwrap();
        let client = BridgeClient::new(SessionId::new("alice"), Arc::new(config));

        let result = client.send_message("123", OutgoingMessage::text("hi")).await;
        assert!(matches!(result, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn destroy_before_initialize_is_noop() {
        let config = BridgeConfig::from_command_line("bridge", "/data").unwrap();
        let client = BridgeClient::new(SessionId::new("alice"), Arc::new(config));

        assert!(client.destroy().await.is_ok());
        assert!(matches!(client.initialize().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let dir = tempdir().unwrap();
        let config = BridgeConfig::from_command_line(
            "/definitely/not/a/bridge-binary",
            dir.path().join("auth"),
        )
        .unwrap();
        let client = BridgeClient::new(SessionId::new("alice"), Arc::new(config));

        assert!(matches!(client.initialize().await, Err(ClientError::Spawn(_))));
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        #[tokio::test]
        async fn initialize_forwards_lifecycle_events() {
            let (_dir, client) = client_for(HAPPY_BRIDGE, "alice");
            let mut events = client.subscribe();

            client.initialize().await.unwrap();

            assert_eq!(next_event(&mut events).await, ClientEvent::Qr("2@test".to_string()));
            assert_eq!(next_event(&mut events).await, ClientEvent::Ready);

            client.destroy().await.unwrap();
        }

        #[tokio::test]
        async fn initialize_twice_is_rejected() {
            let (_dir, client) = client_for(HAPPY_BRIDGE, "alice");

            client.initialize().await.unwrap();
            assert!(matches!(
                client.initialize().await,
                Err(ClientError::Protocol(_))
            ));

            client.destroy().await.unwrap();
        }

        #[tokio::test]
        async fn send_resolves_on_acknowledgement() {
            let (_dir, client) = client_for(HAPPY_BRIDGE, "alice");
            client.initialize().await.unwrap();

            let first = timeout(WAIT, client.send_message("123", OutgoingMessage::text("hi")))
                .await
                .unwrap();
            let second = timeout(
                WAIT,
                client.send_message(
                    "123",
                    OutgoingMessage::attachment(
                        Some("a.png".to_string()),
                        "iVBORw0=".to_string(),
                        Some("look".to_string()),
                    ),
                ),
            )
            .await
            .unwrap();

            assert!(first.is_ok());
            assert!(second.is_ok());
            client.destroy().await.unwrap();
        }

        #[tokio::test]
        async fn send_failure_carries_bridge_message() {
            let (_dir, client) = client_for(FAILING_BRIDGE, "alice");
            client.initialize().await.unwrap();

            let result = timeout(WAIT, client.send_message("123", OutgoingMessage::text("hi")))
                .await
                .unwrap();

            match result {
                Err(ClientError::SendFailed(message)) => {
                    assert_eq!(message, "number not registered")
                }
                other => panic!("Expected SendFailed, got {:?}", other),
            }
            client.destroy().await.unwrap();
        }

        #[tokio::test]
        async fn unexpected_exit_raises_disconnected() {
            let (_dir, client) = client_for(CRASHING_BRIDGE, "alice");
            let mut events = client.subscribe();

            client.initialize().await.unwrap();

            match next_event(&mut events).await {
                ClientEvent::Disconnected(reason) => assert!(reason.contains("bridge exited")),
                other => panic!("Expected Disconnected, got {:?}", other),
            }

            let result = client.send_message("123", OutgoingMessage::text("hi")).await;
            assert!(matches!(result, Err(ClientError::Closed)));
        }

        #[tokio::test]
        async fn destroy_exits_quietly() {
            let (_dir, client) = client_for(FAILING_BRIDGE, "alice");
            let mut events = client.subscribe();
            client.initialize().await.unwrap();

            timeout(WAIT, client.destroy()).await.unwrap().unwrap();

            // Give the exit watcher a chance to run; it must not report a disconnect.
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(matches!(
                events.try_recv(),
                Err(broadcast::error::TryRecvError::Empty)
            ));
        }

        #[tokio::test]
        async fn destroy_kills_unresponsive_bridge() {
            let (_dir, client) = client_for(STUBBORN_BRIDGE, "alice");
            client.initialize().await.unwrap();

            timeout(WAIT, client.destroy()).await.unwrap().unwrap();

            let result = client.send_message("123", OutgoingMessage::text("hi")).await;
            assert!(matches!(result, Err(ClientError::Closed)));
        }

        #[tokio::test]
        async fn transcript_records_both_directions() {
            let (dir, client) = client_for(HAPPY_BRIDGE, "alice");
            let mut events = client.subscribe();
            client.initialize().await.unwrap();
            next_event(&mut events).await;
            next_event(&mut events).await;
            client.destroy().await.unwrap();

            let contents =
                std::fs::read_to_string(dir.path().join("logs").join("alice.log")).unwrap();
            assert!(contents.contains(r#"STDIN: {"type":"initialize"}"#));
            assert!(contents.contains("STDOUT: starting up"));
            assert!(contents.contains(r#"STDOUT: {"type":"ready"}"#));
            assert!(contents.contains(r#"STDIN: {"type":"destroy"}"#));
        }

        #[tokio::test]
        async fn data_dir_is_created() {
            let (dir, client) = client_for(HAPPY_BRIDGE, "alice");
            client.initialize().await.unwrap();

            assert!(dir.path().join("auth").is_dir());
            client.destroy().await.unwrap();
        }
    }
}
