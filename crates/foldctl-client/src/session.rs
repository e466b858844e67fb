use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use foldctl_core::peer::groups_of;
use foldctl_core::view::PeerSnapshot;
use foldctl_core::{FoldError, PeerAddress, StateMirror};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Minimum peer client version this protocol targets.
const MIN_PEER_VERSION: (u64, u64, u64) = (8, 3, 0);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Syncing,
    Live,
    Reconnecting,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "Connecting",
            SessionState::Syncing => "Syncing",
            SessionState::Live => "Live",
            SessionState::Reconnecting => "Reconnecting",
            SessionState::Closing => "Closing",
            SessionState::Closed => "Closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications fanned out to subscribers. Slow subscribers lag and drop
/// old entries instead of queuing stale views without bound.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Every parsed inbound frame, forwarded before interpretation.
    Inbound(Value),
    State(SessionState),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub sync_timeout: Duration,
    /// Long-lived commands reconnect with backoff; one-shot commands treat
    /// a lost transport as terminal.
    pub reconnect: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(10),
            reconnect: false,
        }
    }
}

enum ConnEnd {
    Shutdown,
    /// Transport broke; `was_live` resets the reconnect backoff.
    Lost { was_live: bool },
    /// Never became usable this attempt.
    Failed(FoldError),
    /// Not worth retrying (e.g. unsupported peer version).
    Fatal(FoldError),
}

/// One persistent connection to one peer. Owns the peer's state mirror;
/// only this session's task ever writes it.
pub struct PeerSession {
    peer: PeerAddress,
    name: String,
    opts: SessionOptions,
    mirror: Arc<RwLock<StateMirror>>,
    state_tx: watch::Sender<SessionState>,
    events_tx: broadcast::Sender<PeerEvent>,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Mutex<Option<mpsc::Receiver<String>>>,
    last_error: RwLock<Option<FoldError>>,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    pub fn new(peer: PeerAddress, opts: SessionOptions) -> Arc<Self> {
        let name = peer.label();
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Arc::new(Self {
            peer,
            name,
            opts,
            mirror: Arc::new(RwLock::new(StateMirror::new())),
            state_tx,
            events_tx,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            last_error: RwLock::new(None),
            shutdown: Notify::new(),
            task: Mutex::new(None),
        })
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events_tx.subscribe()
    }

    /// Spawn the session task. Idempotent; later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let mut slot = match self.task.try_lock() {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if slot.is_some() {
            return;
        }
        let session = self.clone();
        *slot = Some(tokio::spawn(async move { session.run().await }));
    }

    async fn run(self: Arc<Self>) {
        let mut outbound = match self.outbound_rx.lock().await.take() {
            Some(rx) => rx,
            None => return,
        };
        let mut backoff = BACKOFF_START;
        loop {
            self.set_state(SessionState::Connecting);
            match self.run_connection(&mut outbound).await {
                ConnEnd::Shutdown => break,
                ConnEnd::Fatal(err) => {
                    warn!(peer = %self.name, error = %err, "session fatal");
                    self.record_error(err).await;
                    break;
                }
                ConnEnd::Failed(err) => {
                    debug!(peer = %self.name, error = %err, "connection attempt failed");
                    self.record_error(err).await;
                    if !self.opts.reconnect {
                        break;
                    }
                }
                ConnEnd::Lost { was_live } => {
                    info!(peer = %self.name, "connection lost");
                    self.record_error(FoldError::TransportLost).await;
                    if !self.opts.reconnect {
                        break;
                    }
                    if was_live {
                        backoff = BACKOFF_START;
                    }
                }
            }
            self.set_state(SessionState::Reconnecting);
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff);
        }
        self.set_state(SessionState::Closed);
    }

    async fn run_connection(&self, outbound: &mut mpsc::Receiver<String>) -> ConnEnd {
        let endpoint = self.peer.endpoint();
        debug!(peer = %self.name, endpoint = %endpoint, "connecting");
        let connect = tokio::time::timeout(self.opts.connect_timeout, connect_async(&endpoint));
        let ws: WsStream = tokio::select! {
            _ = self.shutdown.notified() => return ConnEnd::Shutdown,
            attempt = connect => match attempt {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(err)) => {
                    debug!(peer = %self.name, error = %err, "connect error");
                    return ConnEnd::Failed(FoldError::PeerUnreachable(self.name.clone()));
                }
                Err(_) => return ConnEnd::Failed(FoldError::PeerUnreachable(self.name.clone())),
            },
        };

        self.set_state(SessionState::Syncing);
        let (mut sink, mut stream) = ws.split();

        let snapshot = tokio::select! {
            _ = self.shutdown.notified() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
                return ConnEnd::Shutdown;
            }
            first = tokio::time::timeout(self.opts.sync_timeout, first_snapshot(&mut stream)) => {
                match first {
                    Ok(Ok(tree)) => tree,
                    Ok(Err(end)) => return end,
                    Err(_) => return ConnEnd::Failed(FoldError::PeerUnreachable(self.name.clone())),
                }
            }
        };

        let version = crate::wire::peer_version(&snapshot);
        if version < MIN_PEER_VERSION {
            return ConnEnd::Fatal(FoldError::UnsupportedPeer {
                peer: self.name.clone(),
                version: crate::wire::version_string(version),
                required: crate::wire::version_string(MIN_PEER_VERSION),
            });
        }

        {
            let mut mirror = self.mirror.write().await;
            mirror.reset(snapshot.clone());
        }
        let _ = self.events_tx.send(PeerEvent::Inbound(snapshot));
        info!(peer = %self.name, version = %crate::wire::version_string(version), "live");
        self.set_state(SessionState::Live);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
                    return ConnEnd::Shutdown;
                }
                out = outbound.recv() => match out {
                    Some(text) => {
                        debug!(peer = %self.name, command = %text, "sending");
                        if sink.send(Message::Text(text)).await.is_err() {
                            return ConnEnd::Lost { was_live: true };
                        }
                    }
                    // all handles dropped; nothing can talk to us any more
                    None => return ConnEnd::Shutdown,
                },
                frame = stream.next() => {
                    let message = match frame {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            debug!(peer = %self.name, error = %err, "read error");
                            return ConnEnd::Lost { was_live: true };
                        }
                        None => return ConnEnd::Lost { was_live: true },
                    };
                    match message {
                        Message::Text(text) => {
                            if let Err(err) = self.handle_text(&text).await {
                                // desynchronized; only a fresh snapshot recovers
                                let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
                                return ConnEnd::Failed(err);
                            }
                        }
                        Message::Close(_) => return ConnEnd::Lost { was_live: true },
                        _ => {}
                    }
                }
            }
        }
    }

    /// Apply one inbound frame. Patches go to the mirror in receive order;
    /// everything is forwarded to subscribers first.
    async fn handle_text(&self, raw: &str) -> Result<(), FoldError> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(peer = %self.name, error = %err, "unparseable frame");
                return Ok(());
            }
        };
        let _ = self.events_tx.send(PeerEvent::Inbound(value.clone()));
        match crate::wire::classify(&value) {
            Ok(crate::wire::Inbound::Snapshot(tree)) => {
                self.mirror.write().await.reset(tree);
                Ok(())
            }
            Ok(crate::wire::Inbound::Patch(ops)) => {
                let mut mirror = self.mirror.write().await;
                for op in &ops {
                    if let Err(err) = mirror.apply(op) {
                        warn!(peer = %self.name, error = %err, "malformed patch");
                        return Err(err);
                    }
                }
                Ok(())
            }
            Ok(crate::wire::Inbound::Event(_)) => Ok(()),
            Err(err) => {
                warn!(peer = %self.name, error = %err, "undecodable update");
                self.mirror.write().await.mark_desynchronized();
                Err(err.into())
            }
        }
    }

    /// Fire-and-forget command write. Effects only ever show up through the
    /// patch stream; observe the mirror to confirm them. A stalled or closed
    /// transport fails the write instead of blocking the caller.
    pub async fn send_command(&self, command: Value) -> Result<(), FoldError> {
        let text = crate::wire::command_message(command);
        self.outbound_tx
            .try_send(text)
            .map_err(|_| FoldError::CommandSendFailed(self.name.clone()))
    }

    /// Wait until the session is Live with a synced mirror, or report why it
    /// never got there. Expiry alone distinguishes a slow peer from an
    /// unreachable one.
    pub async fn wait_live(&self, overall: Duration) -> Result<(), FoldError> {
        let mut state_rx = self.state_tx.subscribe();
        let deadline = tokio::time::sleep(overall);
        tokio::pin!(deadline);
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                SessionState::Live => return Ok(()),
                SessionState::Closed => return Err(self.terminal_error().await),
                _ => {}
            }
            tokio::select! {
                _ = &mut deadline => {
                    return Err(FoldError::PeerUnreachable(self.name.clone()));
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(self.terminal_error().await);
                    }
                }
            }
        }
    }

    async fn terminal_error(&self) -> FoldError {
        self.last_error
            .read()
            .await
            .clone()
            .unwrap_or_else(|| FoldError::PeerUnreachable(self.name.clone()))
    }

    pub async fn last_error(&self) -> Option<FoldError> {
        self.last_error.read().await.clone()
    }

    async fn record_error(&self, err: FoldError) {
        *self.last_error.write().await = Some(err);
    }

    /// Materialized copy of the mirrored tree.
    pub async fn snapshot(&self) -> Value {
        self.mirror.read().await.snapshot()
    }

    pub async fn read_path(&self, keypath: &str) -> Option<Value> {
        self.mirror.read().await.read_path(keypath).cloned()
    }

    pub async fn revision(&self) -> u64 {
        self.mirror.read().await.revision()
    }

    pub async fn groups(&self) -> Vec<String> {
        groups_of(self.mirror.read().await.tree())
    }

    pub async fn version(&self) -> (u64, u64, u64) {
        crate::wire::peer_version(self.mirror.read().await.tree())
    }

    /// Derivation-layer input for this peer: the tree when live, otherwise
    /// the connection state to display.
    pub async fn peer_snapshot(&self) -> PeerSnapshot {
        let state = self.state();
        let status = match (state, self.last_error.read().await.as_ref()) {
            (SessionState::Live, _) => String::new(),
            (_, Some(FoldError::PeerUnreachable(_))) => "Unreachable".to_string(),
            (other, _) => other.to_string(),
        };
        let tree = if state == SessionState::Live {
            let mirror = self.mirror.read().await;
            mirror.has_snapshot().then(|| mirror.snapshot())
        } else {
            None
        };
        PeerSnapshot {
            label: self.name.clone(),
            port: self.peer.port,
            status,
            tree,
        }
    }

    /// Close the transport within a short bounded grace, never waiting on
    /// peer acknowledgement.
    pub async fn close(&self) {
        self.set_state(SessionState::Closing);
        self.shutdown.notify_one();
        let handle = self.task.lock().await.take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.set_state(SessionState::Closed);
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(peer = %self.name, from = %previous, to = %state, "session state");
            let _ = self.events_tx.send(PeerEvent::State(state));
        }
    }
}

/// Skip non-text frames until the initial full-document snapshot arrives.
async fn first_snapshot(
    stream: &mut futures_util::stream::SplitStream<WsStream>,
) -> Result<Value, ConnEnd> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let value: Value = serde_json::from_str(&text).map_err(|_| {
                    ConnEnd::Failed(FoldError::MalformedPatch(
                        foldctl_core::PatchError::MalformedUpdate(
                            "initial snapshot is not valid json".to_string(),
                        ),
                    ))
                })?;
                if value.is_object() {
                    return Ok(value);
                }
                return Err(ConnEnd::Failed(FoldError::MalformedPatch(
                    foldctl_core::PatchError::MalformedUpdate(
                        "expected a full document before updates".to_string(),
                    ),
                )));
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ConnEnd::Lost { was_live: false })
            }
            Some(Ok(_)) => {}
            Some(Err(_)) => return Err(ConnEnd::Lost { was_live: false }),
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_MAX)
}
