//! WebSocket connection lifecycle.
//!
//! The [`ConnectionManager`] owns at most one live connection. Each
//! connection is driven by a dedicated task which:
//! - opens the socket (exchange header, optional `?exchange=`, session cookie)
//! - pumps outbound text frames and inbound frames
//! - probes liveness and resets silent connections
//! - reconnects with capped exponential backoff after any abnormal close
//!
//! Only [`ConnectionManager::close`] ends a connection for good. Everything
//! observable about the task flows out through [`ConnectionEvent`]s tagged
//! with the connection id, and through the phase `watch` channel.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use protocol::messages::PONG_FRAME;
use protocol::{CredentialProfile, Exchange, ProtocolError, Result};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderMap, COOKIE, SET_COOKIE};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::backoff::Backoff;
use super::heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
use crate::config::{Config, PingMode, ServerConfig};
use crate::credentials::CredentialStore;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Header carrying the exchange on the upgrade request.
const EXCHANGE_HEADER: &str = "exchange";

/// Tuning for the connection task.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Endpoints and URL shape.
    pub server: ServerConfig,
    /// Interval between liveness probes.
    pub ping_interval: Duration,
    /// Silence after which the connection is reset.
    pub reset_interval: Duration,
    pub ping_mode: PingMode,
    pub ping_message: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound on waiting for a closed connection task to finish.
    pub close_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &Config) -> Self {
        let conn = &config.connection;
        Self {
            server: config.server.clone(),
            ping_interval: conn.ping_interval(),
            reset_interval: conn.reset_interval(),
            ping_mode: conn.ping_mode,
            ping_message: conn.ping_message.clone(),
            initial_backoff: conn.initial_backoff(),
            max_backoff: conn.max_backoff(),
            backoff_multiplier: conn.backoff_multiplier,
            close_timeout: conn.close_timeout(),
        }
    }

    /// Sets the default server URL.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server.url = url.into();
        self
    }

    /// Sets the initial backoff duration.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Sets the liveness probe and reset intervals.
    pub fn with_heartbeat(mut self, ping_interval: Duration, reset_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.reset_interval = reset_interval;
        self
    }

    /// Server URL used as the cookie scope for `exchange`.
    pub fn server_for(&self, exchange: Exchange) -> &str {
        self.server.endpoint_for(exchange)
    }

    /// Full connection target for `exchange`.
    pub fn target(&self, exchange: Exchange) -> Result<Url> {
        let base = self.server_for(exchange);
        let mut url = Url::parse(base).map_err(|e| {
            ProtocolError::ConnectionClosed(format!("invalid server url {base}: {e}"))
        })?;
        if self.server.exchange_query_param {
            url.query_pairs_mut()
                .append_pair(EXCHANGE_HEADER, exchange.as_str());
        }
        Ok(url)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No socket; possibly waiting to reconnect.
    Disconnected,
    /// Opening a socket.
    Connecting,
    /// Socket open; calls may be issued.
    Open,
    /// Intentional close in progress.
    Closing,
}

/// Events emitted by connection tasks.
pub enum ConnectionEvent {
    /// A socket opened. `first` is false for reopenings of the same handle.
    Opened { handle: ConnectionHandle, first: bool },
    /// A text frame arrived.
    Message { id: u64, text: String },
    /// The socket dropped; a reconnect is scheduled.
    Lost { id: u64 },
    /// The connection was closed intentionally and its task ended.
    Closed { id: u64 },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> u64 {
        match self {
            ConnectionEvent::Opened { handle, .. } => handle.id(),
            ConnectionEvent::Message { id, .. }
            | ConnectionEvent::Lost { id }
            | ConnectionEvent::Closed { id } => *id,
        }
    }
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Opened { handle, first } => f
                .debug_struct("Opened")
                .field("id", &handle.id())
                .field("first", first)
                .finish(),
            ConnectionEvent::Message { id, text } => f
                .debug_struct("Message")
                .field("id", id)
                .field("len", &text.len())
                .finish(),
            ConnectionEvent::Lost { id } => f.debug_struct("Lost").field("id", id).finish(),
            ConnectionEvent::Closed { id } => f.debug_struct("Closed").field("id", id).finish(),
        }
    }
}

struct HandleShared {
    id: u64,
    profile: CredentialProfile,
    farewell: bool,
    outbound: mpsc::UnboundedSender<String>,
    phase: watch::Receiver<ConnectionPhase>,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

/// Shared view of one connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleShared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Profile the connection was opened for.
    pub fn profile(&self) -> &CredentialProfile {
        &self.inner.profile
    }

    /// Farewell connections exist only to sign off; no handshake runs on them.
    pub fn is_farewell(&self) -> bool {
        self.inner.farewell
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.inner.phase.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.phase() == ConnectionPhase::Open
    }

    /// True once an intentional close was requested. Never reset.
    pub fn is_closed_intentionally(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Marks the connection closed for good. The task stops reconnecting;
    /// [`ConnectionManager::close`] still has to reap it.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    /// Queues a text frame on the open socket.
    pub fn send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(ProtocolError::NotConnected);
        }
        self.inner
            .outbound
            .send(text)
            .map_err(|_| ProtocolError::ConnectionClosed("connection task ended".to_string()))
    }

    /// Waits until the connection is open; false on timeout or close.
    pub async fn wait_open(&self, timeout: Duration) -> bool {
        let mut phase = self.inner.phase.clone();
        let waited =
            tokio::time::timeout(timeout, phase.wait_for(|p| *p == ConnectionPhase::Open)).await;
        matches!(waited, Ok(Ok(_)))
    }

    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.inner.phase.clone()
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.inner.task.lock().ok().and_then(|mut task| task.take())
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("profile", &self.profile().friendly_name)
            .field("farewell", &self.is_farewell())
            .field("phase", &self.phase())
            .finish()
    }
}

/// Owner of the single live connection.
pub struct ConnectionManager {
    settings: Arc<ConnectionSettings>,
    credentials: CredentialStore,
    next_id: AtomicU64,
    current: Mutex<Option<ConnectionHandle>>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<ConnectionEvent>>>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, credentials: CredentialStore) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            settings: Arc::new(settings),
            credentials,
            next_id: AtomicU64::new(1),
            current: Mutex::new(None),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Returns the event receiver. Only the first call gets it.
    pub fn events(&self) -> Option<mpsc::Receiver<ConnectionEvent>> {
        self.event_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// The live connection, if any.
    pub async fn current(&self) -> Option<ConnectionHandle> {
        self.current.lock().await.clone()
    }

    /// Closes any existing connection, then starts one for `profile`.
    pub async fn connect(&self, profile: &CredentialProfile) -> ConnectionHandle {
        self.open(profile, false).await
    }

    /// Like [`connect`](Self::connect), for a connection that only signs off.
    pub async fn connect_farewell(&self, profile: &CredentialProfile) -> ConnectionHandle {
        self.open(profile, true).await
    }

    async fn open(&self, profile: &CredentialProfile, farewell: bool) -> ConnectionHandle {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            self.shutdown(&previous).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(ConnectionPhase::Disconnected);

        let handle = ConnectionHandle {
            inner: Arc::new(HandleShared {
                id,
                profile: profile.clone(),
                farewell,
                outbound: outbound_tx,
                phase: phase_rx,
                cancel: CancellationToken::new(),
                task: StdMutex::new(None),
            }),
        };

        let task = ConnectionTask {
            handle: handle.clone(),
            settings: self.settings.clone(),
            credentials: self.credentials.clone(),
            events: self.event_tx.clone(),
            outbound_rx,
            phase_tx,
            backoff: Backoff::new(
                self.settings.initial_backoff,
                self.settings.max_backoff,
                self.settings.backoff_multiplier,
            ),
            monitor: HeartbeatMonitor::new(
                self.settings.ping_interval,
                self.settings.reset_interval,
                Instant::now(),
            ),
        };

        tracing::info!(
            id,
            profile = %profile.friendly_name,
            exchange = %profile.exchange,
            farewell,
            "starting connection"
        );
        let join = tokio::spawn(task.run());
        if let Ok(mut slot) = handle.inner.task.lock() {
            *slot = Some(join);
        }

        *current = Some(handle.clone());
        handle
    }

    /// Closes `handle` for good.
    ///
    /// Frames already queued are flushed before the close frame. Returns once
    /// the connection task has finished or `close_timeout` elapsed, in which
    /// case the task is aborted.
    pub async fn close(&self, handle: &ConnectionHandle) {
        let mut current = self.current.lock().await;
        if current.as_ref().map(ConnectionHandle::id) == Some(handle.id()) {
            *current = None;
        }
        self.shutdown(handle).await;
    }

    async fn shutdown(&self, handle: &ConnectionHandle) {
        handle.cancel();

        let Some(mut task) = handle.take_task() else {
            return;
        };

        match tokio::time::timeout(self.settings.close_timeout, &mut task).await {
            Ok(_) => tracing::debug!(id = handle.id(), "connection closed"),
            Err(_) => {
                tracing::warn!(id = handle.id(), "close timed out, aborting connection task");
                task.abort();
                let _ = self
                    .event_tx
                    .send(ConnectionEvent::Closed { id: handle.id() })
                    .await;
            }
        }
    }
}

/// How a socket session ended.
enum SessionEnd {
    /// Intentional close.
    Cancelled,
    /// Anything else; a reconnect follows.
    Lost(String),
}

struct ConnectionTask {
    handle: ConnectionHandle,
    settings: Arc<ConnectionSettings>,
    credentials: CredentialStore,
    events: mpsc::Sender<ConnectionEvent>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    phase_tx: watch::Sender<ConnectionPhase>,
    backoff: Backoff,
    monitor: HeartbeatMonitor,
}

async fn emit(events: &mpsc::Sender<ConnectionEvent>, event: ConnectionEvent) {
    if let Err(e) = events.send(event).await {
        tracing::debug!(event = ?e.0, "connection event dropped - receiver gone");
    }
}

impl ConnectionTask {
    fn set_phase(&self, phase: ConnectionPhase) {
        let previous = self.phase_tx.send_replace(phase);
        if previous != phase {
            tracing::debug!(id = self.handle.id(), ?previous, ?phase, "phase changed");
        }
    }

    async fn run(mut self) {
        let id = self.handle.id();
        let cancel = self.handle.inner.cancel.clone();
        let mut first = true;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_phase(ConnectionPhase::Connecting);
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.open_socket() => result,
            };

            match attempt {
                Ok(ws) => {
                    self.backoff.reset();
                    // Frames queued for a previous socket are stale.
                    while self.outbound_rx.try_recv().is_ok() {}

                    self.set_phase(ConnectionPhase::Open);
                    tracing::info!(id, first, "connection open");
                    emit(
                        &self.events,
                        ConnectionEvent::Opened {
                            handle: self.handle.clone(),
                            first,
                        },
                    )
                    .await;
                    first = false;

                    match self.run_session(ws).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Lost(reason) if cancel.is_cancelled() => {
                            tracing::debug!(id, %reason, "connection ended after close request");
                            break;
                        }
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(id, %reason, "connection lost");
                            self.set_phase(ConnectionPhase::Disconnected);
                            emit(&self.events, ConnectionEvent::Lost { id }).await;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(id, error = %e, "connection attempt failed");
                    self.set_phase(ConnectionPhase::Disconnected);
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let delay = self.backoff.next_delay();
            tracing::info!(id, ?delay, "reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_phase(ConnectionPhase::Disconnected);
        emit(&self.events, ConnectionEvent::Closed { id }).await;
        tracing::debug!(id, "connection task finished");
    }

    async fn open_socket(&self) -> Result<WsStream> {
        let profile = self.handle.profile();
        let server = self.settings.server_for(profile.exchange);
        let url = self.settings.target(profile.exchange)?;

        let mut request = url.as_str().into_client_request().map_err(ws_error)?;
        let headers = request.headers_mut();
        headers.insert(
            EXCHANGE_HEADER,
            HeaderValue::from_static(profile.exchange.as_str()),
        );
        match self.credentials.cookie(server, &profile.friendly_name) {
            Ok(Some(cookie)) => match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    headers.insert(COOKIE, value);
                }
                Err(e) => tracing::warn!(error = %e, "stored session cookie is not a valid header"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "failed to read session cookie"),
        }

        tracing::debug!(id = self.handle.id(), url = %url, "opening socket");
        let (ws, response) =
            tokio::time::timeout(self.settings.reset_interval, connect_async(request))
                .await
                .map_err(|_| ProtocolError::Timeout(format!("connecting to {url}")))?
                .map_err(ws_error)?;

        if let Some(cookie) = session_cookie(response.headers()) {
            if let Err(e) = self
                .credentials
                .set_cookie(server, &profile.friendly_name, &cookie)
            {
                tracing::warn!(error = %e, "failed to store session cookie");
            }
        }

        Ok(ws)
    }

    async fn run_session(&mut self, ws: WsStream) -> SessionEnd {
        let id = self.handle.id();
        let cancel = self.handle.inner.cancel.clone();
        let settings = self.settings.clone();
        let events = self.events.clone();
        let outbound = &mut self.outbound_rx;
        let monitor = &mut self.monitor;

        let (mut sink, mut stream) = ws.split();
        monitor.restart(Instant::now());

        let start = tokio::time::Instant::now();
        let mut ping = tokio::time::interval_at(
            start + settings.ping_interval,
            settings.ping_interval,
        );
        let mut check = tokio::time::interval_at(
            start + settings.reset_interval,
            settings.reset_interval,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.phase_tx.send_replace(ConnectionPhase::Closing);
                    while let Ok(text) = outbound.try_recv() {
                        if let Err(e) = sink.send(WsMessage::Text(text)).await {
                            tracing::debug!(id, error = %e, "flush before close failed");
                            break;
                        }
                    }
                    if let Err(e) = sink.close().await {
                        tracing::debug!(id, error = %e, "close frame not delivered");
                    }
                    return SessionEnd::Cancelled;
                }
                Some(text) = outbound.recv() => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        return SessionEnd::Lost(format!("send failed: {e}"));
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(message)) => {
                        monitor.record_activity(Instant::now());
                        match message {
                            WsMessage::Text(text) => {
                                if text.trim() != PONG_FRAME {
                                    emit(&events, ConnectionEvent::Message { id, text }).await;
                                }
                            }
                            WsMessage::Close(frame) => {
                                return SessionEnd::Lost(format!("server closed the connection: {frame:?}"));
                            }
                            _ => {}
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Lost(format!("receive failed: {e}")),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                },
                _ = ping.tick() => {
                    let probe = match settings.ping_mode {
                        PingMode::Frame => WsMessage::Ping(Vec::new()),
                        PingMode::Message => WsMessage::Text(settings.ping_message.clone()),
                    };
                    if let Err(e) = sink.send(probe).await {
                        return SessionEnd::Lost(format!("ping failed: {e}"));
                    }
                }
                _ = check.tick() => {
                    let now = Instant::now();
                    if monitor.check(now) == HeartbeatVerdict::Reset {
                        return SessionEnd::Lost(format!(
                            "no traffic for {:?}",
                            monitor.silence(now)
                        ));
                    }
                }
            }
        }
    }
}

fn ws_error(err: WsError) -> ProtocolError {
    match err {
        WsError::Io(io_err) => ProtocolError::from(io_err),
        other => ProtocolError::ConnectionClosed(format!("WebSocket connection failed: {other}")),
    }
}

/// `name=value` pairs of every `Set-Cookie` header, attributes dropped.
fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .collect();

    (!pairs.is_empty()).then(|| pairs.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn manager(url: &str) -> ConnectionManager {
        let settings = ConnectionSettings::default()
            .with_server_url(url)
            .with_initial_backoff(Duration::from_millis(10));
        ConnectionManager::new(
            settings,
            CredentialStore::new(Arc::new(MemoryStore::new())),
        )
    }

    fn profile() -> CredentialProfile {
        CredentialProfile::new(Exchange::Binance, "k", "s", "default")
    }

    #[test]
    fn test_target_adds_exchange_query() {
        let settings = ConnectionSettings::default().with_server_url("wss://example.com:8443");
        let url = settings.target(Exchange::BinanceSpot).unwrap();
        assert_eq!(url.as_str(), "wss://example.com:8443/?exchange=binance-spot");

        let mut settings = settings;
        settings.server.exchange_query_param = false;
        settings
            .server
            .endpoints
            .insert("ftx".into(), "ws://ftx.local:9000".into());
        let url = settings.target(Exchange::Ftx).unwrap();
        assert_eq!(url.as_str(), "ws://ftx.local:9000/");
        assert_eq!(settings.server_for(Exchange::Ftx), "ws://ftx.local:9000");
    }

    #[test]
    fn test_invalid_target() {
        let settings = ConnectionSettings::default().with_server_url("not a url");
        assert!(settings.target(Exchange::Binance).is_err());
    }

    #[test]
    fn test_session_cookie_strips_attributes() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=abc; Path=/; HttpOnly"));
        headers.append(SET_COOKIE, HeaderValue::from_static("region=eu"));
        assert_eq!(session_cookie(&headers), Some("sid=abc; region=eu".to_string()));

        assert_eq!(session_cookie(&HeaderMap::new()), None);
    }

    #[test]
    fn test_events_receiver_taken_once() {
        let manager = manager("ws://127.0.0.1:9");
        assert!(manager.events().is_some());
        assert!(manager.events().is_none());
    }

    #[tokio::test]
    async fn test_send_requires_open_connection() {
        // Nothing listens on the discard port, so the connection never opens.
        let manager = manager("ws://127.0.0.1:9");
        let _events = manager.events();
        let handle = manager.connect(&profile()).await;

        assert!(matches!(
            handle.send("{}".to_string()),
            Err(ProtocolError::NotConnected)
        ));

        manager.close(&handle).await;
        assert!(handle.is_closed_intentionally());
        assert_eq!(handle.phase(), ConnectionPhase::Disconnected);
        assert!(manager.current().await.is_none());
    }

    #[tokio::test]
    async fn test_close_emits_closed_event() {
        let manager = manager("ws://127.0.0.1:9");
        let mut events = manager.events().unwrap();
        let handle = manager.connect(&profile()).await;
        manager.close(&handle).await;

        let mut saw_closed = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(500), events.recv()).await
        {
            assert_eq!(event.connection_id(), handle.id());
            assert!(!matches!(event, ConnectionEvent::Opened { .. }));
            if matches!(event, ConnectionEvent::Closed { .. }) {
                saw_closed = true;
                break;
            }
        }
        assert!(saw_closed);
    }

    #[tokio::test]
    async fn test_connect_replaces_previous_handle() {
        let manager = manager("ws://127.0.0.1:9");
        let _events = manager.events();

        let first = manager.connect(&profile()).await;
        let second = manager.connect(&profile()).await;

        assert!(second.id() > first.id());
        assert!(first.is_closed_intentionally());
        assert!(!second.is_closed_intentionally());
        assert_eq!(manager.current().await.map(|h| h.id()), Some(second.id()));

        manager.close(&second).await;
        // Closing twice is harmless.
        manager.close(&second).await;
    }

    #[tokio::test]
    async fn test_wait_open_times_out() {
        let manager = manager("ws://127.0.0.1:9");
        let _events = manager.events();
        let handle = manager.connect(&profile()).await;

        assert!(!handle.wait_open(Duration::from_millis(50)).await);
        manager.close(&handle).await;
    }
}
