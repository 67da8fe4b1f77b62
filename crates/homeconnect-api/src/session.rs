// ── Session engine ──
//
// One Session owns one WebSocket to one appliance: it performs the
// appliance-initiated handshake, allocates monotonic message ids,
// correlates RESPONSEs to waiting callers, fans NOTIFYs out to a
// registered callback, and probes an idle link with keepalive reads.
//
// Concurrency shape: the socket read loop and the keepalive loop are
// background tasks cancelled through one CancellationToken; handshake
// steps run in a third, transient task (they issue further requests and
// must not block the read loop). All session-scoped state sits behind a
// single mutex; the writer half has its own async mutex because the
// "compute MAC + advance chain + hand bytes to the socket" region spans
// an await and must serialise concurrent senders.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::framing::{self, FrameDecryptor, FrameEncryptor};
use crate::message::{lenient_i64, Action, Message};
use crate::transport::Transport;
use crate::{psk, tls, Error, Result};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_IDLE: Duration = Duration::from_secs(60);
pub const DEFAULT_KEEPALIVE_PROBE: Duration = Duration::from_secs(10);

/// How the appliance protects its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `ws://host:80/homeconnect`, frames wrapped by [`crate::framing`].
    Aes,
    /// `wss://host:443/homeconnect` over TLS 1.2 PSK, plain text frames.
    TlsPsk,
}

/// Connection settings for one appliance session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Appliance host name or IP.
    pub host: String,
    /// Pre-shared key, urlsafe base64 without padding.
    pub psk64: SecretString,
    /// Static AES-CBC IV, urlsafe base64 without padding. Required in
    /// [`Mode::Aes`], unused otherwise.
    pub iv64: Option<String>,
    pub mode: Mode,
    /// Port override for test rigs; `None` uses 80 (AES) / 443 (TLS).
    pub port: Option<u16>,
    /// TLS-PSK identity string.
    pub psk_identity: String,
    /// TLS cipher string offered in PSK mode.
    pub cipher_list: String,
    /// Reported to the appliance as `deviceName` during the handshake.
    pub app_name: String,
    /// Reported to the appliance as `deviceID` during the handshake.
    pub app_id: String,
    pub keepalive: bool,
    /// Quiet time on the link before a probe is considered.
    pub keepalive_idle: Duration,
    /// How often the keepalive loop wakes to check.
    pub keepalive_probe: Duration,
    /// Entity uid to read as the probe. When `None`, one is learned from
    /// the first mandatory-values entry during the handshake.
    pub keepalive_uid: Option<u32>,
    pub connect_timeout: Duration,
    /// Default timeout for [`Session::send_sync`] via [`Transport`].
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            psk64: SecretString::from(String::new()),
            iv64: None,
            mode: Mode::Aes,
            port: None,
            psk_identity: "Client_identity".into(),
            cipher_list: "PSK".into(),
            app_name: "homeconnect-rs".into(),
            app_id: "homeconnect-rs".into(),
            keepalive: true,
            keepalive_idle: DEFAULT_KEEPALIVE_IDLE,
            keepalive_probe: DEFAULT_KEEPALIVE_PROBE,
            keepalive_uid: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Session lifecycle. Transitions are one-way per session object; a new
/// connection means a new [`Session`] (and therefore fresh MAC chains).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Handshaking,
    Connected,
    Closed,
}

type NotifyCallback = Arc<dyn Fn(Message) + Send + Sync>;

trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

type WsStream = WebSocketStream<Box<dyn RawStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

struct Writer {
    sink: WsSink,
    /// `Some` in AES mode. Lives under the writer lock so encrypt-then-
    /// send is one mutual-exclusion region and frames hit the socket in
    /// MAC-chain order.
    cipher: Option<FrameEncryptor>,
}

struct SessionState {
    phase: SessionPhase,
    sid: Option<i64>,
    next_msg_id: i64,
    service_versions: HashMap<String, i32>,
    pending: HashMap<i64, oneshot::Sender<Message>>,
    handshake_started: bool,
    keepalive_uid: Option<u32>,
    last_rx_at: Instant,
    last_probe_at: Instant,
    terminal: Option<String>,
}

struct SessionInner {
    config: SessionConfig,
    state: Mutex<SessionState>,
    writer: AsyncMutex<Option<Writer>>,
    phase_tx: watch::Sender<SessionPhase>,
    notify: Mutex<Option<NotifyCallback>>,
    cancel: CancellationToken,
}

/// One appliance session. Cheaply cloneable; all clones share the same
/// socket and state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session. Does not connect -- call [`connect`](Self::connect).
    pub fn new(config: SessionConfig) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::Idle);
        let now = Instant::now();
        Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState {
                    phase: SessionPhase::Idle,
                    sid: None,
                    next_msg_id: 0,
                    service_versions: HashMap::new(),
                    pending: HashMap::new(),
                    handshake_started: false,
                    keepalive_uid: config.keepalive_uid,
                    last_rx_at: now,
                    last_probe_at: now,
                    terminal: None,
                }),
                config,
                writer: AsyncMutex::new(None),
                phase_tx,
                notify: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().phase
    }

    /// Observe phase changes (connected, closed, ...).
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.inner.phase_tx.subscribe()
    }

    /// Session id assigned by the appliance, once the handshake has seen it.
    pub fn sid(&self) -> Option<i64> {
        self.inner.state.lock().sid
    }

    /// Negotiated version for a two-letter service name, if known.
    pub fn service_version(&self, service: &str) -> Option<i32> {
        self.inner.state.lock().service_versions.get(service).copied()
    }

    /// Register the callback invoked for every inbound NOTIFY.
    pub fn set_notify_callback(&self, callback: impl Fn(Message) + Send + Sync + 'static) {
        *self.inner.notify.lock() = Some(Arc::new(callback));
    }

    pub fn keepalive_uid(&self) -> Option<u32> {
        self.inner.state.lock().keepalive_uid
    }

    /// Configure (or clear) the uid probed by the keepalive loop.
    pub fn set_keepalive_uid(&self, uid: Option<u32>) {
        self.inner.state.lock().keepalive_uid = uid;
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Open the socket and wait for the appliance handshake to finish,
    /// bounded by the configured connect timeout.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut st = self.inner.state.lock();
            if st.phase != SessionPhase::Idle {
                return Err(Error::Handshake(format!(
                    "connect called in phase {:?}",
                    st.phase
                )));
            }
            st.phase = SessionPhase::Connecting;
        }
        let _ = self.inner.phase_tx.send(SessionPhase::Connecting);

        let mut phase_rx = self.inner.phase_tx.subscribe();
        let timeout = self.inner.config.connect_timeout;

        let outcome = tokio::time::timeout(timeout, async {
            self.open_socket().await?;
            loop {
                match *phase_rx.borrow_and_update() {
                    SessionPhase::Connected => return Ok(()),
                    SessionPhase::Closed => {
                        let reason = self
                            .inner
                            .state
                            .lock()
                            .terminal
                            .clone()
                            .unwrap_or_else(|| "closed during handshake".into());
                        return Err(Error::Handshake(reason));
                    }
                    _ => {}
                }
                if phase_rx.changed().await.is_err() {
                    return Err(Error::NotConnected);
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.on_socket_closed(&e.to_string());
                Err(e)
            }
            Err(_) => {
                self.on_socket_closed("connect timed out");
                Err(Error::Handshake(format!(
                    "appliance did not complete the handshake within {timeout:?}"
                )))
            }
        }
    }

    /// Tear the session down. Terminal; pending callers observe
    /// [`Error::NotConnected`].
    pub async fn close(&self) {
        self.on_socket_closed("closed by caller");
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.sink.send(WsMessage::Close(None)).await;
        }
    }

    async fn open_socket(&self) -> Result<()> {
        let cfg = &self.inner.config;
        let (scheme, default_port) = match cfg.mode {
            Mode::Aes => ("ws", 80),
            Mode::TlsPsk => ("wss", 443),
        };
        let port = cfg.port.unwrap_or(default_port);
        let endpoint = format!("{scheme}://{}:{port}/homeconnect", cfg.host);
        debug!(endpoint = %endpoint, mode = ?cfg.mode, "connecting");

        let tcp = TcpStream::connect((cfg.host.as_str(), port))
            .await
            .map_err(|e| Error::WebSocket(format!("tcp connect: {e}")))?;

        let stream: Box<dyn RawStream> = match cfg.mode {
            Mode::Aes => Box::new(tcp),
            Mode::TlsPsk => {
                let key = psk::decode_b64(cfg.psk64.expose_secret())?;
                let ctx = tls::psk_context(&cfg.psk_identity, key, &cfg.cipher_list)?;
                let ssl = openssl::ssl::Ssl::new(&ctx).map_err(|e| Error::Tls(e.to_string()))?;
                let mut ssl_stream = tokio_openssl::SslStream::new(ssl, tcp)
                    .map_err(|e| Error::Tls(e.to_string()))?;
                Pin::new(&mut ssl_stream)
                    .connect()
                    .await
                    .map_err(|e| Error::Tls(format!("handshake: {e}")))?;
                Box::new(ssl_stream)
            }
        };

        let uri: tungstenite::http::Uri = endpoint
            .parse()
            .map_err(|e| Error::WebSocket(format!("bad endpoint: {e}")))?;
        let (ws, _response) = tokio_tungstenite::client_async(ClientRequestBuilder::new(uri), stream)
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        debug!("WebSocket established");

        let (encryptor, decryptor) = match cfg.mode {
            Mode::Aes => {
                let iv64 = cfg
                    .iv64
                    .as_deref()
                    .ok_or_else(|| Error::KeyMaterial("AES mode requires iv64".into()))?;
                let material = psk::derive_key_material(cfg.psk64.expose_secret(), iv64)?;
                let (enc, dec) = framing::client_pair(material);
                (Some(enc), Some(dec))
            }
            Mode::TlsPsk => (None, None),
        };

        let (sink, source) = ws.split();
        *self.inner.writer.lock().await = Some(Writer {
            sink,
            cipher: encryptor,
        });

        {
            let mut st = self.inner.state.lock();
            st.phase = SessionPhase::Handshaking;
        }
        let _ = self.inner.phase_tx.send(SessionPhase::Handshaking);

        let cancel = self.inner.cancel.clone();
        tokio::spawn(read_loop(self.clone(), source, decryptor, cancel.clone()));
        tokio::spawn(keepalive_loop(self.clone(), cancel));
        Ok(())
    }

    /// Record the terminal state, cancel background loops, and wake every
    /// pending caller. Idempotent; first reason wins.
    fn on_socket_closed(&self, reason: &str) {
        {
            let mut st = self.inner.state.lock();
            if st.phase == SessionPhase::Closed {
                return;
            }
            st.phase = SessionPhase::Closed;
            if st.terminal.is_none() {
                st.terminal = Some(reason.to_string());
            }
            // Dropping the senders wakes the waiters with NotConnected.
            st.pending.clear();
        }
        self.inner.cancel.cancel();
        let _ = self.inner.phase_tx.send(SessionPhase::Closed);
        info!(reason, "session closed");
    }

    // ── Request / response ───────────────────────────────────────────

    /// Send `message` and wait up to `timeout` for its RESPONSE.
    ///
    /// Fills `sid`, `version` (from the negotiated service map, default
    /// 1), and `msg_id` (next monotonic id) when absent. A RESPONSE with
    /// an error `code` surfaces as [`Error::Remote`]; silence surfaces
    /// as [`Error::Timeout`]. The pending slot is released on every exit
    /// path.
    pub async fn send_sync(&self, message: Message, timeout: Duration) -> Result<Message> {
        let (msg_id, rx, prepared) = {
            let mut st = self.inner.state.lock();
            match st.phase {
                SessionPhase::Handshaking | SessionPhase::Connected => {}
                _ => return Err(Error::NotConnected),
            }
            let mut message = message;
            prepare(&mut message, &mut st);
            let msg_id = message.msg_id.unwrap_or_default();
            let (tx, rx) = oneshot::channel();
            st.pending.insert(msg_id, tx);
            (msg_id, rx, message)
        };

        if let Err(e) = self.write_frame(&prepared).await {
            self.inner.state.lock().pending.remove(&msg_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.inner.state.lock().pending.remove(&msg_id);
                Err(Error::Timeout(timeout))
            }
            // Sender dropped: the session closed and cleared the table.
            Ok(Err(_)) => Err(Error::NotConnected),
            Ok(Ok(reply)) => match reply.code {
                Some(code) => Err(Error::Remote {
                    code,
                    resource: reply.resource,
                }),
                None => Ok(reply),
            },
        }
    }

    /// Fire-and-forget send (handshake replies, NOTIFYs). The message is
    /// prepared like any other but no response is awaited.
    pub async fn send(&self, message: Message) -> Result<()> {
        let prepared = {
            let mut st = self.inner.state.lock();
            match st.phase {
                SessionPhase::Handshaking | SessionPhase::Connected => {}
                _ => return Err(Error::NotConnected),
            }
            let mut message = message;
            prepare(&mut message, &mut st);
            message
        };
        self.write_frame(&prepared).await
    }

    async fn write_frame(&self, message: &Message) -> Result<()> {
        let text = message.to_wire();
        trace!(frame = %text, "outbound");

        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        let ws_message = match writer.cipher {
            Some(ref mut cipher) => WsMessage::binary(cipher.encrypt(&text)),
            None => WsMessage::text(text),
        };
        writer.sink.send(ws_message).await.map_err(|e| {
            warn!(error = %e, "socket write failed");
            Error::NotConnected
        })
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    fn handle_text(&self, text: &str) {
        trace!(frame = text, "inbound");
        let message = match Message::parse(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "dropping unparseable frame");
                return;
            }
        };

        let mut st = self.inner.state.lock();
        st.last_rx_at = Instant::now();

        if message.resource == "/ei/initialValues" && !st.handshake_started {
            st.handshake_started = true;
            drop(st);
            let session = self.clone();
            tokio::spawn(async move { session.run_handshake(message).await });
            return;
        }

        match message.action {
            Action::Response => match message.msg_id {
                Some(id) => match st.pending.remove(&id) {
                    Some(slot) => {
                        drop(st);
                        // Receiver may have timed out already; that is its
                        // problem, the slot is gone either way.
                        let _ = slot.send(message);
                    }
                    None => debug!(msg_id = id, "duplicate or unsolicited response dropped"),
                },
                None => debug!("response without msgID dropped"),
            },
            Action::Notify => {
                drop(st);
                let callback = self.inner.notify.lock().clone();
                match callback {
                    Some(callback) => callback(message),
                    None => trace!(resource = %message.resource, "notify with no listener"),
                }
            }
            _ => trace!(resource = %message.resource, action = %message.action, "unhandled inbound message"),
        }
    }

    // ── Handshake ────────────────────────────────────────────────────

    async fn run_handshake(&self, initial: Message) {
        if let Err(e) = self.handshake(initial).await {
            warn!(error = %e, "handshake failed");
            self.on_socket_closed(&format!("handshake failed: {e}"));
        }
    }

    async fn handshake(&self, initial: Message) -> Result<()> {
        let cfg = &self.inner.config;
        let timeout = cfg.request_timeout;
        debug!(sid = ?initial.sid, "appliance hello received");

        {
            let mut st = self.inner.state.lock();
            st.sid = initial.sid;
            if let Some(seed) = initial
                .first_data()
                .and_then(|d| d.get("edMsgID"))
                .and_then(lenient_i64)
            {
                st.next_msg_id = seed;
            }
        }

        // Identify ourselves. The service-version map is still empty, so
        // this reply (like /ci/services below) goes out with version 1.
        let mut reply = Message {
            resource: "/ei/initialValues".into(),
            action: Action::Response,
            msg_id: initial.msg_id,
            ..Message::default()
        };
        reply.data = vec![json!({
            "deviceType": "Application",
            "deviceName": cfg.app_name,
            "deviceID": cfg.app_id,
        })];
        self.send(reply).await?;

        let mut services = Message::get("/ci/services");
        services.version = Some(1);
        let listing = self.send_sync(services, timeout).await?;
        {
            let mut st = self.inner.state.lock();
            for entry in &listing.data {
                let service = entry.get("service").and_then(serde_json::Value::as_str);
                let version = entry.get("version").and_then(lenient_i64);
                if let (Some(service), Some(version)) = (service, version) {
                    st.service_versions.insert(service.to_string(), version as i32);
                }
            }
            debug!(services = ?st.service_versions, "service versions negotiated");
        }

        let version_of = |service: &str| self.service_version(service);

        if version_of("ci").unwrap_or(1) < 3 {
            let mut nonce = [0u8; 32];
            rand::rng().fill_bytes(&mut nonce);
            let mut auth = Message::get("/ci/authentication");
            auth.data = vec![json!({ "nonce": psk::encode_b64(&nonce) })];
            self.send_sync(auth, timeout).await?;
            self.best_effort("/ci/info", timeout).await;
        }

        if version_of("iz").is_some() {
            self.best_effort("/iz/info", timeout).await;
        }

        if version_of("ei") == Some(2) {
            self.send(Message::notify("/ei/deviceReady")).await?;
        }

        if version_of("ni").is_some() {
            self.best_effort("/ni/info", timeout).await;
        }

        let long = DEFAULT_REQUEST_TIMEOUT;
        self.best_effort("/ro/allDescriptionChanges", long).await;
        match self.send_sync(Message::get("/ro/allMandatoryValues"), long).await {
            Ok(values) => {
                let mut st = self.inner.state.lock();
                if st.keepalive_uid.is_none() {
                    st.keepalive_uid = first_uid(&values);
                    if let Some(uid) = st.keepalive_uid {
                        debug!(uid, "learned keepalive probe uid");
                    }
                }
            }
            Err(e) => debug!(error = %e, "mandatory values unavailable"),
        }

        {
            let mut st = self.inner.state.lock();
            st.phase = SessionPhase::Connected;
        }
        let _ = self.inner.phase_tx.send(SessionPhase::Connected);
        info!("session connected");
        Ok(())
    }

    async fn best_effort(&self, resource: &str, timeout: Duration) {
        if let Err(e) = self.send_sync(Message::get(resource), timeout).await {
            debug!(resource, error = %e, "optional handshake step skipped");
        }
    }

    // ── Keepalive ────────────────────────────────────────────────────

    async fn keepalive_tick(&self) {
        let cfg = &self.inner.config;
        let idle = cfg.keepalive_idle;
        let uid = {
            let mut st = self.inner.state.lock();
            if st.phase != SessionPhase::Connected {
                return;
            }
            let uid = match st.keepalive_uid {
                Some(uid) => uid,
                None => return,
            };
            if st.last_rx_at.elapsed() <= idle || st.last_probe_at.elapsed() <= idle {
                return;
            }
            st.last_probe_at = Instant::now();
            uid
        };

        debug!(uid, "link idle, sending keepalive probe");
        let mut probe = Message::get("/ro/values");
        probe.data = vec![json!({ "uid": uid })];
        match self.send_sync(probe, cfg.request_timeout).await {
            Ok(_) => {}
            Err(Error::Remote { code: 400, .. }) => self.relearn_keepalive_uid(uid).await,
            Err(e) => debug!(error = %e, "keepalive probe failed (ignored)"),
        }
    }

    /// The appliance rejected the probe uid as unknown. Fall back to the
    /// configured uid if that is a different one, otherwise re-learn from
    /// the mandatory values; give up probing when neither works.
    async fn relearn_keepalive_uid(&self, stale: u32) {
        warn!(uid = stale, "keepalive uid rejected by appliance");
        if let Some(configured) = self.inner.config.keepalive_uid {
            if configured != stale {
                self.inner.state.lock().keepalive_uid = Some(configured);
                info!(uid = configured, "restored configured keepalive uid");
                return;
            }
        }

        match self
            .send_sync(
                Message::get("/ro/allMandatoryValues"),
                self.inner.config.request_timeout,
            )
            .await
        {
            Ok(values) => {
                let learned = first_uid(&values);
                self.inner.state.lock().keepalive_uid = learned;
                match learned {
                    Some(uid) => info!(uid, "re-learned keepalive uid"),
                    None => warn!("no keepalive uid available, probing disabled"),
                }
            }
            Err(e) => {
                self.inner.state.lock().keepalive_uid = None;
                warn!(error = %e, "could not re-learn keepalive uid, probing disabled");
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for Session {
    async fn send_sync(&self, message: Message, timeout: Duration) -> Result<Message> {
        Session::send_sync(self, message, timeout).await
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.inner.config.host)
            .field("mode", &self.inner.config.mode)
            .field("phase", &self.phase())
            .finish()
    }
}

// ── Message preparation ──────────────────────────────────────────────

fn prepare(message: &mut Message, st: &mut SessionState) {
    if message.sid.is_none() {
        message.sid = st.sid;
    }
    if message.version.is_none() {
        let version = message
            .service()
            .and_then(|s| st.service_versions.get(s).copied())
            .unwrap_or(1);
        message.version = Some(version);
    }
    if message.msg_id.is_none() {
        message.msg_id = Some(st.next_msg_id);
        st.next_msg_id += 1;
    }
}

fn first_uid(message: &Message) -> Option<u32> {
    message
        .data
        .iter()
        .find_map(|entry| entry.get("uid").and_then(lenient_i64))
        .and_then(|uid| u32::try_from(uid).ok())
}

// ── Background loops ─────────────────────────────────────────────────

async fn read_loop(
    session: Session,
    mut source: WsSource,
    mut cipher: Option<FrameDecryptor>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = source.next() => {
                match frame {
                    Some(Ok(WsMessage::Binary(bytes))) => match cipher {
                        Some(ref mut cipher) => match cipher.decrypt(&bytes) {
                            Ok(text) => session.handle_text(&text),
                            // Chain untouched; the next genuine frame
                            // still verifies.
                            Err(e) => warn!(error = %e, "dropping undecryptable frame"),
                        },
                        None => trace!("binary frame in TLS mode dropped"),
                    },
                    Some(Ok(WsMessage::Text(text))) => {
                        if cipher.is_some() {
                            trace!("text frame in AES mode dropped");
                        } else {
                            session.handle_text(&text);
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) => trace!("ws ping"),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        session.on_socket_closed("peer closed the socket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        session.on_socket_closed(&format!("socket error: {e}"));
                        break;
                    }
                }
            }
        }
    }
    debug!("read loop exited");
}

async fn keepalive_loop(session: Session, cancel: CancellationToken) {
    if !session.inner.config.keepalive {
        return;
    }
    let mut interval = tokio::time::interval(session.inner.config.keepalive_probe);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => session.keepalive_tick().await,
        }
    }
    debug!("keepalive loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SessionState {
        let now = Instant::now();
        SessionState {
            phase: SessionPhase::Connected,
            sid: Some(77),
            next_msg_id: 100,
            service_versions: HashMap::from([("ro".into(), 2), ("ci".into(), 3)]),
            pending: HashMap::new(),
            handshake_started: true,
            keepalive_uid: None,
            last_rx_at: now,
            last_probe_at: now,
            terminal: None,
        }
    }

    #[test]
    fn prepare_fills_sid_version_and_msg_id() {
        let mut st = state();
        let mut msg = Message::get("/ro/values");
        prepare(&mut msg, &mut st);
        assert_eq!(msg.sid, Some(77));
        assert_eq!(msg.version, Some(2));
        assert_eq!(msg.msg_id, Some(100));
        assert_eq!(st.next_msg_id, 101);
    }

    #[test]
    fn prepare_defaults_unknown_service_to_version_1() {
        let mut st = state();
        let mut msg = Message::get("/ei/deviceReady");
        prepare(&mut msg, &mut st);
        assert_eq!(msg.version, Some(1));
    }

    #[test]
    fn prepare_respects_explicit_fields() {
        let mut st = state();
        let mut msg = Message::get("/ci/services");
        msg.sid = Some(1);
        msg.version = Some(1);
        msg.msg_id = Some(5);
        prepare(&mut msg, &mut st);
        assert_eq!(msg.sid, Some(1));
        assert_eq!(msg.version, Some(1));
        assert_eq!(msg.msg_id, Some(5));
        assert_eq!(st.next_msg_id, 100, "explicit ids must not consume the counter");
    }

    #[test]
    fn msg_ids_are_strictly_increasing() {
        let mut st = state();
        let mut seen = Vec::new();
        for _ in 0..5 {
            let mut msg = Message::get("/ro/values");
            prepare(&mut msg, &mut st);
            seen.push(msg.msg_id.unwrap());
        }
        assert!(seen.windows(2).all(|w| w[1] > w[0]), "{seen:?}");
    }

    #[test]
    fn first_uid_skips_entries_without_uid() {
        let mut msg = Message::get("/ro/allMandatoryValues");
        msg.data = vec![
            json!({"value": 1}),
            json!({"uid": "514", "value": true}),
            json!({"uid": 515}),
        ];
        assert_eq!(first_uid(&msg), Some(514));
    }
}
