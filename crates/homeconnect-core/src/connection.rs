// ── Connection supervisor ──
//
// A Session is deliberately single-shot: its phase only moves forward,
// and a fresh connection means fresh record-layer MAC chains. Long-lived
// consumers want the appliance to just come back after a power cycle or
// a Wi-Fi blip, so this module supervises a sequence of sessions:
// connect, hand the live session to the entities, watch it die, back
// off, repeat.
//
// Entities never see the churn. They hold one `SessionHandle`, which
// forwards to whichever session is currently live and reports
// NotConnected in the gaps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use homeconnect_api::{Error, Message, Session, SessionConfig, SessionPhase, Transport};

use crate::appliance::Appliance;
use crate::describe::DeviceDescription;

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Retries exhausted; [`ApplianceConnection::shutdown`] or a new
    /// supervisor is needed.
    Failed,
}

/// Exponential backoff configuration for reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,
    /// Upper bound on backoff delay. Default: 60s.
    pub max_delay: Duration,
    /// Maximum consecutive failed attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_retries: None,
        }
    }
}

/// The [`Transport`] entities hold across reconnects: forwards to the
/// live [`Session`], or fails fast with `NotConnected` between sessions.
#[derive(Default)]
pub struct SessionHandle {
    current: RwLock<Option<Session>>,
}

impl SessionHandle {
    fn set(&self, session: Option<Session>) {
        *self.current.write() = session;
    }

    /// The live session, if one is up.
    pub fn session(&self) -> Option<Session> {
        self.current.read().clone()
    }
}

#[async_trait]
impl Transport for SessionHandle {
    async fn send_sync(&self, message: Message, timeout: Duration) -> Result<Message, Error> {
        let session = self.session().ok_or(Error::NotConnected)?;
        session.send_sync(message, timeout).await
    }
}

/// Supervises sessions for one appliance and owns its entity runtime.
#[derive(Clone)]
pub struct ApplianceConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    config: SessionConfig,
    reconnect: ReconnectConfig,
    appliance: Appliance,
    handle: Arc<SessionHandle>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl ApplianceConnection {
    /// Build the runtime for `description` and prepare supervision with
    /// `config`. Does not connect -- call [`start`](Self::start).
    pub fn new(config: SessionConfig, description: DeviceDescription) -> Self {
        Self::with_reconnect(config, description, ReconnectConfig::default())
    }

    pub fn with_reconnect(
        config: SessionConfig,
        description: DeviceDescription,
        reconnect: ReconnectConfig,
    ) -> Self {
        let handle = Arc::new(SessionHandle::default());
        let appliance = Appliance::new(description, handle.clone() as Arc<dyn Transport>);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(ConnectionInner {
                config,
                reconnect,
                appliance,
                handle,
                state_tx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// The entity runtime. Valid before, during, and between sessions.
    pub fn appliance(&self) -> &Appliance {
        &self.inner.appliance
    }

    /// The transport entities use; also exposes the live session.
    pub fn session_handle(&self) -> &Arc<SessionHandle> {
        &self.inner.handle
    }

    /// Subscribe to connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Spawn the supervision loop. Returns immediately; observe
    /// [`state`](Self::state) for progress.
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(supervise(inner));
    }

    /// Stop supervising and tear down the live session.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(session) = self.inner.handle.session() {
            session.close().await;
        }
        self.inner.handle.set(None);
        let _ = self.inner.state_tx.send(ConnectionState::Disconnected);
    }
}

/// Main loop: connect, serve until the session dies, back off, repeat.
async fn supervise(inner: Arc<ConnectionInner>) {
    let mut attempt: u32 = 0;

    loop {
        if inner.cancel.is_cancelled() {
            break;
        }
        let state = if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting { attempt }
        };
        let _ = inner.state_tx.send(state);

        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            result = run_session(&inner) => {
                match result {
                    // Session came up and later died; reconnect promptly.
                    Ok(()) => {
                        info!("session ended, reconnecting");
                        attempt = 0;
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, "connection attempt failed");
                        if let Some(max) = inner.reconnect.max_retries {
                            if attempt >= max {
                                warn!(max_retries = max, "reconnection limit reached, giving up");
                                let _ = inner.state_tx.send(ConnectionState::Failed);
                                return;
                            }
                        }
                        attempt += 1;
                    }
                }

                let delay = backoff_delay(attempt, &inner.reconnect);
                debug!(delay_ms = delay.as_millis() as u64, attempt, "waiting before reconnect");
                tokio::select! {
                    biased;
                    _ = inner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    let _ = inner.state_tx.send(ConnectionState::Disconnected);
    debug!("connection supervisor exited");
}

/// One session lifetime: connect, publish, wait for it to close.
async fn run_session(inner: &ConnectionInner) -> Result<(), Error> {
    let session = Session::new(inner.config.clone());
    inner.appliance.attach(&session);
    session.connect().await?;

    inner.handle.set(Some(session.clone()));
    let _ = inner.state_tx.send(ConnectionState::Connected);
    info!("appliance connected");

    let mut phase = session.subscribe_phase();
    loop {
        if *phase.borrow_and_update() == SessionPhase::Closed {
            break;
        }
        if phase.changed().await.is_err() {
            break;
        }
    }

    inner.handle.set(None);
    let _ = inner.state_tx.send(ConnectionState::Disconnected);
    Ok(())
}

/// Exponential backoff with deterministic jitter.
///
/// `delay = min(initial * 2^attempt, max) * (1 ± 0.25)`; the jitter is
/// seeded from the attempt number, which is enough to spread herds of
/// clients without pulling randomness into the timing path.
fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(attempt.min(16) as i32);
    let capped = base.min(config.max_delay.as_secs_f64());
    let jitter_factor = 1.0 + 0.25 * ((attempt as f64 * 7.3).sin());
    Duration::from_secs_f64((capped * jitter_factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();
        let d0 = backoff_delay(0, &config);
        let d1 = backoff_delay(1, &config);
        let d2 = backoff_delay(2, &config);
        assert!(d1 > d0, "d1 ({d1:?}) should exceed d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should exceed d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };
        // Jitter can add up to 25% on top of the cap.
        let d = backoff_delay(12, &config);
        assert!(d <= Duration::from_secs(13), "delay {d:?} should sit near the cap");
    }

    #[test]
    fn backoff_survives_large_attempt_counts() {
        let config = ReconnectConfig::default();
        let d = backoff_delay(u32::MAX, &config);
        assert!(d <= Duration::from_secs(75));
    }

    #[tokio::test]
    async fn handle_without_session_reports_not_connected() {
        let handle = SessionHandle::default();
        let err = handle
            .send_sync(Message::get("/ro/values"), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected), "{err}");
    }

    #[tokio::test]
    async fn supervisor_gives_up_after_max_retries() {
        // Nothing listens on this port; every attempt fails fast.
        let config = SessionConfig {
            host: "127.0.0.1".into(),
            port: Some(9),
            connect_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        };
        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_retries: Some(2),
        };
        let connection = ApplianceConnection::with_reconnect(
            config,
            DeviceDescription::default(),
            reconnect,
        );
        let mut state = connection.state();
        connection.start();

        let outcome = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if *state.borrow_and_update() == ConnectionState::Failed {
                    return;
                }
                if state.changed().await.is_err() {
                    panic!("supervisor dropped without reaching Failed");
                }
            }
        })
        .await;
        assert!(outcome.is_ok(), "supervisor never gave up");
    }

    #[tokio::test]
    async fn shutdown_resets_state() {
        let connection = ApplianceConnection::new(
            SessionConfig {
                host: "127.0.0.1".into(),
                port: Some(9),
                connect_timeout: Duration::from_millis(100),
                ..SessionConfig::default()
            },
            DeviceDescription::default(),
        );
        connection.start();
        connection.shutdown().await;

        // The supervisor may still be draining its current iteration;
        // wait for the final Disconnected.
        let mut state = connection.state();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *state.borrow_and_update() != ConnectionState::Disconnected {
                state.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert!(connection.session_handle().session().is_none());
    }
}
