//! # Broker Connection
//!
//! Owns the AMQP connection and its single shared channel. State lives behind a
//! `tokio::sync::RwLock`: channel lookups and health checks take the read lock,
//! (re)connect and close take the write lock only long enough to swap handles in
//! or out. Network I/O never happens while the lock is held.
//!
//! Dialing goes through a [`BrokerDialer`], which hands back a [`BrokerSession`]
//! (connection plus channel). Production uses [`LapinDialer`].
//!
//! A monitor task, started by the first successful [`BrokerConnection::connect`]
//! and stopped when the handle is dropped, listens for connection and channel
//! errors reported by the session. On an unexpected close it marks the connection
//! as down and re-dials according to the configured [`ReconnectPolicy`]. When the
//! attempts are exhausted it logs and stays down; callers keep getting
//! [`MessagingError::NotConnected`] until a later `connect()`.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::ConfirmSelectOptions;
use lapin::{Connection, ConnectionProperties};
use parking_lot::Mutex;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::messaging::channel::{BrokerChannel, ChannelProvider, LapinChannel};
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::resilience::ReconnectPolicy;

/// Callback a session invokes with a reason when the broker reports a failure
pub type FailureHook = Arc<dyn Fn(String) + Send + Sync>;

/// One dialed connection together with its shared channel
#[async_trait]
pub trait BrokerSession: Send + Sync {
    fn channel(&self) -> Arc<dyn BrokerChannel>;

    /// Whether both the connection and the channel are still usable
    fn is_open(&self) -> bool;

    /// Route connection and channel errors to `hook`
    fn on_failure(&self, hook: FailureHook);

    /// Close channel then connection, skipping whatever is already gone;
    /// returns every failure instead of stopping at the first
    async fn close(&self) -> Vec<String>;
}

/// Opens new sessions against the broker
#[async_trait]
pub trait BrokerDialer: Send + Sync {
    async fn dial(&self) -> MessagingResult<Box<dyn BrokerSession>>;
}

/// Close notification tagged with the generation of the session that failed
#[derive(Debug)]
struct CloseNotice {
    generation: u64,
    reason: String,
}

#[derive(Default)]
struct ConnectionState {
    session: Option<Box<dyn BrokerSession>>,
    /// Bumped on every install so stale close notices can be ignored
    generation: u64,
    /// Set by `close()`; the monitor never reconnects after this
    closed: bool,
}

impl ConnectionState {
    fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|session| session.is_open())
    }
}

/// Process-wide broker connection shared by the publisher and the consumer
pub struct BrokerConnection {
    config: BrokerConfig,
    dialer: Arc<dyn BrokerDialer>,
    state: Arc<RwLock<ConnectionState>>,
    notices: mpsc::UnboundedSender<CloseNotice>,
    notice_rx: Mutex<Option<mpsc::UnboundedReceiver<CloseNotice>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("url", &self.config.redacted_url())
            .finish_non_exhaustive()
    }
}

impl BrokerConnection {
    /// Create a disconnected handle dialing RabbitMQ; call
    /// [`connect`](Self::connect) to dial
    pub fn new(config: BrokerConfig, confirm_publishes: bool) -> Self {
        let dialer = Arc::new(LapinDialer::new(config.clone(), confirm_publishes));
        Self::with_dialer(config, dialer)
    }

    /// Create a disconnected handle that opens sessions through `dialer`
    pub fn with_dialer(config: BrokerConfig, dialer: Arc<dyn BrokerDialer>) -> Self {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        Self {
            config,
            dialer,
            state: Arc::new(RwLock::new(ConnectionState::default())),
            notices,
            notice_rx: Mutex::new(Some(notice_rx)),
            monitor: Mutex::new(None),
        }
    }

    /// Dial the broker, open the shared channel and start the close monitor
    ///
    /// A no-op while a live connection is installed. When another caller (or the
    /// monitor) installs a session while this one is dialing, the session dialed
    /// here is closed again and the installed one is kept.
    ///
    /// Fails with [`MessagingError::Connection`] if either the dial or the channel
    /// open fails.
    pub async fn connect(&self) -> MessagingResult<()> {
        if self.is_connected().await {
            debug!("Broker connection already established");
            return Ok(());
        }

        let session = self.dialer.dial().await?;

        let mut state = self.state.write().await;
        if state.is_connected() {
            drop(state);
            discard(session.as_ref(), "connection installed concurrently").await;
            return Ok(());
        }
        state.closed = false;
        let (generation, stale) = install(&mut state, session, &self.notices);
        drop(state);

        if let Some(stale) = stale {
            discard(stale.as_ref(), "replaced by a new connection").await;
        }

        info!(
            url = %self.config.redacted_url(),
            generation = generation,
            "Connected to message broker"
        );

        self.start_monitor();
        Ok(())
    }

    /// Whether a live connection and open channel are installed
    pub async fn is_connected(&self) -> bool {
        self.state.read().await.is_connected()
    }

    /// Close channel then connection, collecting every failure
    ///
    /// Missing handles are skipped. The closed flag is set before any handle is
    /// touched so the monitor never treats this as a broker outage.
    pub async fn close(&self) -> MessagingResult<()> {
        let session = {
            let mut state = self.state.write().await;
            state.closed = true;
            state.session.take()
        };

        let errors = match session {
            Some(session) => session.close().await,
            None => Vec::new(),
        };

        if errors.is_empty() {
            info!("Broker connection closed");
            Ok(())
        } else {
            warn!(errors = ?errors, "Broker connection closed with errors");
            Err(MessagingError::Close { errors })
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn start_monitor(&self) {
        let mut monitor = self.monitor.lock();
        let Some(notice_rx) = self.notice_rx.lock().take() else {
            return;
        };

        let monitor_task = ConnectionMonitor {
            redacted_url: self.config.redacted_url(),
            dialer: self.dialer.clone(),
            policy: self.config.reconnect_policy(),
            state: self.state.clone(),
            notices: self.notices.clone(),
        };

        *monitor = Some(tokio::spawn(monitor_task.run(notice_rx)));
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

#[async_trait]
impl ChannelProvider for BrokerConnection {
    async fn channel(&self) -> MessagingResult<Arc<dyn BrokerChannel>> {
        let state = self.state.read().await;
        match &state.session {
            Some(session) if session.is_open() => Ok(session.channel()),
            _ => Err(MessagingError::NotConnected),
        }
    }
}

/// Background reconnect driver
struct ConnectionMonitor {
    redacted_url: String,
    dialer: Arc<dyn BrokerDialer>,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ConnectionState>>,
    notices: mpsc::UnboundedSender<CloseNotice>,
}

impl ConnectionMonitor {
    async fn run(self, mut notice_rx: mpsc::UnboundedReceiver<CloseNotice>) {
        while let Some(notice) = notice_rx.recv().await {
            if !self.mark_disconnected(&notice).await {
                continue;
            }

            warn!(
                generation = notice.generation,
                reason = %notice.reason,
                "Broker connection lost, reconnecting"
            );
            self.reconnect().await;
        }
        debug!("Connection monitor stopped");
    }

    /// Drop the failed session; false when the notice is stale, already handled or
    /// we are closing
    async fn mark_disconnected(&self, notice: &CloseNotice) -> bool {
        let failed = {
            let mut state = self.state.write().await;
            if state.closed || state.generation != notice.generation || state.session.is_none() {
                return false;
            }
            state.session.take()
        };

        // A channel-level failure leaves the connection itself open
        if let Some(session) = failed {
            discard(session.as_ref(), "broker reported a failure").await;
        }
        true
    }

    async fn reconnect(&self) {
        for attempt in self.policy.attempts() {
            if attempt > 1 {
                tokio::time::sleep(self.policy.delay()).await;
            }

            {
                let state = self.state.read().await;
                if state.closed || state.is_connected() {
                    debug!(attempt = attempt, "Reconnect no longer needed");
                    return;
                }
            }

            match self.dialer.dial().await {
                Ok(session) => {
                    let mut state = self.state.write().await;
                    if state.closed || state.is_connected() {
                        drop(state);
                        discard(session.as_ref(), "reconnect no longer needed").await;
                        return;
                    }
                    let (generation, stale) = install(&mut state, session, &self.notices);
                    drop(state);

                    if let Some(stale) = stale {
                        discard(stale.as_ref(), "replaced by a new connection").await;
                    }
                    info!(
                        attempt = attempt,
                        generation = generation,
                        "Reconnected to message broker"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = self.policy.max_attempts(),
                        last_attempt = self.policy.is_last_attempt(attempt),
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }
        }

        error!(
            max_attempts = self.policy.max_attempts(),
            url = %self.redacted_url,
            "Giving up on broker reconnection; pipeline stays disconnected"
        );
    }
}

/// Install a fresh session and hook its failures to the monitor; returns the new
/// generation and whatever dead session it replaced
fn install(
    state: &mut ConnectionState,
    session: Box<dyn BrokerSession>,
    notices: &mpsc::UnboundedSender<CloseNotice>,
) -> (u64, Option<Box<dyn BrokerSession>>) {
    state.generation += 1;
    let generation = state.generation;

    let notices = notices.clone();
    session.on_failure(Arc::new(move |reason: String| {
        let _ = notices.send(CloseNotice { generation, reason });
    }));

    (generation, state.session.replace(session))
}

async fn discard(session: &dyn BrokerSession, reason: &str) {
    let errors = session.close().await;
    if errors.is_empty() {
        debug!(reason = reason, "Closed broker session");
    } else {
        debug!(reason = reason, errors = ?errors, "Broker session closed with errors");
    }
}

/// Dials RabbitMQ with lapin
#[derive(Debug, Clone)]
pub struct LapinDialer {
    config: BrokerConfig,
    confirm_publishes: bool,
}

impl LapinDialer {
    pub fn new(config: BrokerConfig, confirm_publishes: bool) -> Self {
        Self {
            config,
            confirm_publishes,
        }
    }

    async fn open_channel(&self, connection: &Connection) -> MessagingResult<lapin::Channel> {
        let channel = connection.create_channel().await.map_err(|e| {
            MessagingError::connection(format!("RabbitMQ channel creation failed: {e}"))
        })?;

        if self.confirm_publishes {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| MessagingError::connection(format!("confirm mode failed: {e}")))?;
        }

        Ok(channel)
    }
}

#[async_trait]
impl BrokerDialer for LapinDialer {
    /// Dial and open a channel, closing the connection again if the channel fails
    async fn dial(&self) -> MessagingResult<Box<dyn BrokerSession>> {
        let connection = Connection::connect(
            &self.config.url(),
            ConnectionProperties::default()
                .with_connection_name(self.config.connection_name.clone().into()),
        )
        .await
        .map_err(|e| MessagingError::connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = match self.open_channel(&connection).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close(200, "channel setup failed").await {
                    debug!(error = %close_err, "Failed to close connection after channel error");
                }
                return Err(e);
            }
        };

        Ok(Box::new(LapinSession {
            connection,
            channel: Arc::new(LapinChannel::new(channel, self.confirm_publishes)),
        }))
    }
}

struct LapinSession {
    connection: Connection,
    channel: Arc<LapinChannel>,
}

#[async_trait]
impl BrokerSession for LapinSession {
    fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.is_open()
    }

    fn on_failure(&self, hook: FailureHook) {
        let connection_hook = hook.clone();
        self.connection
            .on_error(move |err| connection_hook(format!("connection error: {err}")));
        self.channel
            .on_error(move |err| hook(format!("channel error: {err}")));
    }

    async fn close(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.channel.is_open() {
            if let Err(e) = self.channel.close().await {
                errors.push(format!("channel: {e}"));
            }
        }

        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "OK").await {
                errors.push(format!("connection: {e}"));
            }
        }

        errors
    }
}
