//! Tokio driver for the notification session.
//!
//! One background task owns the socket and the [`Session`]. Decoded events fan
//! out over a broadcast channel so any number of engines can share one
//! connection read-only. Failures never leave the task: they are logged and
//! show up as a [`ConnectionState`] transition, after which the task reconnects
//! with exponential backoff.
//!
//! ```text
//!            ┌──────────── task ─────────────┐
//!  TcpStream │ read ─► Session ─► Event ─────┼─► broadcast ─► engine 1..N
//!            │ write ◄─ take_outbound        │
//!            │ state ────────────────────────┼─► watch
//!            └───────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::close::CloseStatus;
use crate::error::TransportError;
use crate::handshake::Endpoint;
use crate::notification::Event;
use crate::session::{Session, SessionEvent, DEFAULT_MAX_MESSAGE_SIZE};

/// Connection state of the notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Notification channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// `ws://host[:port]/path?query`
    pub url: String,
    pub reconnect: ReconnectPolicy,
    /// Events buffered per subscriber before it starts lagging.
    pub event_capacity: usize,
    pub max_message_size: usize,
    pub read_buffer_size: usize,
    /// Budget for the TCP connect and the opening handshake together.
    pub connect_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/".to_string(),
            reconnect: ReconnectPolicy::default(),
            event_capacity: 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buffer_size: 8 * 1024,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub connects: u64,
    pub events_received: u64,
}

#[derive(Default)]
struct AtomicChannelStats {
    connects: AtomicU64,
    events_received: AtomicU64,
}

/// Handle to the background notification task.
///
/// Dropping the handle aborts the task.
pub struct NotificationChannel {
    endpoint: Endpoint,
    /// Kept only to mint new receivers; the task owns the sender.
    events: broadcast::Receiver<Event>,
    state: watch::Receiver<ConnectionState>,
    close_tx: mpsc::UnboundedSender<CloseStatus>,
    stats: Arc<AtomicChannelStats>,
    task: Option<JoinHandle<()>>,
}

impl NotificationChannel {
    /// Validate the endpoint and start connecting in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: ChannelConfig) -> Result<Self, TransportError> {
        let endpoint = Endpoint::parse(&config.url)?;
        let (events_tx, events_rx) = broadcast::channel(config.event_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicChannelStats::default());

        let driver = Driver {
            endpoint: endpoint.clone(),
            config,
            events: events_tx,
            state: state_tx,
            close_rx,
            stats: stats.clone(),
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            endpoint,
            events: events_rx,
            state: state_rx,
            close_tx,
            stats,
            task: Some(task),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// A new receiver for every Event decoded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.resubscribe()
    }

    /// Events as a lazy stream that survives reconnects.
    ///
    /// Lagged gaps are logged and skipped; the stream ends when the channel
    /// task stops.
    pub fn events(&self) -> impl Stream<Item = Event> + Send + 'static {
        futures_util::stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Notification stream lagged, {skipped} events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            connects: self.stats.connects.load(Ordering::Relaxed),
            events_received: self.stats.events_received.load(Ordering::Relaxed),
        }
    }

    /// Send a Close frame with `status` and stop reconnecting.
    pub fn close(&self, status: CloseStatus) {
        if self.close_tx.send(status).is_err() {
            log::debug!("Notification task already stopped");
        }
    }

    /// Close and wait for the background task to finish.
    pub async fn shutdown(mut self, status: CloseStatus) {
        self.close(status);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                log::error!("Notification task ended abnormally: {err}");
            }
        }
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ─── Background task ────────────────────────────────────────────────

enum SessionEnd {
    /// Local close requested; do not reconnect.
    Local,
    /// The server closed, or the socket dropped after the upgrade.
    Remote(CloseStatus),
}

struct Driver {
    endpoint: Endpoint,
    config: ChannelConfig,
    events: broadcast::Sender<Event>,
    state: watch::Sender<ConnectionState>,
    close_rx: mpsc::UnboundedReceiver<CloseStatus>,
    stats: Arc<AtomicChannelStats>,
}

impl Driver {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            self.state.send_replace(ConnectionState::Connecting);
            let outcome = self.connect_once(&mut attempt).await;
            self.state.send_replace(ConnectionState::Disconnected);

            match outcome {
                Ok(SessionEnd::Local) => {
                    log::info!("Notification channel to {} closed", self.endpoint.authority());
                    return;
                }
                Ok(SessionEnd::Remote(status)) => {
                    log::info!(
                        "Notification channel to {} ended with status {status}",
                        self.endpoint.authority()
                    );
                }
                Err(err) => {
                    log::warn!(
                        "Notification channel to {} failed: {err}",
                        self.endpoint.authority()
                    );
                }
            }

            if !self.config.reconnect.enabled {
                return;
            }
            let delay = self.config.reconnect.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            log::debug!("Reconnecting in {delay:?} (attempt {attempt})");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.close_rx.recv() => return,
            }
        }
    }

    async fn connect_once(&mut self, attempt: &mut u32) -> Result<SessionEnd, TransportError> {
        let budget = Duration::from_millis(self.config.connect_timeout_ms);
        let deadline = tokio::time::Instant::now() + budget;
        let mut stream =
            tokio::time::timeout_at(deadline, TcpStream::connect(self.endpoint.authority()))
                .await
                .map_err(|_| TransportError::ConnectTimeout(budget))??;
        stream.set_nodelay(true)?;

        let mut session = Session::new(self.endpoint.clone())
            .with_max_message_size(self.config.max_message_size);
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];

        loop {
            flush(&mut stream, &mut session).await?;

            while let Some(event) = session.poll_event() {
                match event {
                    SessionEvent::Connected => {
                        *attempt = 0;
                        self.stats.connects.fetch_add(1, Ordering::Relaxed);
                        self.state.send_replace(ConnectionState::Connected);
                    }
                    SessionEvent::Notification(event) => {
                        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
                        // No subscribers is fine; the event is simply not observed.
                        let _ = self.events.send(event);
                    }
                    SessionEvent::Closed { status } => {
                        flush(&mut stream, &mut session).await?;
                        return Ok(SessionEnd::Remote(status));
                    }
                    SessionEvent::Failed(err) => {
                        flush(&mut stream, &mut session).await?;
                        return Err(err);
                    }
                }
            }

            tokio::select! {
                read = stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return if session.is_connected() {
                            Ok(SessionEnd::Remote(CloseStatus::ABNORMAL))
                        } else {
                            Err(TransportError::UnexpectedEof)
                        };
                    }
                    session.receive(&buf[..n]);
                }
                _ = tokio::time::sleep_until(deadline), if !session.is_connected() => {
                    return Err(TransportError::ConnectTimeout(budget));
                }
                status = self.close_rx.recv() => {
                    session.close(status.unwrap_or(CloseStatus::GOING_AWAY));
                    flush(&mut stream, &mut session).await?;
                    if let Err(err) = stream.shutdown().await {
                        log::debug!("Socket shutdown failed: {err}");
                    }
                    return Ok(SessionEnd::Local);
                }
            }
        }
    }
}

async fn flush(stream: &mut TcpStream, session: &mut Session) -> Result<(), TransportError> {
    if session.has_outbound() {
        stream.write_all(&session.take_outbound()).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            enabled: true,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ChannelConfig =
            serde_json::from_str(r#"{"url":"ws://example:9000/v1/stream","reconnect":{"enabled":false}}"#)
                .unwrap();
        assert_eq!(config.url, "ws://example:9000/v1/stream");
        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert_eq!(config.event_capacity, 1024);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn test_silent_server_times_out_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let channel = NotificationChannel::spawn(ChannelConfig {
            reconnect: ReconnectPolicy {
                enabled: false,
                ..ReconnectPolicy::default()
            },
            connect_timeout_ms: 50,
            ..ChannelConfig::new(format!("ws://127.0.0.1:{port}/stream"))
        })
        .unwrap();
        let events = channel.events();
        futures_util::pin_mut!(events);

        // Accepted but never answered.
        let (_held, _) = listener.accept().await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("handshake never timed out");
        assert!(next.is_none());
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(channel.stats().connects, 0);
    }

    #[tokio::test]
    async fn test_spawn_rejects_bad_endpoint() {
        let result = NotificationChannel::spawn(ChannelConfig::new("https://example.com"));
        assert!(matches!(result, Err(TransportError::InvalidEndpoint { .. })));
    }
}
