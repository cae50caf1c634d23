//! Realtime push channel with fixed-backoff reconnect.
//!
//! One connection per actor role, scoped to a booking (rider) or a driver. Failures are
//! never surfaced: after `max_attempts` consecutive failed reconnects the channel settles
//! in [`ConnectionState::Disconnected`] and the pollers carry on alone. A normal closure
//! (code 1000) or an explicit close does not reconnect.
//!
//! The connection lifecycle is an explicit state value driven by a single task:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!                    ^   |          |
//!                    |   v          v (abnormal close / error)
//!                 Backoff(n) <------+
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::booking::BookingId;
use crate::config::CoreConfig;
use crate::error::{Result, RideError};
use crate::notification::{decode_push, NotificationEvent};
use crate::telemetry::SessionTelemetry;

/// WebSocket close code for a normal closure.
pub const NORMAL_CLOSURE: u16 = 1000;

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Rider,
    Driver,
}

impl ActorRole {
    /// Push endpoint name for this role.
    pub const fn endpoint(&self) -> &'static str {
        match self {
            ActorRole::Rider => "rider-notifications",
            ActorRole::Driver => "driver-notifications",
        }
    }
}

/// What a push subscription is keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelScope {
    /// Rider subscription for one booking.
    Booking {
        booking_id: BookingId,
        rider_id: String,
    },
    /// Driver subscription for everything addressed to the driver.
    Driver { driver_id: String },
}

impl ChannelScope {
    pub fn role(&self) -> ActorRole {
        match self {
            ChannelScope::Booking { .. } => ActorRole::Rider,
            ChannelScope::Driver { .. } => ActorRole::Driver,
        }
    }

    pub fn actor_id(&self) -> &str {
        match self {
            ChannelScope::Booking { rider_id, .. } => rider_id,
            ChannelScope::Driver { driver_id } => driver_id,
        }
    }

    pub fn booking_id(&self) -> Option<BookingId> {
        match self {
            ChannelScope::Booking { booking_id, .. } => Some(*booking_id),
            ChannelScope::Driver { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport contract
// ---------------------------------------------------------------------------

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    Text(String),
    Closed { code: u16, reason: String },
    Error(String),
}

/// An open push connection.
#[async_trait]
pub trait PushConnection: Send {
    /// Next frame, `None` once the stream ended without a close frame.
    async fn next_frame(&mut self) -> Option<PushFrame>;

    /// Close with a normal closure.
    async fn close(&mut self);
}

/// Opens push connections.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, scope: &ChannelScope) -> Result<Box<dyn PushConnection>>;
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ConnectionState {
    /// Push absent: never connected, gave up, or closed normally.
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before reconnect attempt `attempt`.
    Backoff { attempt: u32 },
}

/// Input to [`ConnectionTracker::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSignal {
    Connect,
    Opened,
    /// Connect error, abnormal close, or stream error.
    Failed,
    /// Close code 1000.
    NormalClose,
    Shutdown,
}

/// Pure reconnect bookkeeping.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    state: ConnectionState,
    failures: u32,
    max_attempts: u32,
}

impl ConnectionTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            failures: 0,
            max_attempts,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn apply(&mut self, signal: ConnectionSignal) -> ConnectionState {
        self.state = match signal {
            ConnectionSignal::Connect => ConnectionState::Connecting,
            ConnectionSignal::Opened => {
                self.failures = 0;
                ConnectionState::Connected
            }
            ConnectionSignal::Failed => {
                self.failures = self.failures.saturating_add(1);
                if self.failures > self.max_attempts {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Backoff {
                        attempt: self.failures,
                    }
                }
            }
            ConnectionSignal::NormalClose | ConnectionSignal::Shutdown => {
                ConnectionState::Disconnected
            }
        };
        self.state
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub backoff: Duration,
    pub max_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl From<&CoreConfig> for ChannelConfig {
    fn from(config: &CoreConfig) -> Self {
        Self {
            backoff: config.reconnect_backoff(),
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

/// What the channel reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Notification(NotificationEvent),
    State(ConnectionState),
}

pub type ChannelCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Opens push subscriptions over a [`PushTransport`].
#[derive(Clone)]
pub struct RealtimeChannel {
    transport: Arc<dyn PushTransport>,
    config: ChannelConfig,
    telemetry: Arc<SessionTelemetry>,
}

impl RealtimeChannel {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        config: ChannelConfig,
        telemetry: Arc<SessionTelemetry>,
    ) -> Self {
        Self {
            transport,
            config,
            telemetry,
        }
    }

    /// Start the connection task. Events are delivered to `on_event` until the handle is
    /// closed or `parent` is cancelled.
    pub fn connect(
        &self,
        scope: ChannelScope,
        parent: &CancellationToken,
        on_event: ChannelCallback,
    ) -> ChannelHandle {
        let cancel = parent.child_token();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let task = tokio::spawn(run_channel(
            Arc::clone(&self.transport),
            scope.clone(),
            self.config,
            Arc::clone(&self.telemetry),
            cancel.clone(),
            state_tx,
            on_event,
        ));
        ChannelHandle {
            scope,
            cancel,
            task,
            state: state_rx,
        }
    }
}

/// Owner's handle on a running subscription. Dropping it closes the subscription.
#[derive(Debug)]
pub struct ChannelHandle {
    scope: ChannelScope,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    state: watch::Receiver<ConnectionState>,
}

impl ChannelHandle {
    pub fn scope(&self) -> &ChannelScope {
        &self.scope
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn is_push_available(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Stop the subscription. Returns without waiting; no event is delivered afterwards.
    pub fn close(&self) {
        self.cancel.cancel();
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

enum StreamEnd {
    Shutdown,
    NormalClose,
    Failed(String),
}

async fn run_channel(
    transport: Arc<dyn PushTransport>,
    scope: ChannelScope,
    config: ChannelConfig,
    telemetry: Arc<SessionTelemetry>,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    on_event: ChannelCallback,
) {
    let mut tracker = ConnectionTracker::new(config.max_attempts);
    let publish = |state: ConnectionState| {
        state_tx.send_replace(state);
        on_event(ChannelEvent::State(state));
    };
    let endpoint = scope.role().endpoint();

    loop {
        publish(tracker.apply(ConnectionSignal::Connect));
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = transport.connect(&scope) => result,
        };

        let failure = match connected {
            Ok(mut connection) => {
                publish(tracker.apply(ConnectionSignal::Opened));
                tracing::info!(endpoint, actor = scope.actor_id(), "push channel connected");
                match pump(connection.as_mut(), &scope, &cancel, &telemetry, &on_event).await {
                    StreamEnd::Shutdown => {
                        connection.close().await;
                        break;
                    }
                    StreamEnd::NormalClose => {
                        publish(tracker.apply(ConnectionSignal::NormalClose));
                        tracing::info!(endpoint, "push channel closed normally");
                        return;
                    }
                    StreamEnd::Failed(message) => message,
                }
            }
            Err(err) => err.to_string(),
        };

        let error = RideError::ChannelUnavailable { message: failure };
        match tracker.apply(ConnectionSignal::Failed) {
            state @ ConnectionState::Backoff { attempt } => {
                publish(state);
                telemetry.record_reconnect_attempt();
                tracing::warn!(
                    endpoint,
                    attempt,
                    backoff_ms = config.backoff.as_millis() as u64,
                    %error,
                    "push channel failed, reconnecting"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.backoff) => {}
                }
            }
            state => {
                publish(state);
                tracing::info!(endpoint, %error, "push channel unavailable, relying on polling");
                return;
            }
        }
    }

    publish(tracker.apply(ConnectionSignal::Shutdown));
}

async fn pump(
    connection: &mut dyn PushConnection,
    scope: &ChannelScope,
    cancel: &CancellationToken,
    telemetry: &SessionTelemetry,
    on_event: &ChannelCallback,
) -> StreamEnd {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Shutdown,
            frame = connection.next_frame() => frame,
        };

        match frame {
            None => return StreamEnd::Failed("stream ended without close frame".to_string()),
            Some(PushFrame::Closed { code, .. }) if code == NORMAL_CLOSURE => {
                return StreamEnd::NormalClose
            }
            Some(PushFrame::Closed { code, reason }) => {
                return StreamEnd::Failed(format!("closed with code {code}: {reason}"))
            }
            Some(PushFrame::Error(message)) => return StreamEnd::Failed(message),
            Some(PushFrame::Text(text)) => match decode_push(&text) {
                Ok(Some(mut payload)) => {
                    if let Some(id) = scope.booking_id() {
                        payload.fill_booking_id(id);
                    }
                    telemetry.record_push_event();
                    on_event(ChannelEvent::Notification(NotificationEvent::push(payload)));
                }
                Ok(None) => tracing::debug!("ignoring push frame"),
                Err(err) => tracing::warn!(error = %err, "dropping malformed push frame"),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket transport (behind `ws` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "ws")]
pub mod ws {
    use super::*;
    use crate::notification::ClientFrame;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    /// Close code reported when the peer closed without a status.
    const NO_STATUS: u16 = 1005;

    /// [`PushTransport`] over the push service's WebSocket endpoints.
    #[derive(Debug, Clone)]
    pub struct WebSocketTransport {
        base_url: String,
    }

    impl WebSocketTransport {
        /// Transport for `base_url` (e.g. `ws://localhost:8080`).
        pub fn new(base_url: &str) -> Self {
            Self {
                base_url: base_url.trim_end_matches('/').to_string(),
            }
        }

        /// Transport for the configured `push_service_url`.
        pub fn from_config(config: &CoreConfig) -> Self {
            Self::new(&config.push_service_url)
        }

        pub fn url_for(&self, scope: &ChannelScope) -> String {
            let endpoint = scope.role().endpoint();
            match scope {
                ChannelScope::Driver { driver_id } => {
                    format!("{}/ws/{endpoint}?driverId={driver_id}", self.base_url)
                }
                ChannelScope::Booking { .. } => format!("{}/ws/{endpoint}", self.base_url),
            }
        }
    }

    fn unavailable(err: impl std::fmt::Display) -> RideError {
        RideError::ChannelUnavailable {
            message: err.to_string(),
        }
    }

    #[async_trait]
    impl PushTransport for WebSocketTransport {
        async fn connect(&self, scope: &ChannelScope) -> Result<Box<dyn PushConnection>> {
            let url = self.url_for(scope);
            let (mut stream, _) = connect_async(url.as_str()).await.map_err(unavailable)?;

            if let ChannelScope::Booking {
                booking_id,
                rider_id,
            } = scope
            {
                let subscribe = ClientFrame::Subscribe {
                    booking_id: *booking_id,
                    rider_id: rider_id.clone(),
                };
                let text = serde_json::to_string(&subscribe).map_err(unavailable)?;
                stream.send(Message::Text(text)).await.map_err(unavailable)?;
            }
            Ok(Box::new(WebSocketConnection { stream }))
        }
    }

    struct WebSocketConnection {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    #[async_trait]
    impl PushConnection for WebSocketConnection {
        async fn next_frame(&mut self) -> Option<PushFrame> {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => return Some(PushFrame::Text(text)),
                    Ok(Message::Close(frame)) => {
                        return Some(match frame {
                            Some(frame) => PushFrame::Closed {
                                code: u16::from(frame.code),
                                reason: frame.reason.into_owned(),
                            },
                            None => PushFrame::Closed {
                                code: NO_STATUS,
                                reason: String::new(),
                            },
                        })
                    }
                    Ok(_) => continue,
                    Err(err) => return Some(PushFrame::Error(err.to_string())),
                }
            }
        }

        async fn close(&mut self) {
            let _ = self.stream.close(None).await;
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_backs_off_then_gives_up() {
        let mut tracker = ConnectionTracker::new(2);
        assert_eq!(tracker.apply(ConnectionSignal::Connect), ConnectionState::Connecting);
        assert_eq!(
            tracker.apply(ConnectionSignal::Failed),
            ConnectionState::Backoff { attempt: 1 }
        );
        tracker.apply(ConnectionSignal::Connect);
        assert_eq!(
            tracker.apply(ConnectionSignal::Failed),
            ConnectionState::Backoff { attempt: 2 }
        );
        tracker.apply(ConnectionSignal::Connect);
        assert_eq!(
            tracker.apply(ConnectionSignal::Failed),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn successful_open_resets_the_attempt_count() {
        let mut tracker = ConnectionTracker::new(1);
        tracker.apply(ConnectionSignal::Connect);
        tracker.apply(ConnectionSignal::Failed);
        tracker.apply(ConnectionSignal::Connect);
        assert_eq!(tracker.apply(ConnectionSignal::Opened), ConnectionState::Connected);
        assert_eq!(
            tracker.apply(ConnectionSignal::Failed),
            ConnectionState::Backoff { attempt: 1 }
        );
    }

    #[test]
    fn normal_close_does_not_back_off() {
        let mut tracker = ConnectionTracker::new(5);
        tracker.apply(ConnectionSignal::Connect);
        tracker.apply(ConnectionSignal::Opened);
        assert_eq!(
            tracker.apply(ConnectionSignal::NormalClose),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn scope_endpoints() {
        let rider = ChannelScope::Booking {
            booking_id: BookingId(1),
            rider_id: "asha".into(),
        };
        assert_eq!(rider.role().endpoint(), "rider-notifications");
        assert_eq!(rider.booking_id(), Some(BookingId(1)));
        let driver = ChannelScope::Driver {
            driver_id: "d".into(),
        };
        assert_eq!(driver.role().endpoint(), "driver-notifications");
        assert_eq!(driver.actor_id(), "d");
    }
}
