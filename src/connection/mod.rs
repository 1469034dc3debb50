use crate::reconnect::{ReconnectPolicy, ReconnectState, RetryDecision};
use crate::session::Session;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const ABNORMAL_CLOSURE: u16 = 1006;
pub const SESSION_TIMEOUT: u16 = 4403;

/// Lifecycle signal raised by a transport for the channel it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Error(String),
    Closed { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Send(String),
    Close { code: u16, reason: String },
}

/// Everything the engine task reacts to, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSignal {
    Channel { generation: u64, event: TransportEvent },
    RetryDue { ticket: u64 },
}

/// Sink handed to a transport; tags every event with the channel generation
/// so events from an already-released channel can be told apart.
#[derive(Debug, Clone)]
pub struct ChannelEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<EngineSignal>,
}

impl ChannelEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<EngineSignal>) -> Self {
        Self { generation, tx }
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(EngineSignal::Channel {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Establishes a duplex transport without blocking the caller; the outcome is
/// reported through `events` (`Opened`, then frames, then exactly one `Closed`).
pub trait Connector: Send + 'static {
    fn connect(&self, url: Url, events: ChannelEvents) -> mpsc::UnboundedSender<TransportCommand>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Outbound control messages understood by the push server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    AccountUpdate {
        #[serde(rename = "accountId")]
        account_id: String,
    },
    LocalClose,
}

#[derive(Debug)]
pub enum ConnectionError {
    InvalidState(&'static str),
    Url(url::ParseError),
    Serialize(serde_json::Error),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Url(err) => write!(f, "invalid push endpoint: {err}"),
            Self::Serialize(err) => write!(f, "serialize error: {err}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

#[derive(Debug)]
struct OwnedChannel {
    generation: u64,
    account_id: String,
    state: ChannelState,
    commands: mpsc::UnboundedSender<TransportCommand>,
}

/// Sole owner of the live channel. At most one channel exists at a time; the
/// handle is cleared before an explicit close goes out, which is how a later
/// `Closed` event is recognised as expected rather than a drop.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    endpoint: Url,
    signals: mpsc::UnboundedSender<EngineSignal>,
    channel: Option<OwnedChannel>,
    next_generation: u64,
    reconnect: ReconnectPolicy,
    status: ConnectionStatus,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        connector: C,
        endpoint: Url,
        retry_interval: Duration,
        signals: mpsc::UnboundedSender<EngineSignal>,
    ) -> Self {
        Self {
            connector,
            endpoint,
            signals,
            channel: None,
            next_generation: 0,
            reconnect: ReconnectPolicy::new(retry_interval),
            status: ConnectionStatus::Disconnected,
        }
    }

    pub fn open(&mut self, account_id: &str, token: Option<&str>) -> Result<(), ConnectionError> {
        let account_id = account_id.trim();
        if account_id.is_empty() {
            return Err(ConnectionError::InvalidState(
                "account id must not be empty",
            ));
        }
        if self.channel.is_some() {
            return Err(ConnectionError::InvalidState(
                "a channel is already open; close it first",
            ));
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let url = channel_url(&self.endpoint, account_id, token);
        let events = ChannelEvents::new(generation, self.signals.clone());
        tracing::info!(account_id = %account_id, generation, endpoint = %self.endpoint, "opening push channel");
        self.reconnect.cancel_pending();
        let commands = self.connector.connect(url, events);
        self.channel = Some(OwnedChannel {
            generation,
            account_id: account_id.to_string(),
            state: ChannelState::Connecting,
            commands,
        });
        self.status = ConnectionStatus::Connecting;
        Ok(())
    }

    /// Releases the owned channel (if any) and cancels a pending retry.
    pub fn close(&mut self, code: u16, reason: &str) {
        if let Some(channel) = self.channel.take() {
            tracing::info!(
                account_id = %channel.account_id,
                generation = channel.generation,
                code,
                reason,
                "closing push channel"
            );
            let _ = channel.commands.send(TransportCommand::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.reconnect.reset();
        self.status = ConnectionStatus::Disconnected;
    }

    pub fn send(&self, message: &ControlMessage) {
        let Some(channel) = self.channel.as_ref().filter(|c| c.state == ChannelState::Open) else {
            tracing::warn!(message = ?message, "push channel not open; control message dropped");
            return;
        };
        let text = match serde_json::to_string(message).map_err(ConnectionError::Serialize) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(error = %err, "control message not sent");
                return;
            }
        };
        if channel.commands.send(TransportCommand::Send(text)).is_err() {
            tracing::warn!(generation = channel.generation, "transport gone; control message dropped");
        }
    }

    /// Records that the open channel now serves `account_id` after the server
    /// was told about the switch.
    pub fn rebind(&mut self, account_id: &str) {
        if let Some(channel) = self.channel.as_mut() {
            channel.account_id = account_id.to_string();
        }
    }

    /// Applies one transport event; returns the raw frame for decoding when
    /// the event carries one from the current channel.
    pub fn on_transport_event(&mut self, generation: u64, event: TransportEvent) -> Option<String> {
        let current = self.channel.as_ref().map(|c| c.generation);
        if current != Some(generation) {
            tracing::debug!(generation, current = ?current, event = ?event, "event from released channel ignored");
            return None;
        }

        match event {
            TransportEvent::Opened => {
                if let Some(channel) = self.channel.as_mut() {
                    channel.state = ChannelState::Open;
                    tracing::info!(account_id = %channel.account_id, generation, "push channel connected");
                }
                self.reconnect.on_opened();
                self.status = ConnectionStatus::Connected;
                None
            }
            TransportEvent::Frame(raw) => Some(raw),
            TransportEvent::Error(err) => {
                tracing::warn!(error = %err, generation, "push channel transport error");
                None
            }
            TransportEvent::Closed { code, reason } => {
                let account_id = self.channel.take().map(|c| c.account_id).unwrap_or_default();
                tracing::warn!(
                    account_id = %account_id,
                    generation,
                    code,
                    reason = %reason,
                    retry_in_ms = self.reconnect.interval().as_millis() as u64,
                    "push channel dropped; scheduling reconnect"
                );
                self.status = ConnectionStatus::Disconnected;
                self.reconnect.on_unexpected_close(&self.signals);
                None
            }
        }
    }

    /// Retry timer fired: reopen for the session's account, if it still has one.
    pub fn on_retry_due(&mut self, ticket: u64, session: &Session) {
        let account = session.wants_channel().then(|| session.account_id()).flatten();
        match self.reconnect.on_retry_due(ticket, account) {
            RetryDecision::Stale => {
                tracing::debug!(ticket, "stale retry timer ignored");
            }
            RetryDecision::Abandon => {
                tracing::info!("session ended while reconnecting; retry abandoned");
            }
            RetryDecision::Reopen(account_id) => {
                if let Err(err) = self.open(&account_id, session.token()) {
                    tracing::warn!(error = %err, account_id = %account_id, "reconnect attempt failed to start");
                }
            }
        }
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.channel_state() == ChannelState::Open
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel
            .as_ref()
            .map(|c| c.state)
            .unwrap_or(ChannelState::Closed)
    }

    pub fn channel_account(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.account_id.as_str())
    }

    pub fn reconnect_state(&self) -> ReconnectState {
        self.reconnect.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }
}

/// Joins the configured server base and channel path into the endpoint every
/// channel is addressed from.
pub fn push_endpoint(base: &str, path: &str) -> Result<Url, ConnectionError> {
    let joined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    let url = Url::parse(&joined).map_err(ConnectionError::Url)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConnectionError::InvalidState("push url must use ws:// or wss://"));
    }
    Ok(url)
}

fn channel_url(endpoint: &Url, account_id: &str, token: Option<&str>) -> Url {
    let mut url = endpoint.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("accountId", account_id);
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }
    url
}
