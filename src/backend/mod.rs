//! Network backend.
//!
//! - `connection`: TCP/TLS setup, line framing, shared writer
//! - `negotiation`: CAP and SASL state machine
//! - `session`: one connection attempt, from connect to teardown
//! - `reconnect`: backoff arithmetic and scheduler state
//! - `supervisor`: the single task that owns sessions and reconnection
//!
//! [`Client`] is the handle front ends hold: commands go into the supervisor's
//! inbox, observable state comes back through watch/broadcast/crossbeam channels.

pub mod connection;
pub mod negotiation;
pub mod reconnect;
pub(crate) mod session;
mod supervisor;

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error};

use crate::config::{EngineSettings, SessionConfig};
use crate::error::EngineError;
use crate::events::Event;
use crate::protocol::{Action, ConnectionState, NetworkHandle, UserInfo};
use supervisor::Supervisor;

/// Publishing side of everything observers can see. Each update replaces
/// the whole value.
#[derive(Clone)]
pub(crate) struct Outlets {
    state: Arc<watch::Sender<ConnectionState>>,
    connected: Arc<watch::Sender<bool>>,
    echo: Arc<watch::Sender<bool>>,
    nick: Arc<watch::Sender<String>>,
    users: Arc<watch::Sender<Vec<UserInfo>>>,
    raw: broadcast::Sender<String>,
    event_tx: Sender<Event>,
    /// Kept to evict the oldest event when the channel is full.
    event_rx: Receiver<Event>,
}

impl Outlets {
    pub(crate) fn new(settings: &EngineSettings) -> Self {
        let (raw, _) = broadcast::channel(settings.raw_buffer.max(1));
        let (event_tx, event_rx) = crossbeam_channel::bounded(settings.event_buffer.max(1));
        Self {
            state: Arc::new(watch::channel(ConnectionState::Disconnected).0),
            connected: Arc::new(watch::channel(false).0),
            echo: Arc::new(watch::channel(false).0),
            nick: Arc::new(watch::channel(String::new()).0),
            users: Arc::new(watch::channel(Vec::new()).0),
            raw,
            event_tx,
            event_rx,
        }
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        let ready = state == ConnectionState::Ready;
        self.connected.send_if_modified(|connected| {
            let changed = *connected != ready;
            *connected = ready;
            changed
        });
    }

    pub(crate) fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub(crate) fn set_echo(&self, enabled: bool) {
        self.echo.send_replace(enabled);
    }

    pub(crate) fn echo_enabled(&self) -> bool {
        *self.echo.borrow()
    }

    pub(crate) fn set_nick(&self, nick: &str) {
        self.nick.send_if_modified(|current| {
            if current == nick {
                return false;
            }
            *current = nick.to_string();
            true
        });
    }

    pub(crate) fn nick(&self) -> String {
        self.nick.borrow().clone()
    }

    pub(crate) fn publish_users(&self, users: Vec<UserInfo>) {
        self.users.send_replace(users);
    }

    pub(crate) fn raw(&self, line: &str) {
        // No subscribers is fine.
        let _ = self.raw.send(line.to_string());
    }

    /// Queue an event, discarding the oldest one if the buffer is full.
    pub(crate) fn emit(&self, event: Event) {
        let mut event = event;
        loop {
            match self.event_tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    let _ = self.event_rx.try_recv();
                    event = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

/// Handle to the protocol engine. Cheap to clone; the backend stops once
/// every handle is dropped.
#[derive(Clone)]
pub struct Client {
    actions: mpsc::UnboundedSender<Action>,
    outlets: Outlets,
}

impl Client {
    fn build(settings: EngineSettings) -> (Self, Supervisor) {
        let outlets = Outlets::new(&settings);
        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(settings, outlets.clone(), rx, tx.downgrade());
        (
            Self {
                actions: tx,
                outlets,
            },
            supervisor,
        )
    }

    /// Start the backend on the current tokio runtime.
    ///
    /// Panics when called outside a runtime, like `tokio::spawn`.
    pub fn spawn(settings: EngineSettings) -> Self {
        let (client, supervisor) = Self::build(settings);
        tokio::spawn(supervisor.run());
        client
    }

    /// Start the backend on a dedicated thread with its own runtime, for
    /// front ends that are not async themselves.
    pub fn start(settings: EngineSettings) -> Result<Self, EngineError> {
        let rt = Runtime::new()?;
        let (client, supervisor) = Self::build(settings);
        thread::Builder::new()
            .name("slirc-backend".into())
            .spawn(move || {
                rt.block_on(supervisor.run());
                debug!("backend thread exiting");
            })?;
        Ok(client)
    }

    fn send(&self, action: Action) -> Result<(), EngineError> {
        self.actions.send(action).map_err(|_| {
            error!("backend is gone");
            EngineError::Closed
        })
    }

    /// Connect with `config`. Ignored while a session is already running.
    pub fn connect(&self, config: SessionConfig) -> Result<(), EngineError> {
        config.validate()?;
        self.send(Action::Connect(config))
    }

    /// Close the connection and cancel any pending reconnect. Idempotent.
    pub fn disconnect(&self) -> Result<(), EngineError> {
        self.send(Action::Disconnect)
    }

    /// Send a protocol line as-is (CR, LF and NUL are stripped).
    pub fn send_raw(&self, line: impl Into<String>) -> Result<(), EngineError> {
        self.send(Action::SendRaw(line.into()))
    }

    pub fn send_message(
        &self,
        target: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.send(Action::SendMessage {
            target: target.into(),
            text: text.into(),
        })
    }

    /// JOIN and make `channel` the tracked channel.
    pub fn join(&self, channel: impl Into<String>) -> Result<(), EngineError> {
        self.send(Action::Join(channel.into()))
    }

    pub fn part(&self, channel: impl Into<String>) -> Result<(), EngineError> {
        self.send(Action::Part(channel.into()))
    }

    /// NAMES, tracking `channel` for the reply.
    pub fn request_names(&self, channel: impl Into<String>) -> Result<(), EngineError> {
        self.send(Action::Names(channel.into()))
    }

    /// Send QUIT, then disconnect as if [`Client::disconnect`] was called.
    pub fn quit(&self, message: impl Into<String>) -> Result<(), EngineError> {
        self.send(Action::Quit(message.into()))
    }

    /// Reset the backoff and reconnect now, unless a session is running.
    pub fn reconnect_now(&self) -> Result<(), EngineError> {
        self.send(Action::ReconnectNow)
    }

    pub fn notify_network_available(&self, available: bool) -> Result<(), EngineError> {
        self.send(Action::NetworkAvailable(available))
    }

    /// Interface or local address used for future connections.
    pub fn set_active_network(&self, handle: Option<NetworkHandle>) -> Result<(), EngineError> {
        self.send(Action::SetActiveNetwork(handle))
    }

    pub fn is_connected(&self) -> bool {
        *self.outlets.connected.borrow()
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.outlets.subscribe_connected()
    }

    pub fn echo_enabled(&self) -> watch::Receiver<bool> {
        self.outlets.echo.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.outlets.state.subscribe()
    }

    pub fn nick(&self) -> watch::Receiver<String> {
        self.outlets.nick.subscribe()
    }

    /// Members of the tracked channel, sorted by rank then nick.
    pub fn users(&self) -> watch::Receiver<Vec<UserInfo>> {
        self.outlets.users.subscribe()
    }

    /// Raw inbound lines. Slow receivers lose the oldest lines.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<String> {
        self.outlets.raw.subscribe()
    }

    /// Normalized events. All clones share one queue; each event goes to one reader.
    pub fn events(&self) -> Receiver<Event> {
        self.outlets.event_rx.clone()
    }
}
