use std::net::IpAddr;

use crate::config::SessionConfig;

/// Actions sent from the front end (and from running sessions) to the backend.
#[derive(Debug, Clone)]
pub(crate) enum Action {
    /// Connect to an IRC server
    Connect(SessionConfig),
    /// Caller-initiated disconnect; cancels any pending reconnect
    Disconnect,
    /// Send a raw protocol line
    SendRaw(String),
    /// Send a message to a target (channel or user)
    SendMessage { target: String, text: String },
    /// Join a channel and start tracking its members
    Join(String),
    /// Part (leave) a channel
    Part(String),
    /// Request NAMES and track that channel
    Names(String),
    /// Send QUIT and disconnect
    Quit(String),
    /// Reset backoff and reconnect immediately
    ReconnectNow,
    /// Network availability changed
    NetworkAvailable(bool),
    /// Interface or local address to bind future sockets to
    SetActiveNetwork(Option<NetworkHandle>),
    /// A session received RPL_WELCOME
    SessionReady,
}

/// Lifecycle of the single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Resolving, connecting, TLS handshake
    Connecting,
    /// Socket open, registration and CAP negotiation in progress
    Negotiating,
    /// RPL_WELCOME received
    Ready,
}

/// A channel member with its privilege symbol (if any).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserInfo {
    pub nick: String,
    pub prefix: Option<char>,
}

impl UserInfo {
    pub fn new(nick: impl Into<String>, prefix: Option<char>) -> Self {
        Self {
            nick: nick.into(),
            prefix,
        }
    }
}

/// Where outgoing sockets should be bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkHandle {
    /// Bind to a device by name (`SO_BINDTODEVICE`, Linux/Android only).
    Interface(String),
    /// Bind to a local source address.
    LocalAddress(IpAddr),
}
