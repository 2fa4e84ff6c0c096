//! One connection attempt: connect, register, negotiate, read until closed.
//!
//! All per-connection state (negotiation, membership, own nick) is owned by
//! the task running [`Session::run`]; observers only see published snapshots.

use std::ops::ControlFlow;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{establish_connection, IrcStream, LineCodec, Writer};
use super::negotiation::{Negotiation, Step};
use super::Outlets;
use crate::config::{EngineSettings, SessionConfig};
use crate::error::EngineError;
use crate::events::{normalize, Event};
use crate::membership::Membership;
use crate::message::{outbound, Message};
use crate::protocol::{Action, ConnectionState, NetworkHandle};

/// Phrases servers use when throttling new connections.
const RATE_LIMIT_PHRASES: [&str; 2] = ["too many connections", "excess flood"];

/// Requests from the supervisor to a running session.
#[derive(Debug, Clone)]
pub(crate) enum SessionCommand {
    /// Track membership of this channel from now on.
    Track(String),
}

/// How a session ended, as seen by the scheduler.
#[derive(Debug, Default)]
pub(crate) struct SessionOutcome {
    /// Overrides the computed backoff (server rate limiting).
    pub forced_delay: Option<Duration>,
    /// Replacement configuration (STS upgrade).
    pub upgraded: Option<SessionConfig>,
    /// Ended by the caller rather than the network.
    pub cancelled: bool,
    pub error: Option<EngineError>,
}

/// Supervisor side of a session.
#[derive(Clone)]
pub(crate) struct SessionLink {
    pub cancel: CancellationToken,
    pub writer: Writer,
    pub commands: mpsc::UnboundedSender<SessionCommand>,
}

pub(crate) struct Session {
    config: SessionConfig,
    settings: EngineSettings,
    network: Option<NetworkHandle>,
    outlets: Outlets,
    /// Weak so a running session does not keep the backend alive.
    inbox: mpsc::WeakUnboundedSender<Action>,
    link: SessionLink,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    negotiation: Negotiation,
    membership: Membership,
    nick: String,
    /// Cleared once JOIN has been sent.
    pending_join: Option<String>,
    outcome: SessionOutcome,
}

/// True when a line reports connection throttling. Only server-originated
/// lines count: a line with a `nick!user@host` source that quotes the phrase
/// (a QUIT reason, a PRIVMSG) is never treated as throttling.
pub(crate) fn is_rate_limit(line: &str, msg: Option<&Message>) -> bool {
    if msg.is_some_and(Message::from_user) {
        return false;
    }
    let lower = line.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p))
}

impl Session {
    pub(crate) fn new(
        config: SessionConfig,
        settings: EngineSettings,
        network: Option<NetworkHandle>,
        outlets: Outlets,
        inbox: mpsc::WeakUnboundedSender<Action>,
    ) -> (Self, SessionLink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let link = SessionLink {
            writer: Writer::with_token(cancel.child_token()),
            cancel,
            commands: tx,
        };
        let session = Self {
            nick: config.nick.clone(),
            pending_join: config.auto_join().map(str::to_string),
            config,
            settings,
            network,
            outlets,
            inbox,
            link: link.clone(),
            commands: rx,
            negotiation: Negotiation::new(),
            membership: Membership::new(),
            outcome: SessionOutcome::default(),
        };
        (session, link)
    }

    /// Connect and drive the connection to completion.
    pub(crate) async fn run(self) -> SessionOutcome {
        let addr = self.config.address();
        self.outlets.set_state(ConnectionState::Connecting);
        self.outlets.emit(Event::system(format!(
            "Connecting to {}{}",
            addr,
            if self.config.tls { " (TLS)" } else { "" }
        )));
        info!(%addr, tls = self.config.tls, "connecting");

        let cancel = self.link.cancel.clone();
        let connected = tokio::select! {
            _ = cancel.cancelled() => None,
            result = establish_connection(
                &self.config,
                self.network.as_ref(),
                self.settings.connect_timeout(),
            ) => Some(result),
        };

        match connected {
            None => {
                self.outlets.set_state(ConnectionState::Disconnected);
                SessionOutcome {
                    cancelled: true,
                    ..SessionOutcome::default()
                }
            }
            Some(Err(e)) => {
                warn!(%addr, "connection failed: {}", e);
                self.outlets.emit(Event::system(format!("Connection failed: {}", e)));
                self.outlets.set_state(ConnectionState::Disconnected);
                SessionOutcome {
                    error: Some(e),
                    ..SessionOutcome::default()
                }
            }
            Some(Ok(stream)) => self.drive(stream).await,
        }
    }

    /// Register on an already open stream and read until it closes.
    pub(crate) async fn drive<S>(mut self, stream: S) -> SessionOutcome
    where
        S: IrcStream + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        self.link.writer.install(Box::new(write)).await;
        let mut lines = FramedRead::new(read, LineCodec::new());

        self.outlets.set_state(ConnectionState::Negotiating);
        self.outlets.set_echo(false);
        self.outlets.set_nick(&self.nick);
        self.membership.track(self.pending_join.as_deref());
        self.outlets.publish_users(self.membership.snapshot());

        if let Some(line) = self.negotiation.begin(&self.config) {
            self.send(&line).await;
        }
        self.send(&outbound::nick(&self.config.nick)).await;
        self.send(&outbound::user(&self.config.user, &self.config.real_name))
            .await;

        let cancel = self.link.cancel.clone();
        let mut commands_open = true;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("session cancelled");
                    self.outcome.cancelled = true;
                    break;
                }
                cmd = self.commands.recv(), if commands_open => match cmd {
                    Some(SessionCommand::Track(channel)) => self.track(&channel),
                    None => commands_open = false,
                },
                next = lines.next() => match next {
                    Some(Ok(line)) => {
                        if self.handle_line(&line).await.is_break() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("read failed: {}", e);
                        self.outlets.emit(Event::system(format!("Connection error: {}", e)));
                        self.outcome.error = Some(e.into());
                        break;
                    }
                    None => {
                        info!("server closed the connection");
                        break;
                    }
                },
            }
        }

        // Each handle is released on its own; the writer close cannot fail
        // the reader drop or the state reset.
        self.link.writer.close().await;
        drop(lines);
        self.outlets.set_state(ConnectionState::Disconnected);
        self.outlets.emit(Event::system("Disconnected"));
        info!("disconnected");
        self.outcome
    }

    async fn send(&self, line: &str) {
        self.link.writer.send(line).await;
    }

    fn track(&mut self, channel: &str) {
        if self.membership.track(Some(channel)) {
            debug!(channel, "tracking channel");
            self.outlets.publish_users(self.membership.snapshot());
        }
    }

    async fn auto_join(&mut self) {
        let Some(channel) = self.pending_join.take() else {
            return;
        };
        info!(%channel, "auto-joining");
        self.send(&outbound::join(&channel)).await;
        self.track(&channel);
        self.send(&outbound::names(&channel)).await;
    }

    async fn handle_line(&mut self, line: &str) -> ControlFlow<()> {
        trace!("<- {}", line);
        self.outlets.raw(line);

        let parsed = match Message::parse(line) {
            Ok(msg) => Some(msg),
            Err(e) => {
                debug!("unparseable line ({}): {}", e, line);
                None
            }
        };

        if is_rate_limit(line, parsed.as_ref()) {
            let cooldown = self.settings.rate_limit_cooldown();
            warn!(?cooldown, "server is rate limiting connections");
            self.outlets.emit(Event::system(format!(
                "Server rate-limited connections; retrying in {}m",
                cooldown.as_secs().div_ceil(60)
            )));
            self.outcome.forced_delay = Some(cooldown);
            return ControlFlow::Break(());
        }

        if let Some(msg) = parsed {
            if msg.is("PING") {
                let token = msg.last_arg().unwrap_or("");
                self.send(&outbound::pong(token)).await;
                return ControlFlow::Continue(());
            }
            self.dispatch(&msg).await?;
        }

        if let Some(event) = normalize(line) {
            self.outlets.emit(event);
        }
        ControlFlow::Continue(())
    }

    async fn dispatch(&mut self, msg: &Message) -> ControlFlow<()> {
        match msg.numeric() {
            Some(1) => {
                if let Some(nick) = msg.param(0) {
                    self.nick = nick.to_string();
                    self.outlets.set_nick(nick);
                }
                info!(nick = %self.nick, "registered");
                self.outlets.set_state(ConnectionState::Ready);
                if let Some(inbox) = self.inbox.upgrade() {
                    let _ = inbox.send(Action::SessionReady);
                }
                self.auto_join().await;
            }
            Some(376) => self.auto_join().await,
            _ => {}
        }

        for step in self.negotiation.handle(msg, &self.config) {
            match step {
                Step::Send(line) => self.send(&line).await,
                Step::EchoEnabled => self.outlets.set_echo(true),
                Step::Prefixes(map) => self.membership.set_prefixes(map),
                Step::UpgradeTls(upgraded) => {
                    self.outlets.emit(Event::system(format!(
                        "Server requires TLS; reconnecting on port {}",
                        upgraded.port
                    )));
                    self.outcome.upgraded = Some(upgraded);
                    return ControlFlow::Break(());
                }
            }
        }

        if self.membership.apply(msg, &self.nick) {
            self.outlets.publish_users(self.membership.snapshot());
        }

        if msg.is("NICK") && msg.source_nick().is_some_and(|n| n.eq_ignore_ascii_case(&self.nick)) {
            if let Some(new_nick) = msg.last_arg() {
                info!(old = %self.nick, new = %new_nick, "own nick changed");
                self.nick = new_nick.to_string();
                self.outlets.set_nick(new_nick);
            }
        }
        ControlFlow::Continue(())
    }
}
