//! The backend task: owns the inbox, the running session and the backoff timer.
//!
//! Every command, network notification and session lifecycle signal is
//! handled here one at a time, so there is never more than one session.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Sleep};
use tracing::{debug, info, warn};

use super::reconnect::ReconnectState;
use super::session::{Session, SessionCommand, SessionLink, SessionOutcome};
use super::Outlets;
use crate::config::EngineSettings;
use crate::events::{unwrap_action, Event};
use crate::message::outbound;
use crate::protocol::{Action, NetworkHandle};

/// How long QUIT may wait for a peer that stopped reading.
const QUIT_LIMIT: Duration = Duration::from_secs(2);

struct Running {
    link: SessionLink,
    task: JoinHandle<SessionOutcome>,
}

pub(crate) struct Supervisor {
    settings: EngineSettings,
    outlets: Outlets,
    inbox: mpsc::UnboundedReceiver<Action>,
    /// Weak so dropping every client ends the loop.
    inbox_tx: mpsc::WeakUnboundedSender<Action>,
    reconnect: ReconnectState,
    network: Option<NetworkHandle>,
    current: Option<Running>,
    timer: Option<Pin<Box<Sleep>>>,
}

async fn join_running(current: &mut Option<Running>) -> SessionOutcome {
    match current {
        Some(running) => match (&mut running.task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("session task failed: {}", e);
                SessionOutcome::default()
            }
        },
        None => pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

impl Supervisor {
    pub(crate) fn new(
        settings: EngineSettings,
        outlets: Outlets,
        inbox: mpsc::UnboundedReceiver<Action>,
        inbox_tx: mpsc::WeakUnboundedSender<Action>,
    ) -> Self {
        Self {
            reconnect: ReconnectState::new(&settings),
            settings,
            outlets,
            inbox,
            inbox_tx,
            network: None,
            current: None,
            timer: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                action = self.inbox.recv() => match action {
                    Some(action) => self.handle(action).await,
                    None => break,
                },
                outcome = join_running(&mut self.current) => {
                    self.current = None;
                    self.session_ended(outcome);
                }
                _ = wait_timer(&mut self.timer) => {
                    self.timer = None;
                    self.timer_fired();
                }
            }
        }
        debug!("all clients dropped, shutting down backend");
        self.stop_session().await;
    }

    async fn handle(&mut self, action: Action) {
        match action {
            Action::Connect(config) => {
                if self.current.is_some() {
                    debug!("connect ignored, a session is already running");
                    return;
                }
                self.reconnect.user_initiated = false;
                self.reconnect.reset();
                self.reconnect.last_config = Some(config);
                self.timer = None;
                self.start_session();
            }
            Action::Disconnect => self.disconnect().await,
            Action::SendRaw(line) => self.spawn_send(line),
            Action::SendMessage { target, text } => {
                self.spawn_send(outbound::privmsg(&target, &text));
                if self.current.is_some() && !self.outlets.echo_enabled() {
                    let (text, action) = match unwrap_action(&text) {
                        Some(inner) => (inner.to_string(), true),
                        None => (text, false),
                    };
                    self.outlets.emit(Event::Chat {
                        nick: self.outlets.nick(),
                        target,
                        text,
                        action,
                        time: Utc::now(),
                    });
                }
            }
            Action::Join(channel) => {
                self.spawn_send(outbound::join(&channel));
                self.track(channel);
            }
            Action::Part(channel) => self.spawn_send(outbound::part(&channel)),
            Action::Names(channel) => {
                self.track(channel.clone());
                self.spawn_send(outbound::names(&channel));
            }
            Action::Quit(message) => {
                if let Some(running) = &self.current {
                    let quit = outbound::quit(&message);
                    if timeout(QUIT_LIMIT, running.link.writer.send(&quit)).await.is_err() {
                        debug!("QUIT not written in time, closing anyway");
                    }
                }
                self.disconnect().await;
            }
            Action::ReconnectNow => {
                if self.current.is_some() {
                    debug!("reconnect ignored, a session is already running");
                    return;
                }
                self.reconnect.user_initiated = false;
                self.reconnect.reset();
                self.schedule(true, None);
            }
            Action::NetworkAvailable(available) => {
                info!(available, "network availability changed");
                self.reconnect.network_available = available;
                if available && self.current.is_none() {
                    self.reconnect.reset();
                    self.schedule(true, None);
                }
            }
            Action::SetActiveNetwork(handle) => {
                debug!(?handle, "active network set");
                self.network = handle;
            }
            Action::SessionReady => self.reconnect.reset(),
        }
    }

    fn start_session(&mut self) {
        let Some(config) = self.reconnect.last_config.clone() else {
            return;
        };
        let (session, link) = Session::new(
            config,
            self.settings.clone(),
            self.network.clone(),
            self.outlets.clone(),
            self.inbox_tx.clone(),
        );
        let task = tokio::spawn(session.run());
        self.current = Some(Running { link, task });
    }

    /// Cancel the running session and wait for its teardown.
    async fn stop_session(&mut self) {
        if let Some(running) = self.current.take() {
            running.link.cancel.cancel();
            if let Err(e) = running.task.await {
                warn!("session task failed: {}", e);
            }
        }
    }

    /// Caller-initiated: no reconnect until the next connect or reconnect-now.
    async fn disconnect(&mut self) {
        self.reconnect.user_initiated = true;
        if self.timer.take().is_some() {
            debug!("pending reconnect cancelled");
        }
        self.stop_session().await;
    }

    fn spawn_send(&self, line: String) {
        let Some(running) = &self.current else {
            debug!("not connected, dropping: {}", line);
            return;
        };
        let writer = running.link.writer.clone();
        tokio::spawn(async move { writer.send(&line).await });
    }

    fn track(&self, channel: String) {
        if let Some(running) = &self.current {
            let _ = running.link.commands.send(SessionCommand::Track(channel));
        }
    }

    fn session_ended(&mut self, outcome: SessionOutcome) {
        if let Some(error) = &outcome.error {
            debug!("session ended with error: {}", error);
        }
        if let Some(upgraded) = outcome.upgraded {
            info!(port = upgraded.port, "using TLS for future connections");
            self.reconnect.last_config = Some(upgraded);
        }
        if outcome.cancelled {
            return;
        }
        self.schedule(false, outcome.forced_delay);
    }

    /// Arm the reconnect timer unless the caller disconnected or a session runs.
    fn schedule(&mut self, immediate: bool, forced: Option<Duration>) {
        if self.reconnect.user_initiated || self.current.is_some() {
            return;
        }
        if self.reconnect.last_config.is_none() {
            return;
        }
        let delay = match forced {
            Some(delay) => delay,
            None if immediate => Duration::ZERO,
            None => self.reconnect.next_delay(&self.settings, None),
        };
        let message = if forced.is_some() {
            format!("Reconnecting in {}s (cooldown)", delay.as_secs())
        } else {
            format!(
                "Reconnecting in {}s (attempt {})",
                delay.as_secs(),
                self.reconnect.attempts() + 1
            )
        };
        info!(?delay, attempt = self.reconnect.attempts(), "scheduling reconnect");
        self.outlets.emit(Event::system(message));
        self.timer = Some(Box::pin(sleep(delay)));
    }

    fn timer_fired(&mut self) {
        if self.reconnect.user_initiated || self.current.is_some() {
            return;
        }
        if !self.reconnect.network_available {
            info!("network unavailable, waiting before reconnecting");
            self.outlets.emit(Event::system("Waiting for network"));
            return;
        }
        self.reconnect.record_attempt();
        self.start_session();
    }
}
