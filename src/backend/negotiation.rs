//! IRCv3 capability negotiation and SASL PLAIN.
//!
//! Pure state machine: inbound messages go in, [`Step`]s come out, and the
//! session performs them. State lives for one connection attempt.

use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::membership::PrefixMap;
use crate::message::{outbound, Message};

/// Longest AUTHENTICATE payload per line.
pub const SASL_CHUNK_SIZE: usize = 400;

/// Capabilities we ask for, in request order.
const WANTED: [&str; 3] = ["echo-message", "server-time", "sasl"];

/// Something the session must do in response to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send(String),
    /// Server acknowledged `echo-message`.
    EchoEnabled,
    /// STS policy seen on a plaintext connection: drop it and reconnect with this.
    UpgradeTls(SessionConfig),
    /// ISUPPORT announced a usable PREFIX table.
    Prefixes(PrefixMap),
}

#[derive(Debug, Default)]
pub struct Negotiation {
    active: bool,
    /// Sent in a `CAP REQ` and not yet answered.
    requested: HashSet<String>,
    acknowledged: HashSet<String>,
    sasl_pending: bool,
    /// Continuation lines of a multi-line `CAP LS`.
    ls_buffer: Vec<String>,
}

impl Negotiation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn sasl_pending(&self) -> bool {
        self.sasl_pending
    }

    pub fn acknowledged(&self) -> &HashSet<String> {
        &self.acknowledged
    }

    /// Capabilities requested and still awaiting ACK or NAK.
    pub fn requested(&self) -> &HashSet<String> {
        &self.requested
    }

    /// Reset for a fresh connection and return the opening line, if any.
    pub fn begin(&mut self, config: &SessionConfig) -> Option<String> {
        *self = Self::default();
        if config.request_caps {
            self.active = true;
            Some(outbound::cap_ls())
        } else {
            None
        }
    }

    pub fn handle(&mut self, msg: &Message, config: &SessionConfig) -> Vec<Step> {
        let mut steps = Vec::new();
        if msg.is("CAP") {
            self.handle_cap(msg, config, &mut steps);
        } else if msg.is("AUTHENTICATE") {
            self.handle_authenticate(msg, config, &mut steps);
        } else {
            match msg.numeric() {
                Some(5) => {
                    if let Some(map) = PrefixMap::from_isupport(msg.args().skip(1)) {
                        steps.push(Step::Prefixes(map));
                    }
                }
                Some(900) => {
                    info!("SASL: {}", msg.last_arg().unwrap_or("logged in"));
                }
                Some(903) => {
                    info!("SASL authentication succeeded");
                    self.sasl_pending = false;
                    self.finish(&mut steps);
                }
                Some(code @ 904..=907) => {
                    warn!(code, "SASL authentication failed: {}", msg.last_arg().unwrap_or(""));
                    self.sasl_pending = false;
                    self.finish(&mut steps);
                }
                _ => {}
            }
        }
        steps
    }

    fn handle_cap(&mut self, msg: &Message, config: &SessionConfig, steps: &mut Vec<Step>) {
        let Some(sub) = msg.param(1).map(str::to_ascii_uppercase) else {
            return;
        };
        let caps: Vec<String> = msg
            .trailing
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        match sub.as_str() {
            "LS" | "NEW" => {
                if sub == "LS" && msg.param(2) == Some("*") {
                    // CAP * LS * :... more lines follow
                    self.ls_buffer.extend(caps);
                    return;
                }
                let mut offered = std::mem::take(&mut self.ls_buffer);
                offered.extend(caps);
                if offered.is_empty() {
                    return;
                }
                debug!(?offered, "capabilities offered");
                self.handle_offer(&offered, config, steps);
            }
            "ACK" => {
                let mut sasl_acked = false;
                for cap in &caps {
                    self.requested.remove(cap.trim_start_matches('-'));
                    if let Some(removed) = cap.strip_prefix('-') {
                        self.acknowledged.remove(removed);
                        continue;
                    }
                    if cap.eq_ignore_ascii_case("echo-message") {
                        steps.push(Step::EchoEnabled);
                    }
                    if cap.eq_ignore_ascii_case("sasl") {
                        sasl_acked = true;
                    }
                    self.acknowledged.insert(cap.clone());
                }
                debug!(acknowledged = ?self.acknowledged, "capabilities acknowledged");
                if sasl_acked && config.sasl_credentials().is_some() {
                    self.sasl_pending = true;
                    steps.push(Step::Send(outbound::authenticate("PLAIN")));
                } else {
                    self.finish(steps);
                }
            }
            "NAK" => {
                debug!(?caps, "capabilities rejected");
                for cap in &caps {
                    self.requested.remove(cap.as_str());
                }
                self.finish(steps);
            }
            _ => {}
        }
    }

    fn handle_offer(&mut self, offered: &[String], config: &SessionConfig, steps: &mut Vec<Step>) {
        if !config.tls {
            if let Some(port) = offered
                .iter()
                .find_map(|cap| cap.strip_prefix("sts="))
                .and_then(sts_port)
            {
                info!(port, "server advertises STS, upgrading to TLS");
                steps.push(Step::UpgradeTls(config.with_sts_upgrade(port)));
                return;
            }
        }

        let names: HashSet<&str> = offered
            .iter()
            .map(|cap| cap.split_once('=').map_or(cap.as_str(), |(name, _)| name))
            .collect();
        let wanted: Vec<&str> = WANTED
            .iter()
            .copied()
            .filter(|cap| names.contains(cap))
            .filter(|cap| *cap != "sasl" || config.sasl_credentials().is_some())
            .filter(|cap| !self.acknowledged.contains(*cap) && !self.requested.contains(*cap))
            .collect();

        if wanted.is_empty() {
            self.finish(steps);
            return;
        }
        self.requested.extend(wanted.iter().map(|c| c.to_string()));
        steps.push(Step::Send(outbound::cap_req(&wanted)));
    }

    fn handle_authenticate(&mut self, msg: &Message, config: &SessionConfig, steps: &mut Vec<Step>) {
        if msg.last_arg() != Some("+") || !self.sasl_pending {
            return;
        }
        let Some((account, password)) = config.sasl_credentials() else {
            return;
        };
        let encoded = encode_plain(account, password);
        steps.extend(chunk_payload(&encoded).into_iter().map(Step::Send));
    }

    /// Send `CAP END` unless SASL is still running.
    fn finish(&mut self, steps: &mut Vec<Step>) {
        if !self.active || self.sasl_pending {
            return;
        }
        self.active = false;
        steps.push(Step::Send(outbound::cap_end()));
    }
}

/// `port=` value of an STS policy (`port=6697,duration=300`).
fn sts_port(policy: &str) -> Option<u16> {
    policy
        .split(',')
        .filter_map(|item| item.split_once('='))
        .find(|(key, _)| *key == "port")
        .and_then(|(_, value)| value.parse::<u16>().ok())
        .filter(|port| *port > 0)
}

/// Base64 of `account\0account\0password`.
pub fn encode_plain(account: &str, password: &str) -> String {
    BASE64.encode(format!("{account}\0{account}\0{password}"))
}

/// `AUTHENTICATE` lines for an encoded response, split at 400 bytes.
fn chunk_payload(encoded: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut rest = encoded;
    while rest.len() > SASL_CHUNK_SIZE {
        // base64 is ASCII, any byte index is a char boundary
        let (head, tail) = rest.split_at(SASL_CHUNK_SIZE);
        lines.push(outbound::authenticate(head));
        rest = tail;
    }
    if rest.is_empty() {
        lines.push(outbound::authenticate("+"));
    } else {
        let exact = rest.len() == SASL_CHUNK_SIZE;
        lines.push(outbound::authenticate(rest));
        if exact {
            lines.push(outbound::authenticate("+"));
        }
    }
    lines
}
