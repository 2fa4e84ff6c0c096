//! Normalized events derived from inbound lines.
//!
//! Structured parsing is tried first; lines the parser rejects or does not
//! recognise fall back to a set of loose patterns, and anything left over is
//! surfaced as a [`Event::System`] line.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::message::Message;

/// One user-facing happening on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// PRIVMSG, with CTCP ACTION unwrapped (`action` set).
    Chat {
        nick: String,
        target: String,
        text: String,
        action: bool,
        time: DateTime<Utc>,
    },
    Notice {
        nick: Option<String>,
        target: Option<String>,
        text: String,
        time: DateTime<Utc>,
    },
    Join {
        nick: String,
        channel: String,
        time: DateTime<Utc>,
    },
    Part {
        nick: String,
        channel: String,
        reason: Option<String>,
        time: DateTime<Utc>,
    },
    Quit {
        nick: String,
        reason: Option<String>,
        time: DateTime<Utc>,
    },
    Kick {
        by: Option<String>,
        channel: String,
        target: String,
        reason: Option<String>,
        time: DateTime<Utc>,
    },
    Nick {
        old: String,
        new: String,
        time: DateTime<Utc>,
    },
    /// 332 carries text without setter, 333 setter and time without text.
    Topic {
        channel: String,
        text: String,
        setter: Option<String>,
        set_at: Option<DateTime<Utc>>,
        time: DateTime<Utc>,
    },
    System {
        text: String,
        target: Option<String>,
        time: DateTime<Utc>,
    },
}

impl Event {
    pub fn system(text: impl Into<String>) -> Self {
        Event::System {
            text: text.into(),
            target: None,
            time: Utc::now(),
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Event::Chat { time, .. }
            | Event::Notice { time, .. }
            | Event::Join { time, .. }
            | Event::Part { time, .. }
            | Event::Quit { time, .. }
            | Event::Kick { time, .. }
            | Event::Nick { time, .. }
            | Event::Topic { time, .. }
            | Event::System { time, .. } => *time,
        }
    }
}

static PRIVMSG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^:([^! ]+)!.* PRIVMSG ([^ ]+) :(.*)$").expect("PRIVMSG pattern is valid")
});
static JOIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^:([^! ]+)!.* JOIN :?(.*)$").expect("JOIN pattern is valid"));
static PART_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^:([^! ]+)!.* PART ([^ ]+)(?: :(.*))?$").expect("PART pattern is valid")
});
static QUIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^:([^! ]+)!.* QUIT :?(.*)$").expect("QUIT pattern is valid"));
static KICK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^:([^! ]+)!.* KICK ([^ ]+) ([^ ]+)(?: :(.*))?$").expect("KICK pattern is valid")
});
static TOPIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^:([^! ]+)!.* TOPIC ([^ ]+) :(.*)$").expect("TOPIC pattern is valid")
});
static NICK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^:([^! ]+)!.* NICK :(.*)$").expect("NICK pattern is valid"));
static NOTICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^:([^! ]+)!?[^ ]* NOTICE ([^ ]+) :(.*)$").expect("NOTICE pattern is valid")
});
static NUMERIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^:[^ ]+ (\d{3}) .*$").expect("numeric pattern is valid"));

fn non_blank(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Strip `\x01ACTION ...\x01`. Returns the inner text when wrapped.
pub(crate) fn unwrap_action(text: &str) -> Option<&str> {
    text.strip_prefix("\x01ACTION ")?.strip_suffix('\x01')
}

/// Normalize one raw line using the current wall clock.
pub fn normalize(line: &str) -> Option<Event> {
    normalize_at(line, Utc::now())
}

/// Normalize one raw line; `now` is used when the line has no server-time tag.
///
/// Returns `None` for lines that carry no user-facing meaning (PING, NAMES
/// replies, unrecognised numerics).
pub fn normalize_at(line: &str, now: DateTime<Utc>) -> Option<Event> {
    if line.starts_with("PING ") {
        return None;
    }

    match Message::parse(line) {
        Ok(msg) => {
            if matches!(msg.numeric(), Some(353 | 366)) {
                return None;
            }
            if let Some(result) = from_message(&msg, line, now) {
                return result;
            }
        }
        Err(_) if line.contains(" 353 ") || line.contains(" 366 ") => return None,
        Err(_) => {}
    }

    Some(fallback(line, now))
}

/// `Some(result)` when the structured message decided the outcome, `None` to
/// fall through to pattern matching.
fn from_message(msg: &Message, line: &str, now: DateTime<Utc>) -> Option<Option<Event>> {
    let time = msg.server_time().unwrap_or(now);
    let nick = msg.source_nick().unwrap_or("").to_string();
    let trailing = msg.trailing.as_deref();

    match msg.command.to_ascii_uppercase().as_str() {
        "PRIVMSG" => {
            let target = msg.param(0).unwrap_or("").to_string();
            let raw = trailing.unwrap_or("");
            let (text, action) = match unwrap_action(raw) {
                Some(inner) => (inner, true),
                None => (raw, false),
            };
            return Some(Some(Event::Chat {
                nick,
                target,
                text: text.to_string(),
                action,
                time,
            }));
        }
        "NOTICE" => {
            return Some(Some(Event::Notice {
                nick: non_blank(&nick),
                target: msg.param(0).map(str::to_string),
                text: trailing.unwrap_or("").to_string(),
                time,
            }));
        }
        "JOIN" => {
            let channel = msg.param(0).or(trailing).unwrap_or("");
            if !channel.trim().is_empty() {
                return Some(Some(Event::Join {
                    nick,
                    channel: channel.to_string(),
                    time,
                }));
            }
        }
        "PART" => {
            let channel = msg.param(0).unwrap_or("");
            if !channel.trim().is_empty() {
                return Some(Some(Event::Part {
                    nick,
                    channel: channel.to_string(),
                    reason: trailing.and_then(non_blank),
                    time,
                }));
            }
        }
        "QUIT" => {
            return Some(Some(Event::Quit {
                nick,
                reason: trailing.and_then(non_blank),
                time,
            }));
        }
        "KICK" => {
            if let (Some(channel), Some(target)) = (
                msg.param(0).filter(|c| !c.trim().is_empty()),
                msg.param(1).filter(|t| !t.trim().is_empty()),
            ) {
                return Some(Some(Event::Kick {
                    by: non_blank(&nick),
                    channel: channel.to_string(),
                    target: target.to_string(),
                    reason: trailing.and_then(non_blank),
                    time,
                }));
            }
        }
        "NICK" => {
            let new = trailing.or(msg.param(0)).unwrap_or("");
            if !nick.trim().is_empty() && !new.trim().is_empty() {
                return Some(Some(Event::Nick {
                    old: nick,
                    new: new.to_string(),
                    time,
                }));
            }
        }
        "TOPIC" => {
            if let Some(channel) = msg.param(0).filter(|c| !c.trim().is_empty()) {
                return Some(Some(Event::Topic {
                    channel: channel.to_string(),
                    text: trailing.unwrap_or("").to_string(),
                    setter: non_blank(&nick),
                    set_at: Some(time),
                    time,
                }));
            }
        }
        _ => {}
    }

    let code = msg.numeric()?;
    let system = |text: &str| {
        Some(Event::System {
            text: text.to_string(),
            target: None,
            time,
        })
    };
    let event = match code {
        1 => system(trailing.unwrap_or("Welcome")),
        375 => system(trailing.unwrap_or("- Message of the day -")),
        372 => system(trailing.unwrap_or("")),
        376 => system(trailing.unwrap_or("End of MOTD")),
        422 => system(trailing.unwrap_or("MOTD missing")),
        311 | 312 | 317 | 319 => system(after_colon(line).unwrap_or(line)),
        318 => system("End of WHOIS"),
        332 => msg
            .param(1)
            .filter(|c| !c.trim().is_empty())
            .map(|channel| Event::Topic {
                channel: channel.to_string(),
                text: trailing.unwrap_or("").to_string(),
                setter: None,
                set_at: None,
                time,
            }),
        333 => msg
            .param(1)
            .filter(|c| !c.trim().is_empty())
            .map(|channel| Event::Topic {
                channel: channel.to_string(),
                text: String::new(),
                setter: msg.param(2).map(str::to_string),
                set_at: msg
                    .param(3)
                    .and_then(|ts| ts.parse::<i64>().ok())
                    .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
                time,
            }),
        _ => None,
    };
    Some(event)
}

/// Text after the first ` :` of a raw line.
fn after_colon(line: &str) -> Option<&str> {
    line.split_once(" :").map(|(_, rest)| rest)
}

fn fallback(line: &str, now: DateTime<Utc>) -> Event {
    if let Some(c) = PRIVMSG_RE.captures(line) {
        return Event::Chat {
            nick: c[1].to_string(),
            target: c[2].to_string(),
            text: c[3].to_string(),
            action: false,
            time: now,
        };
    }
    if let Some(c) = JOIN_RE.captures(line) {
        return Event::Join {
            nick: c[1].to_string(),
            channel: c[2].to_string(),
            time: now,
        };
    }
    if let Some(c) = PART_RE.captures(line) {
        return Event::Part {
            nick: c[1].to_string(),
            channel: c[2].to_string(),
            reason: c.get(3).and_then(|m| non_blank(m.as_str())),
            time: now,
        };
    }
    if let Some(c) = QUIT_RE.captures(line) {
        return Event::Quit {
            nick: c[1].to_string(),
            reason: non_blank(&c[2]),
            time: now,
        };
    }
    if let Some(c) = KICK_RE.captures(line) {
        return Event::Kick {
            by: non_blank(&c[1]),
            channel: c[2].to_string(),
            target: c[3].to_string(),
            reason: c.get(4).and_then(|m| non_blank(m.as_str())),
            time: now,
        };
    }
    if let Some(c) = TOPIC_RE.captures(line) {
        return Event::Topic {
            channel: c[2].to_string(),
            text: c[3].to_string(),
            setter: non_blank(&c[1]),
            set_at: Some(now),
            time: now,
        };
    }
    if let Some(c) = NICK_RE.captures(line) {
        if !c[1].trim().is_empty() && !c[2].trim().is_empty() {
            return Event::Nick {
                old: c[1].to_string(),
                new: c[2].to_string(),
                time: now,
            };
        }
    }
    if let Some(c) = NOTICE_RE.captures(line) {
        return Event::Notice {
            nick: non_blank(&c[1]),
            target: non_blank(&c[2]),
            text: c[3].to_string(),
            time: now,
        };
    }
    if NUMERIC_RE.is_match(line) {
        // The structured path handles every well-formed numeric we care
        // about; what reaches here is shown as-is.
        let text = after_colon(line).unwrap_or(line);
        return Event::System {
            text: text.to_string(),
            target: None,
            time: now,
        };
    }
    Event::System {
        text: line.to_string(),
        target: None,
        time: now,
    }
}
