//! Structured IRC messages.
//!
//! - `parser`: raw line to [`Message`]
//! - `tags`: IRCv3 tag splitting and unescaping
//! - `outbound`: builders for the lines the engine sends

pub mod outbound;
mod parser;
mod tags;

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::ParseError;

pub use parser::parse_line;
pub use tags::{parse_tags, unescape_tag_value};

/// One inbound protocol line split into its parts.
///
/// `params` holds the middle parameters only. The trailing parameter, if the
/// line had one, is kept separately and verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
    pub trailing: Option<String>,
}

impl Message {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        parse_line(line)
    }

    /// Case-insensitive command comparison.
    pub fn is(&self, command: &str) -> bool {
        self.command.eq_ignore_ascii_case(command)
    }

    /// Numeric reply code, if the command is a three digit numeric.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// The trailing parameter, or the last middle parameter when the server
    /// left out the colon.
    pub fn last_arg(&self) -> Option<&str> {
        self.trailing
            .as_deref()
            .or_else(|| self.params.last().map(String::as_str))
    }

    /// Middle parameters followed by the trailing one.
    pub fn args(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .map(String::as_str)
            .chain(self.trailing.as_deref())
    }

    /// Nickname part of the prefix (`nick!user@host` -> `nick`).
    pub fn source_nick(&self) -> Option<&str> {
        nick_from_prefix(self.prefix.as_deref()?)
    }

    /// True when the prefix is a user mask rather than a server name.
    pub fn from_user(&self) -> bool {
        self.prefix.as_deref().is_some_and(|p| p.contains('!'))
    }

    /// Timestamp from the `time` tag (server-time), if present and valid.
    pub fn server_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.tag("time")?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_line(s)
    }
}

/// Extract the nickname from a prefix.
pub fn nick_from_prefix(prefix: &str) -> Option<&str> {
    let nick = prefix.split('!').next().unwrap_or(prefix);
    if nick.is_empty() {
        None
    } else {
        Some(nick)
    }
}
