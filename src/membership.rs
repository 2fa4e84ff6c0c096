//! Member list of the single tracked channel.
//!
//! Fed by NAMES (353/366), JOIN, PART, QUIT, KICK, NICK and MODE. Keys are
//! lowercased nicknames; the displayed nick keeps the server's casing.

use std::collections::HashMap;

use crate::message::Message;
use crate::protocol::UserInfo;

/// Ordered mode letter -> symbol table from ISUPPORT `PREFIX`, highest rank first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMap {
    entries: Vec<(char, char)>,
}

impl Default for PrefixMap {
    fn default() -> Self {
        Self {
            entries: vec![('q', '~'), ('a', '&'), ('o', '@'), ('h', '%'), ('v', '+')],
        }
    }
}

impl PrefixMap {
    /// Parse the value of a `PREFIX=` token, e.g. `(ov)@+`.
    ///
    /// Returns `None` unless both halves are non-empty and the same length.
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix('(')?;
        let (modes, symbols) = rest.split_once(')')?;
        if modes.is_empty() || modes.chars().count() != symbols.chars().count() {
            return None;
        }
        Some(Self {
            entries: modes.chars().zip(symbols.chars()).collect(),
        })
    }

    /// Find a usable `PREFIX=` token among ISUPPORT tokens.
    pub fn from_isupport<'a>(tokens: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        tokens
            .into_iter()
            .filter_map(|t| t.strip_prefix("PREFIX="))
            .find_map(Self::parse)
    }

    pub fn symbol_for_mode(&self, mode: char) -> Option<char> {
        self.entries.iter().find(|(m, _)| *m == mode).map(|(_, s)| *s)
    }

    pub fn is_symbol(&self, c: char) -> bool {
        self.entries.iter().any(|(_, s)| *s == c)
    }

    /// Higher is more privileged; plain members and unknown symbols rank 0.
    pub fn rank(&self, symbol: Option<char>) -> usize {
        symbol
            .and_then(|s| self.entries.iter().position(|(_, e)| *e == s))
            .map(|pos| self.entries.len() - pos)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
struct Member {
    nick: String,
    prefix: Option<char>,
}

#[derive(Debug, Default)]
pub struct Membership {
    channel: Option<String>,
    prefixes: PrefixMap,
    members: HashMap<String, Member>,
    /// 353 entries collected until 366 arrives
    pending_names: Vec<UserInfo>,
}

fn key(nick: &str) -> String {
    nick.to_lowercase()
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn prefixes(&self) -> &PrefixMap {
        &self.prefixes
    }

    pub fn set_prefixes(&mut self, prefixes: PrefixMap) {
        self.prefixes = prefixes;
    }

    fn is_tracked(&self, channel: &str) -> bool {
        self.channel
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(channel))
    }

    /// Switch the tracked channel. Returns true (and clears the table) when it changed.
    pub fn track(&mut self, channel: Option<&str>) -> bool {
        let same = match (self.channel.as_deref(), channel) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        };
        if same {
            return false;
        }
        self.channel = channel.map(str::to_string);
        self.members.clear();
        self.pending_names.clear();
        true
    }

    /// Apply one inbound message. Returns true when the published list changed.
    pub fn apply(&mut self, msg: &Message, own_nick: &str) -> bool {
        match msg.numeric() {
            Some(353) => {
                self.collect_names(msg);
                return false;
            }
            Some(366) => return self.finish_names(msg),
            Some(_) => return false,
            None => {}
        }

        let Some(nick) = msg.source_nick() else {
            return false;
        };
        let command = msg.command.to_ascii_uppercase();
        match command.as_str() {
            "JOIN" => {
                let Some(channel) = msg.param(0).or(msg.trailing.as_deref()) else {
                    return false;
                };
                if !self.is_tracked(channel) || self.members.contains_key(&key(nick)) {
                    return false;
                }
                self.members.insert(
                    key(nick),
                    Member {
                        nick: nick.to_string(),
                        prefix: None,
                    },
                );
                true
            }
            "PART" => match msg.param(0) {
                Some(channel) if self.is_tracked(channel) => self.remove(nick, own_nick),
                _ => false,
            },
            "KICK" => match (msg.param(0), msg.param(1)) {
                (Some(channel), Some(victim)) if self.is_tracked(channel) => {
                    self.remove(victim, own_nick)
                }
                _ => false,
            },
            "QUIT" => self.members.remove(&key(nick)).is_some(),
            "NICK" => {
                let Some(new_nick) = msg.last_arg() else {
                    return false;
                };
                match self.members.remove(&key(nick)) {
                    Some(member) => {
                        self.members.insert(
                            key(new_nick),
                            Member {
                                nick: new_nick.to_string(),
                                prefix: member.prefix,
                            },
                        );
                        true
                    }
                    None => false,
                }
            }
            "MODE" => self.apply_mode(msg),
            _ => false,
        }
    }

    fn remove(&mut self, nick: &str, own_nick: &str) -> bool {
        if nick.eq_ignore_ascii_case(own_nick) {
            let had_members = !self.members.is_empty();
            self.members.clear();
            self.pending_names.clear();
            return had_members;
        }
        self.members.remove(&key(nick)).is_some()
    }

    fn collect_names(&mut self, msg: &Message) {
        // 353 <me> [=*@] <channel> :names
        let Some(channel) = msg.params.last() else {
            return;
        };
        if self.channel.is_none() {
            self.channel = Some(channel.clone());
        }
        if !self.is_tracked(channel) {
            return;
        }
        let Some(names) = msg.trailing.as_deref() else {
            return;
        };
        for token in names.split_whitespace() {
            let mut chars = token.chars();
            let prefix = chars.next().filter(|c| self.prefixes.is_symbol(*c));
            let nick = if prefix.is_some() { chars.as_str() } else { token };
            if !nick.is_empty() {
                self.pending_names.push(UserInfo::new(nick, prefix));
            }
        }
    }

    fn finish_names(&mut self, msg: &Message) -> bool {
        // 366 <me> <channel> :End of /NAMES list
        match msg.param(1) {
            Some(channel) if self.is_tracked(channel) => {}
            _ => return false,
        }
        let mut table: HashMap<String, Member> = HashMap::new();
        for entry in self.pending_names.drain(..) {
            let k = key(&entry.nick);
            match table.get(&k) {
                Some(existing)
                    if self.prefixes.rank(existing.prefix) >= self.prefixes.rank(entry.prefix) => {}
                _ => {
                    table.insert(
                        k,
                        Member {
                            nick: entry.nick,
                            prefix: entry.prefix,
                        },
                    );
                }
            }
        }
        self.members = table;
        true
    }

    fn apply_mode(&mut self, msg: &Message) -> bool {
        let mut args = msg.args();
        let Some(target) = args.next() else {
            return false;
        };
        if !self.is_tracked(target) {
            return false;
        }
        let Some(modes) = args.next() else {
            return false;
        };
        let modes = modes.to_string();
        let nicks: Vec<String> = args.map(str::to_string).collect();

        // Only status modes consume an argument here; key/limit/ban
        // arguments are not accounted for.
        let mut nick_args = nicks.iter();
        let mut adding = true;
        let mut changed = false;
        for c in modes.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                mode => {
                    let Some(symbol) = self.prefixes.symbol_for_mode(mode) else {
                        continue;
                    };
                    let Some(nick) = nick_args.next() else {
                        continue;
                    };
                    changed |= self.change_status(nick, symbol, adding);
                }
            }
        }
        changed
    }

    fn change_status(&mut self, nick: &str, symbol: char, adding: bool) -> bool {
        let k = key(nick);
        if adding {
            match self.members.get_mut(&k) {
                Some(member) => {
                    if self.prefixes.rank(Some(symbol)) > self.prefixes.rank(member.prefix) {
                        member.prefix = Some(symbol);
                        return true;
                    }
                    false
                }
                None => {
                    self.members.insert(
                        k,
                        Member {
                            nick: nick.to_string(),
                            prefix: Some(symbol),
                        },
                    );
                    true
                }
            }
        } else {
            match self.members.get_mut(&k) {
                Some(member) if member.prefix == Some(symbol) => {
                    member.prefix = None;
                    true
                }
                _ => false,
            }
        }
    }

    /// Members sorted by rank (highest first), then nick case-insensitively.
    pub fn snapshot(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self
            .members
            .values()
            .map(|m| UserInfo::new(m.nick.clone(), m.prefix))
            .collect();
        users.sort_by(|a, b| {
            self.prefixes
                .rank(b.prefix)
                .cmp(&self.prefixes.rank(a.prefix))
                .then_with(|| a.nick.to_lowercase().cmp(&b.nick.to_lowercase()))
        });
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(m: &mut Membership, lines: &[&str]) -> bool {
        let mut changed = false;
        for line in lines {
            let msg = Message::parse(line).unwrap();
            changed |= m.apply(&msg, "bob");
        }
        changed
    }

    fn tracked() -> Membership {
        let mut m = Membership::new();
        m.track(Some("#x"));
        m
    }

    #[test]
    fn test_names_replaces_table_sorted() {
        let mut m = tracked();
        feed(
            &mut m,
            &[
                ":irc.test 353 bob = #x :bob @alice",
                ":irc.test 366 bob #x :End",
            ],
        );
        assert_eq!(
            m.snapshot(),
            vec![UserInfo::new("alice", Some('@')), UserInfo::new("bob", None)]
        );
    }

    #[test]
    fn test_names_is_idempotent() {
        let mut m = tracked();
        let lines = [
            ":s 353 bob = #x :+Carol bob ~owner %half &adm @op dave",
            ":s 366 bob #x :End",
        ];
        feed(&mut m, &lines);
        let first = m.snapshot();
        feed(&mut m, &lines);
        assert_eq!(m.snapshot(), first);
    }

    #[test]
    fn test_rank_ordering() {
        let mut m = tracked();
        feed(
            &mut m,
            &[
                ":s 353 bob = #x :zed +Carol +alice ~owner %half &adm @op",
                ":s 366 bob #x :End",
            ],
        );
        let nicks: Vec<String> = m.snapshot().into_iter().map(|u| u.nick).collect();
        assert_eq!(nicks, vec!["owner", "adm", "op", "half", "alice", "Carol", "zed"]);
    }

    #[test]
    fn test_duplicate_names_keep_highest_rank() {
        let mut m = tracked();
        feed(
            &mut m,
            &[
                ":s 353 bob = #x :+dup",
                ":s 353 bob = #x :@dup",
                ":s 353 bob = #x :dup",
                ":s 366 bob #x :End",
            ],
        );
        assert_eq!(m.snapshot(), vec![UserInfo::new("dup", Some('@'))]);
    }

    #[test]
    fn test_mode_op_then_deop_restores_plain() {
        let mut m = tracked();
        feed(&mut m, &[":s 353 bob = #x :carol", ":s 366 bob #x :End"]);
        assert!(feed(&mut m, &[":op!o@h MODE #x +o carol"]));
        assert_eq!(m.snapshot(), vec![UserInfo::new("carol", Some('@'))]);
        assert!(feed(&mut m, &[":op!o@h MODE #x -o carol"]));
        assert_eq!(m.snapshot(), vec![UserInfo::new("carol", None)]);
    }

    #[test]
    fn test_mode_upgrade_only_and_exact_removal() {
        let mut m = tracked();
        feed(&mut m, &[":s 353 bob = #x :@carol", ":s 366 bob #x :End"]);
        // voice does not downgrade an op
        assert!(!feed(&mut m, &[":op!o@h MODE #x +v carol"]));
        // removing voice leaves the op symbol
        assert!(!feed(&mut m, &[":op!o@h MODE #x -v carol"]));
        assert_eq!(m.snapshot(), vec![UserInfo::new("carol", Some('@'))]);
    }

    #[test]
    fn test_mode_multiple_targets() {
        let mut m = tracked();
        feed(&mut m, &[":s 353 bob = #x :a b", ":s 366 bob #x :End"]);
        feed(&mut m, &[":op!o@h MODE #x +ov a b"]);
        assert_eq!(
            m.snapshot(),
            vec![UserInfo::new("a", Some('@')), UserInfo::new("b", Some('+'))]
        );
    }

    #[test]
    fn test_join_part_quit_kick_nick() {
        let mut m = tracked();
        feed(&mut m, &[":s 353 bob = #x :bob @alice", ":s 366 bob #x :End"]);

        assert!(feed(&mut m, &[":carol!c@h JOIN #x"]));
        assert!(feed(&mut m, &[":Alice!a@h NICK :alicia"]));
        assert_eq!(m.snapshot()[0], UserInfo::new("alicia", Some('@')));

        assert!(feed(&mut m, &[":carol!c@h PART #x :bye"]));
        assert!(feed(&mut m, &[":alicia!a@h KICK #x BOB :out"]));
        assert!(m.snapshot().is_empty());
    }

    #[test]
    fn test_other_channel_is_ignored() {
        let mut m = tracked();
        assert!(!feed(&mut m, &[":carol!c@h JOIN #other"]));
        assert!(!feed(&mut m, &[":op!o@h MODE #other +o carol"]));
        feed(&mut m, &[":s 353 bob = #other :zed", ":s 366 bob #other :End"]);
        assert!(m.snapshot().is_empty());
    }

    #[test]
    fn test_isupport_prefix_changes_symbols() {
        let mut m = tracked();
        let map = PrefixMap::from_isupport(["CHANTYPES=#", "PREFIX=(Yov)!@+"]).unwrap();
        m.set_prefixes(map);
        feed(&mut m, &[":s 353 bob = #x :+v !y @o", ":s 366 bob #x :End"]);
        let nicks: Vec<String> = m.snapshot().into_iter().map(|u| u.nick).collect();
        assert_eq!(nicks, vec!["y", "o", "v"]);
    }

    #[test]
    fn test_prefix_parse_rejects_mismatch() {
        assert!(PrefixMap::parse("(ov)@").is_none());
        assert!(PrefixMap::parse("()").is_none());
        assert!(PrefixMap::parse("ov@+").is_none());
        assert_eq!(PrefixMap::parse("(ov)@+").unwrap().symbol_for_mode('v'), Some('+'));
    }
}
