//! Outbound command lines, without the CRLF terminator.

pub fn nick(nick: &str) -> String {
    format!("NICK {}", nick)
}

pub fn user(user: &str, real_name: &str) -> String {
    format!("USER {} 0 * :{}", user, real_name)
}

pub fn cap_ls() -> String {
    "CAP LS 302".to_string()
}

pub fn cap_req(caps: &[&str]) -> String {
    format!("CAP REQ :{}", caps.join(" "))
}

pub fn cap_end() -> String {
    "CAP END".to_string()
}

pub fn authenticate(payload: &str) -> String {
    format!("AUTHENTICATE {}", payload)
}

/// `PONG <token>`, with a colon only when the token would otherwise be split.
pub fn pong(token: &str) -> String {
    if token.is_empty() || token.contains(' ') || token.starts_with(':') {
        format!("PONG :{}", token)
    } else {
        format!("PONG {}", token)
    }
}

pub fn join(channel: &str) -> String {
    format!("JOIN {}", channel)
}

pub fn part(channel: &str) -> String {
    format!("PART {}", channel)
}

pub fn names(channel: &str) -> String {
    format!("NAMES {}", channel)
}

pub fn privmsg(target: &str, text: &str) -> String {
    format!("PRIVMSG {} :{}", target, text)
}

/// Single status mode change, e.g. `+o nick`.
pub fn mode(channel: &str, modes: &str, nick: &str) -> String {
    format!("MODE {} {} {}", channel, modes, nick)
}

pub fn kick(channel: &str, nick: &str, reason: Option<&str>) -> String {
    match reason {
        Some(r) => format!("KICK {} {} :{}", channel, nick, r),
        None => format!("KICK {} {}", channel, nick),
    }
}

pub fn quit(message: &str) -> String {
    format!("QUIT :{}", message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_lines() {
        assert_eq!(nick("bob"), "NICK bob");
        assert_eq!(user("bob", "Bob Builder"), "USER bob 0 * :Bob Builder");
        assert_eq!(cap_req(&["echo-message", "sasl"]), "CAP REQ :echo-message sasl");
    }

    #[test]
    fn test_pong_token() {
        assert_eq!(pong("irc.test"), "PONG irc.test");
        assert_eq!(pong("two words"), "PONG :two words");
    }

    #[test]
    fn test_kick_reason() {
        assert_eq!(kick("#x", "eve", Some("spam")), "KICK #x eve :spam");
        assert_eq!(kick("#x", "eve", None), "KICK #x eve");
    }
}
