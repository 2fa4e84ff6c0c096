//! Nom-based IRC line parser.
//!
//! ```text
//! [@tags ][:prefix ]<command>[ middle...][ :trailing]
//! ```

use nom::{
    bytes::complete::{take_till1, take_until},
    character::complete::{char, space0},
    sequence::{preceded, terminated},
    IResult,
};

use super::tags::parse_tags;
use super::Message;
use crate::error::ParseError;

fn tag_section(input: &str) -> IResult<&str, &str> {
    preceded(char('@'), terminated(take_until(" "), char(' ')))(input)
}

fn prefix_section(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), terminated(take_until(" "), char(' ')))(input)
}

fn command_token(input: &str) -> IResult<&str, &str> {
    take_till1(|c| c == ' ')(input)
}

fn skip_spaces(input: &str) -> &str {
    match space0::<&str, nom::error::Error<&str>>(input) {
        Ok((rest, _)) => rest,
        Err(_) => input,
    }
}

/// Parse one line (without CR/LF) into a [`Message`].
pub fn parse_line(line: &str) -> Result<Message, ParseError> {
    if line.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut rest = line;

    let tags = if rest.starts_with('@') {
        let (after, raw) = tag_section(rest).map_err(|_| ParseError::UnterminatedTags)?;
        rest = skip_spaces(after);
        parse_tags(raw)
    } else {
        Default::default()
    };

    let prefix = if rest.starts_with(':') {
        let (after, raw) = prefix_section(rest).map_err(|_| ParseError::UnterminatedPrefix)?;
        rest = after;
        Some(raw.to_string())
    } else {
        None
    };

    let (after, command) =
        command_token(skip_spaces(rest)).map_err(|_| ParseError::MissingCommand)?;
    rest = after;

    let mut params = Vec::new();
    let mut trailing = None;
    loop {
        rest = skip_spaces(rest);
        if rest.is_empty() {
            break;
        }
        if let Some(text) = rest.strip_prefix(':') {
            trailing = Some(text.to_string());
            break;
        }
        let end = rest.find(' ').unwrap_or(rest.len());
        params.push(rest[..end].to_string());
        rest = &rest[end..];
    }

    Ok(Message {
        tags,
        prefix,
        command: command.to_string(),
        params,
        trailing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_simple_command() {
        let msg = parse_line("PING").unwrap();
        assert_eq!(msg.command, "PING");
        assert!(msg.tags.is_empty());
        assert!(msg.prefix.is_none());
        assert!(msg.params.is_empty());
        assert!(msg.trailing.is_none());
    }

    #[test]
    fn test_parse_full_line() {
        let msg = parse_line("@time=2023-01-01T00:00:00Z :nick!u@h PRIVMSG #ch :Hi there").unwrap();
        assert_eq!(msg.tag("time"), Some("2023-01-01T00:00:00Z"));
        assert_eq!(msg.prefix.as_deref(), Some("nick!u@h"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#ch"]);
        assert_eq!(msg.trailing.as_deref(), Some("Hi there"));
    }

    #[test]
    fn test_trailing_is_never_split() {
        let msg = parse_line(":s 001 bob :Welcome :to  the net").unwrap();
        assert_eq!(msg.params, vec!["bob"]);
        assert_eq!(msg.trailing.as_deref(), Some("Welcome :to  the net"));
    }

    #[test]
    fn test_empty_trailing() {
        let msg = parse_line("PRIVMSG #channel :").unwrap();
        assert_eq!(msg.params, vec!["#channel"]);
        assert_eq!(msg.trailing.as_deref(), Some(""));
    }

    #[test]
    fn test_redundant_spaces_are_skipped() {
        let msg = parse_line(":srv   MODE  #c   +o  alice").unwrap();
        assert_eq!(msg.command, "MODE");
        assert_eq!(msg.params, vec!["#c", "+o", "alice"]);
    }

    #[test]
    fn test_unterminated_tags() {
        assert_eq!(parse_line("@time=now"), Err(ParseError::UnterminatedTags));
    }

    #[test]
    fn test_unterminated_prefix() {
        assert_eq!(parse_line(":server.only"), Err(ParseError::UnterminatedPrefix));
    }

    #[test]
    fn test_missing_command() {
        assert_eq!(parse_line(":server "), Err(ParseError::MissingCommand));
        assert_eq!(parse_line(""), Err(ParseError::Empty));
    }

    proptest! {
        #[test]
        fn prop_parser_recovers_components(
            key in "[a-z][a-z0-9-]{0,8}",
            value in "[A-Za-z0-9.-]{0,12}",
            prefix in "[a-z]{1,8}![a-z]{1,6}@[a-z.]{1,10}",
            command in "[A-Z]{3,8}",
            p1 in "[#a-z0-9]{1,10}",
            p2 in "[a-z0-9]{1,10}",
            trailing in "[ -~]{0,40}",
        ) {
            let line = format!("@{key}={value} :{prefix} {command} {p1} {p2} :{trailing}");
            let msg = parse_line(&line).unwrap();
            prop_assert_eq!(msg.tag(&key), Some(value.as_str()));
            prop_assert_eq!(msg.prefix.as_deref(), Some(prefix.as_str()));
            prop_assert_eq!(&msg.command, &command);
            prop_assert_eq!(msg.params, vec![p1, p2]);
            prop_assert_eq!(msg.trailing.as_deref(), Some(trailing.as_str()));
        }
    }
}
