//! Slash command handling for the terminal driver (/join, /part, /msg, etc.).

use crate::backend::Client;
use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::message::outbound;

/// A parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    /// Plain text for the active channel.
    Say(String),
    Join(String),
    /// Part the given channel, or the active one.
    Part(Option<String>),
    Msg { target: String, text: String },
    Me(String),
    Names(Option<String>),
    Raw(String),
    Op(String),
    Deop(String),
    Kick { nick: String, reason: Option<String> },
    Reconnect,
    Disconnect,
    Connect,
    Users,
    Quit(Option<String>),
    Help,
}

/// What the caller should do after a command ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Exit,
}

fn channel_arg(chan: &str) -> String {
    if chan.starts_with('#') || chan.starts_with('&') {
        chan.to_string()
    } else {
        format!("#{}", chan)
    }
}

/// Parse one input line. Empty input yields `Ok(None)`; usage problems
/// come back as the message to show.
pub fn parse_user_command(input: &str) -> Result<Option<UserCommand>, String> {
    let s = input.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let Some(cmdline) = s.strip_prefix('/') else {
        return Ok(Some(UserCommand::Say(s.to_string())));
    };

    let (cmd, rest) = match cmdline.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (cmdline, ""),
    };
    let rest_opt = (!rest.is_empty()).then(|| rest.to_string());

    let command = match cmd.to_lowercase().as_str() {
        "join" | "j" => match rest.split_whitespace().next() {
            Some(chan) => UserCommand::Join(channel_arg(chan)),
            None => return Err("Usage: /join <channel>".into()),
        },
        "part" | "p" => UserCommand::Part(rest.split_whitespace().next().map(channel_arg)),
        "msg" | "m" => match rest.split_once(char::is_whitespace) {
            Some((target, text)) if !text.trim().is_empty() => UserCommand::Msg {
                target: target.to_string(),
                text: text.trim().to_string(),
            },
            _ => return Err("Usage: /msg <target> <message>".into()),
        },
        "me" => match rest_opt {
            Some(text) => UserCommand::Me(text),
            None => return Err("Usage: /me <action>".into()),
        },
        "names" => UserCommand::Names(rest.split_whitespace().next().map(channel_arg)),
        "raw" | "quote" => match rest_opt {
            Some(line) => UserCommand::Raw(line),
            None => return Err("Usage: /raw <line>".into()),
        },
        "op" | "deop" => match rest.split_whitespace().next() {
            Some(nick) if cmd.eq_ignore_ascii_case("op") => UserCommand::Op(nick.to_string()),
            Some(nick) => UserCommand::Deop(nick.to_string()),
            None => return Err(format!("Usage: /{} <nick>", cmd.to_lowercase())),
        },
        "kick" | "k" => match rest.split_once(char::is_whitespace) {
            Some((nick, reason)) => UserCommand::Kick {
                nick: nick.to_string(),
                reason: Some(reason.trim().to_string()).filter(|r| !r.is_empty()),
            },
            None if !rest.is_empty() => UserCommand::Kick {
                nick: rest.to_string(),
                reason: None,
            },
            None => return Err("Usage: /kick <nick> [reason]".into()),
        },
        "reconnect" => UserCommand::Reconnect,
        "disconnect" => UserCommand::Disconnect,
        "connect" => UserCommand::Connect,
        "users" => UserCommand::Users,
        "quit" | "exit" => UserCommand::Quit(rest_opt),
        "help" => UserCommand::Help,
        unknown => return Err(format!("Unknown command: /{}", unknown)),
    };
    Ok(Some(command))
}

fn change_op(
    client: &Client,
    channel: Option<&str>,
    modes: &str,
    nick: &str,
    output: &mut Vec<String>,
) -> Result<(), EngineError> {
    match channel {
        Some(chan) => client.send_raw(outbound::mode(chan, modes, nick)),
        None => {
            output.push(format!("Not in a channel; cannot change modes for {}", nick));
            Ok(())
        }
    }
}

/// Run a command against the engine. Lines for the user go to `output`.
pub fn run_user_command(
    command: UserCommand,
    client: &Client,
    config: &SessionConfig,
    active_channel: &mut Option<String>,
    output: &mut Vec<String>,
) -> Result<Outcome, EngineError> {
    match command {
        UserCommand::Say(text) => match active_channel.as_deref() {
            Some(chan) => client.send_message(chan, text)?,
            None => output.push("No active channel; /join one first".into()),
        },
        UserCommand::Join(channel) => {
            client.join(channel.clone())?;
            *active_channel = Some(channel);
        }
        UserCommand::Part(channel) => match channel.or_else(|| active_channel.clone()) {
            Some(chan) => {
                client.part(chan.clone())?;
                if active_channel.as_deref() == Some(chan.as_str()) {
                    *active_channel = None;
                }
            }
            None => output.push("Usage: /part <channel>".into()),
        },
        UserCommand::Msg { target, text } => client.send_message(target, text)?,
        UserCommand::Me(text) => match active_channel.as_deref() {
            Some(chan) => client.send_message(chan, format!("\x01ACTION {}\x01", text))?,
            None => output.push("/me can only be used in a channel".into()),
        },
        UserCommand::Names(channel) => match channel.or_else(|| active_channel.clone()) {
            Some(chan) => client.request_names(chan)?,
            None => output.push("Usage: /names <channel>".into()),
        },
        UserCommand::Raw(line) => client.send_raw(line)?,
        UserCommand::Op(nick) => change_op(client, active_channel.as_deref(), "+o", &nick, output)?,
        UserCommand::Deop(nick) => change_op(client, active_channel.as_deref(), "-o", &nick, output)?,
        UserCommand::Kick { nick, reason } => match active_channel.as_deref() {
            Some(chan) => client.send_raw(outbound::kick(chan, &nick, reason.as_deref()))?,
            None => output.push("/kick can only be used in a channel".into()),
        },
        UserCommand::Reconnect => client.reconnect_now()?,
        UserCommand::Disconnect => client.disconnect()?,
        UserCommand::Connect => client.connect(config.clone())?,
        UserCommand::Users => {
            let users = client.users().borrow().clone();
            if users.is_empty() {
                output.push("No members known".into());
            } else {
                let names: Vec<String> = users
                    .iter()
                    .map(|u| match u.prefix {
                        Some(p) => format!("{}{}", p, u.nick),
                        None => u.nick.clone(),
                    })
                    .collect();
                output.push(format!("Users ({}): {}", names.len(), names.join(" ")));
            }
        }
        UserCommand::Quit(message) => {
            let message = message.unwrap_or_else(|| "Bye".to_string());
            // Writes QUIT itself only while connected.
            client.quit(message)?;
            return Ok(Outcome::Exit);
        }
        UserCommand::Help => output.push(
            "Commands: /join, /part, /msg, /me, /names, /raw, /op, /deop, /kick, /reconnect, /disconnect, /connect, /users, /quit"
                .into(),
        ),
    }
    Ok(Outcome::Continue)
}
