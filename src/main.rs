//! slirc-engine - terminal driver for the IRC protocol engine
//!
//! Architecture:
//! - Main thread: reads commands from stdin
//! - Backend thread: tokio runtime running the connection supervisor
//! - Printer thread: drains normalized events and membership changes

use std::io::{self, BufRead};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slirc_engine::commands::{parse_user_command, run_user_command, Outcome};
use slirc_engine::config::{self, EngineSettings, Profile, SessionConfig};
use slirc_engine::validation::validate_server_address;
use slirc_engine::{Client, ConnectionState, Event, NetworkHandle};

#[derive(Parser, Debug)]
#[command(
    name = "slirc-engine",
    version,
    about = "Terminal IRC client with IRCv3 CAP, SASL and automatic reconnection"
)]
struct Args {
    /// Server as host or host:port
    #[arg(short, long, env = "SLIRC_SERVER")]
    server: Option<String>,

    /// Port, overriding any port in --server
    #[arg(short, long)]
    port: Option<u16>,

    /// Connect with TLS
    #[arg(long)]
    tls: bool,

    #[arg(short, long, env = "SLIRC_NICK")]
    nick: Option<String>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    real_name: Option<String>,

    /// Channel to join and track
    #[arg(short, long)]
    channel: Option<String>,

    /// Skip IRCv3 capability negotiation
    #[arg(long)]
    no_caps: bool,

    #[arg(long, env = "SLIRC_SASL_ACCOUNT")]
    sasl_account: Option<String>,

    #[arg(long, env = "SLIRC_SASL_PASSWORD", hide_env_values = true)]
    sasl_password: Option<String>,

    /// Profile file (defaults to the per-user settings.json)
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Write the resulting profile back before connecting
    #[arg(long)]
    save: bool,

    /// Bind sockets to this network interface (Linux)
    #[arg(long, conflicts_with = "bind")]
    interface: Option<String>,

    /// Bind sockets to this local address
    #[arg(long)]
    bind: Option<IpAddr>,
}

impl Args {
    fn network_handle(&self) -> Option<NetworkHandle> {
        if let Some(name) = &self.interface {
            return Some(NetworkHandle::Interface(name.clone()));
        }
        self.bind.map(NetworkHandle::LocalAddress)
    }
}

fn profile_path(args: &Args) -> Result<PathBuf> {
    match &args.profile {
        Some(path) => Ok(path.clone()),
        None => Ok(config::settings_path()?),
    }
}

/// Stored profile (if any) with command line flags applied on top.
fn build_profile(args: &Args, path: &Path) -> Result<Profile> {
    let stored = if path.exists() {
        Some(
            config::load_profile(path)
                .with_context(|| format!("loading profile {}", path.display()))?,
        )
    } else if args.profile.is_some() {
        bail!("profile {} does not exist", path.display());
    } else {
        None
    };

    let mut profile = match (stored, &args.server, &args.nick) {
        (Some(profile), _, _) => profile,
        (None, Some(server), Some(nick)) => Profile {
            session: SessionConfig::new(server.clone(), nick.clone()),
            engine: EngineSettings::default(),
        },
        (None, _, _) => bail!("--server and --nick are required when no profile exists"),
    };

    let session = &mut profile.session;
    if let Some(server) = &args.server {
        let (host, port) = validate_server_address(server).map_err(anyhow::Error::msg)?;
        session.server = host;
        session.port = port;
    }
    if let Some(port) = args.port {
        session.port = port;
    }
    if args.tls {
        session.tls = true;
    }
    if let Some(nick) = &args.nick {
        session.nick = nick.clone();
    }
    if let Some(user) = &args.user {
        session.user = user.clone();
    }
    if let Some(real_name) = &args.real_name {
        session.real_name = real_name.clone();
    }
    if let Some(channel) = &args.channel {
        session.channel = Some(channel.clone());
    }
    if args.no_caps {
        session.request_caps = false;
    }
    if let Some(account) = &args.sasl_account {
        session.sasl_account = Some(account.clone());
    }
    if let Some(password) = &args.sasl_password {
        session.sasl_password = Some(password.clone());
    }
    Ok(profile)
}

fn render(event: &Event) -> String {
    let ts = event.time().with_timezone(&Local).format("%H:%M:%S");
    let body = match event {
        Event::Chat {
            nick,
            target,
            text,
            action: true,
            ..
        } => format!("{} * {} {}", target, nick, text),
        Event::Chat {
            nick, target, text, ..
        } => format!("{} <{}> {}", target, nick, text),
        Event::Notice { nick, text, .. } => {
            format!("-{}- {}", nick.as_deref().unwrap_or("server"), text)
        }
        Event::Join { nick, channel, .. } => format!("{} --> {} joined", channel, nick),
        Event::Part {
            nick,
            channel,
            reason,
            ..
        } => match reason {
            Some(r) => format!("{} <-- {} left ({})", channel, nick, r),
            None => format!("{} <-- {} left", channel, nick),
        },
        Event::Quit { nick, reason, .. } => match reason {
            Some(r) => format!("<-- {} quit ({})", nick, r),
            None => format!("<-- {} quit", nick),
        },
        Event::Kick {
            by,
            channel,
            target,
            reason,
            ..
        } => format!(
            "{} {} was kicked by {}{}",
            channel,
            target,
            by.as_deref().unwrap_or("server"),
            reason.as_ref().map(|r| format!(" ({})", r)).unwrap_or_default()
        ),
        Event::Nick { old, new, .. } => format!("{} is now known as {}", old, new),
        Event::Topic {
            channel,
            text,
            setter,
            ..
        } => match (text.is_empty(), setter) {
            (true, Some(setter)) => format!("{} topic set by {}", channel, setter),
            (_, Some(setter)) => format!("{} {} changed the topic: {}", channel, setter, text),
            (_, None) => format!("{} topic: {}", channel, text),
        },
        Event::System { text, .. } => format!("* {}", text),
    };
    format!("[{}] {}", ts, body)
}

fn spawn_printer(client: &Client) -> Result<()> {
    let events = client.events();
    let mut users = client.users();
    thread::Builder::new()
        .name("slirc-printer".into())
        .spawn(move || loop {
            match events.recv_timeout(Duration::from_millis(200)) {
                Ok(event) => println!("{}", render(&event)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            match users.has_changed() {
                Ok(true) => {
                    let list = users.borrow_and_update().clone();
                    let names: Vec<String> = list
                        .iter()
                        .map(|u| format!("{}{}", u.prefix.map(String::from).unwrap_or_default(), u.nick))
                        .collect();
                    if !names.is_empty() {
                        println!("* Users ({}): {}", names.len(), names.join(" "));
                    }
                }
                Ok(false) => {}
                Err(_) => break,
            }
        })?;
    Ok(())
}

/// Give the backend a moment to send QUIT and close the socket.
fn wait_for_disconnect(client: &Client, limit: Duration) {
    let state = client.state();
    let deadline = Instant::now() + limit;
    while *state.borrow() != ConnectionState::Disconnected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slirc_engine=info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let path = profile_path(&args)?;
    let profile = build_profile(&args, &path)?;
    profile.session.validate()?;

    if args.save {
        config::save_profile(&path, &profile)?;
        info!("profile saved to {}", path.display());
    }

    let client = Client::start(profile.engine.clone())?;
    if let Some(handle) = args.network_handle() {
        client.set_active_network(Some(handle))?;
    }
    client.connect(profile.session.clone())?;
    spawn_printer(&client)?;

    let mut active_channel = profile.session.auto_join().map(str::to_string);
    let stdin = io::stdin();
    let mut exiting = false;
    for line in stdin.lock().lines() {
        let line = line?;
        let command = match parse_user_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(usage) => {
                println!("* {}", usage);
                continue;
            }
        };
        let mut output = Vec::new();
        let outcome = run_user_command(
            command,
            &client,
            &profile.session,
            &mut active_channel,
            &mut output,
        )?;
        for line in output {
            println!("* {}", line);
        }
        if outcome == Outcome::Exit {
            exiting = true;
            break;
        }
    }

    if !exiting {
        // stdin closed
        client.quit("Bye")?;
    }
    wait_for_disconnect(&client, Duration::from_secs(3));
    Ok(())
}
