//! Backend tests against an in-process fake server.
//!
//! Full-client scenarios talk to a `TcpListener` on localhost; single-session
//! scenarios drive a `Session` over a `tokio::io::duplex` pipe.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::backend::reconnect::ReconnectState;
use crate::backend::session::{Session, SessionOutcome};
use crate::backend::{Client, Outlets};
use crate::config::{EngineSettings, SessionConfig};
use crate::events::Event;
use crate::protocol::{ConnectionState, UserInfo};

const WAIT: Duration = Duration::from_secs(5);

fn fast_settings() -> EngineSettings {
    EngineSettings {
        connect_timeout_ms: 2_000,
        min_backoff_ms: 10,
        max_backoff_ms: 50,
        max_jitter_ms: 0,
        ..EngineSettings::default()
    }
}

struct FakeServer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakeServer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        let (read, writer) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    async fn next_line(&mut self) -> String {
        timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("client closed the connection")
    }

    async fn expect(&mut self, expected: &str) {
        assert_eq!(self.next_line().await, expected);
    }
}

struct PipeServer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl PipeServer {
    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
    }

    /// Read lines until `expected` shows up, returning everything before it.
    async fn read_until(&mut self, expected: &str) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            let line = timeout(WAIT, self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
                .expect("session closed the pipe");
            if line == expected {
                return seen;
            }
            seen.push(line);
        }
    }
}

async fn wait_for<T>(rx: &mut watch::Receiver<T>, pred: impl FnMut(&T) -> bool) {
    timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .unwrap();
}

/// Run one session over a duplex pipe; returns the fake server end and the session task.
fn pipe_session(
    config: SessionConfig,
    settings: EngineSettings,
) -> (
    PipeServer,
    crate::backend::session::SessionLink,
    Outlets,
    tokio::task::JoinHandle<SessionOutcome>,
) {
    let (client_end, server_end) = tokio::io::duplex(16 * 1024);
    let outlets = Outlets::new(&settings);
    let (inbox, _inbox_rx) = mpsc::unbounded_channel::<crate::protocol::Action>();
    let (session, link) = Session::new(config, settings, None, outlets.clone(), inbox.downgrade());
    let task = tokio::spawn(session.drive(client_end));
    let (read, writer) = tokio::io::split(server_end);
    let server = PipeServer {
        lines: BufReader::new(read).lines(),
        writer,
    };
    (server, link, outlets, task)
}

async fn next_event(events: &crossbeam_channel::Receiver<Event>, mut pred: impl FnMut(&Event) -> bool) -> Event {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        while let Ok(event) = events.try_recv() {
            if pred(&event) {
                return event;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for event");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_welcome_autojoin_and_names() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::spawn(fast_settings());
    let mut config = SessionConfig::new("127.0.0.1", "bob").with_channel("#x");
    config.port = port;
    client.connect(config).unwrap();

    let mut server = FakeServer::accept(&listener).await;
    server.expect("CAP LS 302").await;
    server.expect("NICK bob").await;
    server.expect("USER slirc 0 * :SLIRC Engine").await;
    assert!(!client.is_connected());

    server.send(":irc.test 001 bob :Welcome").await;
    let mut connected = client.connected();
    wait_for(&mut connected, |c| *c).await;
    server.expect("JOIN #x").await;
    server.expect("NAMES #x").await;

    server.send(":irc.test 353 bob = #x :bob @alice").await;
    server.send(":irc.test 366 bob #x :End").await;
    let mut users = client.users();
    wait_for(&mut users, |u| u.len() == 2).await;
    assert_eq!(
        *users.borrow(),
        vec![UserInfo::new("alice", Some('@')), UserInfo::new("bob", None)]
    );

    // end of MOTD after welcome does not join again
    server.send(":irc.test 376 bob :End of MOTD").await;
    server.send("PING :still-here").await;
    server.expect("PONG still-here").await;

    client.disconnect().unwrap();
    let mut state = client.state();
    wait_for(&mut state, |s| *s == ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn test_cap_and_sasl_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::spawn(fast_settings());
    let mut config = SessionConfig::new("127.0.0.1", "bob").with_sasl("user", "pass");
    config.port = port;
    client.connect(config).unwrap();

    let mut server = FakeServer::accept(&listener).await;
    server.expect("CAP LS 302").await;
    server.expect("NICK bob").await;
    server.next_line().await; // USER

    server.send(":irc.test CAP * LS :sasl echo-message").await;
    server.expect("CAP REQ :echo-message sasl").await;
    server.send(":irc.test CAP bob ACK :echo-message sasl").await;
    server.expect("AUTHENTICATE PLAIN").await;

    let mut echo = client.echo_enabled();
    wait_for(&mut echo, |e| *e).await;

    server.send("AUTHENTICATE +").await;
    server.expect("AUTHENTICATE dXNlcgB1c2VyAHBhc3M=").await;
    server.send(":irc.test 900 bob bob!u@h user :You are now logged in as user").await;
    server.send(":irc.test 903 bob :SASL authentication successful").await;
    server.expect("CAP END").await;

    client.disconnect().unwrap();
}

#[tokio::test]
async fn test_rate_limit_forces_cooldown() {
    let settings = fast_settings();
    let config = SessionConfig::new("irc.test", "bob");
    let (mut server, _link, _outlets, task) = pipe_session(config, settings.clone());

    server.read_until("NICK bob").await;
    server.send("ERROR :Closing Link: 10.0.0.1 (Excess Flood)").await;

    let outcome = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(!outcome.cancelled);
    assert_eq!(outcome.forced_delay, Some(settings.rate_limit_cooldown()));

    let state = ReconnectState::new(&settings);
    assert_eq!(
        state.next_delay(&settings, outcome.forced_delay),
        Duration::from_secs(600)
    );
}

#[tokio::test]
async fn test_sts_policy_ends_plaintext_session() {
    let config = SessionConfig::new("irc.test", "bob");
    let (mut server, _link, _outlets, task) = pipe_session(config.clone(), fast_settings());

    server.read_until("CAP LS 302").await;
    server
        .send(":irc.test CAP * LS :sts=port=6697,duration=300 echo-message")
        .await;

    let outcome = timeout(WAIT, task).await.unwrap().unwrap();
    assert_eq!(outcome.upgraded, Some(config.with_sts_upgrade(6697)));
    // nothing was requested on the doomed connection
    let rest: Vec<String> = {
        let mut rest = Vec::new();
        while let Ok(Ok(Some(line))) =
            timeout(Duration::from_millis(100), server.lines.next_line()).await
        {
            rest.push(line);
        }
        rest
    };
    assert!(rest.iter().all(|l| !l.starts_with("CAP REQ")), "{:?}", rest);
}

#[tokio::test]
async fn test_cancel_ends_session_and_closes_writer() {
    let (mut server, link, outlets, task) =
        pipe_session(SessionConfig::new("irc.test", "bob"), fast_settings());

    server.read_until("NICK bob").await;
    server.send(":irc.test 001 bob :Welcome").await;
    server.send("PING irc.test").await;
    server.read_until("PONG irc.test").await;
    assert!(*outlets.subscribe_connected().borrow());

    link.cancel.cancel();
    let outcome = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(outcome.cancelled);
    assert!(!link.writer.is_open().await);
    assert!(!*outlets.subscribe_connected().borrow());
}

#[tokio::test]
async fn test_local_echo_without_echo_message() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::spawn(fast_settings());
    let mut config = SessionConfig::new("127.0.0.1", "bob");
    config.port = port;
    config.request_caps = false;
    client.connect(config).unwrap();

    let mut server = FakeServer::accept(&listener).await;
    server.expect("NICK bob").await;
    server.next_line().await; // USER
    server.send(":irc.test 001 bob :Welcome").await;
    let mut connected = client.connected();
    wait_for(&mut connected, |c| *c).await;

    let events = client.events();
    client.send_message("#x", "hello").unwrap();
    server.expect("PRIVMSG #x :hello").await;
    let event = next_event(&events, |e| matches!(e, Event::Chat { .. })).await;
    match event {
        Event::Chat { nick, target, text, action, .. } => {
            assert_eq!((nick.as_str(), target.as_str(), text.as_str()), ("bob", "#x", "hello"));
            assert!(!action);
        }
        other => panic!("unexpected {:?}", other),
    }

    client.disconnect().unwrap();
}

#[tokio::test]
async fn test_reconnects_after_server_drop_until_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::spawn(fast_settings());
    let mut config = SessionConfig::new("127.0.0.1", "bob");
    config.port = port;
    config.request_caps = false;
    client.connect(config).unwrap();

    let mut first = FakeServer::accept(&listener).await;
    first.expect("NICK bob").await;
    drop(first);

    let mut second = FakeServer::accept(&listener).await;
    second.expect("NICK bob").await;

    client.disconnect().unwrap();
    // repeated disconnects are harmless
    client.disconnect().unwrap();
    drop(second);

    let third = timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(third.is_err(), "client reconnected after disconnect");
}

#[tokio::test]
async fn test_quit_sends_quit_before_closing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let client = Client::spawn(fast_settings());
    let mut config = SessionConfig::new("127.0.0.1", "bob");
    config.port = port;
    config.request_caps = false;
    client.connect(config).unwrap();

    let mut server = FakeServer::accept(&listener).await;
    server.expect("NICK bob").await;
    server.next_line().await; // USER

    client.quit("gone fishing").unwrap();
    server.expect("QUIT :gone fishing").await;
    let eof = timeout(WAIT, server.lines.next_line()).await.unwrap().unwrap();
    assert_eq!(eof, None);

    let third = timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(third.is_err(), "client reconnected after quit");
}

#[tokio::test]
async fn test_connect_rejects_invalid_config() {
    let client = Client::spawn(fast_settings());
    let err = client
        .connect(SessionConfig::new("irc.test", "9lives"))
        .unwrap_err();
    assert!(err.to_string().contains("Nickname"), "{}", err);
}

/// Client with capability negotiation off, pointed at a fresh local listener.
async fn plain_client(settings: EngineSettings) -> (Client, TcpListener, SessionConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = SessionConfig::new("127.0.0.1", "bob");
    config.port = listener.local_addr().unwrap().port();
    config.request_caps = false;
    let client = Client::spawn(settings);
    client.connect(config.clone()).unwrap();
    (client, listener, config)
}

/// Text of the next reconnect-related status line.
async fn next_schedule(events: &crossbeam_channel::Receiver<Event>) -> String {
    let event = next_event(events, |e| {
        matches!(e, Event::System { text, .. }
            if text.starts_with("Reconnecting") || text.starts_with("Waiting"))
    })
    .await;
    match event {
        Event::System { text, .. } => text,
        other => panic!("unexpected {:?}", other),
    }
}

async fn accept_registered(listener: &TcpListener) -> FakeServer {
    let mut server = FakeServer::accept(listener).await;
    server.expect("NICK bob").await;
    server.next_line().await; // USER
    server
}

async fn expect_closed(server: &mut FakeServer) {
    loop {
        match timeout(WAIT, server.lines.next_line()).await {
            Ok(Ok(Some(_))) => continue,
            Ok(_) => return,
            Err(_) => panic!("connection still open"),
        }
    }
}

#[tokio::test]
async fn test_disconnect_with_stalled_peer() {
    let (client, listener, config) = plain_client(fast_settings()).await;
    // registers, then never reads again
    let _stalled = accept_registered(&listener).await;

    let line = format!("PRIVMSG #x :{}", "z".repeat(8 * 1024));
    for _ in 0..2_000 {
        client.send_raw(line.clone()).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.disconnect().unwrap();
    let mut state = client.state();
    wait_for(&mut state, |s| *s == ConnectionState::Disconnected).await;

    // the backend still takes commands
    client.connect(config).unwrap();
    let _again = accept_registered(&listener).await;
    client.disconnect().unwrap();
}

#[tokio::test]
async fn test_backend_stops_when_clients_dropped() {
    let (client, listener, _) = plain_client(fast_settings()).await;
    let mut server = accept_registered(&listener).await;
    server.send(":irc.test 001 bob :Welcome").await;
    let mut connected = client.connected();
    wait_for(&mut connected, |c| *c).await;

    drop(client);
    expect_closed(&mut server).await;
}

#[tokio::test]
async fn test_rate_limit_delays_next_attempt_by_cooldown() {
    let settings = EngineSettings {
        rate_limit_cooldown_ms: 400,
        ..fast_settings()
    };
    let (client, listener, _) = plain_client(settings).await;
    let events = client.events();

    let mut server = accept_registered(&listener).await;
    let sent = tokio::time::Instant::now();
    server.send("ERROR :Closing Link: 127.0.0.1 (Excess Flood)").await;

    assert_eq!(next_schedule(&events).await, "Reconnecting in 0s (cooldown)");
    let _next = accept_registered(&listener).await;
    assert!(
        sent.elapsed() >= Duration::from_millis(400),
        "reconnected after {:?}",
        sent.elapsed()
    );
    client.disconnect().unwrap();
}

#[tokio::test]
async fn test_ready_resets_attempts() {
    let (client, listener, _) = plain_client(fast_settings()).await;
    let events = client.events();

    drop(accept_registered(&listener).await);
    assert_eq!(next_schedule(&events).await, "Reconnecting in 0s (attempt 1)");
    drop(accept_registered(&listener).await);
    assert_eq!(next_schedule(&events).await, "Reconnecting in 0s (attempt 2)");

    let mut server = accept_registered(&listener).await;
    server.send(":irc.test 001 bob :Welcome").await;
    let mut connected = client.connected();
    wait_for(&mut connected, |c| *c).await;
    // let the supervisor see the session reach Ready
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(server);
    assert_eq!(next_schedule(&events).await, "Reconnecting in 0s (attempt 1)");

    let _last = accept_registered(&listener).await;
    client.disconnect().unwrap();
}

#[tokio::test]
async fn test_network_unavailable_holds_reconnect() {
    let (client, listener, _) = plain_client(fast_settings()).await;
    let events = client.events();

    drop(accept_registered(&listener).await);
    assert_eq!(next_schedule(&events).await, "Reconnecting in 0s (attempt 1)");
    let server = accept_registered(&listener).await;

    client.notify_network_available(false).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(server);
    assert_eq!(next_schedule(&events).await, "Reconnecting in 0s (attempt 2)");
    assert_eq!(next_schedule(&events).await, "Waiting for network");
    let held = timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(held.is_err(), "reconnected while the network was down");

    client.notify_network_available(true).unwrap();
    assert_eq!(next_schedule(&events).await, "Reconnecting in 0s (attempt 1)");
    let _back = accept_registered(&listener).await;
    client.disconnect().unwrap();
}

#[tokio::test]
async fn test_reconnect_now_skips_backoff() {
    let settings = EngineSettings {
        min_backoff_ms: 400,
        max_backoff_ms: 10_000,
        ..fast_settings()
    };
    let (client, listener, _) = plain_client(settings).await;
    let events = client.events();

    drop(accept_registered(&listener).await);
    assert_eq!(next_schedule(&events).await, "Reconnecting in 0s (attempt 1)");
    drop(accept_registered(&listener).await);
    // 800ms backoff now pending
    assert_eq!(next_schedule(&events).await, "Reconnecting in 0s (attempt 2)");

    let asked = tokio::time::Instant::now();
    client.reconnect_now().unwrap();
    assert_eq!(next_schedule(&events).await, "Reconnecting in 0s (attempt 1)");
    let _now = accept_registered(&listener).await;
    assert!(asked.elapsed() < Duration::from_millis(400), "{:?}", asked.elapsed());
    client.disconnect().unwrap();
}

#[tokio::test]
async fn test_sts_upgrade_used_for_next_attempt() {
    let plain = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let secure = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let secure_port = secure.local_addr().unwrap().port();

    let client = Client::spawn(fast_settings());
    let mut config = SessionConfig::new("127.0.0.1", "bob");
    config.port = plain.local_addr().unwrap().port();
    client.connect(config).unwrap();

    let mut server = FakeServer::accept(&plain).await;
    server.expect("CAP LS 302").await;
    server
        .send(&format!(":irc.test CAP * LS :sts=port={},duration=300", secure_port))
        .await;
    expect_closed(&mut server).await;

    // next attempt goes to the advertised port and starts a TLS handshake
    let (mut stream, _) = timeout(WAIT, secure.accept()).await.unwrap().unwrap();
    let mut first = [0u8; 1];
    timeout(WAIT, tokio::io::AsyncReadExt::read_exact(&mut stream, &mut first))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first[0], 0x16, "expected a TLS handshake record");
    client.disconnect().unwrap();
}
