//! Connection establishment utilities.
//!
//! Opens the TCP socket (optionally bound to an interface or local address),
//! wraps it in TLS when asked, and provides the line framing used by the
//! read loop plus a shared writer for outbound lines.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::error::EngineError;
use crate::protocol::NetworkHandle;
use crate::validation::sanitize_line;

/// Longest accepted inbound line, excluding the terminator.
pub const MAX_LINE_LEN: usize = 8191;

/// Anything the session can read lines from and write lines to.
pub trait IrcStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IrcStream for T {}

/// Create a TLS connector trusting the platform store plus the bundled webpki roots.
pub fn create_tls_connector() -> TlsConnector {
    let mut root_store = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        debug!("skipping platform certificates: {}", err);
    }
    let (added, ignored) = root_store.add_parsable_certificates(native.certs);
    debug!(added, ignored, "loaded platform trust roots");

    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Open a connection for `config`, bounded by `timeout` as a whole
/// (resolution, TCP connect and TLS handshake).
pub async fn establish_connection(
    config: &SessionConfig,
    network: Option<&NetworkHandle>,
    timeout: Duration,
) -> Result<Box<dyn IrcStream>, EngineError> {
    let addr = config.address();
    match tokio::time::timeout(timeout, connect(config, network)).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout {
            addr,
            secs: timeout.as_secs(),
        }),
    }
}

async fn connect(
    config: &SessionConfig,
    network: Option<&NetworkHandle>,
) -> Result<Box<dyn IrcStream>, EngineError> {
    let addrs: Vec<SocketAddr> = lookup_host((config.server.as_str(), config.port))
        .await?
        .collect();
    if addrs.is_empty() {
        return Err(EngineError::Resolve(config.server.clone()));
    }

    let mut last_err = None;
    let mut stream = None;
    for addr in addrs {
        match connect_addr(addr, network).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => {
                debug!(%addr, "connect failed: {}", e);
                last_err = Some(e);
            }
        }
    }
    let stream = match (stream, last_err) {
        (Some(s), _) => s,
        (None, Some(e)) => return Err(e.into()),
        (None, None) => return Err(EngineError::Resolve(config.server.clone())),
    };

    if let Err(e) = enable_keepalive(&stream) {
        warn!("failed to enable TCP keepalive: {}", e);
    }
    debug!(
        local = ?stream.local_addr().ok(),
        remote = ?stream.peer_addr().ok(),
        "TCP connected"
    );

    if !config.tls {
        return Ok(Box::new(stream));
    }

    let server_name = rustls::pki_types::ServerName::try_from(config.server.clone())
        .map_err(|e| EngineError::InvalidServerName(format!("{}: {}", config.server, e)))?;
    let tls = create_tls_connector()
        .connect(server_name, stream)
        .await
        .map_err(|source| EngineError::Tls {
            addr: config.address(),
            source,
        })?;
    Ok(Box::new(tls))
}

async fn connect_addr(addr: SocketAddr, network: Option<&NetworkHandle>) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(handle) = network {
        // Binding is best effort; an unusable handle still lets us connect.
        if let Err(e) = bind_socket(&socket, addr, handle) {
            warn!(?handle, "could not bind socket: {}", e);
        }
    }
    socket.connect(addr).await
}

fn bind_socket(socket: &TcpSocket, remote: SocketAddr, handle: &NetworkHandle) -> io::Result<()> {
    match handle {
        NetworkHandle::LocalAddress(ip) => {
            if ip.is_ipv4() != remote.is_ipv4() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "local address family does not match the server",
                ));
            }
            socket.bind(SocketAddr::new(*ip, 0))
        }
        NetworkHandle::Interface(name) => bind_device(socket, name),
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
fn bind_device(socket: &TcpSocket, name: &str) -> io::Result<()> {
    socket.bind_device(Some(name.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
fn bind_device(_socket: &TcpSocket, name: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("binding to interface {} is not supported on this platform", name),
    ))
}

fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    use socket2::{SockRef, TcpKeepalive};

    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(120))
        .with_interval(Duration::from_secs(30));
    sock.set_tcp_keepalive(&keepalive)
}

/// Splits a byte stream into text lines.
///
/// Accepts `\r\n` or bare `\n`, skips empty lines, replaces invalid UTF-8 and
/// drops lines longer than [`MAX_LINE_LEN`] instead of failing the connection.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// Inside an overlong line; skip until the next `\n`.
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LEN {
                    warn!(len = src.len(), "discarding overlong line");
                    src.clear();
                    self.discarding = true;
                }
                return Ok(None);
            };

            let raw = src.split_to(pos);
            src.advance(1);
            if std::mem::take(&mut self.discarding) {
                continue;
            }

            let raw = raw.strip_suffix(b"\r").unwrap_or(&raw[..]);
            if raw.len() > MAX_LINE_LEN {
                warn!(len = raw.len(), "discarding overlong line");
                continue;
            }
            if raw.is_empty() {
                continue;
            }
            return Ok(Some(String::from_utf8_lossy(raw).into_owned()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        // Unterminated final line.
        if src.is_empty() || std::mem::take(&mut self.discarding) {
            src.clear();
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest[..]);
        if rest.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(rest).into_owned()))
    }
}

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Upper bound for teardown of the write half.
const CLOSE_LIMIT: Duration = Duration::from_secs(2);

/// Write half of one connection, shared between the read loop and
/// short-lived send tasks. Sends after close are silently dropped.
///
/// A send blocked on a peer that stopped reading gives up as soon as the
/// writer's token is cancelled, releasing the half for [`Writer::close`].
#[derive(Clone, Default)]
pub struct Writer {
    inner: Arc<Mutex<Option<BoxedWrite>>>,
    closed: CancellationToken,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer whose pending sends are abandoned once `token` is cancelled.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::default(),
            closed: token,
        }
    }

    pub async fn install(&self, half: BoxedWrite) {
        *self.inner.lock().await = Some(half);
    }

    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.is_some()
    }

    /// Send one line. Errors are logged and swallowed.
    pub async fn send(&self, line: &str) {
        let line = sanitize_line(line);
        if self.closed.is_cancelled() {
            debug!("dropping line, writer closed: {}", line);
            return;
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => debug!("send abandoned, writer closed: {}", line),
            _ = self.write_line(&line) => {}
        }
    }

    async fn write_line(&self, line: &str) {
        let mut guard = self.inner.lock().await;
        let Some(half) = guard.as_mut() else {
            debug!("dropping line, not connected: {}", line);
            return;
        };
        trace!("-> {}", line);
        let mut wire = Vec::with_capacity(line.len() + 2);
        wire.extend_from_slice(line.as_bytes());
        wire.extend_from_slice(b"\r\n");
        let result = async {
            half.write_all(&wire).await?;
            half.flush().await
        }
        .await;
        if let Err(e) = result {
            debug!("write failed: {}", e);
        }
    }

    /// Abandon pending sends, then shut down and drop the write half.
    /// Idempotent and bounded in time.
    pub async fn close(&self) {
        self.closed.cancel();
        let half = match tokio::time::timeout(CLOSE_LIMIT, self.inner.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                warn!("write half still busy, leaving it to the last sender");
                return;
            }
        };
        if let Some(mut half) = half {
            match tokio::time::timeout(CLOSE_LIMIT, half.shutdown()).await {
                Ok(Err(e)) => debug!("shutdown failed: {}", e),
                Err(_) => debug!("shutdown timed out"),
                Ok(Ok(())) => {}
            }
        }
    }
}
