//! # Message Transport Module
//!
//! Framed, message-oriented connections between the host process and its
//! daemons. One abstraction serves the three wiring patterns the dispatch
//! core uses:
//!
//! - **request/reply**: direct-mode submission, the host plays requester
//! - **push/pull**: the direct pool's shared queue that daemons drain
//! - **pair**: the persistent per-daemon pipe owned by the dispatcher
//!
//! A [`Listener`] binds a [`TransportUrl`] and accepts [`Connection`]s; a
//! daemon [`dial`]s the same URL (with bounded-backoff redial available for
//! transient peer unavailability). Connections carry [`Frame`]s and expose a
//! non-consuming [`Connection::try_recv`] readiness poll.
//!
//! The delivery contract is *deliver-or-lose-with-signal*: a lost peer is
//! always observable as [`TransportError::PeerClosed`], never as silence.
//! TLS activation and credentials are handled in [`tls`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace, warn};

pub mod frame;
pub mod tls;
pub mod url;

pub use frame::{Frame, FrameKind};
pub use tls::{TlsMaterial, TlsMode};
pub use url::TransportUrl;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("frame does not start with the taskgrid magic")]
    BadMagic,

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),

    #[error("frame length {0} exceeds the transport cap")]
    FrameTooLarge(u64),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("TLS required by URL but no credentials configured")]
    TlsRequired,

    #[error("could not reach {url} within {timeout:?}")]
    DialTimeout { url: String, timeout: Duration },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Object-safe alias for the byte streams a connection can ride on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// A framed, bidirectional connection to a single peer.
///
/// Inbound frames are drained by a background reader task into an internal
/// channel, which is what makes the non-blocking [`Connection::try_recv`]
/// poll possible without consuming from the socket twice.
pub struct Connection {
    writer: WriteHalf<BoxedStream>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    peer: String,
}

impl Connection {
    fn spawn(stream: BoxedStream, peer: String) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        let (tx, inbound) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(read_half, tx, peer.clone()));
        Self {
            writer,
            inbound,
            peer,
        }
    }

    /// Send one frame, flushing it to the wire.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        frame::write_frame(&mut self.writer, frame).await
    }

    /// Receive the next frame, suspending until one arrives.
    ///
    /// Returns [`TransportError::PeerClosed`] once the peer is gone and the
    /// inbound buffer has drained.
    pub async fn recv(&mut self) -> Result<Frame, TransportError> {
        self.inbound.recv().await.ok_or(TransportError::PeerClosed)
    }

    /// Non-blocking readiness poll: a buffered frame if one is waiting,
    /// `None` if the connection is alive but idle.
    pub fn try_recv(&mut self) -> Result<Option<Frame>, TransportError> {
        match self.inbound.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::PeerClosed),
        }
    }

    /// Peer description for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Shut the write side down cleanly. Dropping the connection without
    /// closing is also safe; the peer observes it as transport loss.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    tx: mpsc::UnboundedSender<Frame>,
    peer: String,
) {
    loop {
        match frame::read_frame(&mut reader).await {
            Ok(frame) => {
                trace!("frame {:?} from {}", frame.kind, peer);
                if tx.send(frame).is_err() {
                    break; // receiver dropped, connection closed locally
                }
            }
            Err(TransportError::PeerClosed) => {
                debug!("peer {} closed the connection", peer);
                break;
            }
            Err(e) => {
                debug!("read from {} failed: {}", peer, e);
                break;
            }
        }
    }
    // Dropping `tx` here is the loss signal: recv() drains buffered frames
    // and then reports PeerClosed.
}

enum ListenerKind {
    Tcp {
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
    },
    Unix {
        listener: UnixListener,
        /// Filesystem path to unlink on drop; only the binding side owns
        /// the socket file. Empty for abstract-namespace sockets.
        owned_path: Option<PathBuf>,
    },
}

/// A bound listen address accepting daemon connections.
pub struct Listener {
    kind: ListenerKind,
    local: TransportUrl,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("local", &self.local).finish()
    }
}

impl Listener {
    /// Bind a listen URL, activating TLS when the scheme requires it.
    ///
    /// With port 0 the OS assigns an ephemeral port and [`local_url`]
    /// reports the bound address.
    ///
    /// [`local_url`]: Listener::local_url
    pub async fn bind(
        url: &TransportUrl,
        tls_material: Option<&TlsMaterial>,
    ) -> Result<Self, TransportError> {
        match url {
            TransportUrl::Tcp { host, port, .. } => {
                let acceptor = if url.uses_tls() {
                    let material = tls_material.ok_or(TransportError::TlsRequired)?;
                    Some(TlsAcceptor::from(material.server_config()?))
                } else {
                    None
                };
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                let bound = listener.local_addr()?.port();
                debug!("listening on {}", url.with_port(bound));
                Ok(Self {
                    kind: ListenerKind::Tcp { listener, acceptor },
                    local: url.with_port(bound),
                })
            }
            TransportUrl::Ws { .. } => {
                Err(TransportError::UnsupportedScheme("ws/wss".to_string()))
            }
            TransportUrl::Ipc { path } => {
                // A stale socket file from a crashed predecessor would make
                // the bind fail; remove it only if nothing is listening.
                if std::path::Path::new(path).exists()
                    && UnixStream::connect(path).await.is_err()
                {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)?;
                debug!("listening on {}", url);
                Ok(Self {
                    kind: ListenerKind::Unix {
                        listener,
                        owned_path: Some(PathBuf::from(path)),
                    },
                    local: url.clone(),
                })
            }
            TransportUrl::Abstract { name } => {
                let listener = bind_abstract(name)?;
                debug!("listening on {}", url);
                Ok(Self {
                    kind: ListenerKind::Unix {
                        listener,
                        owned_path: None,
                    },
                    local: url.clone(),
                })
            }
        }
    }

    /// The bound address, with any ephemeral port resolved.
    pub fn local_url(&self) -> &TransportUrl {
        &self.local
    }

    /// Accept the next inbound connection, completing the TLS handshake
    /// when the listener carries an acceptor.
    pub async fn accept(&self) -> Result<Connection, TransportError> {
        match &self.kind {
            ListenerKind::Tcp { listener, acceptor } => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let peer = addr.to_string();
                match acceptor {
                    Some(acceptor) => {
                        let stream = acceptor
                            .accept(stream)
                            .await
                            .map_err(|e| TransportError::Tls(e.to_string()))?;
                        Ok(Connection::spawn(Box::new(stream), peer))
                    }
                    None => Ok(Connection::spawn(Box::new(stream), peer)),
                }
            }
            ListenerKind::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Connection::spawn(
                    Box::new(stream),
                    self.local.to_string(),
                ))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let ListenerKind::Unix {
            owned_path: Some(path),
            ..
        } = &self.kind
        {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove socket file {:?}: {}", path, e);
                }
            }
        }
    }
}

/// Dial a URL once.
///
/// `client_tls` supplies the connector configuration when the URL activates
/// TLS; dialing a `tls+` URL without it is an error.
pub async fn dial(
    url: &TransportUrl,
    client_tls: Option<&Arc<rustls::ClientConfig>>,
) -> Result<Connection, TransportError> {
    match url {
        TransportUrl::Tcp { host, port, .. } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            tune_tcp(&stream)?;
            let peer = format!("{host}:{port}");
            if url.uses_tls() {
                let config = client_tls.ok_or(TransportError::TlsRequired)?;
                let connector = TlsConnector::from(Arc::clone(config));
                let stream = connector
                    .connect(tls::server_name(host)?, stream)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                Ok(Connection::spawn(Box::new(stream), peer))
            } else {
                Ok(Connection::spawn(Box::new(stream), peer))
            }
        }
        TransportUrl::Ws { .. } => Err(TransportError::UnsupportedScheme("ws/wss".to_string())),
        TransportUrl::Ipc { path } => {
            let stream = UnixStream::connect(path).await?;
            Ok(Connection::spawn(Box::new(stream), url.to_string()))
        }
        TransportUrl::Abstract { name } => {
            let stream = dial_abstract(name).await?;
            Ok(Connection::spawn(Box::new(stream), url.to_string()))
        }
    }
}

/// Dial with bounded-backoff redial until `timeout` elapses.
///
/// Daemons use this both for the initial connect (the host may still be
/// binding) and for reconnection after transport loss.
pub async fn dial_with_retry(
    url: &TransportUrl,
    client_tls: Option<&Arc<rustls::ClientConfig>>,
    timeout: Duration,
) -> Result<Connection, TransportError> {
    let started = tokio::time::Instant::now();
    let mut backoff = Duration::from_millis(50);
    loop {
        match dial(url, client_tls).await {
            Ok(conn) => return Ok(conn),
            Err(e @ (TransportError::UnsupportedScheme(_) | TransportError::TlsRequired)) => {
                return Err(e); // retrying cannot fix these
            }
            Err(e) => {
                if started.elapsed() + backoff > timeout {
                    debug!("giving up dialing {}: {}", url, e);
                    return Err(TransportError::DialTimeout {
                        url: url.to_string(),
                        timeout,
                    });
                }
                trace!("dial {} failed ({}), retrying in {:?}", url, e, backoff);
                sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(1));
            }
        }
    }
}

/// Tune a TCP stream the same way for both ends: no Nagle delay, larger
/// kernel buffers for bulk payloads.
fn tune_tcp(stream: &TcpStream) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_recv_buffer_size(256 * 1024)?;
    sock.set_send_buffer_size(256 * 1024)?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> Result<UnixListener, TransportError> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = std::os::unix::net::UnixListener::bind_addr(&addr)?;
    listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(listener)?)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &str) -> Result<UnixListener, TransportError> {
    Err(TransportError::UnsupportedScheme(
        "abstract (requires Linux)".to_string(),
    ))
}

#[cfg(target_os = "linux")]
async fn dial_abstract(name: &str) -> Result<UnixStream, TransportError> {
    use std::os::linux::net::SocketAddrExt;
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

#[cfg(not(target_os = "linux"))]
async fn dial_abstract(_name: &str) -> Result<UnixStream, TransportError> {
    Err(TransportError::UnsupportedScheme(
        "abstract (requires Linux)".to_string(),
    ))
}
