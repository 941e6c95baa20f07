//! Listener capability and the stock TCP/Unix implementations.
//!
//! # Responsibilities
//! - Bind to a network/address pair (`tcp`, `tcp4`, `tcp6`, `unix`)
//! - Surface accepted connections as [`Incoming`] values
//! - Classify accept errors as temporary or permanent
//!
//! # Design Decisions
//! - Establishing the byte stream (e.g. a TLS handshake) is deferred to the
//!   per-connection worker, so `accept` only ever waits on the socket
//! - Closing consumes the listener; the socket is released on drop

use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use futures_util::future::{self, BoxFuture, FutureExt, TryFutureExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use crate::error::{AccepterError, Result};

/// Byte stream handed to handlers once a connection is established.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased [`Stream`].
pub type BoxedStream = Box<dyn Stream>;

/// Local or peer address of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAddr {
    Tcp(SocketAddr),
    /// Unix-domain socket; unnamed sockets carry no path.
    Unix(Option<PathBuf>),
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddr::Tcp(addr) => write!(f, "{}", addr),
            NetAddr::Unix(Some(path)) => write!(f, "{}", path.display()),
            NetAddr::Unix(None) => write!(f, "(unnamed)"),
        }
    }
}

impl From<SocketAddr> for NetAddr {
    fn from(addr: SocketAddr) -> Self {
        NetAddr::Tcp(addr)
    }
}

/// A connection returned by [`Listener::accept`].
///
/// The stream is produced by the `establish` future, which runs on the
/// connection's own worker rather than on the accept loop.
pub struct Incoming {
    peer: NetAddr,
    establish: BoxFuture<'static, io::Result<BoxedStream>>,
}

impl Incoming {
    /// A connection whose stream is usable as-is.
    pub fn ready<S: Stream>(stream: S, peer: impl Into<NetAddr>) -> Self {
        Self {
            peer: peer.into(),
            establish: future::ready(Ok(Box::new(stream) as BoxedStream)).boxed(),
        }
    }

    /// A connection whose stream becomes available once `establish` resolves.
    pub fn pending<F>(peer: impl Into<NetAddr>, establish: F) -> Self
    where
        F: Future<Output = io::Result<BoxedStream>> + Send + 'static,
    {
        Self {
            peer: peer.into(),
            establish: establish.boxed(),
        }
    }

    /// Chain another establishment step (such as a handshake) onto this one.
    pub fn and_then<F, Fut>(self, step: F) -> Self
    where
        F: FnOnce(BoxedStream) -> Fut + Send + 'static,
        Fut: Future<Output = io::Result<BoxedStream>> + Send + 'static,
    {
        Self {
            peer: self.peer,
            establish: self.establish.and_then(step).boxed(),
        }
    }

    pub fn peer_addr(&self) -> &NetAddr {
        &self.peer
    }

    pub(crate) fn into_parts(self) -> (NetAddr, BoxFuture<'static, io::Result<BoxedStream>>) {
        (self.peer, self.establish)
    }
}

impl fmt::Debug for Incoming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// Source of inbound connections.
pub trait Listener: Send + 'static {
    /// Wait for the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<Incoming>> + Send;

    /// Address this listener is bound to.
    fn local_addr(&self) -> io::Result<NetAddr>;

    /// Stop listening. Pending and future accepts are abandoned.
    fn close(self) -> io::Result<()>
    where
        Self: Sized,
    {
        drop(self);
        Ok(())
    }

    /// Whether an accept error is worth retrying after a short pause.
    fn is_temporary(&self, err: &io::Error) -> bool {
        is_temporary(err)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const RESOURCE_EXHAUSTION: &[i32] = &[12, 23, 24, 105];
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
const RESOURCE_EXHAUSTION: &[i32] = &[12, 23, 24, 55];
#[cfg(windows)]
const RESOURCE_EXHAUSTION: &[i32] = &[10024, 10055];
#[cfg(not(any(unix, windows)))]
const RESOURCE_EXHAUSTION: &[i32] = &[];

/// Default retryability predicate for accept errors.
///
/// Aborted or reset handshakes, interrupts and descriptor/buffer exhaustion
/// (ENOMEM, ENFILE, EMFILE, ENOBUFS) clear up on their own; anything else
/// means the listener is unusable.
pub fn is_temporary(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => err
            .raw_os_error()
            .is_some_and(|code| RESOURCE_EXHAUSTION.contains(&code)),
    }
}

impl Listener for TcpListener {
    async fn accept(&mut self) -> io::Result<Incoming> {
        let (stream, addr) = TcpListener::accept(self).await?;
        Ok(Incoming::ready(stream, addr))
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        TcpListener::local_addr(self).map(NetAddr::Tcp)
    }
}

/// Unix-domain listener that unlinks its socket file on close.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixListener {
    inner: tokio::net::UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl UnixListener {
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let inner = tokio::net::UnixListener::bind(&path)?;
        Ok(Self { inner, path })
    }
}

#[cfg(unix)]
impl Listener for UnixListener {
    async fn accept(&mut self) -> io::Result<Incoming> {
        let (stream, addr) = self.inner.accept().await?;
        let peer = NetAddr::Unix(addr.as_pathname().map(|p| p.to_path_buf()));
        Ok(Incoming::ready(stream, peer))
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        Ok(NetAddr::Unix(Some(self.path.clone())))
    }

    fn close(self) -> io::Result<()> {
        drop(self.inner);
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Listener produced by [`bind`].
#[derive(Debug)]
pub enum BoundListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener for BoundListener {
    async fn accept(&mut self) -> io::Result<Incoming> {
        match self {
            BoundListener::Tcp(l) => Listener::accept(l).await,
            #[cfg(unix)]
            BoundListener::Unix(l) => Listener::accept(l).await,
        }
    }

    fn local_addr(&self) -> io::Result<NetAddr> {
        match self {
            BoundListener::Tcp(l) => Listener::local_addr(l),
            #[cfg(unix)]
            BoundListener::Unix(l) => Listener::local_addr(l),
        }
    }

    fn close(self) -> io::Result<()> {
        match self {
            BoundListener::Tcp(l) => Listener::close(l),
            #[cfg(unix)]
            BoundListener::Unix(l) => Listener::close(l),
        }
    }
}

/// Bind a listener for `network` on `address`.
///
/// `tcp` accepts any address family, `tcp4`/`tcp6` restrict it. An address
/// with an empty host (`":8080"`) binds the unspecified address. `unix`
/// treats `address` as a filesystem path.
pub async fn bind(network: &str, address: &str) -> Result<BoundListener> {
    let bind_err = |source: io::Error| AccepterError::Bind {
        network: network.to_string(),
        address: address.to_string(),
        source,
    };

    let listener = match network {
        "tcp" | "tcp4" | "tcp6" => {
            let host_port = if address.starts_with(':') {
                let unspecified = if network == "tcp6" { "[::]" } else { "0.0.0.0" };
                format!("{}{}", unspecified, address)
            } else {
                address.to_string()
            };

            let candidates: Vec<SocketAddr> = tokio::net::lookup_host(host_port.as_str())
                .await
                .map_err(bind_err)?
                .filter(|addr| match network {
                    "tcp4" => addr.is_ipv4(),
                    "tcp6" => addr.is_ipv6(),
                    _ => true,
                })
                .collect();

            let mut last_err = io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address resolved", network),
            );
            let mut bound = None;
            for addr in candidates {
                match TcpListener::bind(addr).await {
                    Ok(l) => {
                        bound = Some(l);
                        break;
                    }
                    Err(e) => last_err = e,
                }
            }
            BoundListener::Tcp(bound.ok_or_else(|| bind_err(last_err))?)
        }
        #[cfg(unix)]
        "unix" => BoundListener::Unix(UnixListener::bind(address).map_err(bind_err)?),
        other => return Err(AccepterError::UnsupportedNetwork(other.to_string())),
    };

    let local_addr = listener.local_addr().map_err(bind_err)?;
    tracing::info!(network, address = %local_addr, "Listener bound");

    Ok(listener)
}
