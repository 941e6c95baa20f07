//! Connection handles and the live-connection registry.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Give handlers a stream the accepter can hard-close from outside
//! - Track every connection whose handler is still running
//!
//! # Lock discipline
//! The registry is a `RwLock<HashMap>`: `insert`/`remove` take the write
//! lock, `len`/`for_each`/`close_all` take the read lock, so readers run
//! concurrently with each other but never with a mutation.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

use crate::net::listener::{BoxedStream, NetAddr};

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Stream slot shared between a [`Connection`] and its registry entry.
///
/// `closed` is set exactly once; a stream attached after that is dropped.
struct Socket {
    stream: Mutex<Option<BoxedStream>>,
    closed: CancellationToken,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
}

impl Socket {
    fn new() -> Self {
        Self {
            stream: Mutex::new(None),
            closed: CancellationToken::new(),
            read_waker: AtomicWaker::new(),
            write_waker: AtomicWaker::new(),
        }
    }

    fn attach(&self, stream: BoxedStream) -> Result<(), BoxedStream> {
        let mut slot = self.stream.lock().expect("connection stream mutex poisoned");
        if self.closed.is_cancelled() {
            return Err(stream);
        }
        *slot = Some(stream);
        Ok(())
    }

    /// Drop the stream and wake any task parked on it. Returns false if the
    /// socket was already closed.
    fn close(&self) -> bool {
        let (first, stream) = {
            let mut slot = self.stream.lock().expect("connection stream mutex poisoned");
            let first = !self.closed.is_cancelled();
            self.closed.cancel();
            (first, slot.take())
        };
        drop(stream);
        self.read_waker.wake();
        self.write_waker.wake();
        first
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn poll_with<T>(
        &self,
        waker: &AtomicWaker,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut BoxedStream>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        // Register before looking at the slot so a concurrent close always wakes us.
        waker.register(cx.waker());
        let mut slot = self.stream.lock().expect("connection stream mutex poisoned");
        match slot.as_mut() {
            Some(stream) => op(Pin::new(stream), cx),
            None => Poll::Ready(Err(closed_error())),
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

/// An accepted connection, as seen by a handler.
///
/// Reads and writes go straight to the underlying stream until the accepter
/// force-closes the connection; from then on every operation fails with
/// [`io::ErrorKind::ConnectionAborted`]. Dropping the connection closes it.
pub struct Connection {
    id: ConnectionId,
    peer: NetAddr,
    socket: Arc<Socket>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> &NetAddr {
        &self.peer
    }

    /// True once the connection was closed, locally or by the accepter.
    pub fn is_closed(&self) -> bool {
        self.socket.is_closed()
    }

    /// Close the underlying stream without waiting for the peer.
    pub fn close(&self) {
        self.socket.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.socket.close();
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let socket = &self.socket;
        socket.poll_with(&socket.read_waker, cx, |s, cx| s.poll_read(cx, buf))
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let socket = &self.socket;
        socket.poll_with(&socket.write_waker, cx, |s, cx| s.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let socket = &self.socket;
        socket.poll_with(&socket.write_waker, cx, |s, cx| s.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let socket = &self.socket;
        match socket.poll_with(&socket.write_waker, cx, |s, cx| s.poll_shutdown(cx)) {
            Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::ConnectionAborted => {
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Registry record for one live connection.
///
/// Exists from the moment the connection is accepted until its handler
/// returns.
#[derive(Clone)]
pub struct ConnectionEntry {
    id: ConnectionId,
    peer: NetAddr,
    cancel: CancellationToken,
    socket: Arc<Socket>,
}

impl ConnectionEntry {
    /// Create an entry whose stream is attached later by [`ConnectionEntry::connect`].
    ///
    /// `cancel` should be a child of the accepter's root token.
    pub fn new(peer: NetAddr, cancel: CancellationToken) -> Self {
        Self {
            id: ConnectionId::new(),
            peer,
            cancel,
            socket: Arc::new(Socket::new()),
        }
    }

    /// Attach the established stream and produce the handler-facing connection.
    ///
    /// If the entry was force-closed while the stream was being established,
    /// the stream is dropped and the returned connection is already closed.
    pub fn connect(&self, stream: BoxedStream) -> Connection {
        if let Err(stream) = self.socket.attach(stream) {
            tracing::debug!(connection_id = %self.id, "Connection closed before it was established");
            drop(stream);
        }
        Connection {
            id: self.id,
            peer: self.peer.clone(),
            socket: Arc::clone(&self.socket),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> &NetAddr {
        &self.peer
    }

    /// Cancellation scope handed to the handler.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Hard-close the underlying stream. Returns false if it was already closed.
    pub fn force_close(&self) -> bool {
        self.socket.close()
    }

    /// Resolves once the connection has been closed by anyone.
    pub async fn closed(&self) {
        self.socket.closed.cancelled().await;
    }
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Concurrent map of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: ConnectionEntry) {
        self.entries
            .write()
            .expect("connection registry lock poisoned")
            .insert(entry.id, entry);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionEntry> {
        self.entries
            .write()
            .expect("connection registry lock poisoned")
            .remove(&id)
    }

    /// Number of handlers currently in progress.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("connection registry lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every entry while holding the shared lock.
    pub fn for_each(&self, mut f: impl FnMut(&ConnectionEntry)) {
        let entries = self.entries.read().expect("connection registry lock poisoned");
        for entry in entries.values() {
            f(entry);
        }
    }

    /// IDs and peers of the live connections, sorted by ID.
    pub fn snapshot(&self) -> Vec<(ConnectionId, NetAddr)> {
        let mut out = Vec::new();
        self.for_each(|e| out.push((e.id, e.peer.clone())));
        out.sort_by_key(|(id, _)| *id);
        out
    }

    /// Hard-close every registered connection. Entries stay registered until
    /// their workers finish. Returns how many were still open.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        self.for_each(|e| {
            if e.force_close() {
                closed += 1;
            }
        });
        closed
    }

    /// Insert `entry` and return a guard that removes it on drop.
    pub fn register(self: &Arc<Self>, entry: ConnectionEntry) -> ConnectionGuard {
        let id = entry.id;
        self.insert(entry);
        ConnectionGuard {
            registry: Arc::clone(self),
            id,
        }
    }
}

/// Guard that tracks a connection's lifetime.
/// Deregisters the connection when dropped, including on handler panic.
#[derive(Debug)]
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
