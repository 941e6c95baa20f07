//! Accept loop and connection lifecycle control.
//!
//! # Responsibilities
//! - Accept connections and run one handler task per connection
//! - Register every connection until its handler returns
//! - Graceful shutdown (drain with deadline) and forced close
//!
//! # Design Decisions
//! - Connections are registered on the accept loop, before the worker task
//!   is spawned, so a drain never misses an accepted connection
//! - The accept loop owns the listener and closes it when the root token is
//!   cancelled; `shutdown`/`close` wait for that acknowledgement
//! - Drain detection polls the registry every 5 ms
//!
//! ```text
//! Created ──serve──▶ Serving ──shutdown/close──▶ ShuttingDown ──serve returns──▶ Stopped
//!                       └────────────── permanent accept error ─────────────────▶ Stopped
//! ```

use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{AccepterError, Result};
use crate::lifecycle::shutdown::Deadline;
use crate::net::connection::{Connection, ConnectionEntry, ConnectionId, ConnectionRegistry};
use crate::net::listener::{self, Incoming, Listener, NetAddr};
use crate::net::tls::{TlsConfig, TlsListener};

/// Pause before retrying a temporary accept error.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Interval between registry checks while draining.
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Services one connection.
///
/// `cancel` is cancelled when the accepter shuts down; handlers are expected
/// to notice and return promptly. The connection may be closed underneath
/// the handler at any time by [`Accepter::close`] or an expired shutdown.
pub trait Handler: Send + Sync + 'static {
    fn serve(&self, cancel: CancellationToken, conn: Connection) -> impl Future<Output = ()> + Send;
}

/// Adapter turning a closure into a [`Handler`].
#[derive(Clone)]
pub struct HandlerFn<F>(F);

/// Build a [`Handler`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(CancellationToken, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn(f)
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(CancellationToken, Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve(&self, cancel: CancellationToken, conn: Connection) -> impl Future<Output = ()> + Send {
        (self.0)(cancel, conn)
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFn")
    }
}

/// Lifecycle state of an [`Accepter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccepterState {
    Created = 0,
    Serving = 1,
    ShuttingDown = 2,
    Stopped = 3,
}

impl AccepterState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Serving,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for AccepterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Serving => write!(f, "serving"),
            Self::ShuttingDown => write!(f, "shutting down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

struct Inner<H> {
    handler: Arc<H>,
    tls: Mutex<TlsConfig>,
    root: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    state: AtomicU8,
    listener_closed: watch::Sender<bool>,
    close_error: Mutex<Option<io::Error>>,
}

impl<H> Inner<H> {
    fn state(&self) -> AccepterState {
        AccepterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: AccepterState, to: AccepterState) -> std::result::Result<(), AccepterState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(AccepterState::from_u8)
    }
}

/// Accepts connections from a listener and controls their lifecycle.
///
/// `Accepter` is a cheap handle; clone it to call [`shutdown`](Self::shutdown)
/// or [`close`](Self::close) from another task while [`serve`](Self::serve)
/// runs. An accepter serves once: after shutdown it stays stopped.
pub struct Accepter<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for Accepter<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H> fmt::Debug for Accepter<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepter")
            .field("state", &self.inner.state())
            .field("active_connections", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl<H: Handler> Accepter<H> {
    pub fn new(handler: H) -> Self {
        let (listener_closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                handler: Arc::new(handler),
                tls: Mutex::new(TlsConfig::default()),
                root: CancellationToken::new(),
                registry: Arc::new(ConnectionRegistry::new()),
                state: AtomicU8::new(AccepterState::Created as u8),
                listener_closed,
                close_error: Mutex::new(None),
            }),
        }
    }

    /// Use `config` as the base configuration for the TLS entry points.
    pub fn with_tls(self, config: TlsConfig) -> Self {
        *self.inner.tls.lock().expect("tls config mutex poisoned") = config;
        self
    }

    pub fn state(&self) -> AccepterState {
        self.inner.state()
    }

    /// Number of connections whose handler is still running.
    pub fn active_connections(&self) -> usize {
        self.inner.registry.len()
    }

    /// IDs and peer addresses of the live connections.
    pub fn connections(&self) -> Vec<(ConnectionId, NetAddr)> {
        self.inner.registry.snapshot()
    }

    /// A token cancelled when the accepter begins shutting down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.root.child_token()
    }

    /// Accept connections on `listener` until shutdown, close, or a
    /// permanent accept error.
    ///
    /// Returns `Ok(())` once [`shutdown`](Self::shutdown) or
    /// [`close`](Self::close) has been called; the caller should then wait
    /// for that call to finish draining. Serving an accepter that is already
    /// shutting down or stopped closes `listener` and returns `Ok(())`.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<()> {
        let inner: &Inner<H> = &self.inner;
        match inner.transition(AccepterState::Created, AccepterState::Serving) {
            Ok(()) => {}
            Err(AccepterState::Serving) => return Err(AccepterError::AlreadyServing),
            Err(state) => {
                tracing::debug!(%state, "Accepter not serving, closing listener");
                if let Err(e) = listener.close() {
                    tracing::debug!(error = %e, "Failed to close unused listener");
                }
                return Ok(());
            }
        }

        let stopped = StopGuard { inner };
        // Declared after `stopped` so a dropped serve future releases the
        // socket before the close acknowledgement is published.
        let mut listener = listener;

        match listener.local_addr() {
            Ok(addr) => tracing::info!(address = %addr, "Accepter serving"),
            Err(e) => tracing::info!(error = %e, "Accepter serving on unknown address"),
        }

        let result = self.accept_loop(&mut listener).await;

        if let Err(e) = listener.close() {
            tracing::warn!(error = %e, "Failed to close listener");
            *inner.close_error.lock().expect("close error mutex poisoned") = Some(e);
        }
        drop(stopped);

        result
    }

    /// Bind `address` on `network` and [`serve`](Self::serve) it.
    pub async fn listen_and_serve(&self, network: &str, address: &str) -> Result<()> {
        let listener = listener::bind(network, address).await?;
        self.serve(listener).await
    }

    /// Bind `address` on `network` and [`serve_tls`](Self::serve_tls) it.
    pub async fn listen_and_serve_tls(
        &self,
        network: &str,
        address: &str,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<()> {
        let listener = listener::bind(network, address).await?;
        self.serve_tls(listener, cert_file, key_file).await
    }

    /// Serve TLS connections on `listener`.
    ///
    /// The certificate/key files must be given unless the configured
    /// [`TlsConfig`] already has certificate material; empty paths count as
    /// not given. Certificate errors are returned before anything is accepted.
    pub async fn serve_tls<L: Listener>(
        &self,
        listener: L,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<()> {
        let base = self.inner.tls.lock().expect("tls config mutex poisoned").clone();
        let config = base.prepare(cert_file, key_file).await?;
        let server_config = config.server_config()?;
        self.serve(TlsListener::new(listener, server_config)).await
    }

    /// Stop accepting and wait for in-flight connections to finish.
    ///
    /// Cancels every handler's token, closes the listener, then checks the
    /// registry every [`DRAIN_POLL_INTERVAL`]. Once it is empty the result of
    /// closing the listener is returned. If `deadline` finishes first, every
    /// remaining connection is closed and the deadline's error is returned
    /// without waiting for those handlers.
    pub async fn shutdown(&self, deadline: Deadline) -> Result<()> {
        let close_result = self.stop().await;
        let registry = &self.inner.registry;
        tracing::info!(active_connections = registry.len(), "Draining connections");

        loop {
            tokio::select! {
                biased;
                _ = deadline.done() => {
                    let closed = registry.close_all();
                    tracing::warn!(force_closed = closed, "Shutdown deadline reached, closing remaining connections");
                    return Err(deadline.error());
                }
                _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {
                    if registry.is_empty() {
                        tracing::info!("All connections drained");
                        return close_result;
                    }
                }
            }
        }
    }

    /// Stop accepting and close every connection immediately.
    ///
    /// Returns the result of closing the listener. Handlers are not waited
    /// for; their reads and writes start failing.
    pub async fn close(&self) -> Result<()> {
        let close_result = self.stop().await;
        let closed = self.inner.registry.close_all();
        tracing::info!(force_closed = closed, "Accepter closed");
        close_result
    }

    /// Cancel the root token and wait until the accept loop has closed the
    /// listener.
    async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let was_created = inner
            .transition(AccepterState::Created, AccepterState::Stopped)
            .is_ok();
        if !was_created {
            let _ = inner.transition(AccepterState::Serving, AccepterState::ShuttingDown);
        }
        inner.root.cancel();

        if was_created {
            inner.listener_closed.send_replace(true);
            return Ok(());
        }

        let mut closed = inner.listener_closed.subscribe();
        // The sender lives in `inner`, so this only returns once closed.
        let _ = closed.wait_for(|closed| *closed).await;

        match inner.close_error.lock().expect("close error mutex poisoned").take() {
            Some(e) => Err(AccepterError::Close(e)),
            None => Ok(()),
        }
    }

    async fn accept_loop<L: Listener>(&self, listener: &mut L) -> Result<()> {
        let root = &self.inner.root;
        loop {
            let accepted = tokio::select! {
                biased;
                _ = root.cancelled() => return Ok(()),
                res = listener.accept() => res,
            };

            match accepted {
                Ok(incoming) => self.dispatch(incoming),
                // Closing the listener during shutdown is not an error.
                Err(_) if root.is_cancelled() => return Ok(()),
                Err(e) if listener.is_temporary(&e) => {
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = ACCEPT_RETRY_DELAY.as_millis() as u64,
                        "Temporary accept error"
                    );
                    tokio::select! {
                        biased;
                        _ = root.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                    return Err(AccepterError::Accept(e));
                }
            }
        }
    }

    fn dispatch(&self, incoming: Incoming) {
        let (peer, establish) = incoming.into_parts();
        let entry = ConnectionEntry::new(peer, self.inner.root.child_token());
        let guard = self.inner.registry.register(entry.clone());

        tracing::debug!(
            connection_id = %entry.id(),
            peer_addr = %entry.peer_addr(),
            active_connections = self.inner.registry.len(),
            "Connection accepted"
        );

        let handler = Arc::clone(&self.inner.handler);
        tokio::spawn(async move {
            let _guard = guard;

            let stream = tokio::select! {
                res = establish => match res {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!(connection_id = %entry.id(), error = %e, "Connection failed to establish");
                        return;
                    }
                },
                _ = entry.closed() => return,
            };

            let cancel = entry.cancellation_token().clone();
            handler.serve(cancel.clone(), entry.connect(stream)).await;

            cancel.cancel();
            entry.force_close();
        });
    }
}

/// Marks the accepter stopped when `serve` finishes or is dropped.
struct StopGuard<'a, H> {
    inner: &'a Inner<H>,
}

impl<H> Drop for StopGuard<'_, H> {
    fn drop(&mut self) {
        self.inner.root.cancel();
        self.inner
            .state
            .store(AccepterState::Stopped as u8, Ordering::SeqCst);
        self.inner.listener_closed.send_replace(true);
        tracing::info!("Accepter stopped");
    }
}
