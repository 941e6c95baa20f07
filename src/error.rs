//! Error types surfaced by the accepter.

use std::io;

use crate::net::tls::TlsError;

/// Convenience alias for accepter results.
pub type Result<T, E = AccepterError> = std::result::Result<T, E>;

/// Errors returned by [`Accepter`](crate::Accepter) operations.
///
/// Transient accept errors never show up here: they are retried inside the
/// accept loop. Handler-internal failures are the handler's own business.
#[derive(Debug, thiserror::Error)]
pub enum AccepterError {
    /// Binding the listening socket failed.
    #[error("failed to bind {network} listener on {address}: {source}")]
    Bind {
        network: String,
        address: String,
        #[source]
        source: io::Error,
    },

    /// The requested network kind is not supported on this platform.
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    /// A permanent accept failure ended the accept loop.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// Closing the listener failed.
    #[error("failed to close listener: {0}")]
    Close(#[source] io::Error),

    /// Certificate material could not be prepared.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// `serve` was called while another `serve` is still running.
    #[error("accepter is already serving")]
    AlreadyServing,

    /// The shutdown deadline elapsed before every connection drained.
    #[error("shutdown deadline exceeded")]
    DeadlineExceeded,

    /// The shutdown context was cancelled before every connection drained.
    #[error("shutdown cancelled")]
    ShutdownCancelled,
}

impl AccepterError {
    /// Returns true for the two errors a drain can end with.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::DeadlineExceeded | Self::ShutdownCancelled)
    }
}
