//! Deadline handed to a graceful shutdown.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AccepterError;

/// Bounds how long [`Accepter::shutdown`](crate::Accepter::shutdown) may
/// wait for in-flight connections.
///
/// A deadline is done once its instant passes or its token is cancelled,
/// whichever happens first.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    token: Option<CancellationToken>,
}

impl Deadline {
    /// Wait without limit.
    pub fn never() -> Self {
        Self::default()
    }

    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            at: Some(instant),
            token: None,
        }
    }

    /// A deadline that has already passed.
    pub fn expired() -> Self {
        Self::at(Instant::now())
    }

    /// Done only when `token` is cancelled.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            at: None,
            token: Some(token),
        }
    }

    /// Also finish when `token` is cancelled.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    fn elapsed(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    fn cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn is_done(&self) -> bool {
        self.elapsed() || self.cancelled()
    }

    /// Resolves when the deadline is done.
    pub async fn done(&self) {
        let at = async {
            match self.at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        let token = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = at => {}
            _ = token => {}
        }
    }

    /// The error a shutdown reports when this deadline ends the drain.
    pub fn error(&self) -> AccepterError {
        if self.cancelled() && !self.elapsed() {
            AccepterError::ShutdownCancelled
        } else {
            AccepterError::DeadlineExceeded
        }
    }
}
