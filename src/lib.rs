//! Connection acceptance and lifecycle control.
//!
//! An [`Accepter`] pulls connections off a [`Listener`](net::Listener),
//! runs a [`Handler`] for each one on its own task, and stops either
//! gracefully ([`Accepter::shutdown`]) or immediately ([`Accepter::close`]).

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::AccepterConfig;
pub use error::{AccepterError, Result};
pub use lifecycle::{handler_fn, Accepter, AccepterState, Deadline, Handler, HandlerFn};
pub use net::{Connection, TlsConfig};
