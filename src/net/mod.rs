//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming connection
//!     → listener.rs (accept, temporary-error classification)
//!     → tls.rs (optional TLS handshake, run on the worker)
//!     → connection.rs (registry entry, closable stream)
//!     → Hand off to the handler
//! ```
//!
//! # Design Decisions
//! - Each connection is tracked from accept until its handler returns
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{Connection, ConnectionEntry, ConnectionGuard, ConnectionId, ConnectionRegistry};
pub use listener::{bind, is_temporary, BoundListener, BoxedStream, Incoming, Listener, NetAddr, Stream};
pub use tls::{load_key_pair, TlsConfig, TlsError, TlsListener};
