//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! serve (accepter.rs):
//!     accept → register → spawn worker → handler → close → deregister
//!
//! shutdown (accepter.rs + shutdown.rs):
//!     cancel root token → close listener → drain until empty or deadline
//!
//! close (accepter.rs):
//!     cancel root token → close listener → close every connection
//!
//! signals (signals.rs):
//!     SIGTERM/SIGINT → trigger shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has a deadline: forced close after it passes

pub mod accepter;
pub mod shutdown;
pub mod signals;

pub use accepter::{handler_fn, Accepter, AccepterState, Handler, HandlerFn};
pub use shutdown::Deadline;
