//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! accept loop, workers, shutdown
//!     → tracing events (connection_id, peer_addr fields)
//!     → logging.rs subscriber (stdout, pretty or JSON)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection ID flows through every per-connection event

pub mod logging;
