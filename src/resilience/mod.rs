//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Forwarded operation:
//!     → timeouts.rs (periodic sweep of every upstream's pending tree)
//!     → expired: unlinked, abandoned upstream, rejected to the client
//! ```
//!
//! # Design Decisions
//! - Disabled unless `operation_timeout_secs` is set
//! - The sweep releases counters through the same unlink path responses use

pub mod timeouts;

pub use timeouts::OperationSweeper;
