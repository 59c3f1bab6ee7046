//! Reconnection supervisor.
//!
//! # Data Flow
//! ```text
//! retry.rs   backend below target? → one immediate connect, or one timer
//!                 after a failure (never more than one outstanding)
//! connect.rs resolve → connect (bounded) → session::upstream::upstream_init
//!                 failure → failed += 1 → retry.rs
//! ```
//!
//! # Design Decisions
//! - `opening` counts the single outstanding attempt; a preparing
//!   connection keeps it until it joins a pool or is torn down
//! - Connect failures never reach clients; they only slow the next attempt

pub mod connect;
pub mod retry;

pub use connect::{backend_connect, ConnectError};
pub use retry::backend_retry;
