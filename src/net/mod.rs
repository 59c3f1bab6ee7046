//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming client connection (TCP or local socket)
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (state machine, refcount, reader/writer tasks)
//!     → session layer (client or upstream semantics)
//!
//! Connection States:
//!     Invalid → Ready → Active/Binding → Closing → Invalid
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Client and upstream connections share one abstraction
//! - Streams are generic so sessions run over any duplex byte stream

pub mod address;
pub mod connection;
pub mod listener;

use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream a connection can run over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
