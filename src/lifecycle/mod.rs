//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build fleet → Bind listeners
//!         → Start backends' reconnects → Accept clients
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Close clients and upstreams
//!         → Cancel pending reconnects → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: listeners are bound before any backend is dialed, so
//!   a bad listen address fails before touching the network
//! - Shutdown is immediate: in-flight operations are dropped with their
//!   connections

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{Daemon, StartupError};
