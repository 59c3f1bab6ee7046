//! LDAP load balancer library.
//!
//! Accepts LDAP clients, multiplexes their operations onto pooled backend
//! connections by message id and routes each response back to the request
//! that caused it. Binds are forwarded either on dedicated bind connections
//! or, with the `virtual-bind` feature, wrapped in a verify-credentials
//! extended operation on shared connections.

// Core subsystems
pub mod config;
pub mod fleet;
pub mod net;
pub mod proto;
pub mod session;

// Traffic management
pub mod load_balancer;
pub mod supervisor;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::LloadConfig;
pub use fleet::{Fleet, FleetSettings};
pub use lifecycle::{Daemon, Shutdown};
