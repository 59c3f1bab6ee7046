//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Operation ready to forward
//!     → round_robin.rs (order in which backends are tried)
//!     → pool.rs (per backend: ceiling check, first eligible upstream)
//!         - regular pool, or bind-only pool for direct binds
//!     → operation registered on the upstream, counters bumped
//!     → Return upstream connection + upstream message id, or an error
//! ```
//!
//! # Design Decisions
//! - Backend order is a pluggable strategy; pool eligibility is not
//! - Selection and registration happen under one backend → connection lock
//!   sequence so a counter bump always has a matching tree entry
//! - The chosen upstream moves to the tail of its pool

pub mod backend;
pub mod pool;
pub mod round_robin;

use std::fmt::Debug;

/// Strategy deciding the order backends are tried in.
pub trait LoadBalancer: Send + Sync + Debug {
    /// Indices into the backend list, in the order to try them.
    fn candidates(&self, count: usize) -> Vec<usize>;

    /// Record that backend `index` took an operation.
    fn chosen(&self, index: usize, count: usize);
}
