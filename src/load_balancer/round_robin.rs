//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::load_balancer::LoadBalancer;

/// Round-robin selector.
/// Selection starts at the cursor; the cursor moves past whichever backend
/// took the last operation.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn candidates(&self, count: usize) -> Vec<usize> {
        if count == 0 {
            return Vec::new();
        }
        let start = self.cursor.load(Ordering::Relaxed) % count;
        (0..count).map(|i| (start + i) % count).collect()
    }

    fn chosen(&self, index: usize, count: usize) {
        if count > 0 {
            self.cursor.store((index + 1) % count, Ordering::Relaxed);
        }
    }
}
