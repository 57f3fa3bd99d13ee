use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Produces order numbers of the form `YYYYMMDDHHMMSS-NNNN-SSSSSS`: a UTC
/// timestamp, a random per-process node tag and a process-wide sequence.
/// The database's unique constraint is the final arbiter.
pub struct OrderNumberGenerator {
    node: u16,
    sequence: AtomicU32,
}

impl OrderNumberGenerator {
    pub fn new() -> Self {
        Self::with_node(rand::random::<u16>())
    }

    pub fn with_node(node: u16) -> Self {
        Self {
            node,
            sequence: AtomicU32::new(0),
        }
    }

    pub fn next(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        format!("{}-{:04X}-{:06}", Utc::now().format("%Y%m%d%H%M%S"), self.node, seq)
    }
}

impl Default for OrderNumberGenerator {
    fn default() -> Self {
        Self::new()
    }
}
