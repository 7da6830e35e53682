//! Snapshot generations.
//!
//! Every CacheSet the store publishes carries the generation it was built as.
//! Generations only ever grow, so two sets can be ordered without comparing
//! their contents.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A point in the store's publication history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// When the generation was allocated.
    pub created_at: DateTime<Utc>,
}

impl Generation {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            created_at: Utc::now(),
        }
    }

    /// The generation before anything was published.
    pub fn zero() -> Self {
        Self {
            sequence: 0,
            created_at: DateTime::UNIX_EPOCH,
        }
    }

    pub fn is_newer_than(&self, other: &Generation) -> bool {
        self.sequence > other.sequence
    }

    /// Number of publications between two generations.
    pub fn gap(&self, other: &Generation) -> u64 {
        self.sequence.abs_diff(other.sequence)
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.sequence)
    }
}

/// Allocates generations for one store.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    next: AtomicU64,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next generation.
    pub fn advance(&self) -> Generation {
        Generation::new(self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The most recently allocated sequence number.
    pub fn last(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_is_monotonic() {
        let counter = GenerationCounter::new();
        let first = counter.advance();
        let second = counter.advance();
        assert!(second.is_newer_than(&first));
        assert_eq!(second.gap(&first), 1);
        assert_eq!(counter.last(), 2);
        assert!(first.is_newer_than(&Generation::zero()));
    }

    #[test]
    fn test_display() {
        assert_eq!(Generation::new(7).to_string(), "g7");
    }
}
