//! Round-robin slot selection.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin cursor over a fixed number of slots.
///
/// The cursor always holds a value in `[0, total)`. Each call to
/// [`advance`](Self::advance) moves it by exactly one position and returns
/// the new value, so the first selection after construction is slot 1
/// (or slot 0 for a single-slot pool).
///
/// Slots under repair are not skipped: selection never looks at slot state.
#[derive(Debug)]
pub struct RoundRobin {
    /// Current position in the rotation.
    current: AtomicUsize,
    /// Total number of slots (used for modulo).
    total: usize,
}

impl RoundRobin {
    /// Create a new round-robin cursor for the given number of slots.
    pub fn new(total: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            total,
        }
    }

    /// Advance the cursor and return the slot it lands on.
    ///
    /// Returns `None` only for an empty rotation. Concurrent callers each
    /// observe a distinct advance; no update is lost.
    pub fn advance(&self) -> Option<usize> {
        if self.total == 0 {
            return None;
        }
        let total = self.total;
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % total))
            .unwrap_or_else(|c| c);
        Some((previous + 1) % total)
    }
}
