//! Logical clocks for merge ordering.
//!
//! A clock is a Lamport counter paired with the origin replica that produced
//! it. Ordering is lexicographic on `(counter, origin)`, so two writes never
//! compare equal unless they came from the same fragment.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Largest counter a fragment may carry. Counters stay exact for clients
/// that hold them as JSON numbers.
pub const MAX_COUNTER: u64 = (1 << 53) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Clock {
    pub counter: u64,
    pub origin: Uuid,
}

impl Clock {
    #[must_use]
    pub fn new(counter: u64, origin: Uuid) -> Self {
        Self { counter, origin }
    }

    /// The lowest possible clock. Migrated legacy state is stamped with it so
    /// any live edit outranks it.
    #[must_use]
    pub fn floor() -> Self {
        Self { counter: 0, origin: Uuid::nil() }
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.origin)
    }
}

/// True when `(clock, value)` should replace `(current_clock, current_value)`.
///
/// Equal clocks mean both writes came from the same replica at the same
/// counter; the value comparison keeps the result independent of arrival order.
pub(crate) fn wins<T: Ord + ?Sized>(clock: Clock, value: &T, current_clock: Clock, current_value: &T) -> bool {
    match clock.cmp(&current_clock) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => value > current_value,
    }
}
