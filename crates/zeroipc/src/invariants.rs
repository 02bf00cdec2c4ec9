//! Debug assertion macros for container invariants.
//!
//! Active only in debug builds (`debug_assert!`), so there is zero overhead
//! in release builds. Each macro names the invariant it guards so a failing
//! stress test points straight at the broken protocol step.

/// Ring positions are total byte counters; the writer never falls behind the
/// reader.
macro_rules! debug_assert_positions_ordered {
    ($write:expr, $read:expr) => {
        debug_assert!(
            $write >= $read,
            "ring write position {} behind read position {}",
            $write,
            $read
        )
    };
}

/// Occupancy derived from two indices never exceeds the container capacity.
macro_rules! debug_assert_occupancy_bounded {
    ($len:expr, $cap:expr) => {
        debug_assert!(
            $len <= $cap,
            "occupancy {} exceeds capacity {}",
            $len,
            $cap
        )
    };
}

/// A pool handle always indexes a real node.
macro_rules! debug_assert_handle_in_range {
    ($handle:expr, $cap:expr) => {
        debug_assert!(
            $handle < $cap,
            "pool handle {} out of range (capacity {})",
            $handle,
            $cap
        )
    };
}

pub(crate) use {
    debug_assert_handle_in_range, debug_assert_occupancy_bounded, debug_assert_positions_ordered,
};
