//! Codata Abstractions for zeroipc
//!
//! Higher-level shared-memory abstractions built on the `zeroipc` containers:
//!
//! - [`Future`] — single-assignment cell: one process computes, any number
//!   wait for the same outcome
//! - [`Lazy`] — memoizing thunk with an inline computation descriptor,
//!   evaluated at most once per epoch
//! - [`Channel`] — CSP rendezvous (unbuffered) or bounded queue (buffered),
//!   with close-then-drain semantics
//! - [`Stream`] — append-only sequence over a ring, with pull-style
//!   `map`/`filter`/`take`/`skip`/`fold` transformers
//!
//! All blocking paths are user-space spin waits with exponential backoff;
//! every one of them has a `try_*` or `*_for`/`*_timeout` variant.
//!
//! # Example
//!
//! ```no_run
//! use zeroipc::Segment;
//! use zeroipc_codata::Future;
//!
//! // Producer process
//! let seg = Segment::create("/simulation", 1 << 20, 64)?;
//! let energy = Future::<f64>::create(&seg, "energy")?;
//! energy.set_value(3.14159);
//!
//! // Consumer process
//! let seg = Segment::attach("/simulation")?;
//! let energy = Future::<f64>::open(&seg, "energy")?;
//! assert_eq!(energy.get()?, 3.14159);
//! # Ok::<(), zeroipc_codata::CodataError>(())
//! ```

mod channel;
mod error;
mod future;
mod lazy;
mod stream;

pub use channel::{Channel, ChannelIter};
pub use error::{CodataError, Result};
pub use future::{Future, FutureState};
pub use lazy::{Lazy, LazyOperand};
pub use stream::Stream;

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::atomic::{AtomicU32, Ordering};

    use zeroipc::Segment;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    /// Segment with a unique OS name, unlinked on drop.
    pub(crate) struct TestSegment {
        seg: Segment,
        name: String,
    }

    impl TestSegment {
        pub(crate) fn new(tag: &str) -> Self {
            let name = format!(
                "/zic_{tag}_{}_{}",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed)
            );
            let seg = Segment::create(&name, 1 << 20, 64).expect("create test segment");
            Self { seg, name }
        }

        /// Second mapping of the same segment, through the attach path.
        pub(crate) fn attach(&self) -> Segment {
            Segment::attach(&self.name).expect("attach test segment")
        }
    }

    impl Drop for TestSegment {
        fn drop(&mut self) {
            let _ = Segment::unlink(&self.name);
        }
    }

    impl std::ops::Deref for TestSegment {
        type Target = Segment;

        fn deref(&self) -> &Segment {
            &self.seg
        }
    }
}
