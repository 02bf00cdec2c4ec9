//! ZeroIPC - Zero-Copy Shared-Memory Data Structures
//!
//! A family of concurrent, zero-copy data structures laid out in a POSIX
//! shared-memory segment so that unrelated processes can exchange data
//! without serialization. Every structure is addressed by a short
//! human-readable name; new processes attach to an existing segment and
//! bind to structures by name, with the stored element size validated
//! against the opener's type.
//!
//! # Key Features
//!
//! - Named metadata table at the head of every segment (bump-allocated arena)
//! - Lock-free containers: MPMC queue, LIFO stack, SPSC ring, linear-probe
//!   hash map/set, free-list object pool, atomic bitset
//! - Process-safe synchronization: counting semaphore, reusable barrier,
//!   single-use latch
//! - All waits are user-space spins with exponential backoff (1 µs → 1 ms)
//!
//! # Example
//!
//! ```no_run
//! use zeroipc::{Array, Queue, Segment};
//!
//! // Creator process
//! let seg = Segment::create("/simulation", 1 << 20, 64)?;
//! let counts = Array::<i32>::create(&seg, "counts", 4)?;
//! counts.set(0, 10);
//!
//! let work = Queue::<u64>::create(&seg, "work", 1024)?;
//! work.push(42)?;
//!
//! // Any other process
//! let seg = Segment::attach("/simulation")?;
//! let counts = Array::<i32>::open(&seg, "counts")?;
//! assert_eq!(counts.get(0), 10);
//! # Ok::<(), zeroipc::Error>(())
//! ```
//!
//! Dropping a handle only unmaps the segment; the OS object lives until
//! [`Segment::unlink`]. Erasing a table entry never reclaims its bytes.

mod array;
mod backoff;
mod barrier;
mod bitset;
mod error;
mod invariants;
mod latch;
mod map;
mod pod;
mod pool;
mod queue;
mod ring;
mod segment;
mod semaphore;
mod set;
mod shm;
mod stack;
mod table;

pub use array::Array;
pub use backoff::Backoff;
pub use barrier::Barrier;
pub use bitset::Bitset;
pub use error::{Error, Result};
pub use latch::Latch;
pub use map::Map;
pub use pod::{bytes_of, hash_bytes, Key, Pod};
pub use pool::Pool;
pub use queue::Queue;
pub use ring::Ring;
pub use segment::{RawRegion, Segment, SegmentEntry};
pub use semaphore::{Semaphore, SemaphoreGuard};
pub use set::Set;
pub use stack::Stack;
pub use table::MAX_NAME_LEN;
