//! Property-based tests for the container invariants.
//!
//! Coverage:
//! - Queue: conservation and bounded occupancy under arbitrary op sequences
//! - Stack: LIFO order against a model, occupancy bounds
//! - Ring: SPSC conservation (written == read + buffered)
//! - Map: key uniqueness and update semantics against a model
//! - Pool: allocated + free == capacity at quiescence
//! - Latch: monotone non-increasing count

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use proptest::prelude::*;
use zeroipc::{Latch, Map, Pool, Queue, Ring, Segment, Stack};

static COUNTER: AtomicU32 = AtomicU32::new(0);

struct TestSegment {
    seg: Segment,
    name: String,
}

impl TestSegment {
    fn new(tag: &str) -> Self {
        let name = format!(
            "/zi_prop_{tag}_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let seg = Segment::create(&name, 1 << 20, 64).expect("create test segment");
        Self { seg, name }
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

proptest! {
    /// Successful pushes minus successful pops equals len() at quiescence,
    /// and occupancy never exceeds capacity − 1.
    #[test]
    fn prop_queue_conservation(ops in prop::collection::vec(any::<bool>(), 0..200)) {
        let shm = TestSegment::new("qcons");
        let queue = Queue::<u64>::create(&shm, "q", 16).unwrap();

        let mut pushed = 0usize;
        let mut popped = 0usize;
        for (i, is_push) in ops.into_iter().enumerate() {
            if is_push {
                if queue.push(i as u64).is_ok() {
                    pushed += 1;
                }
            } else if queue.pop().is_ok() {
                popped += 1;
            }
            prop_assert!(queue.len() <= 15, "occupancy {} exceeds bound", queue.len());
        }
        prop_assert_eq!(queue.len(), pushed - popped);
    }

    /// Single-threaded FIFO: whatever goes in comes out in order.
    #[test]
    fn prop_queue_fifo_order(values in prop::collection::vec(any::<u64>(), 0..15)) {
        let shm = TestSegment::new("qfifo");
        let queue = Queue::<u64>::create(&shm, "q", 16).unwrap();

        for &v in &values {
            queue.push(v).unwrap();
        }
        for &v in &values {
            prop_assert_eq!(queue.pop().unwrap(), v);
        }
        prop_assert!(queue.is_empty());
    }

    /// Stack mirrors a Vec model through arbitrary push/pop sequences.
    #[test]
    fn prop_stack_matches_model(ops in prop::collection::vec(any::<Option<u32>>(), 0..200)) {
        let shm = TestSegment::new("stmodel");
        let stack = Stack::<u32>::create(&shm, "s", 32).unwrap();
        let mut model: Vec<u32> = Vec::new();

        for op in ops {
            match op {
                Some(v) => {
                    let pushed = stack.push(v).is_ok();
                    if model.len() < 32 {
                        prop_assert!(pushed);
                        model.push(v);
                    } else {
                        prop_assert!(!pushed);
                    }
                }
                None => {
                    let popped = stack.pop().ok();
                    prop_assert_eq!(popped, model.pop());
                }
            }
            prop_assert_eq!(stack.len(), model.len());
            prop_assert_eq!(stack.top(), model.last().copied());
        }
    }

    /// Ring conservation: every element written is read back exactly once,
    /// in order, with occupancy bounded by capacity.
    #[test]
    fn prop_ring_conservation(chunks in prop::collection::vec(
        prop::collection::vec(any::<u32>(), 0..12), 0..30))
    {
        let shm = TestSegment::new("rcons");
        let ring = Ring::<u32>::create(&shm, "r", 16).unwrap();

        let mut expected = Vec::new();
        let mut read_back = Vec::new();
        for chunk in chunks {
            let written = ring.write_bulk(&chunk);
            expected.extend_from_slice(&chunk[..written]);
            prop_assert!(ring.available() <= 16);

            let mut out = vec![0u32; 8];
            let n = ring.read_bulk(&mut out);
            read_back.extend_from_slice(&out[..n]);
        }
        while let Some(v) = ring.read() {
            read_back.push(v);
        }
        prop_assert_eq!(read_back, expected);
        prop_assert!(ring.is_empty());
    }

    /// Map mirrors a HashMap model: update semantics, erase, uniqueness.
    #[test]
    fn prop_map_matches_model(ops in prop::collection::vec(
        (any::<u8>(), any::<u16>(), any::<bool>()), 0..150))
    {
        let shm = TestSegment::new("mmodel");
        let map = Map::<u8, u16>::create(&shm, "m", 512).unwrap();
        let mut model: HashMap<u8, u16> = HashMap::new();

        for (key, value, is_insert) in ops {
            if is_insert {
                let fresh = map.insert(&key, &value).unwrap();
                let model_fresh = model.insert(key, value).is_none();
                prop_assert_eq!(fresh, model_fresh);
            } else {
                prop_assert_eq!(map.erase(&key), model.remove(&key).is_some());
            }
            prop_assert_eq!(map.len(), model.len());
        }
        for (key, value) in &model {
            prop_assert_eq!(map.get(key), Some(*value));
        }
        // Uniqueness: the occupied slots enumerate the model exactly.
        let mut entries = map.entries();
        entries.sort_unstable();
        let mut expected: Vec<_> = model.into_iter().collect();
        expected.sort_unstable();
        prop_assert_eq!(entries, expected);
    }

    /// Pool accounting returns to baseline after arbitrary interleavings.
    #[test]
    fn prop_pool_accounting(ops in prop::collection::vec(any::<bool>(), 0..100)) {
        let shm = TestSegment::new("pacct");
        let pool = Pool::<u64>::create(&shm, "p", 8).unwrap();
        let mut held: Vec<u32> = Vec::new();

        for acquire in ops {
            if acquire {
                match pool.acquire() {
                    Some(h) => held.push(h),
                    None => prop_assert_eq!(held.len(), 8),
                }
            } else if let Some(h) = held.pop() {
                pool.release(h).unwrap();
            }
            prop_assert_eq!(pool.allocated(), held.len());
            prop_assert_eq!(pool.available(), 8 - held.len());
        }
        for h in held.drain(..) {
            pool.release(h).unwrap();
        }
        prop_assert_eq!(pool.allocated(), 0);
    }

    /// Latch count is non-increasing and sticks at zero.
    #[test]
    fn prop_latch_monotone(initial in 1i32..50, downs in prop::collection::vec(1i32..10, 0..30)) {
        let shm = TestSegment::new("latch");
        let latch = Latch::create(&shm, "l", initial).unwrap();

        let mut previous = latch.count();
        for n in downs {
            latch.count_down(n).unwrap();
            let current = latch.count();
            prop_assert!(current <= previous, "count increased: {previous} -> {current}");
            prop_assert!(current >= 0);
            previous = current;
        }
        latch.count_down(initial).unwrap();
        prop_assert_eq!(latch.count(), 0);
        prop_assert!(latch.try_wait());
    }
}
