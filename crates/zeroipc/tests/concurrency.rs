//! Threaded stress tests for the lock-free containers and the
//! synchronization primitives. Multi-process use is simulated by attaching
//! the same OS segment a second time (a second mapping through the attach
//! path) and by sharing handles across threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

use zeroipc::{Array, Barrier, Latch, Map, Pool, Queue, Ring, Segment, Semaphore, Stack};

static COUNTER: AtomicU32 = AtomicU32::new(0);

struct TestSegment {
    seg: Segment,
    name: String,
}

impl TestSegment {
    fn new(tag: &str) -> Self {
        let name = format!(
            "/zi_conc_{tag}_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let seg = Segment::create(&name, 4 << 20, 64).expect("create test segment");
        Self { seg, name }
    }

    fn attach(&self) -> Segment {
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

/// 4 producers × 1000 values, 4 consumers: the popped multiset equals four
/// copies of 0..1000 and the queue is empty at quiescence.
#[test]
fn test_queue_mpmc_fairness() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 1000;

    let shm = TestSegment::new("mpmc");
    let queue = Queue::<i32>::create(&shm, "q", 1024).unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let attached = shm.attach();
            thread::spawn(move || {
                let q = Queue::<i32>::open(&attached, "q").unwrap();
                for v in 0..PER_PRODUCER as i32 {
                    while q.push(v).is_err() {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let attached = shm.attach();
            thread::spawn(move || {
                let q = Queue::<i32>::open(&attached, "q").unwrap();
                let mut got = Vec::with_capacity(PER_PRODUCER);
                while got.len() < PER_PRODUCER {
                    match q.pop() {
                        Ok(v) => got.push(v),
                        Err(_) => thread::yield_now(),
                    }
                }
                got
            })
        })
        .collect();

    for p in producers {
        p.join().unwrap();
    }
    let mut counts: HashMap<i32, usize> = HashMap::new();
    for c in consumers {
        for v in c.join().unwrap() {
            *counts.entry(v).or_default() += 1;
        }
    }

    assert!(queue.is_empty());
    assert_eq!(counts.len(), PER_PRODUCER);
    assert!(counts.values().all(|&n| n == PRODUCERS));
}

/// Per-producer FIFO: with one producer pushing sequentially and one
/// consumer draining, values arrive in push order.
#[test]
fn test_queue_spsc_preserves_order() {
    let shm = TestSegment::new("spsc_q");
    let queue = Queue::<u64>::create(&shm, "q", 64).unwrap();

    let producer = {
        let q = queue.clone();
        thread::spawn(move || {
            for v in 0..10_000u64 {
                while q.push(v).is_err() {
                    thread::yield_now();
                }
            }
        })
    };

    let mut expected = 0u64;
    while expected < 10_000 {
        if let Ok(v) = queue.pop() {
            assert_eq!(v, expected);
            expected += 1;
        } else {
            thread::yield_now();
        }
    }
    producer.join().unwrap();
}

/// Concurrent pushes and pops conserve elements: everything pushed is popped
/// exactly once.
#[test]
fn test_stack_concurrent_conservation() {
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 500;

    let shm = TestSegment::new("stack");
    let stack = Stack::<u64>::create(&shm, "s", 4096).unwrap();

    let pushers: Vec<_> = (0..THREADS)
        .map(|t| {
            let s = stack.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    while s.push(t * PER_THREAD + i).is_err() {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();
    for p in pushers {
        p.join().unwrap();
    }

    let mut seen = vec![false; (THREADS * PER_THREAD) as usize];
    while let Ok(v) = stack.pop() {
        let idx = v as usize;
        assert!(!seen[idx], "value {v} popped twice");
        seen[idx] = true;
    }
    assert!(seen.iter().all(|&s| s));
    assert!(stack.is_empty());
}

/// SPSC ring across a second mapping: bytes written equal bytes read, in
/// order.
#[test]
fn test_ring_spsc_cross_mapping() {
    const TOTAL: u64 = 50_000;

    let shm = TestSegment::new("ring");
    let ring = Ring::<u64>::create(&shm, "r", 256).unwrap();

    let attached = shm.attach();
    let producer = thread::spawn(move || {
        let r = Ring::<u64>::open(&attached, "r").unwrap();
        for v in 0..TOTAL {
            while r.write(v).is_err() {
                thread::yield_now();
            }
        }
    });

    let mut expected = 0u64;
    while expected < TOTAL {
        match ring.read() {
            Some(v) => {
                assert_eq!(v, expected);
                expected += 1;
            }
            None => thread::yield_now(),
        }
    }
    producer.join().unwrap();
    assert!(ring.is_empty());
}

/// Concurrent same-key inserts never produce duplicate occupied slots.
#[test]
fn test_map_concurrent_same_keys() {
    const THREADS: u32 = 4;

    let shm = TestSegment::new("map");
    let map = Map::<u32, u32>::create(&shm, "m", 256).unwrap();

    let writers: Vec<_> = (0..THREADS)
        .map(|t| {
            let m = map.clone();
            thread::spawn(move || {
                for key in 0..64u32 {
                    m.insert(&key, &(t * 1000 + key)).unwrap();
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    assert_eq!(map.len(), 64);
    let entries = map.entries();
    assert_eq!(entries.len(), 64);
    for key in 0..64u32 {
        // Last writer wins; the value is one of the contenders' writes.
        let value = map.get(&key).unwrap();
        assert_eq!(value % 1000, key);
    }
}

/// 4 threads × N cycles: every thread observes every generation, and the
/// phase array written before each wait is fully visible after it.
#[test]
fn test_barrier_phases() {
    const PARTIES: i32 = 4;
    const CYCLES: i32 = 25;

    let shm = TestSegment::new("barrier");
    Barrier::create(&shm, "b", PARTIES).unwrap();
    Array::<i32>::create(&shm, "phase", PARTIES as usize).unwrap();

    let workers: Vec<_> = (0..PARTIES)
        .map(|t| {
            let attached = shm.attach();
            thread::spawn(move || {
                let barrier = Barrier::open(&attached, "b").unwrap();
                let phase = Array::<i32>::open(&attached, "phase").unwrap();
                for cycle in 0..CYCLES {
                    phase.set(t as usize, cycle);
                    barrier.wait();
                    // Everyone wrote this cycle's marker before the release.
                    for other in 0..PARTIES as usize {
                        assert!(phase.get(other) >= cycle);
                    }
                }
                barrier.generation()
            })
        })
        .collect();

    for w in workers {
        assert_eq!(w.join().unwrap(), CYCLES);
    }
}

/// Bounded semaphore never exceeds its bound and never goes negative.
#[test]
fn test_semaphore_bound_under_stress() {
    const PERMITS: i32 = 3;

    let shm = TestSegment::new("sem");
    let sem = Semaphore::create(&shm, "s", PERMITS, PERMITS).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let sem = sem.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    sem.acquire();
                    let observed = sem.count();
                    assert!((0..PERMITS).contains(&observed));
                    sem.release().unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(sem.count(), PERMITS);
}

/// Latch releases every waiter exactly when the workers finish.
#[test]
fn test_latch_gates_workers() {
    const WORKERS: i32 = 4;

    let shm = TestSegment::new("latch");
    let latch = Latch::create(&shm, "l", WORKERS).unwrap();
    let done = Array::<u32>::create(&shm, "done", WORKERS as usize).unwrap();

    let workers: Vec<_> = (0..WORKERS)
        .map(|t| {
            let latch = latch.clone();
            let done = done.clone();
            thread::spawn(move || {
                done.set(t as usize, 1);
                latch.count_down(1).unwrap();
            })
        })
        .collect();

    latch.wait();
    for t in 0..WORKERS as usize {
        assert_eq!(done.get(t), 1);
    }
    for w in workers {
        w.join().unwrap();
    }
}

/// Pool recycling under contention: accounting returns to baseline and no
/// handle is ever held by two threads at once.
#[test]
fn test_pool_concurrent_recycling() {
    let shm = TestSegment::new("pool");
    let pool = Pool::<u64>::create(&shm, "p", 16).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                for round in 0..500u64 {
                    if let Some(h) = pool.acquire() {
                        let tag = t as u64 * 1_000_000 + round;
                        pool.write(h, tag).unwrap();
                        thread::yield_now();
                        // Nobody else wrote this node while we held it.
                        assert_eq!(pool.read(h).unwrap(), tag);
                        pool.release(h).unwrap();
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(pool.allocated(), 0);
    assert_eq!(pool.acquire_batch(16).len(), 16);
}
