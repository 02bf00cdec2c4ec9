//! Counting semaphore over a shared atomic.
//!
//! Three shapes fall out of `max_count`: binary (`max_count == 1`, a mutex),
//! counting (`max_count == N`, a permit pool), and unbounded
//! (`max_count == 0`). Waits are user-space spins with the 1 µs → 1 ms
//! exponential backoff; a `waiting` counter is kept for observability.

use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::segment::{RawRegion, Segment};

#[repr(C)]
struct SemaphoreHeader {
    count: AtomicI32,
    waiting: AtomicI32,
    max_count: i32, // 0 = unbounded
    reserved: i32,
}

const HEADER_SIZE: usize = mem::size_of::<SemaphoreHeader>();

/// Named cross-process counting semaphore.
#[derive(Clone)]
pub struct Semaphore {
    region: RawRegion,
    segment: Segment,
}

impl Semaphore {
    /// Create a semaphore with `initial` permits and an optional upper bound
    /// (`max_count == 0` means unbounded).
    pub fn create(segment: &Segment, name: &str, initial: i32, max_count: i32) -> Result<Self> {
        if initial < 0 {
            return Err(Error::InvalidArgument("initial count must be non-negative"));
        }
        if max_count < 0 {
            return Err(Error::InvalidArgument("max count must be non-negative"));
        }
        if max_count > 0 && initial > max_count {
            return Err(Error::InvalidArgument("initial count exceeds max count"));
        }

        let region = segment.allocate_region(name, HEADER_SIZE as u64)?;
        let header = region.as_ptr().cast::<SemaphoreHeader>();
        unsafe {
            (*header).count.store(initial, Ordering::Relaxed);
            (*header).waiting.store(0, Ordering::Relaxed);
            (*header).max_count = max_count;
            (*header).reserved = 0;
        }

        Ok(Self {
            region,
            segment: segment.clone(),
        })
    }

    /// Open an existing semaphore.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        let region = segment.open_region(name)?;
        if (region.len() as usize) < HEADER_SIZE {
            return Err(Error::TypeMismatch);
        }
        Ok(Self {
            region,
            segment: segment.clone(),
        })
    }

    #[inline]
    fn header(&self) -> &SemaphoreHeader {
        unsafe { &*self.region.as_ptr().cast::<SemaphoreHeader>() }
    }

    fn try_decrement(&self) -> bool {
        let h = self.header();
        let current = h.count.load(Ordering::Acquire);
        current > 0
            && h.count
                .compare_exchange_weak(current, current - 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
    }

    /// Acquire one permit, spinning until one is available.
    pub fn acquire(&self) {
        let h = self.header();
        h.waiting.fetch_add(1, Ordering::Relaxed);
        let mut backoff = Backoff::new();
        loop {
            if self.try_decrement() {
                h.waiting.fetch_sub(1, Ordering::Relaxed);
                return;
            }
            backoff.snooze();
        }
    }

    /// Acquire one permit without blocking.
    pub fn try_acquire(&self) -> bool {
        // A failed weak CAS under contention is just "not this time".
        self.try_decrement()
    }

    /// Acquire one permit, giving up after `timeout`.
    pub fn acquire_for(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let h = self.header();
        h.waiting.fetch_add(1, Ordering::Relaxed);
        let mut backoff = Backoff::new();
        loop {
            if self.try_decrement() {
                h.waiting.fetch_sub(1, Ordering::Relaxed);
                return Ok(());
            }
            if Instant::now() >= deadline {
                h.waiting.fetch_sub(1, Ordering::Relaxed);
                return Err(Error::Timeout);
            }
            backoff.snooze();
        }
    }

    /// Return one permit. Fails with `Overflow` when a bound would be
    /// exceeded.
    pub fn release(&self) -> Result<()> {
        let h = self.header();
        let max = h.max_count;
        loop {
            let current = h.count.load(Ordering::Relaxed);
            if max > 0 && current >= max {
                return Err(Error::Overflow);
            }
            if h.count
                .compare_exchange_weak(current, current + 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Acquire a permit and hold it for the guard's lifetime.
    pub fn guard(&self) -> SemaphoreGuard<'_> {
        self.acquire();
        SemaphoreGuard { semaphore: self }
    }

    /// Current permit count.
    pub fn count(&self) -> i32 {
        self.header().count.load(Ordering::Acquire)
    }

    /// Number of callers currently spinning in `acquire`.
    pub fn waiting(&self) -> i32 {
        self.header().waiting.load(Ordering::Acquire)
    }

    /// Configured bound (0 = unbounded).
    pub fn max_count(&self) -> i32 {
        self.header().max_count
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}

/// RAII permit: released on drop.
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        // Releasing what we acquired cannot overflow a bound unless someone
        // else released permits they never held.
        let _ = self.semaphore.release();
    }
}
