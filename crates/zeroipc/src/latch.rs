//! Single-use countdown rendezvous.
//!
//! The count only moves toward zero and stays there; a latch cannot be
//! reset. Waiters spin with backoff until the count reaches zero.

use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::segment::{RawRegion, Segment};

#[repr(C)]
struct LatchHeader {
    count: AtomicI32,
    initial_count: i32,
}

const HEADER_SIZE: usize = mem::size_of::<LatchHeader>();

/// Named single-use cross-process latch.
#[derive(Clone)]
pub struct Latch {
    region: RawRegion,
    segment: Segment,
}

impl Latch {
    /// Create a latch that opens after `count` total count-downs.
    pub fn create(segment: &Segment, name: &str, count: i32) -> Result<Self> {
        if count <= 0 {
            return Err(Error::InvalidArgument("latch count must be positive"));
        }
        let region = segment.allocate_region(name, HEADER_SIZE as u64)?;
        let header = region.as_ptr().cast::<LatchHeader>();
        unsafe {
            (*header).count.store(count, Ordering::Relaxed);
            (*header).initial_count = count;
        }
        Ok(Self {
            region,
            segment: segment.clone(),
        })
    }

    /// Open an existing latch.
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
    fn header(&self) -> &LatchHeader {
        unsafe { &*self.region.as_ptr().cast::<LatchHeader>() }
    }

    /// Count down by `n` (saturating at zero). `n` must be positive.
    pub fn count_down(&self, n: i32) -> Result<()> {
        if n <= 0 {
            return Err(Error::InvalidArgument("count_down needs a positive amount"));
        }
        let h = self.header();
        loop {
            let current = h.count.load(Ordering::Relaxed);
            if current == 0 {
                return Ok(());
            }
            let next = (current - n).max(0);
            if h.count
                .compare_exchange_weak(current, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Whether the latch has opened.
    pub fn try_wait(&self) -> bool {
        self.header().count.load(Ordering::Acquire) == 0
    }

    /// Spin until the count reaches zero.
    pub fn wait(&self) {
        let mut backoff = Backoff::new();
        while !self.try_wait() {
            backoff.snooze();
        }
    }

    /// Spin until the count reaches zero or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new();
        while !self.try_wait() {
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            backoff.snooze();
        }
        Ok(())
    }

    /// Remaining count.
    pub fn count(&self) -> i32 {
        self.header().count.load(Ordering::Acquire)
    }

    /// Count chosen at creation.
    pub fn initial(&self) -> i32 {
        self.header().initial_count
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}
