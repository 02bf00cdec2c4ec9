//! Reusable N-party rendezvous with a generation counter.
//!
//! The generation counter keeps early arrivals for the next cycle from
//! slipping past waiters of the current one: a waiter snapshots the
//! generation before arriving and spins until it changes. The last arrival
//! resets `arrived` and then bumps the generation with release ordering, so
//! waiters that observe the new generation also observe the reset.

use std::mem;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::segment::{RawRegion, Segment};

#[repr(C)]
struct BarrierHeader {
    arrived: AtomicI32,
    generation: AtomicI32,
    num_participants: i32,
    reserved: i32,
}

const HEADER_SIZE: usize = mem::size_of::<BarrierHeader>();

/// Named reusable cross-process barrier.
#[derive(Clone)]
pub struct Barrier {
    region: RawRegion,
    segment: Segment,
}

impl Barrier {
    /// Create a barrier for `participants` parties.
    pub fn create(segment: &Segment, name: &str, participants: i32) -> Result<Self> {
        if participants <= 0 {
            return Err(Error::InvalidArgument("barrier needs at least one participant"));
        }
        let region = segment.allocate_region(name, HEADER_SIZE as u64)?;
        let header = region.as_ptr().cast::<BarrierHeader>();
        unsafe {
            (*header).arrived.store(0, Ordering::Relaxed);
            (*header).generation.store(0, Ordering::Relaxed);
            (*header).num_participants = participants;
            (*header).reserved = 0;
        }
        Ok(Self {
            region,
            segment: segment.clone(),
        })
    }

    /// Open an existing barrier.
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
    fn header(&self) -> &BarrierHeader {
        unsafe { &*self.region.as_ptr().cast::<BarrierHeader>() }
    }

    /// Arrive and wait until every participant has arrived.
    pub fn wait(&self) {
        let h = self.header();
        let my_generation = h.generation.load(Ordering::Acquire);
        let arrived = h.arrived.fetch_add(1, Ordering::AcqRel) + 1;

        if arrived == h.num_participants {
            h.arrived.store(0, Ordering::Relaxed);
            // Release publishes the reset along with the new generation.
            h.generation.fetch_add(1, Ordering::Release);
            return;
        }

        let mut backoff = Backoff::new();
        while h.generation.load(Ordering::Acquire) == my_generation {
            backoff.snooze();
        }
    }

    /// Arrive and wait, giving up after `timeout`.
    ///
    /// Timeout is sticky: once the deadline passes, the caller withdraws its
    /// arrival and returns `Timeout` even if the barrier released in the same
    /// window. If the last participant arrives during that window the
    /// withdrawal under-counts the next cycle; parties mixing `wait_for`
    /// with `wait` must either accept best-effort phases or coordinate the
    /// timeout path externally.
    pub fn wait_for(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let h = self.header();
        let my_generation = h.generation.load(Ordering::Acquire);
        let arrived = h.arrived.fetch_add(1, Ordering::AcqRel) + 1;

        if arrived == h.num_participants {
            h.arrived.store(0, Ordering::Relaxed);
            h.generation.fetch_add(1, Ordering::Release);
            return Ok(());
        }

        let mut backoff = Backoff::new();
        loop {
            if Instant::now() >= deadline {
                // Withdraw the arrival unless the release already reset the
                // counter.
                loop {
                    let current = h.arrived.load(Ordering::Acquire);
                    if current <= 0 {
                        break;
                    }
                    if h.arrived
                        .compare_exchange_weak(
                            current,
                            current - 1,
                            Ordering::AcqRel,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        break;
                    }
                }
                return Err(Error::Timeout);
            }
            if h.generation.load(Ordering::Acquire) != my_generation {
                return Ok(());
            }
            backoff.snooze();
        }
    }

    /// Parties that have arrived in the current cycle (snapshot).
    pub fn arrived(&self) -> i32 {
        self.header().arrived.load(Ordering::Acquire)
    }

    /// Completed cycles since creation.
    pub fn generation(&self) -> i32 {
        self.header().generation.load(Ordering::Acquire)
    }

    /// Party count fixed at creation.
    pub fn participants(&self) -> i32 {
        self.header().num_participants
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}
