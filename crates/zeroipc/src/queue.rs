//! Bounded MPMC FIFO over a circular buffer.
//!
//! # Memory ordering protocol
//!
//! Producers reserve a slot by CAS-advancing `tail`, then copy the element,
//! then issue a release fence; consumers CAS-advance `head`, then read the
//! slot after an acquire fence. The indices increase modulo `capacity`, and
//! one slot stays unused so that `head == tail` means empty and
//! `(tail + 1) % capacity == head` means full: a queue created with
//! capacity `C` stores at most `C − 1` items.
//!
//! ABA on `head`/`tail` is impossible because the indices are monotonic
//! modulo capacity and wrap uniformly. A producer that dies between its CAS
//! and the slot copy leaves a consumed index whose slot contents are
//! undefined; the library offers no recovery (callers needing crash safety
//! layer checksums on top).

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::array::check_elem_align;
use crate::error::{Error, Result};
use crate::invariants::debug_assert_occupancy_bounded;
use crate::pod::Pod;
use crate::segment::{RawRegion, Segment};

#[repr(C)]
struct QueueHeader {
    head: AtomicU32,
    tail: AtomicU32,
    capacity: u32,
    elem_size: u32,
}

const HEADER_SIZE: usize = mem::size_of::<QueueHeader>();

/// Named bounded MPMC lock-free queue.
pub struct Queue<T: Pod> {
    region: RawRegion,
    capacity: u32,
    segment: Segment,
    _marker: PhantomData<T>,
}

unsafe impl<T: Pod> Send for Queue<T> {}
unsafe impl<T: Pod> Sync for Queue<T> {}

impl<T: Pod> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            capacity: self.capacity,
            segment: self.segment.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Pod> Queue<T> {
    /// Create a queue with `capacity` slots (holding `capacity − 1` items).
    pub fn create(segment: &Segment, name: &str, capacity: usize) -> Result<Self> {
        check_elem_align::<T>()?;
        if capacity < 2 {
            return Err(Error::InvalidArgument("queue capacity must be at least 2"));
        }
        if capacity > u32::MAX as usize {
            return Err(Error::Overflow);
        }
        let payload = (capacity as u64)
            .checked_mul(mem::size_of::<T>() as u64)
            .ok_or(Error::Overflow)?;
        let total = payload.checked_add(HEADER_SIZE as u64).ok_or(Error::Overflow)?;

        let region = segment.allocate_region(name, total)?;
        let header = region.as_ptr().cast::<QueueHeader>();
        unsafe {
            (*header).head.store(0, Ordering::Relaxed);
            (*header).tail.store(0, Ordering::Relaxed);
            (*header).capacity = capacity as u32;
            (*header).elem_size = mem::size_of::<T>() as u32;
        }

        Ok(Self {
            region,
            capacity: capacity as u32,
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    /// Open an existing queue, validating the stored element size.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        check_elem_align::<T>()?;
        let region = segment.open_region(name)?;
        if (region.len() as usize) < HEADER_SIZE {
            return Err(Error::TypeMismatch);
        }
        let header = unsafe { &*region.as_ptr().cast::<QueueHeader>() };
        if header.elem_size as usize != mem::size_of::<T>() {
            return Err(Error::TypeMismatch);
        }
        let capacity = header.capacity;

        Ok(Self {
            region,
            capacity,
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &QueueHeader {
        unsafe { &*self.region.as_ptr().cast::<QueueHeader>() }
    }

    #[inline]
    fn slot(&self, index: u32) -> *mut T {
        unsafe {
            self.region
                .as_ptr()
                .add(HEADER_SIZE)
                .cast::<T>()
                .add(index as usize)
        }
    }

    /// Enqueue `value`. Fails with `Full` when only the reserved gap is left.
    pub fn push(&self, value: T) -> Result<()> {
        let h = self.header();
        loop {
            let tail = h.tail.load(Ordering::Relaxed);
            let next = (tail + 1) % self.capacity;
            if next == h.head.load(Ordering::Acquire) {
                return Err(Error::Full);
            }
            if h.tail
                .compare_exchange_weak(tail, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                // The CAS reserved slot `tail` for this producer.
                unsafe { self.slot(tail).write(value) };
                // Order the slot copy before any subsequent publication the
                // consumer might pair an acquire with.
                fence(Ordering::Release);
                return Ok(());
            }
        }
    }

    /// Dequeue the oldest element.
    pub fn pop(&self) -> Result<T> {
        let h = self.header();
        loop {
            let head = h.head.load(Ordering::Relaxed);
            if head == h.tail.load(Ordering::Acquire) {
                return Err(Error::Empty);
            }
            let next = (head + 1) % self.capacity;
            if h.head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                fence(Ordering::Acquire);
                return Ok(unsafe { self.slot(head).read() });
            }
        }
    }

    /// Item count snapshot; may be stale under concurrency.
    pub fn len(&self) -> usize {
        let h = self.header();
        let head = u64::from(h.head.load(Ordering::Acquire));
        let tail = u64::from(h.tail.load(Ordering::Acquire));
        let capacity = u64::from(self.capacity);
        let len = (tail + capacity - head) % capacity;
        debug_assert_occupancy_bounded!(len, capacity - 1);
        len as usize
    }

    pub fn is_empty(&self) -> bool {
        let h = self.header();
        h.head.load(Ordering::Acquire) == h.tail.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        let h = self.header();
        let tail = h.tail.load(Ordering::Acquire);
        (tail + 1) % self.capacity == h.head.load(Ordering::Acquire)
    }

    /// Slot count chosen at creation (maximum occupancy is one less).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}
