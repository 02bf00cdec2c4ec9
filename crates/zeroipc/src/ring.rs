//! Bounded SPSC byte ring with element granularity.
//!
//! # Memory ordering protocol
//!
//! The classic Lamport ring: `write_pos` and `read_pos` are **total** byte
//! counters (u64, never wrapped except when indexing), so available data is
//! `write_pos − read_pos` and the ABA problem cannot arise. The single
//! producer is the only writer of `write_pos`; the single consumer is the
//! only writer of `read_pos`. Each side loads the counterpart index with
//! acquire and publishes its own with release, which orders the buffer
//! copies between them.
//!
//! Bulk transfers split across the wrap boundary with a second memcpy.
//! Deployments needing multi-producer behavior should use a `Queue`; the
//! ring stays SPSC to retain bulk-copy speed.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::array::check_elem_align;
use crate::error::{Error, Result};
use crate::invariants::debug_assert_positions_ordered;
use crate::pod::Pod;
use crate::segment::{RawRegion, Segment};

#[repr(C)]
struct RingHeader {
    write_pos: AtomicU64,
    read_pos: AtomicU64,
    capacity: u32, // bytes; multiple of elem_size
    elem_size: u32,
}

const HEADER_SIZE: usize = mem::size_of::<RingHeader>();

/// Named SPSC ring buffer of `T`.
pub struct Ring<T: Pod> {
    region: RawRegion,
    capacity_bytes: u64,
    segment: Segment,
    _marker: PhantomData<T>,
}

unsafe impl<T: Pod> Send for Ring<T> {}
unsafe impl<T: Pod> Sync for Ring<T> {}

impl<T: Pod> Clone for Ring<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            capacity_bytes: self.capacity_bytes,
            segment: self.segment.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Pod> Ring<T> {
    const ELEM: usize = mem::size_of::<T>();

    /// Create a ring holding up to `capacity` elements.
    pub fn create(segment: &Segment, name: &str, capacity: usize) -> Result<Self> {
        check_elem_align::<T>()?;
        if Self::ELEM == 0 {
            return Err(Error::NotSupported);
        }
        if capacity == 0 {
            return Err(Error::InvalidArgument("ring capacity must be non-zero"));
        }
        let bytes = (capacity as u64)
            .checked_mul(Self::ELEM as u64)
            .ok_or(Error::Overflow)?;
        if bytes > u64::from(u32::MAX) {
            return Err(Error::Overflow);
        }
        let total = bytes + HEADER_SIZE as u64;

        let region = segment.allocate_region(name, total)?;
        let header = region.as_ptr().cast::<RingHeader>();
        unsafe {
            (*header).write_pos.store(0, Ordering::Relaxed);
            (*header).read_pos.store(0, Ordering::Relaxed);
            (*header).capacity = bytes as u32;
            (*header).elem_size = Self::ELEM as u32;
        }

        Ok(Self {
            region,
            capacity_bytes: bytes,
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    /// Open an existing ring, validating the stored element size.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        check_elem_align::<T>()?;
        if Self::ELEM == 0 {
            return Err(Error::NotSupported);
        }
        let region = segment.open_region(name)?;
        if (region.len() as usize) < HEADER_SIZE {
            return Err(Error::TypeMismatch);
        }
        let header = unsafe { &*region.as_ptr().cast::<RingHeader>() };
        if header.elem_size as usize != Self::ELEM {
            return Err(Error::TypeMismatch);
        }

        Ok(Self {
            region,
            capacity_bytes: u64::from(header.capacity),
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        unsafe { &*self.region.as_ptr().cast::<RingHeader>() }
    }

    #[inline]
    fn buffer(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(HEADER_SIZE) }
    }

    /// Copy `len` bytes into the ring at total position `pos`, splitting
    /// across the wrap boundary when needed.
    fn copy_in(&self, pos: u64, src: *const u8, len: usize) {
        let offset = (pos % self.capacity_bytes) as usize;
        let first = len.min(self.capacity_bytes as usize - offset);
        unsafe {
            ptr::copy_nonoverlapping(src, self.buffer().add(offset), first);
            if first < len {
                ptr::copy_nonoverlapping(src.add(first), self.buffer(), len - first);
            }
        }
    }

    fn copy_out(&self, pos: u64, dst: *mut u8, len: usize) {
        let offset = (pos % self.capacity_bytes) as usize;
        let first = len.min(self.capacity_bytes as usize - offset);
        unsafe {
            ptr::copy_nonoverlapping(self.buffer().add(offset), dst, first);
            if first < len {
                ptr::copy_nonoverlapping(self.buffer(), dst.add(first), len - first);
            }
        }
    }

    /// Append one element; fails with `Full` when free space is short.
    pub fn write(&self, value: T) -> Result<()> {
        let h = self.header();
        let write_pos = h.write_pos.load(Ordering::Relaxed);
        let read_pos = h.read_pos.load(Ordering::Acquire);
        debug_assert_positions_ordered!(write_pos, read_pos);

        if self.capacity_bytes - (write_pos - read_pos) < Self::ELEM as u64 {
            return Err(Error::Full);
        }
        self.copy_in(write_pos, (&value as *const T).cast(), Self::ELEM);
        h.write_pos
            .store(write_pos + Self::ELEM as u64, Ordering::Release);
        Ok(())
    }

    /// Append one element, unconditionally advancing `read_pos` over the
    /// oldest element when the ring is full (drop-oldest).
    ///
    /// This makes the producer a second writer of `read_pos`; only use it
    /// when the consumer tolerates losing the element it was about to read.
    pub fn overwrite_push(&self, value: T) {
        let h = self.header();
        let write_pos = h.write_pos.load(Ordering::Relaxed);
        loop {
            let read_pos = h.read_pos.load(Ordering::Acquire);
            if self.capacity_bytes - (write_pos - read_pos) >= Self::ELEM as u64 {
                break;
            }
            // Drop the oldest element. CAS because the consumer may be
            // advancing read_pos at the same time.
            let _ = h.read_pos.compare_exchange(
                read_pos,
                read_pos + Self::ELEM as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        self.copy_in(write_pos, (&value as *const T).cast(), Self::ELEM);
        h.write_pos
            .store(write_pos + Self::ELEM as u64, Ordering::Release);
    }

    /// Pop the oldest element, or `None` when empty.
    pub fn read(&self) -> Option<T> {
        let h = self.header();
        let read_pos = h.read_pos.load(Ordering::Relaxed);
        let write_pos = h.write_pos.load(Ordering::Acquire);

        if write_pos - read_pos < Self::ELEM as u64 {
            return None;
        }
        let mut value = mem::MaybeUninit::<T>::uninit();
        self.copy_out(read_pos, value.as_mut_ptr().cast(), Self::ELEM);
        h.read_pos
            .store(read_pos + Self::ELEM as u64, Ordering::Release);
        Some(unsafe { value.assume_init() })
    }

    /// Append as many whole elements from `values` as fit; returns the count
    /// transferred.
    pub fn write_bulk(&self, values: &[T]) -> usize {
        if values.is_empty() {
            return 0;
        }
        let h = self.header();
        let write_pos = h.write_pos.load(Ordering::Relaxed);
        let read_pos = h.read_pos.load(Ordering::Acquire);

        let free = self.capacity_bytes - (write_pos - read_pos);
        let count = values.len().min((free / Self::ELEM as u64) as usize);
        if count == 0 {
            return 0;
        }
        let bytes = count * Self::ELEM;
        self.copy_in(write_pos, values.as_ptr().cast(), bytes);
        h.write_pos.store(write_pos + bytes as u64, Ordering::Release);
        count
    }

    /// Pop up to `out.len()` elements into `out`; returns the count
    /// transferred.
    pub fn read_bulk(&self, out: &mut [T]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let h = self.header();
        let read_pos = h.read_pos.load(Ordering::Relaxed);
        let write_pos = h.write_pos.load(Ordering::Acquire);

        let avail = write_pos - read_pos;
        let count = out.len().min((avail / Self::ELEM as u64) as usize);
        if count == 0 {
            return 0;
        }
        let bytes = count * Self::ELEM;
        self.copy_out(read_pos, out.as_mut_ptr().cast(), bytes);
        h.read_pos.store(read_pos + bytes as u64, Ordering::Release);
        count
    }

    /// Read the element `offset` positions past the read cursor without
    /// consuming anything.
    pub fn peek(&self, offset: usize) -> Option<T> {
        let h = self.header();
        let read_pos = h.read_pos.load(Ordering::Relaxed);
        let write_pos = h.write_pos.load(Ordering::Acquire);

        let wanted = (offset as u64 + 1) * Self::ELEM as u64;
        if write_pos - read_pos < wanted {
            return None;
        }
        let mut value = mem::MaybeUninit::<T>::uninit();
        self.copy_out(
            read_pos + offset as u64 * Self::ELEM as u64,
            value.as_mut_ptr().cast(),
            Self::ELEM,
        );
        Some(unsafe { value.assume_init() })
    }

    /// Discard up to `count` elements; returns the number skipped.
    pub fn skip(&self, count: usize) -> usize {
        let h = self.header();
        let read_pos = h.read_pos.load(Ordering::Relaxed);
        let write_pos = h.write_pos.load(Ordering::Acquire);

        let avail = (write_pos - read_pos) / Self::ELEM as u64;
        let skipped = count.min(avail as usize);
        if skipped > 0 {
            h.read_pos.store(
                read_pos + (skipped * Self::ELEM) as u64,
                Ordering::Release,
            );
        }
        skipped
    }

    /// Elements available to read.
    pub fn available(&self) -> usize {
        let h = self.header();
        let read_pos = h.read_pos.load(Ordering::Relaxed);
        let write_pos = h.write_pos.load(Ordering::Acquire);
        debug_assert_positions_ordered!(write_pos, read_pos);
        ((write_pos - read_pos) / Self::ELEM as u64) as usize
    }

    /// Elements that can be written before the ring is full.
    pub fn free_space(&self) -> usize {
        let h = self.header();
        let read_pos = h.read_pos.load(Ordering::Acquire);
        let write_pos = h.write_pos.load(Ordering::Relaxed);
        ((self.capacity_bytes - (write_pos - read_pos)) / Self::ELEM as u64) as usize
    }

    /// Capacity in elements.
    #[inline]
    pub fn capacity(&self) -> usize {
        (self.capacity_bytes / Self::ELEM as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        let h = self.header();
        h.read_pos.load(Ordering::Relaxed) == h.write_pos.load(Ordering::Acquire)
    }

    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Reset both cursors to zero. Not thread-safe; callers quiesce first.
    pub fn reset(&self) {
        let h = self.header();
        h.write_pos.store(0, Ordering::Relaxed);
        h.read_pos.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}
