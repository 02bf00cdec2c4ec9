//! Free-list object pool with stable handle indices.
//!
//! A singly linked free list threads through the unused nodes; `free_head`
//! holds the index of the first free node or [`Pool::NULL_HANDLE`]. Handles
//! are plain u32 indices, valid until released and exchangeable between
//! processes.
//!
//! Releasing the same handle twice corrupts the free list (undefined
//! behavior); the pool does not detect it. A handle must not be re-examined
//! after release — the classic ABA mitigation for this structure is exactly
//! that rule plus the retry-from-scratch CAS loops below.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::array::check_elem_align;
use crate::error::{Error, Result};
use crate::invariants::debug_assert_handle_in_range;
use crate::pod::Pod;
use crate::segment::{RawRegion, Segment};

#[repr(C)]
struct PoolHeader {
    free_head: AtomicU32,
    allocated: AtomicU32,
    capacity: u32,
    elem_size: u32,
}

#[repr(C)]
struct Node<T> {
    data: T,
    next: AtomicU32,
}

const HEADER_SIZE: usize = mem::size_of::<PoolHeader>();

/// Named bounded free-list object pool.
pub struct Pool<T: Pod> {
    region: RawRegion,
    capacity: u32,
    segment: Segment,
    _marker: PhantomData<T>,
}

unsafe impl<T: Pod> Send for Pool<T> {}
unsafe impl<T: Pod> Sync for Pool<T> {}

impl<T: Pod> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            capacity: self.capacity,
            segment: self.segment.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Pod> Pool<T> {
    /// Sentinel for "no node".
    pub const NULL_HANDLE: u32 = u32::MAX;

    /// Create a pool of `capacity` nodes, all initially free.
    pub fn create(segment: &Segment, name: &str, capacity: usize) -> Result<Self> {
        check_elem_align::<T>()?;
        if capacity == 0 {
            return Err(Error::InvalidArgument("pool capacity must be non-zero"));
        }
        if capacity >= Self::NULL_HANDLE as usize {
            return Err(Error::Overflow);
        }
        let payload = (capacity as u64)
            .checked_mul(mem::size_of::<Node<T>>() as u64)
            .ok_or(Error::Overflow)?;
        let total = payload.checked_add(HEADER_SIZE as u64).ok_or(Error::Overflow)?;

        let region = segment.allocate_region(name, total)?;
        let header = region.as_ptr().cast::<PoolHeader>();
        unsafe {
            (*header).free_head.store(0, Ordering::Relaxed);
            (*header).allocated.store(0, Ordering::Relaxed);
            (*header).capacity = capacity as u32;
            (*header).elem_size = mem::size_of::<T>() as u32;
        }

        let pool = Self {
            region,
            capacity: capacity as u32,
            segment: segment.clone(),
            _marker: PhantomData,
        };
        // Thread the free list through every node.
        for i in 0..pool.capacity {
            let next = if i + 1 == pool.capacity {
                Self::NULL_HANDLE
            } else {
                i + 1
            };
            pool.node_next(i).store(next, Ordering::Relaxed);
        }
        Ok(pool)
    }

    /// Open an existing pool, validating the stored element size.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        check_elem_align::<T>()?;
        let region = segment.open_region(name)?;
        if (region.len() as usize) < HEADER_SIZE {
            return Err(Error::TypeMismatch);
        }
        let header = unsafe { &*region.as_ptr().cast::<PoolHeader>() };
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
    fn header(&self) -> &PoolHeader {
        unsafe { &*self.region.as_ptr().cast::<PoolHeader>() }
    }

    #[inline]
    fn node_ptr(&self, index: u32) -> *mut Node<T> {
        debug_assert_handle_in_range!(index, self.capacity);
        unsafe {
            self.region
                .as_ptr()
                .add(HEADER_SIZE)
                .cast::<Node<T>>()
                .add(index as usize)
        }
    }

    #[inline]
    fn node_next(&self, index: u32) -> &AtomicU32 {
        unsafe { &(*self.node_ptr(index)).next }
    }

    /// Take a node off the free list. `None` when the pool is exhausted.
    pub fn acquire(&self) -> Option<u32> {
        let h = self.header();
        loop {
            let head = h.free_head.load(Ordering::Acquire);
            if head == Self::NULL_HANDLE {
                return None;
            }
            let next = self.node_next(head).load(Ordering::Relaxed);
            if h.free_head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                h.allocated.fetch_add(1, Ordering::Relaxed);
                return Some(head);
            }
        }
    }

    /// Return a node to the free list (last-in-first-out).
    pub fn release(&self, handle: u32) -> Result<()> {
        if handle >= self.capacity {
            return Err(Error::InvalidArgument("pool handle out of range"));
        }
        let h = self.header();
        loop {
            let head = h.free_head.load(Ordering::Acquire);
            self.node_next(handle).store(head, Ordering::Relaxed);
            if h.free_head
                .compare_exchange_weak(head, handle, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                h.allocated.fetch_sub(1, Ordering::Relaxed);
                return Ok(());
            }
        }
    }

    /// Acquire up to `count` handles.
    pub fn acquire_batch(&self, count: usize) -> Vec<u32> {
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            match self.acquire() {
                Some(handle) => handles.push(handle),
                None => break,
            }
        }
        handles
    }

    /// Release every handle in `handles`.
    pub fn release_batch(&self, handles: &[u32]) -> Result<()> {
        for &handle in handles {
            self.release(handle)?;
        }
        Ok(())
    }

    /// Copy out the node's value.
    pub fn read(&self, handle: u32) -> Result<T> {
        if handle >= self.capacity {
            return Err(Error::InvalidArgument("pool handle out of range"));
        }
        Ok(unsafe { ptr::addr_of!((*self.node_ptr(handle)).data).read() })
    }

    /// Store a value into the node.
    pub fn write(&self, handle: u32, value: T) -> Result<()> {
        if handle >= self.capacity {
            return Err(Error::InvalidArgument("pool handle out of range"));
        }
        unsafe { ptr::addr_of_mut!((*self.node_ptr(handle)).data).write(value) };
        Ok(())
    }

    /// Raw pointer to the node's value.
    pub fn data_ptr(&self, handle: u32) -> Result<*mut T> {
        if handle >= self.capacity {
            return Err(Error::InvalidArgument("pool handle out of range"));
        }
        Ok(unsafe { ptr::addr_of_mut!((*self.node_ptr(handle)).data) })
    }

    /// Whether `handle` indexes a real node (says nothing about liveness).
    pub fn is_valid(&self, handle: u32) -> bool {
        handle < self.capacity
    }

    /// Nodes currently handed out.
    pub fn allocated(&self) -> usize {
        self.header().allocated.load(Ordering::Relaxed) as usize
    }

    /// Nodes still on the free list.
    pub fn available(&self) -> usize {
        self.capacity as usize - self.allocated()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn is_empty(&self) -> bool {
        self.allocated() == 0
    }

    pub fn is_full(&self) -> bool {
        self.allocated() == self.capacity as usize
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestSegment;

    #[test]
    fn test_acquire_until_exhausted() {
        let shm = TestSegment::new("pool_all");
        let pool = Pool::<u64>::create(&shm, "p", 8).unwrap();

        let handles = pool.acquire_batch(8);
        assert_eq!(handles.len(), 8);
        assert!(pool.is_full());
        assert_eq!(pool.acquire(), None);

        pool.release_batch(&handles).unwrap();
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn test_free_list_is_lifo() {
        let shm = TestSegment::new("pool_lifo");
        let pool = Pool::<u64>::create(&shm, "p", 8).unwrap();

        let handles = pool.acquire_batch(8);
        pool.release(handles[3]).unwrap();
        assert_eq!(pool.acquire(), Some(handles[3]));
    }

    #[test]
    fn test_data_access() {
        let shm = TestSegment::new("pool_data");
        let pool = Pool::<u64>::create(&shm, "p", 4).unwrap();

        let h = pool.acquire().unwrap();
        pool.write(h, 0xDEAD_BEEF).unwrap();
        assert_eq!(pool.read(h).unwrap(), 0xDEAD_BEEF);

        assert!(matches!(pool.read(99), Err(Error::InvalidArgument(_))));
        assert!(matches!(pool.release(99), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_handles_stable_across_open() {
        let shm = TestSegment::new("pool_open");
        let pool = Pool::<u32>::create(&shm, "p", 4).unwrap();
        let h = pool.acquire().unwrap();
        pool.write(h, 42).unwrap();

        let other = shm.attach();
        let view = Pool::<u32>::open(&other, "p").unwrap();
        assert_eq!(view.read(h).unwrap(), 42);
        assert_eq!(view.allocated(), 1);

        assert!(matches!(
            Pool::<u64>::open(&other, "p"),
            Err(Error::TypeMismatch)
        ));
    }
}
