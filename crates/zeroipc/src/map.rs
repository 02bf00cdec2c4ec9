//! Bounded open-addressed hash map with linear probing and tombstones.
//!
//! Each slot is `{state, key, value}` and the atomic `state` word is the
//! synchronization point: `EMPTY` terminates a probe, `DELETED` keeps the
//! probe chain alive after an erase, and `RESERVED` stages an in-flight
//! insert so that readers can never observe a torn key. A writer CASes
//! `EMPTY|DELETED → RESERVED`, copies key and value, then publishes with a
//! release store of `OCCUPIED`. Probes that hit `RESERVED` while inserting
//! wait for the slot to resolve (it is in the middle of someone else's
//! insert); lookups and erases simply skip it, since that insert has not
//! linearized yet.
//!
//! Tombstones are never reclaimed, so the table degrades after many erases;
//! a long-lived map should be sized for its churn.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::pod::{Key, Pod};
use crate::segment::{RawRegion, Segment};

const EMPTY: u32 = 0;
const OCCUPIED: u32 = 1;
const DELETED: u32 = 2;
const RESERVED: u32 = 3;

#[repr(C)]
struct MapHeader {
    size: AtomicU32,
    capacity: u32,
    key_size: u32,
    value_size: u32,
}

#[repr(C)]
struct Slot<K, V> {
    state: AtomicU32,
    key: K,
    value: V,
}

const HEADER_SIZE: usize = mem::size_of::<MapHeader>();

/// Named bounded lock-free hash map.
pub struct Map<K: Key, V: Pod> {
    region: RawRegion,
    capacity: u32,
    segment: Segment,
    _marker: PhantomData<(K, V)>,
}

unsafe impl<K: Key, V: Pod> Send for Map<K, V> {}
unsafe impl<K: Key, V: Pod> Sync for Map<K, V> {}

impl<K: Key, V: Pod> Clone for Map<K, V> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            capacity: self.capacity,
            segment: self.segment.clone(),
            _marker: PhantomData,
        }
    }
}

fn check_slot_align<K: Key, V: Pod>() -> Result<()> {
    if mem::align_of::<Slot<K, V>>() > 8 {
        return Err(Error::NotSupported);
    }
    Ok(())
}

impl<K: Key, V: Pod> Map<K, V> {
    /// Create a map with `capacity` slots.
    pub fn create(segment: &Segment, name: &str, capacity: usize) -> Result<Self> {
        check_slot_align::<K, V>()?;
        if capacity == 0 {
            return Err(Error::InvalidArgument("map capacity must be non-zero"));
        }
        if capacity > u32::MAX as usize {
            return Err(Error::Overflow);
        }
        let payload = (capacity as u64)
            .checked_mul(mem::size_of::<Slot<K, V>>() as u64)
            .ok_or(Error::Overflow)?;
        let total = payload.checked_add(HEADER_SIZE as u64).ok_or(Error::Overflow)?;

        let region = segment.allocate_region(name, total)?;
        let header = region.as_ptr().cast::<MapHeader>();
        unsafe {
            (*header).size.store(0, Ordering::Relaxed);
            (*header).capacity = capacity as u32;
            (*header).key_size = mem::size_of::<K>() as u32;
            (*header).value_size = mem::size_of::<V>() as u32;
        }
        let map = Self {
            region,
            capacity: capacity as u32,
            segment: segment.clone(),
            _marker: PhantomData,
        };
        for i in 0..map.capacity {
            map.state(i).store(EMPTY, Ordering::Relaxed);
        }
        Ok(map)
    }

    /// Open an existing map, validating the stored key and value sizes.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        check_slot_align::<K, V>()?;
        let region = segment.open_region(name)?;
        if (region.len() as usize) < HEADER_SIZE {
            return Err(Error::TypeMismatch);
        }
        let header = unsafe { &*region.as_ptr().cast::<MapHeader>() };
        if header.key_size as usize != mem::size_of::<K>()
            || header.value_size as usize != mem::size_of::<V>()
        {
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
    fn header(&self) -> &MapHeader {
        unsafe { &*self.region.as_ptr().cast::<MapHeader>() }
    }

    #[inline]
    fn slot_ptr(&self, index: u32) -> *mut Slot<K, V> {
        unsafe {
            self.region
                .as_ptr()
                .add(HEADER_SIZE)
                .cast::<Slot<K, V>>()
                .add(index as usize)
        }
    }

    #[inline]
    fn state(&self, index: u32) -> &AtomicU32 {
        unsafe { &(*self.slot_ptr(index)).state }
    }

    #[inline]
    fn read_key(&self, index: u32) -> K {
        unsafe { ptr::addr_of!((*self.slot_ptr(index)).key).read() }
    }

    #[inline]
    fn read_value(&self, index: u32) -> V {
        unsafe { ptr::addr_of!((*self.slot_ptr(index)).value).read() }
    }

    #[inline]
    fn probe_start(&self, key: &K) -> u32 {
        (key.hash_key() % u64::from(self.capacity)) as u32
    }

    /// Insert or update. Returns `true` for a fresh insertion, `false` when
    /// an existing key was updated (last writer wins on the value).
    pub fn insert(&self, key: &K, value: &V) -> Result<bool> {
        let start = self.probe_start(key);
        for i in 0..self.capacity {
            let idx = (start + i) % self.capacity;
            let mut backoff = Backoff::new();
            loop {
                let state = self.state(idx).load(Ordering::Acquire);
                match state {
                    EMPTY | DELETED => {
                        if self
                            .state(idx)
                            .compare_exchange(state, RESERVED, Ordering::Acquire, Ordering::Relaxed)
                            .is_ok()
                        {
                            unsafe {
                                let slot = self.slot_ptr(idx);
                                ptr::addr_of_mut!((*slot).key).write(*key);
                                ptr::addr_of_mut!((*slot).value).write(*value);
                            }
                            self.state(idx).store(OCCUPIED, Ordering::Release);
                            self.header().size.fetch_add(1, Ordering::AcqRel);
                            return Ok(true);
                        }
                        // Lost the race for this slot; re-examine it.
                    }
                    OCCUPIED => {
                        if self.read_key(idx) == *key {
                            unsafe {
                                ptr::addr_of_mut!((*self.slot_ptr(idx)).value).write(*value);
                            }
                            return Ok(false);
                        }
                        break;
                    }
                    RESERVED => {
                        // Mid-insert by another writer; it resolves in a few
                        // instructions. Waiting (rather than probing past)
                        // keeps keys unique when two inserters race on the
                        // same key.
                        backoff.snooze();
                    }
                    _ => break,
                }
            }
        }
        Err(Error::Full)
    }

    /// Look up `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let start = self.probe_start(key);
        for i in 0..self.capacity {
            let idx = (start + i) % self.capacity;
            match self.state(idx).load(Ordering::Acquire) {
                EMPTY => return None,
                OCCUPIED => {
                    if self.read_key(idx) == *key {
                        return Some(self.read_value(idx));
                    }
                }
                // DELETED and RESERVED keep the probe chain alive.
                _ => {}
            }
        }
        None
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Remove `key`, leaving a tombstone. Returns whether a mapping was
    /// removed.
    pub fn erase(&self, key: &K) -> bool {
        let start = self.probe_start(key);
        for i in 0..self.capacity {
            let idx = (start + i) % self.capacity;
            match self.state(idx).load(Ordering::Acquire) {
                EMPTY => return false,
                OCCUPIED => {
                    if self.read_key(idx) == *key {
                        if self
                            .state(idx)
                            .compare_exchange(
                                OCCUPIED,
                                DELETED,
                                Ordering::AcqRel,
                                Ordering::Relaxed,
                            )
                            .is_ok()
                        {
                            self.header().size.fetch_sub(1, Ordering::AcqRel);
                            return true;
                        }
                        // A concurrent erase beat us to this slot.
                        return false;
                    }
                }
                _ => {}
            }
        }
        false
    }

    /// Entry count snapshot.
    pub fn len(&self) -> usize {
        self.header().size.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count chosen at creation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Snapshot of the occupied entries. Concurrent writers may be missed or
    /// doubled; quiesce for an exact picture.
    pub fn entries(&self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        for idx in 0..self.capacity {
            if self.state(idx).load(Ordering::Acquire) == OCCUPIED {
                out.push((self.read_key(idx), self.read_value(idx)));
            }
        }
        out
    }

    /// Iterate over a snapshot of the occupied entries.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> {
        self.entries().into_iter()
    }

    /// Reset every slot to `EMPTY`. Not thread-safe; callers quiesce first.
    pub fn clear(&self) {
        for idx in 0..self.capacity {
            self.state(idx).store(EMPTY, Ordering::Relaxed);
        }
        self.header().size.store(0, Ordering::Release);
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}
