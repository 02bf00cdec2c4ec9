//! Single-assignment cell for asynchronous computation results.
//!
//! One process computes a value while any number of others wait for it.
//! Exactly one of `set_value`/`set_error` wins the transition out of
//! `Pending` (enforced by CAS); every getter then observes the same outcome.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use zeroipc::{Backoff, Error as IpcError, Pod, RawRegion, Segment};

use crate::error::{CodataError, Result};

const PENDING: u32 = 0;
const COMPUTING: u32 = 1;
const READY: u32 = 2;
const ERROR: u32 = 3;

const ERROR_MSG_LEN: usize = 256;

/// Observable lifecycle of a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Computing,
    Ready,
    Error,
}

#[repr(C)]
struct FutureHeader<T> {
    state: AtomicU32,
    waiters: AtomicU32,
    elem_size: u32,
    reserved: u32,
    completion_time: AtomicU64, // UNIX nanos; diagnostic only
    value: T,
    error_msg: [u8; ERROR_MSG_LEN],
}

/// Named cross-process single-assignment future.
pub struct Future<T: Pod> {
    region: RawRegion,
    segment: Segment,
    _marker: PhantomData<T>,
}

unsafe impl<T: Pod> Send for Future<T> {}
unsafe impl<T: Pod> Sync for Future<T> {}

impl<T: Pod> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            segment: self.segment.clone(),
            _marker: PhantomData,
        }
    }
}

fn check_elem_align<T>() -> Result<()> {
    if mem::align_of::<T>() > 8 {
        return Err(IpcError::NotSupported.into());
    }
    Ok(())
}

impl<T: Pod> Future<T> {
    const SIZE: usize = mem::size_of::<FutureHeader<T>>();

    /// Create a pending future.
    pub fn create(segment: &Segment, name: &str) -> Result<Self> {
        check_elem_align::<T>()?;
        let region = segment.allocate_region(name, Self::SIZE as u64)?;
        let header = region.as_ptr().cast::<FutureHeader<T>>();
        unsafe {
            (*header).state.store(PENDING, Ordering::Relaxed);
            (*header).waiters.store(0, Ordering::Relaxed);
            (*header).elem_size = mem::size_of::<T>() as u32;
            (*header).reserved = 0;
            (*header).completion_time.store(0, Ordering::Relaxed);
        }
        Ok(Self {
            region,
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    /// Open an existing future, validating the stored element size.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        check_elem_align::<T>()?;
        let region = segment.open_region(name)?;
        if (region.len() as usize) < Self::SIZE {
            return Err(IpcError::TypeMismatch.into());
        }
        let stored = unsafe { (*region.as_ptr().cast::<FutureHeader<T>>()).elem_size };
        if stored as usize != mem::size_of::<T>() {
            return Err(IpcError::TypeMismatch.into());
        }
        Ok(Self {
            region,
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &FutureHeader<T> {
        unsafe { &*self.region.as_ptr().cast::<FutureHeader<T>>() }
    }

    #[inline]
    fn header_ptr(&self) -> *mut FutureHeader<T> {
        self.region.as_ptr().cast::<FutureHeader<T>>()
    }

    fn stamp_completion(&self) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        self.header().completion_time.store(nanos, Ordering::Relaxed);
    }

    /// Complete the future. Returns `false` if it was already completed.
    pub fn set_value(&self, value: T) -> bool {
        let h = self.header();
        if h.state
            .compare_exchange(PENDING, COMPUTING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        unsafe { ptr::addr_of_mut!((*self.header_ptr()).value).write(value) };
        self.stamp_completion();
        h.state.store(READY, Ordering::Release);
        true
    }

    /// Fail the future with a message (truncated to 255 bytes). Returns
    /// `false` if it was already completed.
    pub fn set_error(&self, message: &str) -> bool {
        let h = self.header();
        if h.state
            .compare_exchange(PENDING, COMPUTING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        let mut buf = [0u8; ERROR_MSG_LEN];
        let len = message.len().min(ERROR_MSG_LEN - 1);
        buf[..len].copy_from_slice(&message.as_bytes()[..len]);
        unsafe { ptr::addr_of_mut!((*self.header_ptr()).error_msg).write(buf) };
        self.stamp_completion();
        h.state.store(ERROR, Ordering::Release);
        true
    }

    fn error_message(&self) -> String {
        let buf = unsafe { &(*self.header_ptr()).error_msg };
        let end = buf.iter().position(|&b| b == 0).unwrap_or(ERROR_MSG_LEN);
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    fn completed_outcome(&self, state: u32) -> Result<T> {
        match state {
            READY => Ok(unsafe { ptr::addr_of!((*self.header_ptr()).value).read() }),
            ERROR => Err(CodataError::Failed(self.error_message())),
            _ => unreachable!("outcome read before completion"),
        }
    }

    /// Block until the future completes, then return its outcome.
    pub fn get(&self) -> Result<T> {
        let h = self.header();
        h.waiters.fetch_add(1, Ordering::Relaxed);
        let mut backoff = Backoff::new();
        let state = loop {
            let state = h.state.load(Ordering::Acquire);
            if state == READY || state == ERROR {
                break state;
            }
            backoff.snooze();
        };
        h.waiters.fetch_sub(1, Ordering::Relaxed);
        self.completed_outcome(state)
    }

    /// Non-blocking probe: `None` while the future is still pending.
    pub fn try_get(&self) -> Result<Option<T>> {
        match self.header().state.load(Ordering::Acquire) {
            READY => Ok(Some(self.completed_outcome(READY)?)),
            ERROR => Err(CodataError::Failed(self.error_message())),
            _ => Ok(None),
        }
    }

    /// Block until the future completes or `timeout` passes.
    pub fn get_for(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let h = self.header();
        h.waiters.fetch_add(1, Ordering::Relaxed);
        let mut backoff = Backoff::new();
        let outcome = loop {
            let state = h.state.load(Ordering::Acquire);
            if state == READY || state == ERROR {
                break Ok(state);
            }
            if Instant::now() >= deadline {
                break Err(CodataError::from(IpcError::Timeout));
            }
            backoff.snooze();
        };
        h.waiters.fetch_sub(1, Ordering::Relaxed);
        self.completed_outcome(outcome?)
    }

    /// Whether the future completed (with a value or an error).
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), FutureState::Ready | FutureState::Error)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FutureState {
        match self.header().state.load(Ordering::Acquire) {
            PENDING => FutureState::Pending,
            COMPUTING => FutureState::Computing,
            READY => FutureState::Ready,
            _ => FutureState::Error,
        }
    }

    /// Getters currently blocked in `get`/`get_for` (snapshot).
    pub fn waiters(&self) -> u32 {
        self.header().waiters.load(Ordering::Relaxed)
    }

    /// Completion wall-clock time in UNIX nanoseconds (0 while pending).
    pub fn completion_time(&self) -> u64 {
        self.header().completion_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}
