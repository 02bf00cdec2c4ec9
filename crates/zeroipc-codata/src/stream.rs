//! Reactive stream: an append-only sequence over a backing ring.
//!
//! A stream is a header plus a [`Ring`] named `<name>_buffer`. `emit` fails
//! when the ring is full; `emit_overwrite` drops the oldest element instead
//! (sensor-style sources). After `close`, emits fail but `next` keeps
//! draining until the ring is empty.
//!
//! The derived operators (`map`, `filter`, `take`, `skip`, `fold`) are
//! pull-style transformers: each creates a new stream backed by its own ring
//! and spawns a forwarding thread that drains source → target, applying the
//! transform, until the source is closed and empty — then closes the target.
//! `window` is deliberately absent: variable-length results do not fit the
//! fixed-size element contract.

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;

use zeroipc::{Backoff, Error as IpcError, Pod, RawRegion, Ring, Segment};

use crate::error::{CodataError, Result};

#[repr(C)]
struct StreamHeader {
    sequence: AtomicU64,
    subscribers: AtomicU32,
    closed: AtomicU32,
    buffer_capacity: u32,
    elem_size: u32,
}

const HEADER_SIZE: usize = mem::size_of::<StreamHeader>();

fn buffer_name(name: &str) -> String {
    format!("{name}_buffer")
}

/// Named cross-process reactive stream.
pub struct Stream<T: Pod> {
    region: RawRegion,
    ring: Ring<T>,
    segment: Segment,
    _marker: PhantomData<T>,
}

unsafe impl<T: Pod> Send for Stream<T> {}
unsafe impl<T: Pod> Sync for Stream<T> {}

impl<T: Pod> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            ring: self.ring.clone(),
            segment: self.segment.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Pod> Stream<T> {
    /// Create a stream buffering up to `buffer_capacity` elements.
    pub fn create(segment: &Segment, name: &str, buffer_capacity: usize) -> Result<Self> {
        if buffer_capacity == 0 || buffer_capacity > u32::MAX as usize {
            return Err(IpcError::InvalidArgument("stream buffer must be non-empty").into());
        }
        let region = segment.allocate_region(name, HEADER_SIZE as u64)?;
        let header = region.as_ptr().cast::<StreamHeader>();
        unsafe {
            (*header).sequence.store(0, Ordering::Relaxed);
            (*header).subscribers.store(0, Ordering::Relaxed);
            (*header).closed.store(0, Ordering::Relaxed);
            (*header).buffer_capacity = buffer_capacity as u32;
            (*header).elem_size = mem::size_of::<T>() as u32;
        }
        let ring = Ring::create(segment, &buffer_name(name), buffer_capacity)?;

        Ok(Self {
            region,
            ring,
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    /// Open an existing stream, validating the stored element size.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        let region = segment.open_region(name)?;
        if (region.len() as usize) < HEADER_SIZE {
            return Err(IpcError::TypeMismatch.into());
        }
        let header = unsafe { &*region.as_ptr().cast::<StreamHeader>() };
        if header.elem_size as usize != mem::size_of::<T>() {
            return Err(IpcError::TypeMismatch.into());
        }
        let ring = Ring::open(segment, &buffer_name(name))?;

        Ok(Self {
            region,
            ring,
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &StreamHeader {
        unsafe { &*self.region.as_ptr().cast::<StreamHeader>() }
    }

    /// Append `value`. Fails with `Full` when the ring has no room and
    /// `Closed` after [`Stream::close`].
    pub fn emit(&self, value: T) -> Result<()> {
        if self.is_closed() {
            return Err(IpcError::Closed.into());
        }
        self.ring.write(value).map_err(CodataError::from)?;
        self.header().sequence.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Append `value`, dropping the oldest buffered element when full.
    pub fn emit_overwrite(&self, value: T) -> Result<()> {
        if self.is_closed() {
            return Err(IpcError::Closed.into());
        }
        self.ring.overwrite_push(value);
        self.header().sequence.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Append as many elements of `values` as fit; returns the count.
    pub fn emit_bulk(&self, values: &[T]) -> Result<usize> {
        if self.is_closed() {
            return Err(IpcError::Closed.into());
        }
        let written = self.ring.write_bulk(values);
        if written > 0 {
            self.header()
                .sequence
                .fetch_add(written as u64, Ordering::AcqRel);
        }
        Ok(written)
    }

    /// Pop the next element, or `None` when the buffer is empty. Keeps
    /// draining after close.
    pub fn next(&self) -> Option<T> {
        self.ring.read()
    }

    /// Pop up to `out.len()` elements; returns the count.
    pub fn read_bulk(&self, out: &mut [T]) -> usize {
        self.ring.read_bulk(out)
    }

    /// Stop the stream: further emits fail, reads drain what is buffered.
    pub fn close(&self) {
        self.header().closed.store(1, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }

    /// Total elements emitted since creation.
    pub fn sequence(&self) -> u64 {
        self.header().sequence.load(Ordering::Acquire)
    }

    /// Elements currently buffered.
    pub fn depth(&self) -> usize {
        self.ring.available()
    }

    /// Ring capacity chosen at creation.
    pub fn buffer_capacity(&self) -> usize {
        self.header().buffer_capacity as usize
    }

    /// Register a polling consumer (refcount maintained by callers).
    pub fn subscribe(&self) -> u32 {
        self.header().subscribers.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Deregister a polling consumer.
    pub fn unsubscribe(&self) -> u32 {
        self.header().subscribers.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Currently registered consumers.
    pub fn subscribers(&self) -> u32 {
        self.header().subscribers.load(Ordering::Acquire)
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Derived stream carrying `transform(v)` for every source element.
    ///
    /// The forwarding thread becomes the source's consumer (the backing ring
    /// is SPSC), so attach at most one transformer or reader per stream.
    pub fn map<U, F>(&self, segment: &Segment, name: &str, transform: F) -> Result<Stream<U>>
    where
        U: Pod,
        F: Fn(T) -> U + Send + 'static,
    {
        let target = Stream::<U>::create(segment, name, self.buffer_capacity())?;
        spawn_pump(self.clone(), target.clone(), move |value, target| {
            emit_retry(target, transform(value))
        });
        Ok(target)
    }

    /// Derived stream keeping only elements matching `predicate`.
    pub fn filter<F>(&self, segment: &Segment, name: &str, predicate: F) -> Result<Stream<T>>
    where
        F: Fn(&T) -> bool + Send + 'static,
    {
        let target = Stream::<T>::create(segment, name, self.buffer_capacity())?;
        spawn_pump(self.clone(), target.clone(), move |value, target| {
            !predicate(&value) || emit_retry(target, value)
        });
        Ok(target)
    }

    /// Derived stream carrying the first `count` elements, then closing.
    pub fn take(&self, segment: &Segment, name: &str, count: u64) -> Result<Stream<T>> {
        let target = Stream::<T>::create(segment, name, self.buffer_capacity())?;
        let mut taken = 0u64;
        spawn_pump(self.clone(), target.clone(), move |value, target| {
            if taken >= count {
                return false;
            }
            taken += 1;
            emit_retry(target, value) && taken < count
        });
        Ok(target)
    }

    /// Derived stream dropping the first `count` elements.
    pub fn skip(&self, segment: &Segment, name: &str, count: u64) -> Result<Stream<T>> {
        let target = Stream::<T>::create(segment, name, self.buffer_capacity())?;
        let mut skipped = 0u64;
        spawn_pump(self.clone(), target.clone(), move |value, target| {
            if skipped < count {
                skipped += 1;
                return true;
            }
            emit_retry(target, value)
        });
        Ok(target)
    }

    /// Derived stream of running accumulations: emits `acc` after folding in
    /// each source element.
    pub fn fold<A, F>(&self, segment: &Segment, name: &str, init: A, f: F) -> Result<Stream<A>>
    where
        A: Pod + Send,
        F: Fn(A, T) -> A + Send + 'static,
    {
        let target = Stream::<A>::create(segment, name, self.buffer_capacity())?;
        let mut acc = init;
        spawn_pump(self.clone(), target.clone(), move |value, target| {
            acc = f(acc, value);
            emit_retry(target, acc)
        });
        Ok(target)
    }
}

/// Emit into a derived stream, waiting out backpressure. `false` once the
/// target is closed.
fn emit_retry<U: Pod>(target: &Stream<U>, value: U) -> bool {
    let mut backoff = Backoff::new();
    loop {
        match target.emit(value) {
            Ok(()) => return true,
            Err(err) if err.is_would_block() => backoff.snooze(),
            Err(_) => return false,
        }
    }
}

/// Forwarding task shared by the derived operators: drain the source until
/// it is closed and empty (or the step aborts), then close the target.
fn spawn_pump<T, U, F>(source: Stream<T>, target: Stream<U>, mut step: F)
where
    T: Pod,
    U: Pod,
    F: FnMut(T, &Stream<U>) -> bool + Send + 'static,
{
    thread::spawn(move || {
        let mut backoff = Backoff::new();
        loop {
            match source.next() {
                Some(value) => {
                    backoff.reset();
                    if !step(value, &target) {
                        break;
                    }
                }
                None => {
                    if source.is_closed() {
                        break;
                    }
                    backoff.snooze();
                }
            }
        }
        target.close();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestSegment;
    use std::time::Duration;

    fn drain<T: Pod>(stream: &Stream<T>) -> Vec<T> {
        let mut out = Vec::new();
        let mut backoff = Backoff::new();
        loop {
            match stream.next() {
                Some(v) => {
                    backoff.reset();
                    out.push(v);
                }
                None if stream.is_closed() => return out,
                None => backoff.snooze(),
            }
        }
    }

    #[test]
    fn test_emit_next_roundtrip() {
        let shm = TestSegment::new("str_rt");
        let stream = Stream::<f64>::create(&shm, "temps", 16).unwrap();

        stream.emit(20.5).unwrap();
        stream.emit(21.0).unwrap();
        assert_eq!(stream.sequence(), 2);
        assert_eq!(stream.depth(), 2);

        assert_eq!(stream.next(), Some(20.5));
        assert_eq!(stream.next(), Some(21.0));
        assert_eq!(stream.next(), None);
    }

    #[test]
    fn test_emit_fails_when_full() {
        let shm = TestSegment::new("str_full");
        let stream = Stream::<u8>::create(&shm, "s", 2).unwrap();
        stream.emit(1).unwrap();
        stream.emit(2).unwrap();
        assert!(stream.emit(3).unwrap_err().is_would_block());

        // Drop-oldest variant succeeds instead.
        stream.emit_overwrite(3).unwrap();
        assert_eq!(stream.next(), Some(2));
        assert_eq!(stream.next(), Some(3));
        assert_eq!(stream.sequence(), 3);
    }

    #[test]
    fn test_close_drains() {
        let shm = TestSegment::new("str_close");
        let stream = Stream::<u32>::create(&shm, "s", 8).unwrap();
        stream.emit(1).unwrap();
        stream.close();

        assert!(stream.emit(2).unwrap_err().is_closed());
        assert_eq!(stream.next(), Some(1));
        assert_eq!(stream.next(), None);
    }

    #[test]
    fn test_bulk_and_subscribers() {
        let shm = TestSegment::new("str_bulk");
        let stream = Stream::<u16>::create(&shm, "s", 8).unwrap();

        assert_eq!(stream.emit_bulk(&[1, 2, 3]).unwrap(), 3);
        let mut out = [0u16; 8];
        assert_eq!(stream.read_bulk(&mut out), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);

        assert_eq!(stream.subscribe(), 1);
        assert_eq!(stream.subscribe(), 2);
        assert_eq!(stream.unsubscribe(), 1);
        assert_eq!(stream.subscribers(), 1);
    }

    #[test]
    fn test_map_transforms() {
        let shm = TestSegment::new("str_map");
        let source = Stream::<f64>::create(&shm, "celsius", 32).unwrap();
        let mapped = source
            .map(&shm, "fahrenheit", |c| c * 9.0 / 5.0 + 32.0)
            .unwrap();

        source.emit(0.0).unwrap();
        source.emit(100.0).unwrap();
        source.close();

        assert_eq!(drain(&mapped), vec![32.0, 212.0]);
    }

    #[test]
    fn test_filter_take_skip() {
        let shm = TestSegment::new("str_ops");
        // One source per transformer: each forwarding thread is its
        // source's single consumer.
        let feed = |name: &str| {
            let s = Stream::<u32>::create(&shm, name, 64).unwrap();
            for v in 0..10 {
                s.emit(v).unwrap();
            }
            s.close();
            s
        };

        let evens = feed("nums_f")
            .filter(&shm, "evens", |v| v % 2 == 0)
            .unwrap();
        let first3 = feed("nums_t").take(&shm, "first3", 3).unwrap();
        let rest = feed("nums_s").skip(&shm, "rest", 8).unwrap();

        assert_eq!(drain(&evens), vec![0, 2, 4, 6, 8]);
        assert_eq!(drain(&first3), vec![0, 1, 2]);
        assert_eq!(drain(&rest), vec![8, 9]);
    }

    #[test]
    fn test_fold_emits_running_totals() {
        let shm = TestSegment::new("str_fold");
        let source = Stream::<u64>::create(&shm, "s", 32).unwrap();
        let sums = source.fold(&shm, "sums", 0u64, |acc, v| acc + v).unwrap();

        for v in [1, 2, 3, 4] {
            source.emit(v).unwrap();
        }
        source.close();

        assert_eq!(drain(&sums), vec![1, 3, 6, 10]);
    }

    #[test]
    fn test_open_validates_elem_size() {
        let shm = TestSegment::new("str_ty");
        Stream::<u64>::create(&shm, "s", 8).unwrap();
        assert!(Stream::<u32>::open(&shm, "s").is_err());
        let view = Stream::<u64>::open(&shm, "s").unwrap();
        view.emit(1).unwrap();
        assert_eq!(view.depth(), 1);
    }

    #[test]
    fn test_transform_sees_preexisting_elements() {
        let shm = TestSegment::new("str_pre");
        let source = Stream::<u32>::create(&shm, "s", 16).unwrap();
        source.emit(5).unwrap();

        let doubled = source.map(&shm, "doubled", |v| v * 2).unwrap();
        source.emit(6).unwrap();
        source.close();

        // Give the pump a moment; drain blocks until the target closes.
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(drain(&doubled), vec![10, 12]);
    }
}
