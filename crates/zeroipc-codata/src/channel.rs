//! CSP channel: synchronous rendezvous or bounded buffer.
//!
//! Two modes, chosen at creation:
//!
//! - **Unbuffered (`capacity == 0`)** — a single rendezvous slot embedded
//!   after the header. `send` blocks until a receiver takes the value;
//!   `recv` blocks until a sender offers one. The slot's `ready` word is a
//!   four-state machine (`EMPTY → WRITING → FULL → READING → EMPTY`) so
//!   racing senders, and racing receivers, serialize by CAS-claiming the
//!   slot instead of corrupting it. One sender and one receiver is the
//!   intended shape; more are safe but serialized.
//! - **Buffered (`capacity > 0`)** — a backing [`Queue`] named
//!   `<name>_buffer`, sized `capacity + 1` to honor the queue's reserved
//!   slot. `send`/`recv` are single non-blocking queue operations; the
//!   `*_timeout` variants poll with backoff.
//!
//! After `close`, sends fail with `Closed`; `recv` drains whatever is
//! buffered, then reports `Closed`.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use zeroipc::{Backoff, Error as IpcError, Pod, Queue, RawRegion, Segment};

use crate::error::{CodataError, Result};

const SLOT_EMPTY: u32 = 0;
const SLOT_FULL: u32 = 1;
const SLOT_WRITING: u32 = 2;
const SLOT_READING: u32 = 3;

#[repr(C)]
struct ChannelHeader {
    capacity: AtomicU32, // 0 = unbuffered
    senders: AtomicU32,
    receivers: AtomicU32,
    closed: AtomicU32,
    send_seq: AtomicU64,
    recv_seq: AtomicU64,
    elem_size: u32,
    reserved: u32,
}

#[repr(C)]
struct RendezvousSlot<T> {
    ready: AtomicU32,
    // Counts completed hand-offs. A sender snapshots it after claiming the
    // slot and waits for it to move; a plain flag could be reset by the next
    // sender before a slow one observed it.
    consumed: AtomicU32,
    data: T,
}

const HEADER_SIZE: usize = mem::size_of::<ChannelHeader>();

fn buffer_name(name: &str) -> String {
    format!("{name}_buffer")
}

/// Named cross-process CSP channel.
pub struct Channel<T: Pod> {
    region: RawRegion,
    buffer: Option<Queue<T>>,
    capacity: u32,
    segment: Segment,
    _marker: PhantomData<T>,
}

unsafe impl<T: Pod> Send for Channel<T> {}
unsafe impl<T: Pod> Sync for Channel<T> {}

impl<T: Pod> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            buffer: self.buffer.clone(),
            capacity: self.capacity,
            segment: self.segment.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Pod> Channel<T> {
    /// Create a channel. `capacity == 0` makes it a synchronous rendezvous;
    /// `capacity > 0` buffers that many elements in a derived queue.
    pub fn create(segment: &Segment, name: &str, capacity: usize) -> Result<Self> {
        if mem::align_of::<T>() > 8 {
            return Err(IpcError::NotSupported.into());
        }
        if capacity > u32::MAX as usize - 1 {
            return Err(IpcError::Overflow.into());
        }

        let total = if capacity == 0 {
            HEADER_SIZE + mem::size_of::<RendezvousSlot<T>>()
        } else {
            HEADER_SIZE
        };
        let region = segment.allocate_region(name, total as u64)?;
        let header = region.as_ptr().cast::<ChannelHeader>();
        unsafe {
            (*header).capacity.store(capacity as u32, Ordering::Relaxed);
            (*header).senders.store(0, Ordering::Relaxed);
            (*header).receivers.store(0, Ordering::Relaxed);
            (*header).closed.store(0, Ordering::Relaxed);
            (*header).send_seq.store(0, Ordering::Relaxed);
            (*header).recv_seq.store(0, Ordering::Relaxed);
            (*header).elem_size = mem::size_of::<T>() as u32;
            (*header).reserved = 0;
        }

        let buffer = if capacity > 0 {
            // One extra slot: the queue keeps a gap to tell full from empty.
            Some(Queue::create(segment, &buffer_name(name), capacity + 1)?)
        } else {
            let slot = unsafe { region.as_ptr().add(HEADER_SIZE).cast::<RendezvousSlot<T>>() };
            unsafe {
                (*slot).ready.store(SLOT_EMPTY, Ordering::Relaxed);
                (*slot).consumed.store(0, Ordering::Relaxed);
            }
            None
        };

        Ok(Self {
            region,
            buffer,
            capacity: capacity as u32,
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    /// Open an existing channel, validating the stored element size.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        if mem::align_of::<T>() > 8 {
            return Err(IpcError::NotSupported.into());
        }
        let region = segment.open_region(name)?;
        if (region.len() as usize) < HEADER_SIZE {
            return Err(IpcError::TypeMismatch.into());
        }
        let header = unsafe { &*region.as_ptr().cast::<ChannelHeader>() };
        if header.elem_size as usize != mem::size_of::<T>() {
            return Err(IpcError::TypeMismatch.into());
        }
        let capacity = header.capacity.load(Ordering::Relaxed);

        let buffer = if capacity > 0 {
            Some(Queue::open(segment, &buffer_name(name))?)
        } else {
            let needed = HEADER_SIZE + mem::size_of::<RendezvousSlot<T>>();
            if (region.len() as usize) < needed {
                return Err(IpcError::TypeMismatch.into());
            }
            None
        };

        Ok(Self {
            region,
            buffer,
            capacity,
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    #[inline]
    fn header(&self) -> &ChannelHeader {
        unsafe { &*self.region.as_ptr().cast::<ChannelHeader>() }
    }

    #[inline]
    fn slot(&self) -> &RendezvousSlot<T> {
        debug_assert!(self.buffer.is_none());
        unsafe { &*self.region.as_ptr().add(HEADER_SIZE).cast::<RendezvousSlot<T>>() }
    }

    #[inline]
    fn slot_data_ptr(&self) -> *mut T {
        unsafe {
            let slot = self.region.as_ptr().add(HEADER_SIZE).cast::<RendezvousSlot<T>>();
            ptr::addr_of_mut!((*slot).data)
        }
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }

    /// Close the channel. Senders fail immediately; receivers drain the
    /// buffer and then see `Closed`.
    pub fn close(&self) {
        self.header().closed.store(1, Ordering::Release);
    }

    /// Send a value. Unbuffered channels block until a receiver takes it;
    /// buffered channels enqueue without blocking and report `Full` when the
    /// buffer has no room.
    pub fn send(&self, value: T) -> Result<()> {
        if self.is_closed() {
            return Err(IpcError::Closed.into());
        }
        match &self.buffer {
            Some(queue) => {
                queue.push(value).map_err(CodataError::from)?;
                self.header().send_seq.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            None => self.rendezvous_send(value, None),
        }
    }

    /// Send without blocking. For unbuffered channels this only succeeds
    /// when a receiver is already waiting.
    pub fn try_send(&self, value: T) -> Result<()> {
        if self.is_closed() {
            return Err(IpcError::Closed.into());
        }
        match &self.buffer {
            Some(queue) => {
                queue.push(value).map_err(CodataError::from)?;
                self.header().send_seq.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            None => {
                if self.header().receivers.load(Ordering::Acquire) == 0 {
                    return Err(IpcError::Full.into());
                }
                self.rendezvous_send(value, None)
            }
        }
    }

    /// Send, giving up after `timeout`.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        match &self.buffer {
            Some(_) => {
                let mut backoff = Backoff::new();
                loop {
                    match self.try_send(value) {
                        Err(err) if err.is_would_block() => {
                            if Instant::now() >= deadline {
                                return Err(IpcError::Timeout.into());
                            }
                            backoff.snooze();
                        }
                        other => return other,
                    }
                }
            }
            None => {
                if self.is_closed() {
                    return Err(IpcError::Closed.into());
                }
                self.rendezvous_send(value, Some(deadline))
            }
        }
    }

    fn rendezvous_send(&self, value: T, deadline: Option<Instant>) -> Result<()> {
        let h = self.header();
        let slot = self.slot();
        h.senders.fetch_add(1, Ordering::AcqRel);
        let result = self.rendezvous_send_inner(value, deadline, slot);
        h.senders.fetch_sub(1, Ordering::AcqRel);
        if result.is_ok() {
            h.send_seq.fetch_add(1, Ordering::AcqRel);
        }
        result
    }

    fn rendezvous_send_inner(
        &self,
        value: T,
        deadline: Option<Instant>,
        slot: &RendezvousSlot<T>,
    ) -> Result<()> {
        let mut backoff = Backoff::new();
        // Claim the slot.
        loop {
            if self.is_closed() {
                return Err(IpcError::Closed.into());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(IpcError::Timeout.into());
                }
            }
            if slot
                .ready
                .compare_exchange(SLOT_EMPTY, SLOT_WRITING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
            backoff.snooze();
        }

        // The claim's acquire ordered all prior hand-off increments before
        // this snapshot.
        let handed_off = slot.consumed.load(Ordering::Acquire);
        unsafe { self.slot_data_ptr().write(value) };
        slot.ready.store(SLOT_FULL, Ordering::Release);

        // Wait for the receiver to take it.
        backoff.reset();
        loop {
            if slot.consumed.load(Ordering::Acquire) != handed_off {
                return Ok(());
            }
            let abandon = self.is_closed()
                || deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if abandon {
                // Retract the offer unless a receiver is already mid-read.
                if slot
                    .ready
                    .compare_exchange(
                        SLOT_FULL,
                        SLOT_EMPTY,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return Err(if self.is_closed() {
                        IpcError::Closed.into()
                    } else {
                        IpcError::Timeout.into()
                    });
                }
                // A receiver claimed the slot; the hand-off completes.
            }
            backoff.snooze();
        }
    }

    /// Receive a value. Unbuffered channels block until a sender offers one;
    /// buffered channels dequeue without blocking, reporting `Empty` while
    /// open and `Closed` once closed and drained.
    pub fn recv(&self) -> Result<T> {
        match &self.buffer {
            Some(queue) => match queue.pop() {
                Ok(value) => {
                    self.header().recv_seq.fetch_add(1, Ordering::AcqRel);
                    Ok(value)
                }
                Err(IpcError::Empty) if self.is_closed() => Err(IpcError::Closed.into()),
                Err(err) => Err(err.into()),
            },
            None => self.rendezvous_recv(None),
        }
    }

    /// Receive without blocking.
    pub fn try_recv(&self) -> Result<T> {
        match &self.buffer {
            Some(_) => self.recv(),
            None => {
                let slot = self.slot();
                if slot
                    .ready
                    .compare_exchange(SLOT_FULL, SLOT_READING, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    Ok(self.take_from_slot(slot))
                } else if self.is_closed() {
                    Err(IpcError::Closed.into())
                } else {
                    Err(IpcError::Empty.into())
                }
            }
        }
    }

    /// Receive, giving up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        match &self.buffer {
            Some(_) => {
                let mut backoff = Backoff::new();
                loop {
                    match self.recv() {
                        Err(err) if err.is_would_block() => {
                            if Instant::now() >= deadline {
                                return Err(IpcError::Timeout.into());
                            }
                            backoff.snooze();
                        }
                        other => return other,
                    }
                }
            }
            None => self.rendezvous_recv(Some(deadline)),
        }
    }

    fn take_from_slot(&self, slot: &RendezvousSlot<T>) -> T {
        let value = unsafe { self.slot_data_ptr().read() };
        // Increment before releasing the slot so the next claimant's
        // snapshot already includes this hand-off.
        slot.consumed.fetch_add(1, Ordering::Release);
        slot.ready.store(SLOT_EMPTY, Ordering::Release);
        self.header().recv_seq.fetch_add(1, Ordering::AcqRel);
        value
    }

    fn rendezvous_recv(&self, deadline: Option<Instant>) -> Result<T> {
        let h = self.header();
        let slot = self.slot();
        h.receivers.fetch_add(1, Ordering::AcqRel);
        let mut backoff = Backoff::new();
        let result = loop {
            if slot
                .ready
                .compare_exchange(SLOT_FULL, SLOT_READING, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break Ok(self.take_from_slot(slot));
            }
            if self.is_closed() {
                break Err(IpcError::Closed.into());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break Err(IpcError::Timeout.into());
                }
            }
            backoff.snooze();
        };
        h.receivers.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Buffered capacity (0 for rendezvous channels).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline]
    pub fn is_buffered(&self) -> bool {
        self.capacity > 0
    }

    /// Values currently buffered (0 or 1 for rendezvous channels).
    pub fn len(&self) -> usize {
        match &self.buffer {
            Some(queue) => queue.len(),
            None => usize::from(self.slot().ready.load(Ordering::Acquire) == SLOT_FULL),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Senders currently blocked in a rendezvous (snapshot).
    pub fn senders(&self) -> u32 {
        self.header().senders.load(Ordering::Acquire)
    }

    /// Receivers currently blocked in a rendezvous (snapshot).
    pub fn receivers(&self) -> u32 {
        self.header().receivers.load(Ordering::Acquire)
    }

    /// Messages sent and received so far (diagnostic ordering only).
    pub fn sequences(&self) -> (u64, u64) {
        let h = self.header();
        (
            h.send_seq.load(Ordering::Acquire),
            h.recv_seq.load(Ordering::Acquire),
        )
    }

    /// Blocking iterator draining the channel until it is closed.
    pub fn iter(&self) -> ChannelIter<'_, T> {
        ChannelIter { channel: self }
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}

/// Iterator over received values; ends when the channel closes.
pub struct ChannelIter<'a, T: Pod> {
    channel: &'a Channel<T>,
}

impl<T: Pod> Iterator for ChannelIter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            match self.channel.recv() {
                Ok(value) => return Some(value),
                Err(err) if err.is_would_block() => backoff.snooze(),
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestSegment;

    #[test]
    fn test_buffered_send_recv() {
        let shm = TestSegment::new("ch_buf");
        let ch = Channel::<i32>::create(&shm, "ch", 4).unwrap();
        assert!(ch.is_buffered());
        assert_eq!(ch.capacity(), 4);

        for v in [1, 2, 3, 4] {
            ch.send(v).unwrap();
        }
        // Buffer holds exactly `capacity` items.
        assert!(ch.send(5).unwrap_err().is_would_block());

        assert_eq!(ch.recv().unwrap(), 1);
        ch.send(5).unwrap();
        assert_eq!(ch.len(), 4);
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let shm = TestSegment::new("ch_close");
        let ch = Channel::<u8>::create(&shm, "ch", 2).unwrap();
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        ch.close();

        assert!(ch.send(3).unwrap_err().is_closed());
        assert_eq!(ch.recv().unwrap(), 1);
        assert_eq!(ch.recv().unwrap(), 2);
        assert!(ch.recv().unwrap_err().is_closed());
    }

    #[test]
    fn test_rendezvous_hand_off() {
        let shm = TestSegment::new("ch_rdv");
        let ch = Channel::<i32>::create(&shm, "ch", 0).unwrap();
        assert!(!ch.is_buffered());

        let sender = ch.clone();
        let t = std::thread::spawn(move || sender.send(42));
        assert_eq!(ch.recv().unwrap(), 42);
        t.join().unwrap().unwrap();
        assert_eq!(ch.sequences(), (1, 1));
    }

    #[test]
    fn test_rendezvous_try_send_needs_receiver() {
        let shm = TestSegment::new("ch_try");
        let ch = Channel::<u32>::create(&shm, "ch", 0).unwrap();
        assert!(ch.try_send(1).unwrap_err().is_would_block());
        assert!(ch.try_recv().unwrap_err().is_would_block());
    }

    #[test]
    fn test_rendezvous_send_timeout() {
        let shm = TestSegment::new("ch_to");
        let ch = Channel::<u32>::create(&shm, "ch", 0).unwrap();
        assert!(ch
            .send_timeout(7, Duration::from_millis(20))
            .unwrap_err()
            .is_timeout());
        assert!(ch
            .recv_timeout(Duration::from_millis(20))
            .unwrap_err()
            .is_timeout());
        // The retracted offer left the slot clean.
        assert_eq!(ch.len(), 0);
    }

    #[test]
    fn test_closed_rendezvous_send_fails() {
        let shm = TestSegment::new("ch_closed");
        let ch = Channel::<i32>::create(&shm, "ch", 0).unwrap();
        ch.close();
        assert!(ch.send(99).unwrap_err().is_closed());
        assert!(ch.recv_timeout(Duration::from_millis(5)).unwrap_err().is_closed());
    }

    #[test]
    fn test_open_validates_elem_size() {
        let shm = TestSegment::new("ch_ty");
        Channel::<u64>::create(&shm, "ch", 3).unwrap();
        assert!(Channel::<u32>::open(&shm, "ch").is_err());

        let view = Channel::<u64>::open(&shm, "ch").unwrap();
        view.send(5).unwrap();
        assert_eq!(view.recv().unwrap(), 5);
    }

    #[test]
    fn test_iterator_drains_until_close() {
        let shm = TestSegment::new("ch_iter");
        let ch = Channel::<u32>::create(&shm, "ch", 8).unwrap();
        for v in 0..5 {
            ch.send(v).unwrap();
        }
        ch.close();
        let got: Vec<u32> = ch.iter().collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }
}
