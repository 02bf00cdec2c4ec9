//! Segment handle: an owned or attached mapping plus its metadata table.
//!
//! A creator process calls [`Segment::create`]; any number of others call
//! [`Segment::attach`]. Containers are then constructed by name — each
//! construction reserves arena bytes and records a table entry — and other
//! processes open them by the same name. The handle is cheap to clone; all
//! clones share one mapping.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::table::Table;

/// One active metadata-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// A named byte range handed out by the arena allocator.
///
/// Container constructors reinterpret the range as a header plus payload.
/// This is also the extension point for building custom structures on top of
/// a segment.
#[derive(Debug, Clone, Copy)]
pub struct RawRegion {
    ptr: NonNull<u8>,
    offset: u32,
    len: u32,
}

impl RawRegion {
    /// Base of the region within this process's mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Byte offset from the segment base (stable across processes).
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Allocation length in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

struct SegmentInner {
    shm: crate::shm::ShmObject,
    name: String,
    owner: bool,
    // Serializes table mutation within this process. Cross-process structure
    // creation must be coordinated by the callers; concurrent *use* of
    // already-created structures needs no coordination at all.
    alloc: Mutex<()>,
}

/// Shared-memory segment handle.
#[derive(Clone)]
pub struct Segment {
    inner: Arc<SegmentInner>,
}

impl Segment {
    /// Create a new segment: OS-create the object, zero it, and write the
    /// table header.
    ///
    /// `bytes` must leave room for the table (32 + 40 × `max_entries`
    /// bytes) plus whatever the caller intends to allocate.
    pub fn create(name: &str, bytes: usize, max_entries: u32) -> Result<Self> {
        if max_entries == 0 {
            return Err(Error::InvalidArgument("max_entries must be non-zero"));
        }
        if (bytes as u64) < Table::reserved_bytes(max_entries) {
            return Err(Error::InvalidArgument("segment too small for its table"));
        }

        let shm = crate::shm::ShmObject::create(name, bytes)?;
        Table::new(shm.base(), shm.len()).init(max_entries);

        Ok(Self {
            inner: Arc::new(SegmentInner {
                shm,
                name: name.to_owned(),
                owner: true,
                alloc: Mutex::new(()),
            }),
        })
    }

    /// Attach to an existing segment and verify its magic and version.
    pub fn attach(name: &str) -> Result<Self> {
        let shm = crate::shm::ShmObject::attach(name)?;
        Table::new(shm.base(), shm.len()).validate()?;

        Ok(Self {
            inner: Arc::new(SegmentInner {
                shm,
                name: name.to_owned(),
                owner: false,
                alloc: Mutex::new(()),
            }),
        })
    }

    /// Remove the OS name. Existing mappings stay valid until dropped; the
    /// object's bytes live on until the last mapping goes away.
    pub fn unlink(name: &str) -> Result<()> {
        crate::shm::ShmObject::unlink(name)
    }

    fn table(&self) -> Table {
        Table::new(self.inner.shm.base(), self.inner.shm.len())
    }

    /// Reserve `size` arena bytes under `name` and record a table entry.
    ///
    /// The returned region starts 8-byte aligned. Erased entries never give
    /// their bytes back; the arena cursor only moves forward.
    pub fn allocate_region(&self, name: &str, size: u64) -> Result<RawRegion> {
        let _guard = self.inner.alloc.lock().expect("allocation lock poisoned");
        let offset = self.table().allocate(name, size)?;
        Ok(self.region_at(offset, size as u32))
    }

    /// Look up `name` and bind to its byte range.
    pub fn open_region(&self, name: &str) -> Result<RawRegion> {
        let _guard = self.inner.alloc.lock().expect("allocation lock poisoned");
        let (offset, size) = self.table().find(name).ok_or(Error::NotFound)?;
        Ok(self.region_at(offset, size))
    }

    fn region_at(&self, offset: u32, size: u32) -> RawRegion {
        // Offsets recorded by `allocate` are validated against the segment
        // length before they reach the table.
        let ptr = unsafe {
            NonNull::new_unchecked(self.inner.shm.base().as_ptr().add(offset as usize))
        };
        RawRegion {
            ptr,
            offset,
            len: size,
        }
    }

    /// Whether `name` is present in the table.
    pub fn find(&self, name: &str) -> Option<(u32, u32)> {
        let _guard = self.inner.alloc.lock().expect("allocation lock poisoned");
        self.table().find(name)
    }

    /// Drop `name` from the table. The allocation's bytes are not reclaimed,
    /// and erasing a structure another process is still using is undefined
    /// behavior.
    pub fn erase(&self, name: &str) -> bool {
        let _guard = self.inner.alloc.lock().expect("allocation lock poisoned");
        self.table().erase(name)
    }

    /// Number of active table entries.
    pub fn count(&self) -> u32 {
        self.table().count()
    }

    /// Entry capacity chosen at creation.
    pub fn max_entries(&self) -> u32 {
        self.table().max_entries()
    }

    /// Table slots still available for new structures.
    pub fn free_entries(&self) -> u32 {
        self.max_entries() - self.count()
    }

    /// Snapshot of the active entries, in table order.
    pub fn entries(&self) -> Vec<SegmentEntry> {
        let _guard = self.inner.alloc.lock().expect("allocation lock poisoned");
        self.table()
            .entries()
            .into_iter()
            .map(|(name, offset, size)| SegmentEntry { name, offset, size })
            .collect()
    }

    /// Iterate over a snapshot of the active entries.
    pub fn iter(&self) -> impl Iterator<Item = SegmentEntry> {
        self.entries().into_iter()
    }

    /// Bounds-checked pointer into the mapping.
    pub fn at(&self, offset: usize) -> Result<*mut u8> {
        if offset >= self.size() {
            return Err(Error::InvalidArgument("offset past end of segment"));
        }
        Ok(unsafe { self.inner.shm.base().as_ptr().add(offset) })
    }

    /// Segment length in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.inner.shm.len()
    }

    /// OS object name (`"/name"`).
    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether this handle created the segment.
    #[inline]
    pub fn is_owner(&self) -> bool {
        self.inner.owner
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.inner.name)
            .field("size", &self.size())
            .field("owner", &self.inner.owner)
            .field("entries", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_name(tag: &str) -> String {
        format!(
            "/zi_{tag}_{}_{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    struct Unlink(String);
    impl Drop for Unlink {
        fn drop(&mut self) {
            let _ = Segment::unlink(&self.0);
        }
    }

    #[test]
    fn test_create_validates_arguments() {
        let name = unique_name("seg_args");
        assert!(matches!(
            Segment::create(&name, 1 << 20, 0),
            Err(Error::InvalidArgument(_))
        ));
        // 64 entries need 32 + 40*64 = 2592 bytes just for the table.
        assert!(matches!(
            Segment::create(&name, 1024, 64),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_create_attach_roundtrip() {
        let name = unique_name("seg_rt");
        let _cleanup = Unlink(name.clone());

        let seg = Segment::create(&name, 1 << 20, 64).unwrap();
        assert!(seg.is_owner());
        assert_eq!(seg.count(), 0);

        seg.allocate_region("numbers", 128).unwrap();

        let other = Segment::attach(&name).unwrap();
        assert!(!other.is_owner());
        assert_eq!(other.count(), 1);
        let region = other.open_region("numbers").unwrap();
        assert_eq!(region.len(), 128);
        assert_eq!(region.offset() % 8, 0);
    }

    #[test]
    fn test_attach_missing_is_not_found() {
        let name = unique_name("seg_missing");
        assert!(matches!(Segment::attach(&name), Err(Error::NotFound)));
    }

    #[test]
    fn test_entries_snapshot_and_erase() {
        let name = unique_name("seg_entries");
        let _cleanup = Unlink(name.clone());

        let seg = Segment::create(&name, 1 << 20, 16).unwrap();
        seg.allocate_region("first", 64).unwrap();
        seg.allocate_region("second", 64).unwrap();

        let names: Vec<_> = seg.iter().map(|e| e.name).collect();
        assert_eq!(names, ["first", "second"]);

        assert!(seg.erase("first"));
        assert_eq!(seg.count(), 1);
        assert!(matches!(seg.open_region("first"), Err(Error::NotFound)));

        // The freed slot is reused; the bytes are not.
        let before = seg.entries()[0].offset;
        let region = seg.allocate_region("third", 64).unwrap();
        assert!(region.offset() > before);
    }

    #[test]
    fn test_unlink_then_attach_fails() {
        let name = unique_name("seg_unlink");
        let seg = Segment::create(&name, 1 << 16, 8).unwrap();
        Segment::unlink(&name).unwrap();
        // Existing mapping still works.
        seg.allocate_region("post_unlink", 32).unwrap();
        assert!(matches!(Segment::attach(&name), Err(Error::NotFound)));
    }
}
