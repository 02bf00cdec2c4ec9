//! POSIX shared-memory backend.
//!
//! Thin wrapper over `shm_open`/`mmap`. Dropping a mapping only unmaps it;
//! the OS object persists until someone calls [`ShmObject::unlink`].

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Owned mapping of a POSIX shared-memory object.
pub(crate) struct ShmObject {
    base: NonNull<u8>,
    len: usize,
}

// The mapping is shared by design; all synchronization happens through
// atomics placed inside it.
unsafe impl Send for ShmObject {}
unsafe impl Sync for ShmObject {}

fn os_name(name: &str) -> Result<CString> {
    if name.len() < 2 || !name.starts_with('/') || name[1..].contains('/') {
        return Err(Error::InvalidArgument(
            "shared memory name must be \"/name\" with no inner slashes",
        ));
    }
    CString::new(name).map_err(|_| Error::InvalidArgument("shared memory name contains NUL"))
}

impl ShmObject {
    /// Create a new OS object of exactly `len` bytes, map it, and zero it.
    pub(crate) fn create(name: &str, len: usize) -> Result<Self> {
        let c_name = os_name(name)?;
        if len == 0 {
            return Err(Error::InvalidArgument("segment size must be non-zero"));
        }

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::EEXIST) {
                Error::AlreadyExists
            } else {
                Error::Io(err)
            });
        }

        if unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(Error::Io(err));
        }

        let base = match Self::map(fd, len) {
            Ok(base) => base,
            Err(err) => {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(err);
            }
        };

        // Fresh pages are zero-filled by the OS, but make the contract
        // explicit: a created segment starts as all zeroes.
        unsafe { base.as_ptr().write_bytes(0, len) };

        Ok(Self { base, len })
    }

    /// Map an existing OS object, taking its current size.
    pub(crate) fn attach(name: &str) -> Result<Self> {
        let c_name = os_name(name)?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o600 as libc::c_uint) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::ENOENT) {
                Error::NotFound
            } else {
                Error::Io(err)
            });
        }

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Io(err));
        }
        let len = st.st_size as usize;
        if len == 0 {
            unsafe { libc::close(fd) };
            return Err(Error::InvalidMagic);
        }

        let base = Self::map(fd, len)?;
        Ok(Self { base, len })
    }

    /// Remove the OS name. Existing mappings stay valid until unmapped.
    pub(crate) fn unlink(name: &str) -> Result<()> {
        let c_name = os_name(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            return Err(if err.raw_os_error() == Some(libc::ENOENT) {
                Error::NotFound
            } else {
                Error::Io(err)
            });
        }
        Ok(())
    }

    /// mmap the object and close the descriptor (the mapping keeps the
    /// object alive).
    fn map(fd: libc::c_int, len: usize) -> Result<NonNull<u8>> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let map_err = if ptr == libc::MAP_FAILED {
            Some(io::Error::last_os_error())
        } else {
            None
        };
        unsafe { libc::close(fd) };
        match map_err {
            Some(err) => Err(Error::Io(err)),
            None => NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| Error::Io(io::Error::other("mmap returned null"))),
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}
