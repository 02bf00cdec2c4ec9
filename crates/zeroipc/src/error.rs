use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds for segment and container operations.
///
/// All failures are returned; nothing is retried inside the library except
/// the CAS loops that are a natural part of the lock-free algorithms.
/// `Full`, `Empty` and `Timeout` are expected, non-exceptional outcomes of
/// non-blocking calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Name absent from the segment table (or OS object absent on attach).
    #[error("name not found")]
    NotFound,

    /// Name already present in the table, or OS object already exists.
    #[error("name already exists")]
    AlreadyExists,

    /// Container or table has no capacity for the requested operation.
    #[error("no capacity left")]
    Full,

    /// Container has no element to return.
    #[error("no element available")]
    Empty,

    /// Arena lacks contiguous bytes for the requested allocation.
    #[error("segment arena exhausted")]
    OutOfSpace,

    /// Zero capacity, over-long name, negative count, and similar.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Attached region does not start with the segment magic.
    #[error("not a zeroipc segment (bad magic)")]
    InvalidMagic,

    /// Attached segment was written by an incompatible format version.
    #[error("segment format version mismatch")]
    VersionMismatch,

    /// Stored element (or key) size differs from the opener's type.
    #[error("stored element size does not match requested type")]
    TypeMismatch,

    /// Counter or size computation would overflow its representation.
    #[error("count or size overflow")]
    Overflow,

    /// Backing OS operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Time-bounded operation expired.
    #[error("operation timed out")]
    Timeout,

    /// Send or emit on a closed endpoint, or recv after close and drain.
    #[error("endpoint is closed")]
    Closed,

    /// Operation requested on a type that cannot satisfy it.
    #[error("operation not supported for this element type")]
    NotSupported,
}
