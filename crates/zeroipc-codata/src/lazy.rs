//! Memoizing lazy value: a thunk with an at-most-once cache.
//!
//! The computation is described by a small descriptor stored inline in
//! shared memory (a constant, an arithmetic combination of two inline
//! operands, or a boolean connective), so any process can force it. The
//! first `force` wins the `NotComputed → Computing` CAS and evaluates; other
//! forcers spin until the cached result is published. The `External` tag is
//! reserved for caller-supplied evaluators and currently reports
//! `NotSupported`.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use zeroipc::{Backoff, Error as IpcError, Pod, RawRegion, Segment};

use crate::error::Result;

const NOT_COMPUTED: u32 = 0;
const COMPUTING: u32 = 1;
const COMPUTED: u32 = 2;
const ERROR: u32 = 3;

const OP_CONSTANT: u32 = 0;
const OP_ADD: u32 = 1;
const OP_MULTIPLY: u32 = 2;
const OP_NEGATE: u32 = 3;
const OP_EXTERNAL: u32 = 4;
const OP_AND: u32 = 5;
const OP_OR: u32 = 6;
const OP_XOR: u32 = 7;
const OP_NOT: u32 = 8;

/// Element types a [`Lazy`] descriptor can operate on.
///
/// The arithmetic hooks default to "unsupported"; numeric types override
/// them, and `bool` overrides the boolean connectives. Forcing a descriptor
/// whose operation the type does not support reports `NotSupported`.
pub trait LazyOperand: Pod {
    fn op_add(_a: Self, _b: Self) -> Option<Self> {
        None
    }
    fn op_multiply(_a: Self, _b: Self) -> Option<Self> {
        None
    }
    fn op_negate(_a: Self) -> Option<Self> {
        None
    }
    fn op_and(_a: Self, _b: Self) -> Option<Self> {
        None
    }
    fn op_or(_a: Self, _b: Self) -> Option<Self> {
        None
    }
    fn op_xor(_a: Self, _b: Self) -> Option<Self> {
        None
    }
    fn op_not(_a: Self) -> Option<Self> {
        None
    }
}

macro_rules! impl_int_operand {
    ($($t:ty),* $(,)?) => {
        $(impl LazyOperand for $t {
            fn op_add(a: Self, b: Self) -> Option<Self> {
                Some(a.wrapping_add(b))
            }
            fn op_multiply(a: Self, b: Self) -> Option<Self> {
                Some(a.wrapping_mul(b))
            }
            fn op_negate(a: Self) -> Option<Self> {
                Some(a.wrapping_neg())
            }
        })*
    };
}

macro_rules! impl_float_operand {
    ($($t:ty),* $(,)?) => {
        $(impl LazyOperand for $t {
            fn op_add(a: Self, b: Self) -> Option<Self> {
                Some(a + b)
            }
            fn op_multiply(a: Self, b: Self) -> Option<Self> {
                Some(a * b)
            }
            fn op_negate(a: Self) -> Option<Self> {
                Some(-a)
            }
        })*
    };
}

impl_int_operand!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);
impl_float_operand!(f32, f64);

impl LazyOperand for bool {
    fn op_and(a: Self, b: Self) -> Option<Self> {
        Some(a && b)
    }
    fn op_or(a: Self, b: Self) -> Option<Self> {
        Some(a || b)
    }
    fn op_xor(a: Self, b: Self) -> Option<Self> {
        Some(a ^ b)
    }
    fn op_not(a: Self) -> Option<Self> {
        Some(!a)
    }
}

#[repr(C)]
struct LazyHeader<T> {
    state: AtomicU32,
    compute_count: AtomicU32,
    op: u32,
    external_id: u32,
    elem_size: u32,
    reserved: u32,
    operands: [T; 2],
    cached: T,
}

/// Named cross-process memoized thunk.
pub struct Lazy<T: LazyOperand> {
    region: RawRegion,
    segment: Segment,
    _marker: PhantomData<T>,
}

unsafe impl<T: LazyOperand> Send for Lazy<T> {}
unsafe impl<T: LazyOperand> Sync for Lazy<T> {}

impl<T: LazyOperand> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region,
            segment: self.segment.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: LazyOperand> Lazy<T> {
    const SIZE: usize = mem::size_of::<LazyHeader<T>>();

    fn create_with(
        segment: &Segment,
        name: &str,
        op: u32,
        operands: [T; 2],
        external_id: u32,
    ) -> Result<Self> {
        if mem::align_of::<T>() > 8 {
            return Err(IpcError::NotSupported.into());
        }
        let region = segment.allocate_region(name, Self::SIZE as u64)?;
        let header = region.as_ptr().cast::<LazyHeader<T>>();
        unsafe {
            (*header).state.store(NOT_COMPUTED, Ordering::Relaxed);
            (*header).compute_count.store(0, Ordering::Relaxed);
            (*header).op = op;
            (*header).external_id = external_id;
            (*header).elem_size = mem::size_of::<T>() as u32;
            (*header).reserved = 0;
            ptr::addr_of_mut!((*header).operands).write(operands);
        }
        Ok(Self {
            region,
            segment: segment.clone(),
            _marker: PhantomData,
        })
    }

    /// Create an already-computed constant.
    pub fn constant(segment: &Segment, name: &str, value: T) -> Result<Self> {
        let lazy = Self::create_with(segment, name, OP_CONSTANT, [value, value], 0)?;
        let header = lazy.header_ptr();
        unsafe { ptr::addr_of_mut!((*header).cached).write(value) };
        lazy.header().state.store(COMPUTED, Ordering::Release);
        Ok(lazy)
    }

    /// Deferred `a + b`.
    pub fn add(segment: &Segment, name: &str, a: T, b: T) -> Result<Self> {
        Self::create_with(segment, name, OP_ADD, [a, b], 0)
    }

    /// Deferred `a * b`.
    pub fn multiply(segment: &Segment, name: &str, a: T, b: T) -> Result<Self> {
        Self::create_with(segment, name, OP_MULTIPLY, [a, b], 0)
    }

    /// Deferred `-a`.
    pub fn negate(segment: &Segment, name: &str, a: T) -> Result<Self> {
        Self::create_with(segment, name, OP_NEGATE, [a, a], 0)
    }

    /// Deferred `a && b` (short-circuit; `bool` only).
    pub fn and(segment: &Segment, name: &str, a: T, b: T) -> Result<Self> {
        Self::create_with(segment, name, OP_AND, [a, b], 0)
    }

    /// Deferred `a || b` (short-circuit; `bool` only).
    pub fn or(segment: &Segment, name: &str, a: T, b: T) -> Result<Self> {
        Self::create_with(segment, name, OP_OR, [a, b], 0)
    }

    /// Deferred `a ^ b` (`bool` only).
    pub fn xor(segment: &Segment, name: &str, a: T, b: T) -> Result<Self> {
        Self::create_with(segment, name, OP_XOR, [a, b], 0)
    }

    /// Deferred `!a` (`bool` only).
    pub fn not(segment: &Segment, name: &str, a: T) -> Result<Self> {
        Self::create_with(segment, name, OP_NOT, [a, a], 0)
    }

    /// Reserved hook for caller-supplied evaluators; forcing it reports
    /// `NotSupported`.
    pub fn external(segment: &Segment, name: &str, id: u32) -> Result<Self> {
        let zero = unsafe { mem::zeroed::<T>() };
        Self::create_with(segment, name, OP_EXTERNAL, [zero, zero], id)
    }

    /// Open an existing lazy value, validating the stored element size.
    pub fn open(segment: &Segment, name: &str) -> Result<Self> {
        if mem::align_of::<T>() > 8 {
            return Err(IpcError::NotSupported.into());
        }
        let region = segment.open_region(name)?;
        if (region.len() as usize) < Self::SIZE {
            return Err(IpcError::TypeMismatch.into());
        }
        let stored = unsafe { (*region.as_ptr().cast::<LazyHeader<T>>()).elem_size };
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
    fn header(&self) -> &LazyHeader<T> {
        unsafe { &*self.region.as_ptr().cast::<LazyHeader<T>>() }
    }

    #[inline]
    fn header_ptr(&self) -> *mut LazyHeader<T> {
        self.region.as_ptr().cast::<LazyHeader<T>>()
    }

    fn operand(&self, index: usize) -> T {
        unsafe { ptr::addr_of!((*self.header_ptr()).operands).cast::<T>().add(index).read() }
    }

    fn evaluate(&self) -> Result<T> {
        let h = self.header();
        let a = self.operand(0);
        let b = self.operand(1);
        let result = match h.op {
            OP_CONSTANT => Some(a),
            OP_ADD => T::op_add(a, b),
            OP_MULTIPLY => T::op_multiply(a, b),
            OP_NEGATE => T::op_negate(a),
            OP_AND => T::op_and(a, b),
            OP_OR => T::op_or(a, b),
            OP_XOR => T::op_xor(a, b),
            OP_NOT => T::op_not(a),
            _ => None, // External and unknown tags are unsupported
        };
        result.ok_or_else(|| IpcError::NotSupported.into())
    }

    /// Evaluate at most once and return the cached result.
    pub fn force(&self) -> Result<T> {
        let h = self.header();
        let mut backoff = Backoff::new();
        loop {
            match h.state.load(Ordering::Acquire) {
                COMPUTED => {
                    return Ok(unsafe { ptr::addr_of!((*self.header_ptr()).cached).read() })
                }
                // The failure is deterministic from the descriptor, so every
                // forcer reconstructs the same error.
                ERROR => return self.evaluate(),
                NOT_COMPUTED => {
                    if h.state
                        .compare_exchange(
                            NOT_COMPUTED,
                            COMPUTING,
                            Ordering::Acquire,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                    {
                        match self.evaluate() {
                            Ok(value) => {
                                unsafe {
                                    ptr::addr_of_mut!((*self.header_ptr()).cached).write(value);
                                }
                                h.compute_count.fetch_add(1, Ordering::Relaxed);
                                h.state.store(COMPUTED, Ordering::Release);
                                return Ok(value);
                            }
                            Err(err) => {
                                h.state.store(ERROR, Ordering::Release);
                                return Err(err);
                            }
                        }
                    }
                }
                _ => backoff.snooze(), // another forcer is computing
            }
        }
    }

    /// Allow re-evaluation. Returns `true` if the state went back from
    /// `Computed` to `NotComputed`.
    pub fn reset(&self) -> bool {
        self.header()
            .state
            .compare_exchange(COMPUTED, NOT_COMPUTED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Whether a cached result is available.
    pub fn is_computed(&self) -> bool {
        self.header().state.load(Ordering::Acquire) == COMPUTED
    }

    /// Successful evaluations since creation (1 unless `reset` is used).
    pub fn compute_count(&self) -> u32 {
        self.header().compute_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}
