//! The allocation side of the tracer: the two backing allocators, the events
//! they produce and the [`tracer::Tracer`] that routes between them.

use libc::{c_void, size_t};

pub mod event;
pub mod locator;
pub mod pool;
pub mod recorder;
pub mod tracer;

/// The C allocation primitives, as implemented by one concrete allocator.
///
/// Implementations follow C semantics: failures are reported as null (with
/// `errno` set), `free(NULL)` does nothing and `realloc(NULL, n)` allocates.
pub trait BackingAllocator {
    /// # Safety
    ///
    /// The same as C `malloc()`.
    unsafe fn malloc(&self, size: size_t) -> *mut c_void;

    /// # Safety
    ///
    /// The same as C `calloc()`.
    unsafe fn calloc(&self, count: size_t, size: size_t) -> *mut c_void;

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation made by this allocator.
    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void;

    /// # Safety
    ///
    /// The same as C `memalign()`.
    unsafe fn memalign(&self, align: size_t, size: size_t) -> *mut c_void;

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation made by this allocator.
    unsafe fn free(&self, ptr: *mut c_void);
}

/// Which allocator owns a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    Real,
    Pool,
}

/// The alignment that `malloc()` guarantees on every 64-bit glibc target.
pub const MALLOC_ALIGNMENT: usize = 2 * std::mem::size_of::<usize>();

pub(crate) fn set_errno(value: libc::c_int) {
    // SAFETY: `__errno_location()` always returns the calling thread's errno.
    unsafe { *libc::__errno_location() = value }
}
