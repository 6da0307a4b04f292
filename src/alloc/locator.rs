//! Finding the allocator we interpose on.
//!
//! Resolution happens once, lazily, on the first allocation that needs it.
//! While it is in progress (and `dlsym()` is busy allocating on our behalf)
//! the locator reports itself unresolved and callers fall back to the pool.

use std::{ffi::CStr, mem, ptr};

use libc::{c_void, size_t};

use super::BackingAllocator;
use crate::{
    lazy_lock::{LazyLock, LazyLockState},
    rawln,
};

pub type MallocFn = unsafe extern "C" fn(size_t) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type MemalignFn = unsafe extern "C" fn(size_t, size_t) -> *mut c_void;

/// Where to look up symbols.
///
/// # Safety
///
/// A non-null result of `lookup(name)` must be the address of a function
/// with the C signature of the libc function `name` (or of its `__libc_`
/// alias). `lookup` must not call the tracer's own entry points other than
/// through ordinary allocation.
pub unsafe trait SymbolSource: Sync {
    /// The address of `name`, or null.
    fn lookup(&self, name: &CStr) -> *mut c_void;
}

/// The next definition after ours in the dynamic linker's search order, which
/// is the C library's allocator when we are preloaded.
pub struct NextInChain;

// SAFETY: `dlsym()` returns the real libc definitions.
unsafe impl SymbolSource for NextInChain {
    fn lookup(&self, name: &CStr) -> *mut c_void {
        // SAFETY: `name` is NUL-terminated
        unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) }
    }
}

/// Each primitive, by its public name and its glibc-internal alias.
const PRIMITIVES: [(&CStr, &CStr); 5] = [
    (c"malloc", c"__libc_malloc"),
    (c"calloc", c"__libc_calloc"),
    (c"realloc", c"__libc_realloc"),
    (c"free", c"__libc_free"),
    (c"memalign", c"__libc_memalign"),
];

/// The allocation primitives of the real allocator.
#[derive(Clone, Copy, Debug)]
pub struct RealAllocator {
    malloc: MallocFn,
    calloc: CallocFn,
    realloc: ReallocFn,
    free: FreeFn,
    memalign: MemalignFn,
}

impl RealAllocator {
    /// Resolve every primitive through `source`, trying the public name
    /// first. All five must be found.
    pub fn from_source<S: SymbolSource + ?Sized>(source: &S) -> Option<Self> {
        let mut found = [ptr::null_mut(); PRIMITIVES.len()];
        for (slot, (name, alias)) in found.iter_mut().zip(PRIMITIVES) {
            let mut addr = source.lookup(name);
            if addr.is_null() {
                addr = source.lookup(alias);
            }
            if addr.is_null() {
                return None;
            }
            *slot = addr;
        }
        let [malloc, calloc, realloc, free, memalign] = found;
        // SAFETY: `SymbolSource` guarantees each address has the signature of
        // the primitive it was looked up as.
        unsafe {
            Some(Self {
                malloc: mem::transmute::<*mut c_void, MallocFn>(malloc),
                calloc: mem::transmute::<*mut c_void, CallocFn>(calloc),
                realloc: mem::transmute::<*mut c_void, ReallocFn>(realloc),
                free: mem::transmute::<*mut c_void, FreeFn>(free),
                memalign: mem::transmute::<*mut c_void, MemalignFn>(memalign),
            })
        }
    }
}

impl BackingAllocator for RealAllocator {
    unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        (self.malloc)(size)
    }

    unsafe fn calloc(&self, count: size_t, size: size_t) -> *mut c_void {
        (self.calloc)(count, size)
    }

    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        (self.realloc)(ptr, size)
    }

    unsafe fn memalign(&self, align: size_t, size: size_t) -> *mut c_void {
        (self.memalign)(align, size)
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        (self.free)(ptr)
    }
}

pub struct Locator<S> {
    source: S,
    real: LazyLock<RealAllocator>,
}

impl<S: SymbolSource> Locator<S> {
    pub const fn new(source: S) -> Self {
        Self {
            source,
            real: LazyLock::new(),
        }
    }

    /// The real allocator, resolving it first if nobody has tried yet. `None`
    /// while resolution is in progress (on any thread) and forever after it
    /// has failed.
    pub fn resolve(&self) -> Option<&RealAllocator> {
        self.real.get_or_try_init(|| {
            let real = RealAllocator::from_source(&self.source);
            if real.is_none() {
                rawln!("alloc-trace: could not locate the real allocator, serving everything from the fallback pool");
            }
            real
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.real.get().is_some()
    }

    pub fn state(&self) -> LazyLockState {
        LazyLock::state(&self.real)
    }
}
