//! The fallback pool: a `dlmalloc` heap over a fixed, statically allocated
//! arena.
//!
//! This serves every allocation made before the real allocator is known, and
//! every later operation on a block it handed out. It never asks the system
//! for memory: `dlmalloc` is given an [`ArenaSource`] that hands over the
//! arena as a single segment and refuses everything after that.
//!
//! Each block carries a [`PoolHeader`] directly in front of the pointer we
//! hand out, since C's `free()` does not tell us the size or alignment that
//! `dlmalloc` wants back:
//!
//! ```plaintext
//! +--------------------+ <- what dlmalloc returned (aligned to `align`)
//! | padding...         | `align` bytes
//! | PoolHeader         |
//! +--------------------+ <- what the caller gets
//! | requested size     | `header.size` bytes
//! +--------------------+
//! ```

use std::{
    cell::{Cell, UnsafeCell},
    cmp,
    ptr::{self, NonNull},
};

use libc::{c_void, size_t, ENOMEM};

use super::{set_errno, BackingAllocator, MALLOC_ALIGNMENT};
use crate::{sync::SpinLock, util::num::round_up};

/// Size of the process-wide pool's arena.
pub const POOL_CAPACITY: usize = 10 << 20;

/// Page size reported to `dlmalloc`. The arena is handed over in whole pages.
const ARENA_PAGE: usize = 4096;

/// Backing bytes for a [`FallbackPool`]. Lives in `.bss`, so it costs nothing
/// until touched.
#[repr(C, align(4096))]
pub struct PoolArena<T: ?Sized> {
    bytes: UnsafeCell<T>,
}

// SAFETY: the bytes are only ever accessed through the owning pool's heap,
// which is behind a lock.
unsafe impl<T: ?Sized + Send> Sync for PoolArena<T> {}

impl<const N: usize> PoolArena<[u8; N]> {
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new([0; N]),
        }
    }
}

impl PoolArena<[u8]> {
    fn start(&self) -> usize {
        self.bytes.get().cast::<u8>() as usize
    }

    fn len(&self) -> usize {
        self.bytes.get().len()
    }

    /// The arena's whole pages. `start()` is already page-aligned.
    fn pages(&self) -> (usize, usize) {
        (self.start(), self.len() & !(ARENA_PAGE - 1))
    }
}

static GLOBAL_ARENA: PoolArena<[u8; POOL_CAPACITY]> = PoolArena::new();

/// The process-wide fallback pool.
pub static GLOBAL_POOL: FallbackPool = FallbackPool::new(&GLOBAL_ARENA);

/// Hands `dlmalloc` the rest of the arena as one segment, on the first
/// request that fits. Nothing is ever given back: `dlmalloc` recycles the
/// memory itself.
pub struct ArenaSource {
    arena: &'static PoolArena<[u8]>,
    /// Bytes handed to `dlmalloc` so far
    claimed: Cell<usize>,
}

unsafe impl dlmalloc::Allocator for ArenaSource {
    fn alloc(&self, size: usize) -> (*mut u8, usize, u32) {
        let (base, len) = self.arena.pages();
        let start = self.claimed.get();
        let remaining = len - start;
        if remaining == 0 || round_up(size, ARENA_PAGE) > remaining {
            return (ptr::null_mut(), 0, 0);
        }
        self.claimed.set(len);
        ((base + start) as *mut u8, remaining, 0)
    }

    fn remap(&self, _ptr: *mut u8, _oldsize: usize, _newsize: usize, _can_move: bool) -> *mut u8 {
        ptr::null_mut()
    }

    fn free_part(&self, _ptr: *mut u8, _oldsize: usize, _newsize: usize) -> bool {
        false
    }

    fn free(&self, _ptr: *mut u8, _size: usize) -> bool {
        false
    }

    fn can_release_part(&self, _flags: u32) -> bool {
        false
    }

    fn allocates_zeros(&self) -> bool {
        true
    }

    fn page_size(&self) -> usize {
        ARENA_PAGE
    }
}

struct PoolHeap(dlmalloc::Dlmalloc<ArenaSource>);

// SAFETY: the heap is only reachable through the pool's lock and has no
// thread affinity.
unsafe impl Send for PoolHeap {}

/// Additional metadata that every pool allocation has
#[repr(C)]
struct PoolHeader {
    /// The exact requested size of this allocation
    size: usize,
    /// Alignment (and header offset) the block was allocated with
    align: usize,
}

/// A fixed-capacity allocator that is usable before anything else is.
pub struct FallbackPool {
    arena: &'static PoolArena<[u8]>,
    heap: SpinLock<Option<PoolHeap>>,
}

impl FallbackPool {
    /// A pool over `arena`. The heap itself is only built on first use.
    pub const fn new(arena: &'static PoolArena<[u8]>) -> Self {
        Self {
            arena,
            heap: SpinLock::new(None),
        }
    }

    /// Does `ptr` point into this pool's arena? Never locks.
    pub fn owns<T>(&self, ptr: *const T) -> bool {
        let start = self.arena.start();
        (start..start + self.arena.len()).contains(&(ptr as usize))
    }

    pub fn capacity(&self) -> usize {
        self.arena.pages().1
    }

    /// Bytes of the arena that the heap has claimed so far.
    pub fn used(&self) -> usize {
        self.heap
            .lock()
            .as_ref()
            .map_or(0, |heap| heap.0.allocator().claimed.get())
    }

    pub fn is_initialized(&self) -> bool {
        self.heap.lock().is_some()
    }

    fn with_heap<R>(&self, f: impl FnOnce(&mut dlmalloc::Dlmalloc<ArenaSource>) -> R) -> R {
        let mut heap = self.heap.lock();
        let heap = heap.get_or_insert_with(|| {
            PoolHeap(dlmalloc::Dlmalloc::new_with_allocator(ArenaSource {
                arena: self.arena,
                claimed: Cell::new(0),
            }))
        });
        f(&mut heap.0)
    }

    /// Allocate `size` bytes aligned to `align` (a power of two).
    fn allocate(&self, size: usize, align: usize, zeroed: bool) -> Option<NonNull<u8>> {
        let align = cmp::max(align, MALLOC_ALIGNMENT);
        let total = size.checked_add(align)?;
        // SAFETY: `align` is a power of two and `total` is non-zero
        let raw = self.with_heap(|heap| unsafe { heap.malloc(total, align) });
        let raw = NonNull::new(raw)?;
        // SAFETY: the block is `align + size` bytes, so both the header (in the
        // last `size_of::<PoolHeader>()` bytes of the padding) and the data are
        // in bounds. `align >= 16` keeps the header aligned.
        unsafe {
            let data = raw.as_ptr().add(align);
            data.cast::<PoolHeader>()
                .sub(1)
                .write(PoolHeader { size, align });
            if zeroed {
                ptr::write_bytes(data, 0, size);
            }
            Some(NonNull::new_unchecked(data))
        }
    }

    /// # Safety
    ///
    /// `data` must be a live allocation from this pool.
    unsafe fn header(&self, data: *mut u8) -> PoolHeader {
        data.cast::<PoolHeader>().sub(1).read()
    }

    /// # Safety
    ///
    /// `data` must be a live allocation from this pool.
    unsafe fn deallocate(&self, data: *mut u8) {
        debug_assert!(self.owns(data));
        let header = self.header(data);
        let raw = data.sub(header.align);
        self.with_heap(|heap| heap.free(raw, header.size + header.align, header.align));
    }

    fn out_of_memory() -> *mut c_void {
        set_errno(ENOMEM);
        ptr::null_mut()
    }
}

impl BackingAllocator for FallbackPool {
    unsafe fn malloc(&self, size: size_t) -> *mut c_void {
        match self.allocate(size, MALLOC_ALIGNMENT, false) {
            Some(data) => data.as_ptr().cast(),
            None => Self::out_of_memory(),
        }
    }

    unsafe fn calloc(&self, count: size_t, size: size_t) -> *mut c_void {
        match count
            .checked_mul(size)
            .and_then(|bytes| self.allocate(bytes, MALLOC_ALIGNMENT, true))
        {
            Some(data) => data.as_ptr().cast(),
            None => Self::out_of_memory(),
        }
    }

    /// `realloc(p, 0)` frees `p` and returns null, like glibc.
    unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        if ptr.is_null() {
            return self.malloc(size);
        }
        if size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        let old = self.header(ptr.cast());
        let Some(new) = self.allocate(size, old.align, false) else {
            return Self::out_of_memory();
        };
        ptr::copy_nonoverlapping(ptr.cast::<u8>(), new.as_ptr(), cmp::min(old.size, size));
        self.deallocate(ptr.cast());
        new.as_ptr().cast()
    }

    /// Non-power-of-two alignments are rounded up, like glibc.
    unsafe fn memalign(&self, align: size_t, size: size_t) -> *mut c_void {
        let align = match align.checked_next_power_of_two() {
            Some(align) => align,
            None => return Self::out_of_memory(),
        };
        match self.allocate(size, align, false) {
            Some(data) => data.as_ptr().cast(),
            None => Self::out_of_memory(),
        }
    }

    unsafe fn free(&self, ptr: *mut c_void) {
        if !ptr.is_null() {
            self.deallocate(ptr.cast());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SMALL_ARENA: PoolArena<[u8; 1 << 20]> = PoolArena::new();
    static SMALL: FallbackPool = FallbackPool::new(&SMALL_ARENA);

    #[test]
    fn pool_is_built_lazily_and_owns_its_blocks() {
        static LAZY_ARENA: PoolArena<[u8; 64 << 10]> = PoolArena::new();
        static LAZY: FallbackPool = FallbackPool::new(&LAZY_ARENA);

        assert!(!LAZY.is_initialized());
        unsafe {
            let p = LAZY.malloc(24);
            assert!(LAZY.is_initialized());
            assert!(LAZY.owns(p));
            assert!(!SMALL.owns(p));
            LAZY.free(p);
        }
        let local = 5u8;
        assert!(!LAZY.owns(&local));
    }

    #[test]
    fn small_arenas_are_usable_to_the_end() {
        static SNUG_ARENA: PoolArena<[u8; 64 << 10]> = PoolArena::new();
        static SNUG: FallbackPool = FallbackPool::new(&SNUG_ARENA);

        assert_eq!(SNUG.capacity(), 64 << 10);
        assert_eq!(SNUG.used(), 0);
        let mut blocks = Vec::new();
        unsafe {
            loop {
                let p = SNUG.malloc(1024);
                if p.is_null() {
                    break;
                }
                blocks.push(p);
            }
        }
        assert_eq!(SNUG.used(), SNUG.capacity());
        assert!(blocks.len() * 1024 >= SNUG.capacity() * 3 / 4, "{}", blocks.len());
        for p in blocks {
            unsafe { SNUG.free(p) };
        }
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        unsafe {
            let p = SMALL.malloc(256).cast::<u8>();
            ptr::write_bytes(p, 0xAB, 256);
            SMALL.free(p.cast());

            let q = SMALL.calloc(16, 16).cast::<u8>();
            assert!(std::slice::from_raw_parts(q, 256).iter().all(|&b| b == 0));
            SMALL.free(q.cast());

            assert!(SMALL.calloc(usize::MAX, 2).is_null());
        }
    }

    #[test]
    fn realloc_preserves_contents_and_alignment() {
        unsafe {
            let p = SMALL.memalign(256, 10).cast::<u8>();
            assert_eq!(p as usize % 256, 0);
            for i in 0..10 {
                *p.add(i) = i as u8;
            }
            let q = SMALL.realloc(p.cast(), 5000).cast::<u8>();
            assert_eq!(q as usize % 256, 0);
            for i in 0..10 {
                assert_eq!(*q.add(i), i as u8);
            }
            assert!(SMALL.realloc(q.cast(), 0).is_null());
        }
    }

    #[test]
    fn odd_alignments_round_up() {
        unsafe {
            let p = SMALL.memalign(48, 8);
            assert_eq!(p as usize % 64, 0);
            SMALL.free(p);
        }
    }

    #[test]
    fn exhaustion_returns_null() {
        static TINY_ARENA: PoolArena<[u8; 256 << 10]> = PoolArena::new();
        static TINY: FallbackPool = FallbackPool::new(&TINY_ARENA);

        unsafe {
            assert!(TINY.malloc(1 << 20).is_null());
            assert_eq!(*libc::__errno_location(), ENOMEM);
            let mut blocks = Vec::new();
            loop {
                let p = TINY.malloc(4096);
                if p.is_null() {
                    break;
                }
                blocks.push(p);
            }
            assert!(!blocks.is_empty());
            assert!(TINY.used() <= TINY.capacity());
            for p in blocks {
                TINY.free(p);
            }
            assert!(!TINY.malloc(4096).is_null());
        }
    }
}
