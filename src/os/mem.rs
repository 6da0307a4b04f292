use std::{io, ptr};

use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use once_cell::sync::Lazy;

use crate::util::num::round_up;

static PAGE_SIZE: Lazy<usize> = Lazy::new(page_size::get);

/// An anonymous, private, read/write mapping that is unmapped on drop. Memory
/// obtained this way never passes through `malloc()`, so the tracer can hold
/// buffers of any size without tracing itself.
pub struct MmapRegion {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the region is plain memory that we exclusively own.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// `mmap()` a read/write, page-aligned arena of memory of `size` bytes (or
    /// more -- the resulting arena is always a whole number of pages). This is
    /// guaranteed to map at least 1 page. The pages are zeroed.
    pub fn map_noreserve(size: usize) -> io::Result<MmapRegion> {
        let size = round_up(size.max(1), *PAGE_SIZE);
        // SAFETY: an anonymous mapping with a null hint has no preconditions.
        let ptr = unsafe {
            mmap(
                ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_NORESERVE | MAP_ANONYMOUS | MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MmapRegion {
            ptr: ptr.cast(),
            size,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Length of the mapping in bytes (always a multiple of the page size)
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // - The address addr must be a multiple of the page size (but length
        //   need not be). This is guaranteed true because we can only construct
        //   this region as page-aligned
        // - All pages containing a part of the indicated range are unmapped.
        //   This is fine, because we requested a region of at least `self.size`
        //   bytes and never mutated it.
        unsafe {
            munmap(self.ptr.cast(), self.size);
        }
    }
}
