//! Allocation events as they sit in the recorder's buffer.
//!
//! Events are plain `Copy` data: capturing one never allocates, and only the
//! raw return addresses are kept. Turning addresses into symbols is left to
//! flush time.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub use crate::config::MAX_BACKTRACE_DEPTH;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    Allocate = 1,
    Deallocate = 2,
    Reallocate = 3,
}

impl Operation {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Allocate),
            2 => Some(Self::Deallocate),
            3 => Some(Self::Reallocate),
            _ => None,
        }
    }
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Operation::from_code(code).ok_or_else(|| {
            de::Error::invalid_value(de::Unexpected::Unsigned(code.into()), &"1, 2 or 3")
        })
    }
}

/// An anchor on the stack of an allocation entry point. Frames below it
/// belong to the tracer and are left out of an event's provenance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSite {
    sp: usize,
}

impl CallSite {
    /// No anchor: provenance starts at whatever frame captured it.
    pub const UNKNOWN: Self = Self { sp: 0 };

    /// Anchor at the calling function's frame. This must be inlined into the
    /// entry point, which is what it anchors.
    #[inline(always)]
    pub fn here() -> Self {
        let marker = 0u8;
        Self {
            sp: std::hint::black_box(&marker) as *const u8 as usize,
        }
    }
}

/// Return addresses of the application frames that made a call, innermost
/// first.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
    frames: [usize; MAX_BACKTRACE_DEPTH],
    len: u8,
}

impl Provenance {
    pub const EMPTY: Self = Self {
        frames: [0; MAX_BACKTRACE_DEPTH],
        len: 0,
    };

    pub fn from_frames(frames: &[usize]) -> Self {
        let mut p = Self::EMPTY;
        for &ip in frames.iter().take(MAX_BACKTRACE_DEPTH) {
            p.frames[p.len as usize] = ip;
            p.len += 1;
        }
        p
    }

    /// Walk the stack above `site` and keep the first `depth` return
    /// addresses, starting with the one the entry point that owns `site` will
    /// return to.
    ///
    /// The unwinder reports each frame's stack pointer as it was at the call
    /// out of that frame, so the entry point's own frame sits at or below
    /// `site` and the first frame above it is its caller.
    ///
    /// Unwinding may allocate the first time it touches a module, so this must
    /// only be called from inside instrumentation.
    pub fn capture(site: CallSite, depth: usize) -> Self {
        let depth = depth.min(MAX_BACKTRACE_DEPTH);
        let mut p = Self::EMPTY;
        if depth == 0 {
            return p;
        }
        // SAFETY: only ever called with the tracer's guard held, which keeps
        // unwinds from running concurrently.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let sp = frame.sp() as usize;
                if sp != 0 && sp <= site.sp {
                    return true;
                }
                p.frames[p.len as usize] = frame.ip() as usize;
                p.len += 1;
                (p.len as usize) < depth
            });
        }
        p
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.frames[..self.len as usize]
    }

    /// The `i`th return address, or `0` past the end.
    pub fn get(&self, i: usize) -> usize {
        self.as_slice().get(i).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for Provenance {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for ip in self.as_slice() {
            list.entry(&format_args!("{ip:#x}"));
        }
        list.finish()
    }
}

/// One call to an allocation primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocationEvent {
    pub operation: Operation,
    /// The pointer returned (allocations) or passed in (everything else)
    pub primary: usize,
    /// The pointer returned by a reallocation, `0` otherwise
    pub secondary: usize,
    /// Requested size in bytes, `0` for deallocations
    pub size: usize,
    pub provenance: Provenance,
}

impl AllocationEvent {
    pub const fn allocate(ptr: usize, size: usize) -> Self {
        Self {
            operation: Operation::Allocate,
            primary: ptr,
            secondary: 0,
            size,
            provenance: Provenance::EMPTY,
        }
    }

    pub const fn deallocate(ptr: usize) -> Self {
        Self {
            operation: Operation::Deallocate,
            primary: ptr,
            secondary: 0,
            size: 0,
            provenance: Provenance::EMPTY,
        }
    }

    pub const fn reallocate(old: usize, new: usize, size: usize) -> Self {
        Self {
            operation: Operation::Reallocate,
            primary: old,
            secondary: new,
            size,
            provenance: Provenance::EMPTY,
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}
