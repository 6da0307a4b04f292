//! Locks that are safe to take from inside `malloc()`.
//!
//! Neither lock here allocates, parks through a global table, or touches
//! thread-local storage (which may itself call `malloc()` the first time a
//! thread touches it in a `dlopen()`ed object). Waiters spin with
//! exponential backoff.

pub mod reentrant;
pub mod spin;

pub use reentrant::{ReentrantGuard, ReentrantLock};
pub use spin::{SpinGuard, SpinLock};

/// A non-zero identifier for the calling thread that can be obtained without
/// allocating.
#[inline]
pub fn current_thread_id() -> usize {
    // SAFETY: `pthread_self()` is always safe to call.
    unsafe { libc::pthread_self() as usize }
}
