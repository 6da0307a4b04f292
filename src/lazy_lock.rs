use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::util::hint::cold;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies this lock is mid initialization. Observed by the initializer
    /// itself when it recurses, and by other threads racing it.
    Initializing,
    /// The initializer ran and gave up. This is terminal.
    Failed,
}

impl LazyLockState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninit,
            1 => Self::Init,
            2 => Self::Initializing,
            _ => Self::Failed,
        }
    }
}

/// A one-shot cell that lets you poll its initialization state (including
/// mid-init). Unlike `std::sync::LazyLock`, nobody ever waits: a caller that
/// finds the cell `Initializing` (because another thread got there first, or
/// because the initializer recursed into itself) gets `None` back and has to
/// make do without the value.
pub struct LazyLock<T> {
    cell: UnsafeCell<MaybeUninit<T>>,
    state: AtomicU8,
}

// SAFETY: the value is written once, by the thread that won the
// `Uninit -> Initializing` transition, and published with `Release`.
unsafe impl<T: Send + Sync> Sync for LazyLock<T> {}
unsafe impl<T: Send> Send for LazyLock<T> {}

impl<T> LazyLock<T> {
    pub const fn new() -> Self {
        Self {
            cell: UnsafeCell::new(MaybeUninit::uninit()),
            state: AtomicU8::new(LazyLockState::Uninit as u8),
        }
    }

    pub fn state(lock: &Self) -> LazyLockState {
        LazyLockState::from_u8(lock.state.load(Ordering::Acquire))
    }

    /// The value, if initialization has already completed.
    pub fn get(&self) -> Option<&T> {
        if LazyLock::state(self) == LazyLockState::Init {
            // SAFETY: `Init` is only stored after the value is written.
            Some(unsafe { self.assume_init() })
        } else {
            None
        }
    }

    /// # Safety
    ///
    /// The state must be [`LazyLockState::Init`].
    pub unsafe fn assume_init(&self) -> &T {
        (*self.cell.get()).assume_init_ref()
    }

    /// Run `init` if nobody has yet. Returns the value if it is available
    /// after this call.
    pub fn get_or_try_init(&self, init: impl FnOnce() -> Option<T>) -> Option<&T> {
        if let Some(value) = self.get() {
            return Some(value);
        }
        if self
            .state
            .compare_exchange(
                LazyLockState::Uninit as u8,
                LazyLockState::Initializing as u8,
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .is_err()
        {
            return self.get();
        }
        cold(|| match init() {
            Some(value) => {
                // SAFETY: we won the transition out of `Uninit`, so nobody else
                // writes or reads the cell until we publish `Init`.
                unsafe { (*self.cell.get()).write(value) };
                self.state.store(LazyLockState::Init as u8, Ordering::Release);
                self.get()
            }
            None => {
                self.state
                    .store(LazyLockState::Failed as u8, Ordering::Release);
                None
            }
        })
    }
}

impl<T> Default for LazyLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LazyLock<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == LazyLockState::Init as u8 {
            // SAFETY: initialized, and we have exclusive access
            unsafe { self.cell.get_mut().assume_init_drop() }
        }
    }
}
