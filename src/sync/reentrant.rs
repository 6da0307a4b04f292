//! The tracer's process-wide guard.
//!
//! A thread that already owns the lock re-enters it without blocking, which
//! is what happens when resolving symbols, unwinding or logging calls back
//! into `malloc()`. The owner also carries an "inside instrumentation" flag:
//! while it is raised, allocations made by the owning thread are the tracer's
//! own and are served but not recorded.

use std::{
    cell::Cell,
    ops::Deref,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam::utils::Backoff;

use super::current_thread_id;

const UNOWNED: usize = 0;

pub struct ReentrantLock<T> {
    owner: AtomicUsize,
    /// Only touched by the owning thread
    depth: Cell<usize>,
    /// Only touched by the owning thread
    instrumenting: Cell<bool>,
    data: T,
}

// SAFETY: `depth` and `instrumenting` are only accessed by the thread stored
// in `owner`. `data` is handed out as `&T` to one thread at a time, so `T`
// only needs to be `Send`.
unsafe impl<T: Send> Sync for ReentrantLock<T> {}
unsafe impl<T: Send> Send for ReentrantLock<T> {}

impl<T> ReentrantLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            owner: AtomicUsize::new(UNOWNED),
            depth: Cell::new(0),
            instrumenting: Cell::new(false),
            data,
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_id()
    }

    pub fn lock(&self) -> ReentrantGuard<'_, T> {
        let me = current_thread_id();
        if self.owner.load(Ordering::Relaxed) == me {
            self.depth.set(self.depth.get() + 1);
            return ReentrantGuard { lock: self };
        }
        let backoff = Backoff::new();
        while self
            .owner
            .compare_exchange_weak(UNOWNED, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        self.depth.set(1);
        ReentrantGuard { lock: self }
    }

    /// Lock depth of the calling thread (0 if it does not own the lock).
    pub fn depth(&self) -> usize {
        if self.is_held_by_current_thread() {
            self.depth.get()
        } else {
            0
        }
    }
}

pub struct ReentrantGuard<'a, T> {
    lock: &'a ReentrantLock<T>,
}

impl<T> ReentrantGuard<'_, T> {
    /// Is the owning thread currently executing tracer machinery?
    pub fn inside_instrumentation(&self) -> bool {
        self.lock.instrumenting.get()
    }

    /// Run `f` with the instrumentation flag raised. Nested calls keep the
    /// flag raised until the outermost one returns.
    pub fn instrument<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Restore<'c>(&'c Cell<bool>, bool);

        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.0.set(self.1);
            }
        }

        let _restore = Restore(&self.lock.instrumenting, self.lock.instrumenting.replace(true));
        f()
    }
}

impl<T> Deref for ReentrantGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.lock.data
    }
}

impl<T> Drop for ReentrantGuard<'_, T> {
    fn drop(&mut self) {
        let depth = self.lock.depth.get() - 1;
        self.lock.depth.set(depth);
        if depth == 0 {
            self.lock.owner.store(UNOWNED, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    #[test]
    fn owner_reenters_without_blocking() {
        let lock = ReentrantLock::new(());
        let outer = lock.lock();
        let inner = lock.lock();
        assert_eq!(lock.depth(), 2);
        drop(inner);
        assert!(lock.is_held_by_current_thread());
        drop(outer);
        assert!(!lock.is_held_by_current_thread());
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn instrumentation_flag_is_scoped() {
        let lock = ReentrantLock::new(());
        let guard = lock.lock();
        assert!(!guard.inside_instrumentation());
        guard.instrument(|| {
            let nested = lock.lock();
            assert!(nested.inside_instrumentation());
            nested.instrument(|| assert!(nested.inside_instrumentation()));
            assert!(nested.inside_instrumentation());
        });
        assert!(!guard.inside_instrumentation());
    }

    #[test]
    fn other_threads_wait_for_the_owner() {
        let lock = ReentrantLock::new(RefCell::new(Vec::new()));
        crossbeam::scope(|s| {
            for t in 0..4 {
                let lock = &lock;
                s.spawn(move |_| {
                    for i in 0..200 {
                        let guard = lock.lock();
                        // Two pushes per critical section must stay adjacent
                        guard.borrow_mut().push((t, i));
                        let again = lock.lock();
                        again.borrow_mut().push((t, i));
                    }
                });
            }
        })
        .unwrap();
        let log = lock.lock().borrow().clone();
        assert_eq!(log.len(), 4 * 200 * 2);
        for pair in log.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }
}
