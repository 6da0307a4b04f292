use std::{
    fmt::Write,
    panic::Location,
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use libc::c_int;

use crate::{
    sync::{current_thread_id, SpinLock},
    util::print::{write_fd, StackWriter},
};

pub const CHECKPOINT_SLOTS: usize = 64;

struct Slot {
    location: AtomicPtr<Location<'static>>,
    thread: AtomicUsize,
}

const EMPTY_SLOT: Slot = Slot {
    location: AtomicPtr::new(ptr::null_mut()),
    thread: AtomicUsize::new(0),
};

/// A recorded source location and the thread that passed it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Checkpoint {
    pub location: &'static Location<'static>,
    pub thread: usize,
}

/// The last [`CHECKPOINT_SLOTS`] checkpoints, oldest overwritten first.
///
/// Writers serialize on their own lock, separate from the tracer's guard.
/// Readers take no lock at all, because the signal handler has to be able to
/// read the ring while the interrupted thread is halfway through a write.
pub struct CheckpointRing {
    slots: [Slot; CHECKPOINT_SLOTS],
    /// Total checkpoints ever written
    written: AtomicUsize,
    lock: SpinLock<()>,
}

impl CheckpointRing {
    pub const fn new() -> Self {
        Self {
            slots: [EMPTY_SLOT; CHECKPOINT_SLOTS],
            written: AtomicUsize::new(0),
            lock: SpinLock::new(()),
        }
    }

    /// Record the caller's location.
    #[track_caller]
    #[inline]
    pub fn mark(&self) {
        self.mark_at(Location::caller());
    }

    pub fn mark_at(&self, location: &'static Location<'static>) {
        let _guard = self.lock.lock();
        let n = self.written.load(Ordering::Relaxed);
        let slot = &self.slots[n % CHECKPOINT_SLOTS];
        slot.location
            .store(location as *const Location<'static> as *mut _, Ordering::Relaxed);
        slot.thread.store(current_thread_id(), Ordering::Relaxed);
        self.written.store(n + 1, Ordering::Release);
    }

    pub fn written(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }

    /// Visit the retained checkpoints, oldest first, without locking.
    pub fn for_each(&self, mut f: impl FnMut(Checkpoint)) {
        let end = self.written();
        for n in end.saturating_sub(CHECKPOINT_SLOTS)..end {
            let slot = &self.slots[n % CHECKPOINT_SLOTS];
            let location = slot.location.load(Ordering::Relaxed);
            if location.is_null() {
                continue;
            }
            f(Checkpoint {
                // SAFETY: only `&'static Location` values are ever stored
                location: unsafe { &*location },
                thread: slot.thread.load(Ordering::Relaxed),
            });
        }
    }

    /// Write the ring to `fd`, one checkpoint per line. Async-signal-safe.
    pub fn dump(&self, fd: c_int) {
        let mut line = StackWriter::<256>::new();
        let _ = writeln!(
            line,
            "recent checkpoints ({} total, oldest first):",
            self.written()
        );
        write_fd(fd, line.as_bytes());
        self.for_each(|checkpoint| {
            line.clear();
            let _ = writeln!(
                line,
                "  {}:{} thread={:#x}",
                checkpoint.location.file(),
                checkpoint.location.line(),
                checkpoint.thread
            );
            write_fd(fd, line.as_bytes());
        });
    }
}

impl Default for CheckpointRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_the_most_recent_checkpoints_in_order() {
        let ring = CheckpointRing::new();
        let mut lines = Vec::new();
        for _ in 0..CHECKPOINT_SLOTS + 10 {
            ring.mark();
            lines.push(line!() - 1);
        }
        let mut seen = Vec::new();
        ring.for_each(|c| seen.push(c));
        assert_eq!(seen.len(), CHECKPOINT_SLOTS);
        assert_eq!(ring.written(), CHECKPOINT_SLOTS + 10);
        assert!(seen.iter().all(|c| c.location.file().ends_with("checkpoint.rs")));
        assert!(seen.iter().all(|c| c.thread == current_thread_id()));
        assert_eq!(seen[0].location.line(), lines[0]);
    }

    #[test]
    fn dump_writes_one_line_per_checkpoint() {
        let ring = CheckpointRing::new();
        ring.mark();
        ring.mark();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        ring.dump(fds[1]);
        unsafe { libc::close(fds[1]) };
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = unsafe { libc::read(fds[0], buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        unsafe { libc::close(fds[0]) };
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("recent checkpoints (2 total"));
        assert_eq!(out.lines().filter(|l| l.contains("checkpoint.rs:")).count(), 2);
    }
}
