//! Fatal-signal reporting.
//!
//! The handler may interrupt a thread that holds the tracer's guard, the
//! checkpoint lock or libc's heap lock, so it takes no locks and allocates
//! nothing: it reads the checkpoint ring racily, formats on the stack and
//! writes straight to stderr. `backtrace()` is warmed up at install time,
//! since its first call loads the unwinder with `dlopen()`.

use std::{
    fmt::Write,
    io, mem, ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

use libc::{c_int, c_void, SIGABRT, SIGBUS, SIGFPE, SIGILL, SIGSEGV, SIGTERM};

use super::checkpoint::CheckpointRing;
use crate::{
    error::{Result, TraceError},
    util::print::{write_fd, StackWriter, STDERR},
};

pub const FATAL_SIGNALS: [c_int; 6] = [SIGABRT, SIGILL, SIGBUS, SIGSEGV, SIGTERM, SIGFPE];

const MAX_FRAMES: usize = 64;

extern "C" {
    fn backtrace(buffer: *mut *mut c_void, size: c_int) -> c_int;
    fn backtrace_symbols_fd(buffer: *const *mut c_void, size: c_int, fd: c_int);
}

static INSTALLED: AtomicBool = AtomicBool::new(false);
static RING: AtomicPtr<CheckpointRing> = AtomicPtr::new(ptr::null_mut());

/// Install the fatal-signal handler, reporting from `ring`. Handlers stay
/// installed for the life of the process; later calls only change which ring
/// is dumped.
pub fn install_handlers(ring: &'static CheckpointRing) -> Result<()> {
    RING.store(ring as *const CheckpointRing as *mut _, Ordering::Release);
    if INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }

    let mut frames = [ptr::null_mut(); 1];
    // SAFETY: `frames` has room for one entry
    unsafe { backtrace(frames.as_mut_ptr(), 1) };

    for &signal in &FATAL_SIGNALS {
        // SAFETY: `sigaction` is plain old data
        let mut action: libc::sigaction = unsafe { mem::zeroed() };
        action.sa_sigaction = handle_fatal_signal as extern "C" fn(c_int) as libc::sighandler_t;
        action.sa_flags = libc::SA_RESETHAND;
        // SAFETY: `action` is a valid `sigaction` and the handler is
        // async-signal-safe
        let rc = unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, ptr::null_mut())
        };
        if rc != 0 {
            return Err(TraceError::SignalHandler {
                signal,
                source: io::Error::last_os_error(),
            });
        }
    }
    INSTALLED.store(true, Ordering::Release);
    Ok(())
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

pub fn signal_name(signal: c_int) -> &'static str {
    match signal {
        SIGABRT => "SIGABRT",
        SIGILL => "SIGILL",
        SIGBUS => "SIGBUS",
        SIGSEGV => "SIGSEGV",
        SIGTERM => "SIGTERM",
        SIGFPE => "SIGFPE",
        _ => "unknown",
    }
}

extern "C" fn handle_fatal_signal(signal: c_int) {
    let mut line = StackWriter::<128>::new();
    let _ = writeln!(line, "caught signal {} ({})", signal, signal_name(signal));
    write_fd(STDERR, line.as_bytes());

    let ring = RING.load(Ordering::Acquire);
    if !ring.is_null() {
        // SAFETY: only `&'static CheckpointRing`s are stored
        unsafe { &*ring }.dump(STDERR);
    }

    write_fd(STDERR, b"stack trace:\n");
    let mut frames = [ptr::null_mut(); MAX_FRAMES];
    // SAFETY: `frames` holds `MAX_FRAMES` entries, and `backtrace()` was
    // already called once outside the handler
    unsafe {
        let n = backtrace(frames.as_mut_ptr(), MAX_FRAMES as c_int);
        backtrace_symbols_fd(frames.as_ptr(), n, STDERR);
    }

    // The disposition was reset on entry, so this terminates once we return
    // and the signal is unblocked.
    // SAFETY: `raise()` is async-signal-safe
    unsafe { libc::raise(signal) };
}
