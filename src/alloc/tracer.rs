//! The interception layer.
//!
//! A [`Tracer`] owns everything one tracing session needs: the checkpoint
//! ring, the real-allocator locator, a reference to a fallback pool and the
//! recorder behind the re-entrant guard. Each allocation primitive:
//!
//! 1. marks a checkpoint,
//! 2. takes the guard (unless tracing is off, in which case it only serves),
//! 3. routes to the real allocator or the pool, and serves the call,
//! 4. records the event with the instrumentation flag raised,
//! 5. drops the guard and marks a closing checkpoint.
//!
//! Anything the tracer's machinery allocates while the flag is raised comes
//! straight back in here on the same thread, finds the guard already held
//! and the flag set, and is served without being recorded.

use std::{
    alloc::{GlobalAlloc, Layout},
    cell::RefCell,
    path::Path,
    ptr,
    sync::atomic::{AtomicBool, Ordering},
};

use libc::{c_int, c_void, size_t, EINVAL, ENOMEM};
use log::{error, info};

use super::{
    event::{AllocationEvent, CallSite, Provenance},
    locator::{Locator, NextInChain, RealAllocator, SymbolSource},
    pool::{FallbackPool, GLOBAL_POOL},
    recorder::{Recorder, TraceStats},
    set_errno, Backing, BackingAllocator, MALLOC_ALIGNMENT,
};
use crate::{
    config::TraceConfig,
    crash::{self, CheckpointRing},
    error::Result,
    os::fd::OutputPath,
    rawln,
    sync::{ReentrantGuard, ReentrantLock},
    util::{hint::cold, num::is_valid_alignment},
};

static GLOBAL_TRACER: Tracer = Tracer::new(NextInChain, &GLOBAL_POOL);

/// The process-wide tracer, used by the exported C entry points.
pub fn tracer() -> &'static Tracer {
    &GLOBAL_TRACER
}

/// Where an existing pointer has to go.
enum Route<'a> {
    Real(&'a RealAllocator),
    Pool,
    /// Not ours, and the real allocator is unavailable
    Stray,
}

pub struct Tracer<S = NextInChain> {
    checkpoints: CheckpointRing,
    locator: Locator<S>,
    pool: &'static FallbackPool,
    /// Lock-free mirror of the recorder being armed
    enabled: AtomicBool,
    guard: ReentrantLock<RefCell<Recorder>>,
}

impl<S: SymbolSource> Tracer<S> {
    pub const fn new(source: S, pool: &'static FallbackPool) -> Self {
        Self {
            checkpoints: CheckpointRing::new(),
            locator: Locator::new(source),
            pool,
            enabled: AtomicBool::new(false),
            guard: ReentrantLock::new(RefCell::new(Recorder::new())),
        }
    }

    /// Start tracing to `path` with the default configuration.
    pub fn start(&self, path: impl AsRef<Path>) -> Result<()> {
        self.start_with(path, TraceConfig::DEFAULT)
    }

    /// Start tracing to `path`, which is created if it does not exist and
    /// appended to otherwise. If already tracing, buffered events are first
    /// flushed to the old output. On error the tracer is left stopped.
    pub fn start_with(&self, path: impl AsRef<Path>, config: TraceConfig) -> Result<()> {
        let path = path.as_ref();
        self.enabled.store(false, Ordering::Release);
        let guard = self.guard.lock();
        let armed = guard.instrument(|| {
            let mut recorder = guard.borrow_mut();
            match OutputPath::new(path) {
                Ok(output) => recorder.arm(output, config),
                Err(e) => {
                    let _ = recorder.disarm();
                    Err(e)
                }
            }
        });
        drop(guard);
        match armed {
            Ok(()) => {
                info!(
                    "tracing allocations to {} (buffer {}, depth {})",
                    path.display(),
                    config.buffer_capacity,
                    config.backtrace_depth
                );
                self.enabled.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                error!("could not start tracing to {}: {e}", path.display());
                Err(e)
            }
        }
    }

    /// Stop tracing and flush. Stopping a stopped tracer does nothing.
    pub fn stop(&self) -> Result<()> {
        let was_enabled = self.enabled.swap(false, Ordering::AcqRel);
        let guard = self.guard.lock();
        let (flushed, stats) = guard.instrument(|| {
            let mut recorder = guard.borrow_mut();
            (recorder.disarm(), recorder.stats())
        });
        drop(guard);
        if was_enabled {
            info!(
                "stopped tracing: {} events recorded, {} written, {} lost",
                stats.recorded, stats.written, stats.lost
            );
        }
        flushed.map(drop)
    }

    /// Write out everything buffered so far. Returns the number of events
    /// written.
    pub fn flush(&self) -> Result<usize> {
        let guard = self.guard.lock();
        guard.instrument(|| guard.borrow_mut().flush())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TraceStats {
        let guard = self.guard.lock();
        let stats = guard.borrow().stats();
        stats
    }

    /// Events currently waiting in the buffer.
    pub fn buffered_events(&self) -> usize {
        let guard = self.guard.lock();
        let buffered = guard.borrow().buffered();
        buffered
    }

    /// Which allocator a pointer returned by this tracer belongs to.
    pub fn backing_of(&self, ptr: *const c_void) -> Backing {
        if self.pool.owns(ptr) {
            Backing::Pool
        } else {
            Backing::Real
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.locator.is_resolved()
    }

    pub fn pool(&self) -> &'static FallbackPool {
        self.pool
    }

    pub fn checkpoints(&self) -> &CheckpointRing {
        &self.checkpoints
    }

    /// Dump this tracer's checkpoints (and a stack trace) on fatal signals.
    pub fn install_crash_handlers(&'static self) -> Result<()>
    where
        S: 'static,
    {
        crash::install_handlers(&self.checkpoints)
    }

    /// The allocator for new blocks.
    fn backing(&self) -> &dyn BackingAllocator {
        match self.locator.resolve() {
            Some(real) => real,
            None => self.pool,
        }
    }

    fn route(&self, ptr: *mut c_void) -> Route<'_> {
        if self.pool.owns(ptr) {
            return Route::Pool;
        }
        match self.locator.resolve() {
            Some(real) => Route::Real(real),
            None if ptr.is_null() => Route::Pool,
            None => cold(|| Route::Stray),
        }
    }

    /// Serve a call with `serve`, and record what `describe` makes of the
    /// result if tracing is on and this is not the tracer's own allocation.
    #[inline(always)]
    fn intercept<R: Copy>(
        &self,
        site: CallSite,
        serve: impl FnOnce() -> R,
        describe: impl FnOnce(R) -> AllocationEvent,
    ) -> R {
        self.checkpoints.mark();
        let result = if self.enabled.load(Ordering::Acquire) {
            let guard = self.guard.lock();
            if guard.inside_instrumentation() {
                serve()
            } else {
                guard.instrument(|| {
                    let result = serve();
                    self.record(&guard, site, describe(result));
                    result
                })
            }
        } else {
            serve()
        };
        self.checkpoints.mark();
        result
    }

    fn record(
        &self,
        guard: &ReentrantGuard<'_, RefCell<Recorder>>,
        site: CallSite,
        event: AllocationEvent,
    ) {
        let Ok(mut recorder) = guard.try_borrow_mut() else {
            return;
        };
        if !recorder.is_armed() {
            return;
        }
        let provenance = Provenance::capture(site, recorder.config().backtrace_depth);
        recorder.record(event.with_provenance(provenance));
    }

    #[inline(never)]
    pub fn malloc(&self, size: size_t) -> *mut c_void {
        self.malloc_at(CallSite::here(), size)
    }

    pub fn malloc_at(&self, site: CallSite, size: size_t) -> *mut c_void {
        self.intercept(
            site,
            // SAFETY: `malloc()` has no preconditions
            || unsafe { self.backing().malloc(size) },
            |p| AllocationEvent::allocate(p as usize, size),
        )
    }

    /// Recorded with the total byte count, `count * size`.
    #[inline(never)]
    pub fn calloc(&self, count: size_t, size: size_t) -> *mut c_void {
        self.calloc_at(CallSite::here(), count, size)
    }

    pub fn calloc_at(&self, site: CallSite, count: size_t, size: size_t) -> *mut c_void {
        self.intercept(
            site,
            // SAFETY: `calloc()` has no preconditions
            || unsafe { self.backing().calloc(count, size) },
            |p| AllocationEvent::allocate(p as usize, count.saturating_mul(size)),
        )
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation returned by this tracer.
    #[inline(never)]
    pub unsafe fn realloc(&self, ptr: *mut c_void, size: size_t) -> *mut c_void {
        self.realloc_at(CallSite::here(), ptr, size)
    }

    /// # Safety
    ///
    /// See [`Tracer::realloc`].
    pub unsafe fn realloc_at(&self, site: CallSite, ptr: *mut c_void, size: size_t) -> *mut c_void {
        self.intercept(
            site,
            || match self.route(ptr) {
                Route::Real(real) => real.realloc(ptr, size),
                Route::Pool => self.pool.realloc(ptr, size),
                Route::Stray => {
                    set_errno(ENOMEM);
                    ptr::null_mut()
                }
            },
            |new| AllocationEvent::reallocate(ptr as usize, new as usize, size),
        )
    }

    /// # Safety
    ///
    /// `ptr` must be null or a live allocation returned by this tracer.
    #[inline(never)]
    pub unsafe fn free(&self, ptr: *mut c_void) {
        self.free_at(CallSite::here(), ptr)
    }

    /// # Safety
    ///
    /// See [`Tracer::free`].
    pub unsafe fn free_at(&self, site: CallSite, ptr: *mut c_void) {
        self.intercept(
            site,
            || match self.route(ptr) {
                Route::Real(real) => real.free(ptr),
                Route::Pool => self.pool.free(ptr),
                // Nobody left who could free it
                Route::Stray => {}
            },
            |()| AllocationEvent::deallocate(ptr as usize),
        )
    }

    #[inline(never)]
    pub fn memalign(&self, align: size_t, size: size_t) -> *mut c_void {
        self.memalign_at(CallSite::here(), align, size)
    }

    pub fn memalign_at(&self, site: CallSite, align: size_t, size: size_t) -> *mut c_void {
        self.intercept(
            site,
            // SAFETY: `memalign()` has no preconditions
            || unsafe { self.backing().memalign(align, size) },
            |p| AllocationEvent::allocate(p as usize, size),
        )
    }

    /// Fails with `EINVAL`, unrecorded, unless `align` is a power of two and a
    /// multiple of the pointer size.
    #[inline(never)]
    pub fn aligned_alloc(&self, align: size_t, size: size_t) -> *mut c_void {
        self.aligned_alloc_at(CallSite::here(), align, size)
    }

    pub fn aligned_alloc_at(&self, site: CallSite, align: size_t, size: size_t) -> *mut c_void {
        if !is_valid_alignment(align) {
            set_errno(EINVAL);
            return ptr::null_mut();
        }
        self.memalign_at(site, align, size)
    }

    /// Returns `EINVAL` (unrecorded) for a bad alignment, `ENOMEM` (recorded,
    /// with a null pointer) on exhaustion, and `0` otherwise. `*memptr` is
    /// only written on success.
    ///
    /// # Safety
    ///
    /// `memptr` must be valid for a pointer-sized write.
    #[inline(never)]
    pub unsafe fn posix_memalign(
        &self,
        memptr: *mut *mut c_void,
        align: size_t,
        size: size_t,
    ) -> c_int {
        self.posix_memalign_at(CallSite::here(), memptr, align, size)
    }

    /// # Safety
    ///
    /// See [`Tracer::posix_memalign`].
    pub unsafe fn posix_memalign_at(
        &self,
        site: CallSite,
        memptr: *mut *mut c_void,
        align: size_t,
        size: size_t,
    ) -> c_int {
        if !is_valid_alignment(align) {
            return EINVAL;
        }
        let p = self.memalign_at(site, align, size);
        if p.is_null() {
            return ENOMEM;
        }
        memptr.write(p);
        0
    }
}

/// Legacy primitives we refuse to emulate: say which one was called, and
/// abort.
pub fn unsupported(primitive: &str, arg: usize) -> ! {
    rawln!("{} called: {}", primitive, arg);
    std::process::abort()
}

unsafe impl<S: SymbolSource> GlobalAlloc for Tracer<S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let site = CallSite::here();
        if layout.align() <= MALLOC_ALIGNMENT {
            self.malloc_at(site, layout.size()).cast()
        } else {
            self.memalign_at(site, layout.align(), layout.size()).cast()
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let site = CallSite::here();
        if layout.align() <= MALLOC_ALIGNMENT {
            self.calloc_at(site, 1, layout.size()).cast()
        } else {
            let p = self.memalign_at(site, layout.align(), layout.size()).cast::<u8>();
            if !p.is_null() {
                ptr::write_bytes(p, 0, layout.size());
            }
            p
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free_at(CallSite::here(), ptr.cast())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let site = CallSite::here();
        if layout.align() <= MALLOC_ALIGNMENT {
            return self.realloc_at(site, ptr.cast(), new_size).cast();
        }
        let new = self.memalign_at(site, layout.align(), new_size).cast::<u8>();
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
            self.free_at(site, ptr.cast());
        }
        new
    }
}
