//! Resolving the real allocator may itself allocate. Those nested calls must
//! be served by the pool and left out of the trace.

use std::{
    ffi::CStr,
    sync::atomic::{AtomicUsize, Ordering},
};

use alloc_trace::{
    read_log, Backing, FallbackPool, NextInChain, Operation, PoolArena, SymbolSource, Tracer,
};
use libc::c_void;

/// Allocates through the tracer on every lookup, the way `dlsym()` can.
struct AllocatingLookup;

const MAX_NESTED: usize = 16;

static NESTED: [AtomicUsize; MAX_NESTED] = [const { AtomicUsize::new(0) }; MAX_NESTED];
static NESTED_COUNT: AtomicUsize = AtomicUsize::new(0);

unsafe impl SymbolSource for AllocatingLookup {
    fn lookup(&self, name: &CStr) -> *mut c_void {
        let p = TRACER.malloc(name.to_bytes().len() + 1);
        let i = NESTED_COUNT.fetch_add(1, Ordering::Relaxed);
        if i < MAX_NESTED {
            NESTED[i].store(p as usize, Ordering::Relaxed);
        }
        NextInChain.lookup(name)
    }
}

static ARENA: PoolArena<[u8; 1 << 20]> = PoolArena::new();
static POOL: FallbackPool = FallbackPool::new(&ARENA);
static TRACER: Tracer<AllocatingLookup> = Tracer::new(AllocatingLookup, &POOL);

#[test]
fn nested_bootstrap_allocations_use_the_pool_and_are_not_traced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bootstrap.log");
    assert!(!POOL.is_initialized());
    TRACER.start(&path).unwrap();

    let p = TRACER.malloc(100);
    assert!(!p.is_null());
    assert!(TRACER.is_resolved());
    assert_eq!(TRACER.backing_of(p), Backing::Real);

    let nested = NESTED_COUNT.load(Ordering::Relaxed);
    assert!(nested >= 5, "one lookup per primitive, got {nested}");
    for slot in NESTED.iter().take(nested.min(MAX_NESTED)) {
        let q = slot.load(Ordering::Relaxed) as *mut c_void;
        assert!(!q.is_null());
        assert_eq!(TRACER.backing_of(q), Backing::Pool);
    }
    assert!(POOL.is_initialized());

    unsafe { TRACER.free(p) };
    TRACER.stop().unwrap();

    let records = read_log(&path).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].op, Operation::Allocate);
    assert_eq!(records[0].size, 100);
    assert_eq!(records[0].p, p as usize);
    assert_eq!(records[1].op, Operation::Deallocate);
    assert_eq!(records[1].p, p as usize);

    // Pool blocks still go back to the pool once the real allocator is known
    for slot in NESTED.iter().take(nested.min(MAX_NESTED)) {
        unsafe { TRACER.free(slot.load(Ordering::Relaxed) as *mut c_void) };
    }
}
