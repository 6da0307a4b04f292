//! A tracer whose real allocator can never be found runs entirely on its
//! fallback pool.

use std::{ffi::CStr, ptr};

use alloc_trace::{
    read_log, Backing, FallbackPool, Operation, PoolArena, SymbolSource, Tracer,
};
use libc::c_void;
use rand::{rngs::StdRng, Rng, SeedableRng};

struct Unresolvable;

unsafe impl SymbolSource for Unresolvable {
    fn lookup(&self, _: &CStr) -> *mut c_void {
        ptr::null_mut()
    }
}

static CYCLE_ARENA: PoolArena<[u8; 4 << 20]> = PoolArena::new();
static CYCLE_POOL: FallbackPool = FallbackPool::new(&CYCLE_ARENA);
static CYCLE_TRACER: Tracer<Unresolvable> = Tracer::new(Unresolvable, &CYCLE_POOL);

static TRACE_ARENA: PoolArena<[u8; 1 << 20]> = PoolArena::new();
static TRACE_POOL: FallbackPool = FallbackPool::new(&TRACE_ARENA);
static TRACE_TRACER: Tracer<Unresolvable> = Tracer::new(Unresolvable, &TRACE_POOL);

#[test]
fn pool_serves_until_exhausted() {
    let tracer = &CYCLE_TRACER;
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..10_000 {
        let size = rng.gen_range(1..=4096);
        let p = tracer.malloc(size);
        assert!(!p.is_null(), "allocation of {size} bytes failed");
        assert_eq!(tracer.backing_of(p), Backing::Pool);
        unsafe {
            ptr::write_bytes(p.cast::<u8>(), 0x5a, size);
            tracer.free(p);
        }
    }
    assert!(!tracer.is_resolved());

    let mut live = Vec::new();
    loop {
        let p = tracer.malloc(64 << 10);
        if p.is_null() {
            assert_eq!(unsafe { *libc::__errno_location() }, libc::ENOMEM);
            break;
        }
        assert!(CYCLE_POOL.owns(p));
        live.push(p);
    }
    assert!(!live.is_empty());
    assert!(live.len() * (64 << 10) <= CYCLE_POOL.capacity());
    assert!(tracer.malloc(1 << 20).is_null());

    for p in live.drain(..) {
        unsafe { tracer.free(p) };
    }
    let p = tracer.malloc(64 << 10);
    assert!(!p.is_null());
    unsafe { tracer.free(p) };
}

#[test]
fn pool_only_tracing_still_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.log");
    let tracer = &TRACE_TRACER;
    tracer.start(&path).unwrap();

    let p = tracer.calloc(10, 10);
    let q = unsafe { tracer.realloc(p, 1000) };
    let aligned = tracer.aligned_alloc(256, 256);
    assert_eq!(aligned as usize % 256, 0);
    unsafe {
        tracer.free(q);
        tracer.free(aligned);
    }

    // A pointer that neither allocator owns is left alone
    let mut foreign = 0u64;
    let stray = (&mut foreign as *mut u64).cast::<c_void>();
    unsafe {
        assert!(tracer.realloc(stray, 16).is_null());
        tracer.free(stray);
    }
    tracer.stop().unwrap();

    let records = read_log(&path).unwrap();
    let ops: Vec<Operation> = records.iter().map(|r| r.op).collect();
    assert_eq!(
        ops,
        [
            Operation::Allocate,
            Operation::Reallocate,
            Operation::Allocate,
            Operation::Deallocate,
            Operation::Deallocate,
            Operation::Reallocate,
            Operation::Deallocate,
        ]
    );
    assert_eq!(records[0].size, 100);
    assert!(records.iter().take(5).all(|r| TRACE_POOL.owns(r.p as *const u8)));
    assert_eq!(records[5].p2, 0);
}
