//! A bootstrap-safe allocation tracing shim.
//!
//! Every call to `malloc`, `calloc`, `realloc`, `free`, `memalign`,
//! `aligned_alloc` and `posix_memalign` is served by the real C allocator (or,
//! before that has been located, by an embedded fallback pool) and recorded as
//! a JSON line with its pointers, size and return addresses.
//!
//! Built with the `interpose` feature, the `cdylib` exports those symbols and
//! can be loaded with `LD_PRELOAD`; see [`config::EnvSettings`] for the
//! environment it reads. From Rust, a [`Tracer`] can be driven directly or
//! installed as the `#[global_allocator]`.

pub mod alloc;
pub mod config;
pub mod crash;
pub mod error;
#[cfg(feature = "interpose")]
pub mod externc;
pub mod lazy_lock;
pub mod os;
pub mod serialize;
pub mod sync;
pub mod util;

pub use crate::alloc::{
    event::{AllocationEvent, CallSite, Operation},
    locator::{NextInChain, SymbolSource},
    pool::{FallbackPool, PoolArena, GLOBAL_POOL},
    recorder::TraceStats,
    tracer::{tracer, unsupported, Tracer},
    Backing,
};
pub use config::TraceConfig;
pub use error::TraceError;
pub use serialize::log_format::{read_log, LogRecord};
