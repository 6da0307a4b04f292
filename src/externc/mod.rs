//! The C ABI: the interposed allocation primitives, a small control API, and
//! the load-time constructor that configures tracing from the environment.

use std::ffi::{c_char, CStr, OsStr};
use std::os::unix::ffi::OsStrExt;

use libc::{c_int, c_void, size_t};
use log::{error, warn};

use crate::{
    alloc::{
        event::CallSite,
        tracer::{tracer, unsupported},
    },
    config::{EnvSettings, ENV_LOG},
};

#[no_mangle]
pub extern "C" fn malloc(size: size_t) -> *mut c_void {
    tracer().malloc_at(CallSite::here(), size)
}

#[no_mangle]
pub extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    tracer().calloc_at(CallSite::here(), count, size)
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    tracer().realloc_at(CallSite::here(), ptr, size)
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    tracer().free_at(CallSite::here(), ptr)
}

#[no_mangle]
pub extern "C" fn memalign(align: size_t, size: size_t) -> *mut c_void {
    tracer().memalign_at(CallSite::here(), align, size)
}

#[no_mangle]
pub extern "C" fn aligned_alloc(align: size_t, size: size_t) -> *mut c_void {
    tracer().aligned_alloc_at(CallSite::here(), align, size)
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    align: size_t,
    size: size_t,
) -> c_int {
    tracer().posix_memalign_at(CallSite::here(), memptr, align, size)
}

#[no_mangle]
pub extern "C" fn valloc(size: size_t) -> *mut c_void {
    unsupported("valloc", size)
}

#[no_mangle]
pub extern "C" fn pvalloc(size: size_t) -> *mut c_void {
    unsupported("pvalloc", size)
}

#[no_mangle]
pub extern "C" fn malloc_usable_size(ptr: *mut c_void) -> size_t {
    unsupported("malloc_usable_size", ptr as usize)
}

/// Start tracing to the NUL-terminated `path`. Returns `0` on success and
/// `-1` on failure (which is logged).
#[no_mangle]
pub unsafe extern "C" fn alloc_trace_start(path: *const c_char) -> c_int {
    if path.is_null() {
        return -1;
    }
    let path = OsStr::from_bytes(CStr::from_ptr(path).to_bytes());
    status(tracer().start(path))
}

#[no_mangle]
pub extern "C" fn alloc_trace_stop() -> c_int {
    status(tracer().stop())
}

#[no_mangle]
pub extern "C" fn alloc_trace_flush() -> c_int {
    status(tracer().flush().map(drop))
}

#[no_mangle]
pub extern "C" fn alloc_trace_install_crash_handlers() -> c_int {
    status(tracer().install_crash_handlers())
}

fn status(result: crate::error::Result<()>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(e) => {
            warn!("{e}");
            -1
        }
    }
}

#[used]
#[link_section = ".init_array"]
static CONSTRUCTOR: extern "C" fn() = init;

extern "C" fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::new().filter(ENV_LOG)).try_init();
    let settings = EnvSettings::from_env();
    if settings.crash_handler {
        if let Err(e) = tracer().install_crash_handlers() {
            error!("{e}");
        }
    }
    let Some(output) = settings.output else {
        return;
    };
    match tracer().start_with(&output, settings.config) {
        // SAFETY: `stop_at_exit` is a plain `extern "C" fn()`
        Ok(()) => unsafe {
            libc::atexit(stop_at_exit);
        },
        Err(e) => error!("not tracing: {e}"),
    }
}

extern "C" fn stop_at_exit() {
    let _ = tracer().stop();
}
