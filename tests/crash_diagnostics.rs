//! Fatal paths run in a re-executed copy of this test binary, since they end
//! the process.

use std::{
    env,
    os::unix::process::ExitStatusExt,
    process::{Command, Output},
};

use alloc_trace::{unsupported, NextInChain, Tracer, GLOBAL_POOL};

const CHILD_ENV: &str = "ALLOC_TRACE_CRASH_CHILD";

static TRACER: Tracer = Tracer::new(NextInChain, &GLOBAL_POOL);

fn run_child(test: &str, mode: &str) -> Output {
    Command::new(env::current_exe().unwrap())
        .args(["--exact", test, "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, mode)
        .output()
        .unwrap()
}

fn child_mode() -> Option<String> {
    env::var(CHILD_ENV).ok()
}

#[test]
fn fatal_signal_dumps_checkpoints_and_stack() {
    if child_mode().as_deref() == Some("segv") {
        TRACER.install_crash_handlers().unwrap();
        let p = TRACER.malloc(32);
        unsafe {
            TRACER.free(p);
            libc::raise(libc::SIGSEGV);
        }
        unreachable!("SIGSEGV should have terminated the process");
    }

    let output = run_child("fatal_signal_dumps_checkpoints_and_stack", "segv");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.signal(), Some(libc::SIGSEGV), "stderr: {stderr}");
    assert!(stderr.contains("caught signal 11 (SIGSEGV)"), "stderr: {stderr}");
    assert!(stderr.contains("recent checkpoints"), "stderr: {stderr}");
    assert!(stderr.contains("tracer.rs:"), "stderr: {stderr}");
    assert!(stderr.contains("stack trace:"), "stderr: {stderr}");
}

#[test]
fn unsupported_primitives_abort_loudly() {
    if child_mode().as_deref() == Some("valloc") {
        unsupported("valloc", 4096);
    }

    let output = run_child("unsupported_primitives_abort_loudly", "valloc");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.signal(), Some(libc::SIGABRT), "stderr: {stderr}");
    assert!(stderr.contains("valloc called: 4096"), "stderr: {stderr}");
}
