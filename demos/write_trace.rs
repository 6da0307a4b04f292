//! Trace this program's own heap traffic.
//!
//! ```plaintext
//! cargo run --example write_trace -- /tmp/demo.log
//! ```

use std::{collections::BTreeMap, env, process::ExitCode};

use alloc_trace::{read_log, NextInChain, Operation, Tracer, GLOBAL_POOL};

#[global_allocator]
static TRACER: Tracer = Tracer::new(NextInChain, &GLOBAL_POOL);

fn workload() -> usize {
    let mut words: Vec<String> = Vec::new();
    for i in 0..64 {
        words.push(format!("word-{i}"));
    }
    words.retain(|w| w.len() % 2 == 0);
    let joined = words.join(",");
    joined.len()
}

fn main() -> ExitCode {
    env_logger::init();
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| "alloc_trace_demo.log".to_owned());

    if let Err(e) = TRACER.start(&path) {
        eprintln!("could not start tracing: {e}");
        return ExitCode::FAILURE;
    }
    let n = workload();
    if let Err(e) = TRACER.stop() {
        eprintln!("could not flush the trace: {e}");
        return ExitCode::FAILURE;
    }

    let records = match read_log(&path) {
        Ok(records) => records,
        Err(e) => {
            eprintln!("could not read {path}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut by_op = BTreeMap::new();
    for record in &records {
        *by_op.entry(record.op.code()).or_insert(0usize) += 1;
    }
    println!("workload produced {n} bytes of output");
    println!("{} events in {path}", records.len());
    for (code, count) in by_op {
        let name = match Operation::from_code(code) {
            Some(Operation::Allocate) => "allocate",
            Some(Operation::Deallocate) => "deallocate",
            Some(Operation::Reallocate) => "reallocate",
            None => "unknown",
        };
        println!("  {name:>10}: {count}");
    }
    ExitCode::SUCCESS
}
