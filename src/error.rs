use std::io;

use thiserror::Error;

/// Failures of the tracer's own machinery. Allocation failures are never
/// reported through this type; those surface to callers as null pointers and
/// `errno`, exactly as with the system allocator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TraceError {
    #[error("output path is empty or contains a NUL byte")]
    InvalidPath,
    #[error("output path is {len} bytes long, at most {max} are supported")]
    PathTooLong { len: usize, max: usize },
    #[error("could not open trace output: {0}")]
    Open(#[source] io::Error),
    #[error("could not write trace output: {0}")]
    Write(#[source] io::Error),
    #[error("could not map an event buffer of {bytes} bytes: {source}")]
    MapBuffer {
        bytes: usize,
        #[source]
        source: io::Error,
    },
    #[error("invalid trace configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("could not install handler for signal {signal}: {source}")]
    SignalHandler {
        signal: i32,
        #[source]
        source: io::Error,
    },
    #[error("malformed trace line {line}: {source}")]
    MalformedLine {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not read trace log: {0}")]
    Read(#[source] io::Error),
}

pub type Result<T, E = TraceError> = std::result::Result<T, E>;
