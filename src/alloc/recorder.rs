//! The trace session: a bounded event buffer and the file it drains into.
//!
//! The buffer lives in its own anonymous mapping rather than on the heap, and
//! flushing goes straight through `open(2)`/`write(2)`/`close(2)` with a stack
//! buffer, so recording never calls back into the allocator it is tracing.

use std::{io::Write, mem, ptr::NonNull, slice};

use serde::Serialize;

use super::event::AllocationEvent;
use crate::{
    config::TraceConfig,
    error::{Result, TraceError},
    os::{
        fd::{FdWriter, OutputPath, RawFile},
        mem::MmapRegion,
    },
    rawln,
    serialize::log_format::LogLine,
};

/// Fixed-capacity, append-only storage for events.
pub struct EventBuffer {
    region: MmapRegion,
    capacity: usize,
    len: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        let bytes = capacity
            .checked_mul(mem::size_of::<AllocationEvent>())
            .ok_or(TraceError::InvalidConfig("buffer capacity is too large"))?;
        let region = MmapRegion::map_noreserve(bytes)
            .map_err(|source| TraceError::MapBuffer { bytes, source })?;
        Ok(Self {
            region,
            capacity,
            len: 0,
        })
    }

    fn base(&self) -> NonNull<AllocationEvent> {
        // SAFETY: mappings are never null, and page alignment covers the
        // alignment of `AllocationEvent`
        unsafe { NonNull::new_unchecked(self.region.as_ptr().cast()) }
    }

    /// Append `event`, or hand it back if the buffer is full.
    pub fn push(&mut self, event: AllocationEvent) -> Result<(), AllocationEvent> {
        if self.len == self.capacity {
            return Err(event);
        }
        // SAFETY: `len < capacity`, and the region holds `capacity` events
        unsafe { self.base().as_ptr().add(self.len).write(event) };
        self.len += 1;
        Ok(())
    }

    pub fn events(&self) -> &[AllocationEvent] {
        // SAFETY: the first `len` slots have been written
        unsafe { slice::from_raw_parts(self.base().as_ptr(), self.len) }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Running totals for one tracer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TraceStats {
    /// Events accepted into the buffer
    pub recorded: u64,
    /// Lines written to the output
    pub written: u64,
    /// Events dropped because their flush failed
    pub lost: u64,
    /// Flushes that had something to write
    pub flushes: u64,
}

/// Trace session state. Every method must be called with the tracer's guard
/// held and the instrumentation flag raised.
pub struct Recorder {
    armed: bool,
    output: Option<OutputPath>,
    config: TraceConfig,
    buffer: Option<EventBuffer>,
    stats: TraceStats,
}

impl Recorder {
    pub const fn new() -> Self {
        Self {
            armed: false,
            output: None,
            config: TraceConfig::DEFAULT,
            buffer: None,
            stats: TraceStats {
                recorded: 0,
                written: 0,
                lost: 0,
                flushes: 0,
            },
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn stats(&self) -> TraceStats {
        self.stats
    }

    pub fn buffered(&self) -> usize {
        self.buffer.as_ref().map_or(0, EventBuffer::len)
    }

    pub fn output(&self) -> Option<&OutputPath> {
        self.output.as_ref()
    }

    /// Start recording into `output`, creating it if needed. An armed
    /// recorder first drains into its previous output, and stays disarmed if
    /// anything here fails.
    pub fn arm(&mut self, output: OutputPath, config: TraceConfig) -> Result<()> {
        if self.armed {
            let _ = self.flush();
        }
        self.armed = false;
        config.validate()?;
        drop(RawFile::open_append(&output).map_err(TraceError::Open)?);
        match &mut self.buffer {
            Some(buffer) if buffer.capacity() == config.buffer_capacity => buffer.clear(),
            slot => *slot = Some(EventBuffer::new(config.buffer_capacity)?),
        }
        self.output = Some(output);
        self.config = config;
        self.armed = true;
        Ok(())
    }

    /// Stop recording and drain whatever is buffered. Harmless when already
    /// disarmed.
    pub fn disarm(&mut self) -> Result<usize> {
        self.armed = false;
        self.flush()
    }

    /// Buffer `event`, flushing first if the buffer is full. A no-op unless
    /// armed.
    pub fn record(&mut self, event: AllocationEvent) {
        if !self.armed {
            return;
        }
        let Some(buffer) = &mut self.buffer else {
            return;
        };
        let event = match buffer.push(event) {
            Ok(()) => {
                self.stats.recorded += 1;
                return;
            }
            Err(event) => event,
        };
        let _ = self.flush();
        if let Some(buffer) = &mut self.buffer {
            if buffer.push(event).is_ok() {
                self.stats.recorded += 1;
            }
        }
    }

    /// Write every buffered event to the output and empty the buffer. The
    /// buffer is emptied even if writing fails; those events are lost.
    pub fn flush(&mut self) -> Result<usize> {
        let (Some(buffer), Some(output)) = (&mut self.buffer, &self.output) else {
            return Ok(0);
        };
        if buffer.is_empty() {
            return Ok(0);
        }
        let n = buffer.len();
        self.stats.flushes += 1;
        let result = write_events(
            output,
            buffer.events(),
            self.config.backtrace_depth,
            self.config.resolve_symbols,
        );
        buffer.clear();
        match result {
            Ok(()) => {
                self.stats.written += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.stats.lost += n as u64;
                rawln!("alloc-trace: dropped {} events: {}", n, e);
                Err(e)
            }
        }
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

fn write_events(
    output: &OutputPath,
    events: &[AllocationEvent],
    depth: usize,
    resolve: bool,
) -> Result<()> {
    let file = RawFile::open_append(output).map_err(TraceError::Open)?;
    let mut w = FdWriter::new(&file);
    for event in events {
        serde_json::to_writer(&mut w, &LogLine::new(event, depth, resolve))
            .map_err(|e| TraceError::Write(e.into()))?;
        w.write_all(b"\n").map_err(TraceError::Write)?;
    }
    w.flush().map_err(TraceError::Write)
}
