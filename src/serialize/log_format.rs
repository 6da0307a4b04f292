//! The trace log: one JSON object per line.
//!
//! ```plaintext
//! {"op":1,"p":"0x55d0c1e0a2a0","p2":"0x0","size":100,"return_addr":["0x55d0c0b1f1a4","0x55d0c0b1f2c8"]}
//! ```
//!
//! With symbol resolution switched on, each return address becomes
//! `{"addr":"0x...","module":"/usr/lib/libfoo.so","symbol":"foo_init"}`
//! (either name may be `null`).
//!
//! The writing half ([`LogLine`]) borrows everything and never allocates, so
//! it can run inside the tracer. The reading half ([`LogRecord`]) is for
//! tools and tests.

use std::{
    ffi::{c_void, CStr},
    fs, mem,
    path::Path,
};

use serde::{ser::SerializeSeq, Deserialize, Serialize, Serializer};

use super::serde_hex::{self, HexAddr};
use crate::{
    alloc::event::{AllocationEvent, Operation},
    error::{Result, TraceError},
};

/// One event, ready to be written.
#[derive(Serialize)]
pub struct LogLine<'a> {
    op: Operation,
    #[serde(with = "serde_hex")]
    p: usize,
    #[serde(with = "serde_hex")]
    p2: usize,
    size: usize,
    return_addr: ReturnAddrs<'a>,
}

impl<'a> LogLine<'a> {
    /// `depth` is the exact number of `return_addr` entries; missing frames
    /// are written as `0x0`.
    pub fn new(event: &'a AllocationEvent, depth: usize, resolve: bool) -> Self {
        Self {
            op: event.operation,
            p: event.primary,
            p2: event.secondary,
            size: event.size,
            return_addr: ReturnAddrs {
                event,
                depth,
                resolve,
            },
        }
    }
}

struct ReturnAddrs<'a> {
    event: &'a AllocationEvent,
    depth: usize,
    resolve: bool,
}

impl Serialize for ReturnAddrs<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.depth))?;
        for i in 0..self.depth {
            let addr = self.event.provenance.get(i);
            if self.resolve {
                seq.serialize_element(&ResolvedFrame::resolve(addr))?;
            } else {
                seq.serialize_element(&HexAddr(addr))?;
            }
        }
        seq.end()
    }
}

/// A return address with whatever `dladdr()` knows about it.
#[derive(Serialize)]
struct ResolvedFrame {
    addr: HexAddr,
    module: Option<&'static str>,
    symbol: Option<&'static str>,
}

impl ResolvedFrame {
    fn resolve(addr: usize) -> Self {
        let mut frame = Self {
            addr: HexAddr(addr),
            module: None,
            symbol: None,
        };
        if addr == 0 {
            return frame;
        }
        // SAFETY: `Dl_info` is plain old data
        let mut info: libc::Dl_info = unsafe { mem::zeroed() };
        // SAFETY: `dladdr()` accepts any address and only writes to `info`
        if unsafe { libc::dladdr(addr as *const c_void, &mut info) } != 0 {
            frame.module = loader_str(info.dli_fname);
            frame.symbol = loader_str(info.dli_sname);
        }
        frame
    }
}

/// Strings returned by `dladdr()` live as long as the object they describe.
/// We never unload anything, so treat them as `'static`.
fn loader_str(s: *const libc::c_char) -> Option<&'static str> {
    if s.is_null() {
        return None;
    }
    // SAFETY: non-null `dladdr()` strings are NUL-terminated
    unsafe { CStr::from_ptr(s) }.to_str().ok()
}

/// A return address as read back from a log.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ReturnAddr {
    Bare(HexAddr),
    Resolved {
        addr: HexAddr,
        module: Option<String>,
        symbol: Option<String>,
    },
}

impl ReturnAddr {
    pub fn addr(&self) -> usize {
        match self {
            ReturnAddr::Bare(addr) | ReturnAddr::Resolved { addr, .. } => addr.0,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            ReturnAddr::Bare(_) => None,
            ReturnAddr::Resolved { symbol, .. } => symbol.as_deref(),
        }
    }
}

/// One parsed log line.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct LogRecord {
    pub op: Operation,
    #[serde(with = "serde_hex")]
    pub p: usize,
    #[serde(with = "serde_hex")]
    pub p2: usize,
    pub size: usize,
    #[serde(default)]
    pub return_addr: Vec<ReturnAddr>,
}

pub fn parse_line(line: &str) -> serde_json::Result<LogRecord> {
    serde_json::from_str(line)
}

/// Read every record in a log file, skipping blank lines.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<LogRecord>> {
    let text = fs::read_to_string(path).map_err(TraceError::Read)?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            parse_line(line).map_err(|source| TraceError::MalformedLine { line: i + 1, source })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::event::Provenance;

    #[test]
    fn bare_lines_have_the_classic_shape() {
        let event = AllocationEvent::reallocate(0x1000, 0x2000, 200)
            .with_provenance(Provenance::from_frames(&[0xabc]));
        let line = serde_json::to_string(&LogLine::new(&event, 2, false)).unwrap();
        assert_eq!(
            line,
            r#"{"op":3,"p":"0x1000","p2":"0x2000","size":200,"return_addr":["0xabc","0x0"]}"#
        );
    }

    #[test]
    fn resolved_frames_name_their_module() {
        let here = resolved_frames_name_their_module as usize;
        let event =
            AllocationEvent::allocate(0x10, 8).with_provenance(Provenance::from_frames(&[here]));
        let line = serde_json::to_string(&LogLine::new(&event, 1, true)).unwrap();
        let record = parse_line(&line).unwrap();
        match &record.return_addr[..] {
            [ReturnAddr::Resolved { addr, module, .. }] => {
                assert_eq!(addr.0, here);
                assert!(module.is_some());
            }
            other => panic!("unexpected return_addr {other:?}"),
        }
    }

    #[test]
    fn reads_glibc_style_nil_pointers() {
        let record = parse_line(
            r#"{"op":2,"p":"(nil)","p2":"(nil)","size":0,"return_addr":["0x4005d6"]}"#,
        )
        .unwrap();
        assert_eq!(record.op, Operation::Deallocate);
        assert_eq!(record.p, 0);
        assert_eq!(record.return_addr[0].addr(), 0x4005d6);
    }

    #[test]
    fn malformed_lines_are_located() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.log");
        fs::write(
            &path,
            "{\"op\":1,\"p\":\"0x1\",\"p2\":\"0x0\",\"size\":1,\"return_addr\":[]}\n\nnot json\n",
        )
        .unwrap();
        match read_log(&path) {
            Err(TraceError::MalformedLine { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected a malformed line, got {other:?}"),
        }
    }
}
