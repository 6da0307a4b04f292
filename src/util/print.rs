//! Diagnostics that never touch the allocator.
//!
//! Everything in here formats into a fixed stack buffer and hands the bytes
//! straight to `write(2)`, so it is usable before the real allocator has been
//! found, while the tracer holds its own lock, and from inside a signal
//! handler.

use std::fmt;

use libc::{c_int, STDERR_FILENO};

/// The descriptor that all raw diagnostics go to.
pub const STDERR: c_int = STDERR_FILENO;

/// A `fmt::Write` sink over a fixed, inline byte buffer. Output that does not
/// fit is silently truncated.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackWriter<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Were any bytes dropped since the last `clear()`?
    pub fn is_full(&self) -> bool {
        self.len == N
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(N - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

/// Write all of `bytes` to `fd`, retrying on `EINTR` and short writes. Returns
/// `false` if the descriptor refused the data.
pub fn write_fd(fd: c_int, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice for the duration of the call.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return false;
        }
        if n == 0 {
            return false;
        }
        bytes = &bytes[n as usize..];
    }
    true
}

/// Format `args` onto the stack and write them, plus a newline, to stderr.
pub fn write_line(args: fmt::Arguments<'_>) {
    use fmt::Write;

    let mut line = StackWriter::<512>::new();
    let _ = line.write_fmt(args);
    if line.is_full() {
        line.len -= 1;
    }
    line.push_bytes(b"\n");
    write_fd(STDERR, line.as_bytes());
}

/// `eprintln!()`, but doesn't use the allocator (or the stderr lock)
#[macro_export]
macro_rules! rawln {
    ($($arg:tt)*) => {
        $crate::util::print::write_line(::std::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use super::*;

    #[test]
    fn stack_writer_truncates_instead_of_growing() {
        let mut w = StackWriter::<8>::new();
        write!(w, "{}-{}", 1234, 56789).unwrap();
        assert_eq!(w.as_bytes(), b"1234-567");
        assert!(w.is_full());
        w.clear();
        write!(w, "{:#x}", 255).unwrap();
        assert_eq!(w.as_bytes(), b"0xff");
    }

    #[test]
    fn write_fd_reports_bad_descriptor() {
        assert!(!write_fd(-1, b"nope"));
        assert!(write_fd(STDERR, b""));
    }
}
