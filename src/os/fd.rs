//! Raw file-descriptor I/O for the flush path. Nothing here allocates: paths
//! live in a fixed inline buffer and writes are staged on the stack.

use std::{
    ffi::{CStr, OsStr},
    io,
    os::unix::ffi::OsStrExt,
    path::Path,
};

use libc::{c_int, O_APPEND, O_CLOEXEC, O_CREAT, O_WRONLY};

use crate::{error::TraceError, util::print::write_fd};

/// `PATH_MAX` on Linux, including the terminating NUL.
pub const MAX_PATH_LEN: usize = 4096;

/// How many bytes an [`FdWriter`] stages before issuing a `write(2)`.
pub const WRITE_BUFFER_LEN: usize = 4096;

/// A NUL-terminated file system path stored inline, so that reopening the
/// output target on every flush does not need the heap.
#[derive(Clone)]
pub struct OutputPath {
    buf: [u8; MAX_PATH_LEN],
    len: usize,
}

impl OutputPath {
    pub fn new(path: &Path) -> Result<Self, TraceError> {
        Self::from_bytes(path.as_os_str().as_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TraceError> {
        if bytes.is_empty() || bytes.contains(&0) {
            return Err(TraceError::InvalidPath);
        }
        if bytes.len() >= MAX_PATH_LEN {
            return Err(TraceError::PathTooLong {
                len: bytes.len(),
                max: MAX_PATH_LEN - 1,
            });
        }
        let mut buf = [0; MAX_PATH_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            buf,
            len: bytes.len(),
        })
    }

    pub fn as_c_str(&self) -> &CStr {
        // SAFETY: `from_bytes()` rejected interior NULs and left
        // `buf[len]` zeroed.
        unsafe { CStr::from_bytes_with_nul_unchecked(&self.buf[..=self.len]) }
    }

    pub fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(&self.buf[..self.len]))
    }
}

impl std::fmt::Debug for OutputPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_path().fmt(f)
    }
}

/// An owned descriptor opened with `open(2)`, closed on drop.
pub struct RawFile {
    fd: c_int,
}

impl RawFile {
    /// Open `path` write-only in append mode, creating it (`0644`) if it does
    /// not exist yet. Existing contents are never truncated.
    pub fn open_append(path: &OutputPath) -> io::Result<Self> {
        // SAFETY: `as_c_str()` is a valid NUL-terminated string.
        let fd = unsafe {
            libc::open(
                path.as_c_str().as_ptr(),
                O_CREAT | O_WRONLY | O_APPEND | O_CLOEXEC,
                0o644 as libc::c_uint,
            )
        };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(Self { fd })
        }
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }
}

impl Drop for RawFile {
    fn drop(&mut self) {
        // SAFETY: we own `fd` and nobody else closes it.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A `BufWriter` whose buffer lives on the stack.
pub struct FdWriter<'f> {
    file: &'f RawFile,
    buf: [u8; WRITE_BUFFER_LEN],
    len: usize,
}

impl<'f> FdWriter<'f> {
    pub fn new(file: &'f RawFile) -> Self {
        Self {
            file,
            buf: [0; WRITE_BUFFER_LEN],
            len: 0,
        }
    }

    fn drain(&mut self) -> io::Result<()> {
        if self.len > 0 {
            let ok = write_fd(self.file.fd(), &self.buf[..self.len]);
            self.len = 0;
            if !ok {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

impl io::Write for FdWriter<'_> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.len == WRITE_BUFFER_LEN {
            self.drain()?;
        }
        let n = bytes.len().min(WRITE_BUFFER_LEN - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()
    }
}
