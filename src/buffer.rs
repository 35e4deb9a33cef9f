use std::io;
use std::os::unix::io::RawFd;

use libc::c_void;

/// Bytes readv'd into the stack region when the writable tail is too small.
const OVERFLOW_CHUNK: usize = 65536;

const INITIAL_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BufferError {
    /// `retrieve` asked for more bytes than the readable span holds.
    #[error("retrieve of {requested} bytes exceeds readable length {readable}")]
    Underflow { requested: usize, readable: usize },
}

/// Growable byte buffer with two cursors.
///
/// The readable span is `[read_pos, write_pos)`, the writable span is
/// `[write_pos, capacity)`, and `[0, read_pos)` is prependable space that
/// gets reclaimed by shifting before the buffer is ever grown.
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn readable_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable_len(&self) -> usize {
        self.data.len() - self.write_pos
    }

    pub fn prependable_len(&self) -> usize {
        self.read_pos
    }

    /// The readable span.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Mark `n` readable bytes as consumed.
    pub fn retrieve(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.readable_len() {
            return Err(BufferError::Underflow {
                requested: n,
                readable: self.readable_len(),
            });
        }
        self.read_pos += n;
        Ok(())
    }

    /// Consume the readable span up to `end`, an offset into `peek()`.
    pub fn retrieve_until(&mut self, end: usize) -> Result<(), BufferError> {
        self.retrieve(end)
    }

    /// Drain the readable span into a `String` (lossy) and clear the buffer.
    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.reset();
        s
    }

    /// Clear both cursors and zero the storage.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.read_pos = 0;
        self.write_pos = 0;
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Make room for `n` more bytes: shift the readable span down if the
    /// reclaimed prepend space suffices, otherwise grow the storage to
    /// `write_pos + n + 1`.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_len() >= n {
            return;
        }
        if self.writable_len() + self.prependable_len() >= n {
            let readable = self.readable_len();
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        } else {
            self.data.resize(self.write_pos + n + 1, 0);
        }
        debug_assert!(self.writable_len() >= n);
    }

    /// Scatter-read from `fd`: the writable tail first, then a stack
    /// region for whatever the tail cannot hold. One readiness
    /// notification therefore drains one full syscall's worth even when
    /// the buffer is momentarily small, which edge-triggered mode
    /// depends on.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut overflow = [0u8; OVERFLOW_CHUNK];
        let writable = self.writable_len();

        let iov = [
            libc::iovec {
                iov_base: unsafe { self.data.as_mut_ptr().add(self.write_pos) } as *mut c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: overflow.as_mut_ptr() as *mut c_void,
                iov_len: overflow.len(),
            },
        ];

        let n = unsafe { libc::readv(fd, iov.as_ptr(), 2) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&overflow[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable span to `fd` in one call and advance `read_pos`
    /// by whatever the OS accepted. Partial writes are the caller's
    /// problem.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_len();
        let n = unsafe {
            libc::write(
                fd,
                self.data.as_ptr().add(self.read_pos) as *const c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.read_pos += n as usize;
        Ok(n as usize)
    }
}
