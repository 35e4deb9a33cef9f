use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libc::c_void;

use crate::buffer::Buffer;
use crate::logger::Logger;
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::sqlpool::SqlConnPool;
use crate::syscalls;

/// Below this many pending bytes a level-triggered write returns to the
/// reactor instead of looping on writev.
const WRITE_BURST_BYTES: usize = 10_240;

/// State shared by every connection of one server.
pub struct ConnContext {
    pub src_dir: PathBuf,
    pub is_et: bool,
    pub sql: Option<SqlConnPool>,
    pub log: Logger,
    pub user_count: AtomicUsize,
}

/// One client connection: socket, two buffers, parser, responder, and
/// the two-element scatter-gather vector (headers out of the write
/// buffer, body out of the response's file mapping).
///
/// One-shot registration guarantees a single worker touches the
/// connection at a time; the surrounding mutex exists for Rust's
/// aliasing rules and is never contended while that discipline holds.
pub struct HttpConn {
    fd: RawFd,
    addr: SocketAddr,
    closed: bool,
    body_written: usize,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    ctx: Arc<ConnContext>,
}

impl HttpConn {
    pub fn new(fd: RawFd, addr: SocketAddr, ctx: Arc<ConnContext>) -> Self {
        let count = ctx.user_count.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.log
            .info(format!("Client[{fd}]({addr}) in, userCount: {count}"));
        Self {
            fd,
            addr,
            closed: false,
            body_written: 0,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            ctx,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_keep_alive(&self) -> bool {
        self.request.is_keep_alive()
    }

    /// Release the mapping, the socket, and the connection-count slot.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.response.unmap();
        self.closed = true;
        let count = self.ctx.user_count.fetch_sub(1, Ordering::SeqCst) - 1;
        unsafe {
            libc::close(self.fd);
        }
        self.ctx.log.info(format!(
            "Client[{}]({}) quit, userCount: {}",
            self.fd, self.addr, count
        ));
    }

    /// Drain the socket into the read buffer. Under edge triggering the
    /// notification came once, so keep reading until the socket is dry.
    ///
    /// `Ok(0)` is end of stream with nothing new buffered;
    /// `Err(WouldBlock)` means the socket had nothing at all this round.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_from_fd(self.fd) {
                Ok(0) => break, // EOF
                Ok(n) => {
                    total += n;
                    if !self.ctx.is_et {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn body_remaining(&self) -> usize {
        match self.response.file() {
            Some(file) => file.len() - self.body_written,
            None => 0,
        }
    }

    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_len() + self.body_remaining()
    }

    /// Push the scatter-gather vector out, rebasing each element as
    /// bytes drain. Loops while edge-triggered or while more than a
    /// burst's worth is still pending.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut last = 0;
        loop {
            if self.to_write_bytes() == 0 {
                break;
            }
            let head = self.write_buf.peek();
            let head_len = head.len();
            let mut iov = [
                libc::iovec {
                    iov_base: head.as_ptr() as *mut c_void,
                    iov_len: head_len,
                },
                libc::iovec {
                    iov_base: std::ptr::null_mut(),
                    iov_len: 0,
                },
            ];
            if let Some(file) = self.response.file() {
                let rest = &file[self.body_written..];
                iov[1].iov_base = rest.as_ptr() as *mut c_void;
                iov[1].iov_len = rest.len();
            }

            let n = syscalls::writev(self.fd, &iov)?;
            last = n;
            if n > head_len {
                self.body_written += n - head_len;
                if head_len > 0 {
                    self.write_buf
                        .retrieve(head_len)
                        .expect("writev consumed at most the readable span");
                }
            } else {
                self.write_buf
                    .retrieve(n)
                    .expect("writev consumed at most the readable span");
            }

            if self.to_write_bytes() == 0 {
                break;
            }
            if !self.ctx.is_et && self.to_write_bytes() <= WRITE_BURST_BYTES {
                break;
            }
        }
        Ok(last)
    }

    /// Parse whatever the read buffer holds and stage the response.
    /// False means there was no input to process.
    pub fn process(&mut self) -> bool {
        self.request.init();
        if self.read_buf.readable_len() == 0 {
            return false;
        }

        match self
            .request
            .parse(&mut self.read_buf, self.ctx.sql.as_ref(), &self.ctx.log)
        {
            Ok(()) => {
                self.ctx
                    .log
                    .debug(format!("serving {}", self.request.path()));
                let path = self.request.path().to_owned();
                let keep_alive = self.request.is_keep_alive();
                self.response
                    .init(&self.ctx.src_dir, &path, keep_alive, 200);
            }
            Err(e) => {
                self.ctx.log.warn(format!(
                    "Client[{}] bad request: {e}",
                    self.fd
                ));
                let path = self.request.path().to_owned();
                self.response.init(&self.ctx.src_dir, &path, false, 400);
            }
        }

        self.response.make_response(&mut self.write_buf);
        self.body_written = 0;
        true
    }
}

impl Drop for HttpConn {
    fn drop(&mut self) {
        self.close();
    }
}
