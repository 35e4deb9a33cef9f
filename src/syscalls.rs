use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::time::Duration;

use libc::{c_int, c_void, socklen_t};
use socket2::{Domain, Protocol, Socket, Type};

const BACKLOG: i32 = 1024;

/// Build the nonblocking listener: `SO_REUSEADDR`, optional one-second
/// `SO_LINGER`, bound to `0.0.0.0:port`.
pub fn create_listen_socket(port: u16, linger: bool) -> io::Result<RawFd> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if linger {
        // Graceful close: block the final close until pending data is
        // flushed or the linger window runs out.
        socket.set_linger(Some(Duration::from_secs(1)))?;
    }
    socket.set_nonblocking(true)?;

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into_raw_fd())
}

/// Accept one pending connection, already nonblocking. `Ok(None)` means
/// the accept queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some((fd, sockaddr_to_std(&storage))))
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> SocketAddr {
    match storage.ss_family as c_int {
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)),
                u16::from_be(sin6.sin6_port),
            )
        }
        _ => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))),
                u16::from_be(sin.sin_port),
            )
        }
    }
}

/// Reject an over-capacity peer: best-effort message, then close.
pub fn send_error(fd: RawFd, info: &str) {
    unsafe {
        libc::send(fd, info.as_ptr() as *const c_void, info.len(), 0);
        libc::close(fd);
    }
}

/// Scatter-gather write of up to two regions in one syscall.
pub fn writev(fd: RawFd, iov: &[libc::iovec]) -> io::Result<usize> {
    let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
