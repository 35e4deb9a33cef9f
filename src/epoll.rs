use std::io;
use std::os::unix::io::RawFd;

use libc::c_int;

pub const EV_IN: u32 = libc::EPOLLIN as u32;
pub const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EV_HUP: u32 = libc::EPOLLHUP as u32;
pub const EV_ERR: u32 = libc::EPOLLERR as u32;
pub const EV_ET: u32 = libc::EPOLLET as u32;
pub const EV_ONESHOT: u32 = libc::EPOLLONESHOT as u32;

/// Ready-event buffer filled by `Epoller::wait`.
pub struct ReadyEvents {
    events: Vec<libc::epoll_event>,
}

impl ReadyEvents {
    pub fn with_capacity(max_events: usize) -> Self {
        assert!(max_events > 0);
        Self {
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events],
        }
    }

    /// The fd of the i-th ready entry of the last wait.
    pub fn event_fd(&self, i: usize) -> RawFd {
        self.events[i].u64 as RawFd
    }

    /// The event mask of the i-th ready entry of the last wait.
    pub fn events_of(&self, i: usize) -> u32 {
        self.events[i].events
    }
}

/// Thin wrapper over the epoll readiness facility.
///
/// `add`/`modify`/`delete` are usable from any thread; one-shot
/// registrations are re-armed by worker threads through `modify` while
/// the reactor thread sits in `wait`.
pub struct Epoller {
    epfd: RawFd,
}

impl Epoller {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epfd })
    }

    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let res = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            // Deleting an fd that was already dropped from the interest
            // set is not worth reporting.
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` (-1 blocks) and fill `ready`. EINTR
    /// reports zero events so the caller can re-check its shutdown flag.
    pub fn wait(&self, ready: &mut ReadyEvents, timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.epfd,
                ready.events.as_mut_ptr(),
                ready.events.len() as c_int,
                timeout_ms,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(res as usize)
    }

    fn ctl(&self, op: c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let res = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Epoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
