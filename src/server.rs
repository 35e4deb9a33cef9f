use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::conn::{ConnContext, HttpConn};
use crate::epoll::{
    Epoller, ReadyEvents, EV_ERR, EV_ET, EV_HUP, EV_IN, EV_ONESHOT, EV_OUT, EV_RDHUP,
};
use crate::error::Result;
use crate::logger::{Level, Logger};
use crate::sqlpool::SqlConnPool;
use crate::syscalls;
use crate::threadpool::ThreadPool;
use crate::timer::HeapTimer;

/// Hard cap on simultaneously open client connections.
const MAX_FD: usize = 65_536;

const MAX_EVENTS: usize = 1024;

/// Upper bound on one epoll wait so the loop keeps noticing the
/// shutdown flag; signals land on the ctrlc thread, not in the wait.
const WAIT_SLICE_MS: u64 = 1000;

type UserTable = Arc<Mutex<HashMap<RawFd, Arc<Mutex<HttpConn>>>>>;

/// Everything a worker task or timer callback needs to re-arm or tear
/// down a connection, detached from the server's exclusive state.
#[derive(Clone)]
struct Dispatch {
    epoller: Arc<Epoller>,
    users: UserTable,
    log: Logger,
    conn_event: u32,
}

impl Dispatch {
    /// The only path that destroys a connection: drop it from the
    /// table, drop the epoll registration, release fd and mapping.
    fn close(&self, fd: RawFd) {
        let conn = self.users.lock().unwrap().remove(&fd);
        if let Some(conn) = conn {
            let _ = self.epoller.delete(fd);
            conn.lock().unwrap().close();
        }
    }

    /// Parse the buffered input and flip the one-shot interest to the
    /// next phase: writable when a response is staged, readable when
    /// there was nothing to process.
    fn process(&self, fd: RawFd, conn: &mut HttpConn) {
        let interest = if conn.process() { EV_OUT } else { EV_IN };
        if let Err(e) = self.epoller.modify(fd, self.conn_event | interest) {
            self.log.error(format!("Client[{fd}] re-arm failed: {e}"));
        }
    }

    fn on_read(&self, fd: RawFd, conn: Arc<Mutex<HttpConn>>) {
        let mut c = conn.lock().unwrap();
        match c.read() {
            // Peer finished sending nothing: end of stream.
            Ok(0) => {
                drop(c);
                self.close(fd);
                return;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                self.log.warn(format!("Client[{fd}] read failed: {e}"));
                drop(c);
                self.close(fd);
                return;
            }
        }
        self.process(fd, &mut c);
    }

    fn on_write(&self, fd: RawFd, conn: Arc<Mutex<HttpConn>>) {
        let mut c = conn.lock().unwrap();
        match c.write() {
            Ok(_) => {
                if c.to_write_bytes() == 0 && c.is_keep_alive() {
                    // Response fully delivered: go look for the next
                    // request on this connection.
                    self.process(fd, &mut c);
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                // Socket full: resume once it drains.
                if let Err(e) = self.epoller.modify(fd, self.conn_event | EV_OUT) {
                    self.log.error(format!("Client[{fd}] re-arm failed: {e}"));
                }
                return;
            }
            Err(e) => {
                self.log.warn(format!("Client[{fd}] write failed: {e}"));
            }
        }
        drop(c);
        self.close(fd);
    }
}

/// Stops the accept loop from another thread (signal handler, tests).
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Owns the reactor, the worker pool, the timer heap, and the
/// connection table, and runs the accept/read/write dispatch loop.
pub struct WebServer {
    listen_fd: RawFd,
    timeout_ms: u64,
    listen_event: u32,
    conn_event: u32,
    epoller: Arc<Epoller>,
    ready: ReadyEvents,
    timer: HeapTimer,
    workers: Option<ThreadPool>,
    users: UserTable,
    ctx: Arc<ConnContext>,
    log: Logger,
    shutdown: Arc<AtomicBool>,
    stopped: bool,
}

fn event_mode(trigger_mode: u8) -> (u32, u32) {
    let mut listen_event = EV_RDHUP;
    let mut conn_event = EV_ONESHOT | EV_RDHUP;
    match trigger_mode {
        0 => {}
        1 => conn_event |= EV_ET,
        2 => listen_event |= EV_ET,
        _ => {
            listen_event |= EV_ET;
            conn_event |= EV_ET;
        }
    }
    (listen_event, conn_event)
}

impl WebServer {
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;

        let log = if cfg.log_enable {
            Logger::init(&cfg.log_dir, Level::from_u8(cfg.log_level), cfg.log_queue_size)?
        } else {
            Logger::disabled()
        };

        let src_dir = match cfg.src_dir.clone() {
            Some(dir) => dir,
            None => std::env::current_dir()?.join("resources"),
        };

        let sql = match &cfg.sql {
            Some(sql_cfg) => Some(SqlConnPool::connect(sql_cfg).map_err(|e| {
                log.error(format!("SqlConnPool init error: {e}"));
                crate::error::Error::Sql(e)
            })?),
            None => None,
        };

        let (listen_event, conn_event) = event_mode(cfg.trigger_mode);

        let listen_fd = syscalls::create_listen_socket(cfg.port, cfg.linger).map_err(|e| {
            log.error(format!("Init socket error on port {}: {e}", cfg.port));
            crate::error::Error::Io(e)
        })?;

        let epoller = Arc::new(Epoller::new()?);
        if let Err(e) = epoller.add(listen_fd, listen_event | EV_IN) {
            log.error(format!("Add listen error: {e}"));
            unsafe { libc::close(listen_fd) };
            return Err(e.into());
        }

        let ctx = Arc::new(ConnContext {
            src_dir: src_dir.clone(),
            is_et: conn_event & EV_ET != 0,
            sql,
            log: log.clone(),
            user_count: AtomicUsize::new(0),
        });

        log.info("========== Server init ==========");
        log.info(format!("Port: {}, OpenLinger: {}", cfg.port, cfg.linger));
        log.info(format!(
            "Listen Mode: {}, OpenConn Mode: {}",
            if listen_event & EV_ET != 0 { "ET" } else { "LT" },
            if conn_event & EV_ET != 0 { "ET" } else { "LT" },
        ));
        log.info(format!("srcDir: {}", src_dir.display()));
        log.info(format!(
            "SqlConnPool num: {}, ThreadPool num: {}",
            ctx.sql.as_ref().map(|p| p.size()).unwrap_or(0),
            cfg.worker_threads
        ));

        Ok(Self {
            listen_fd,
            timeout_ms: cfg.timeout_ms,
            listen_event,
            conn_event,
            epoller,
            ready: ReadyEvents::with_capacity(MAX_EVENTS),
            timer: HeapTimer::new(),
            workers: Some(ThreadPool::new(cfg.worker_threads)),
            users: Arc::new(Mutex::new(HashMap::new())),
            ctx,
            log,
            shutdown: Arc::new(AtomicBool::new(false)),
            stopped: false,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    /// The port actually bound, resolved for ephemeral configurations.
    pub fn local_port(&self) -> io::Result<u16> {
        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let res = unsafe {
            libc::getsockname(
                self.listen_fd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(u16::from_be(addr.sin_port))
    }

    pub fn connection_count(&self) -> usize {
        self.ctx.user_count.load(Ordering::SeqCst)
    }

    /// Run the dispatch loop until the shutdown flag is raised, then
    /// tear everything down.
    pub fn run(&mut self) {
        self.log.info("========== Server start ==========");
        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = if self.timeout_ms > 0 {
                self.timer
                    .next_tick_ms()
                    .unwrap_or(WAIT_SLICE_MS)
                    .min(WAIT_SLICE_MS) as i32
            } else {
                WAIT_SLICE_MS as i32
            };

            let count = match self.epoller.wait(&mut self.ready, timeout) {
                Ok(count) => count,
                Err(e) => {
                    self.log.error(format!("epoll wait failed: {e}"));
                    break;
                }
            };

            for i in 0..count {
                let fd = self.ready.event_fd(i);
                let events = self.ready.events_of(i);
                if fd == self.listen_fd {
                    self.deal_listen();
                } else if events & (EV_RDHUP | EV_HUP | EV_ERR) != 0 {
                    self.dispatch().close(fd);
                } else if events & EV_IN != 0 {
                    self.deal_read(fd);
                } else if events & EV_OUT != 0 {
                    self.deal_write(fd);
                } else {
                    self.log.error(format!("unexpected event {events:#x} on fd {fd}"));
                }
            }
        }
        self.stop();
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch {
            epoller: self.epoller.clone(),
            users: self.users.clone(),
            log: self.log.clone(),
            conn_event: self.conn_event,
        }
    }

    fn deal_listen(&mut self) {
        loop {
            match syscalls::accept_connection(self.listen_fd) {
                Ok(Some((fd, addr))) => {
                    if self.ctx.user_count.load(Ordering::SeqCst) >= MAX_FD {
                        syscalls::send_error(fd, "Server busy!");
                        self.log.warn("Clients are full!");
                        return;
                    }
                    self.add_client(fd, addr);
                }
                Ok(None) => return,
                Err(e) => {
                    self.log.error(format!("accept failed: {e}"));
                    return;
                }
            }
            // Level-triggered listeners take one accept per
            // notification; edge-triggered ones drain the queue.
            if self.listen_event & EV_ET == 0 {
                return;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, addr: SocketAddr) {
        let conn = Arc::new(Mutex::new(HttpConn::new(fd, addr, self.ctx.clone())));
        self.users.lock().unwrap().insert(fd, conn);

        if let Err(e) = self.epoller.add(fd, self.conn_event | EV_IN) {
            self.log.error(format!("Client[{fd}] register failed: {e}"));
            self.dispatch().close(fd);
            return;
        }
        if self.timeout_ms > 0 {
            // Insert-or-replace also retires any stale node left by a
            // previous owner of this fd.
            let d = self.dispatch();
            self.timer
                .add(fd, self.timeout_ms, Box::new(move || d.close(fd)));
        }
    }

    /// Push the deadline back before handing the connection to a
    /// worker; a timer must never fire while a task is outstanding.
    fn extend_time(&mut self, fd: RawFd) {
        if self.timeout_ms > 0 {
            self.timer.adjust(fd, self.timeout_ms);
        }
    }

    fn deal_read(&mut self, fd: RawFd) {
        let conn = match self.users.lock().unwrap().get(&fd) {
            Some(conn) => conn.clone(),
            None => return,
        };
        self.extend_time(fd);
        let d = self.dispatch();
        if let Some(pool) = &self.workers {
            pool.submit(move || d.on_read(fd, conn));
        }
    }

    fn deal_write(&mut self, fd: RawFd) {
        let conn = match self.users.lock().unwrap().get(&fd) {
            Some(conn) => conn.clone(),
            None => return,
        };
        self.extend_time(fd);
        let d = self.dispatch();
        if let Some(pool) = &self.workers {
            pool.submit(move || d.on_write(fd, conn));
        }
    }

    /// Stop accepting, drain the workers, close every connection, and
    /// flush the log. Safe to call more than once.
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shutdown.store(true, Ordering::Release);

        let _ = self.epoller.delete(self.listen_fd);
        unsafe { libc::close(self.listen_fd) };

        // Join the workers first so no task is left pointing at a
        // connection while we tear the table down.
        self.workers.take();

        let remaining: Vec<_> = self.users.lock().unwrap().drain().collect();
        for (fd, conn) in remaining {
            let _ = self.epoller.delete(fd);
            conn.lock().unwrap().close();
        }
        self.timer.clear();

        if let Some(sql) = &self.ctx.sql {
            sql.close_all();
        }
        self.log.info("========== Server quit ==========");
        self.log.flush();
    }
}

impl Drop for WebServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_mode_matrix_matches_the_selector() {
        let (listen, conn) = event_mode(0);
        assert_eq!(listen & EV_ET, 0);
        assert_eq!(conn & EV_ET, 0);

        let (listen, conn) = event_mode(1);
        assert_eq!(listen & EV_ET, 0);
        assert_ne!(conn & EV_ET, 0);

        let (listen, conn) = event_mode(2);
        assert_ne!(listen & EV_ET, 0);
        assert_eq!(conn & EV_ET, 0);

        let (listen, conn) = event_mode(3);
        assert_ne!(listen & EV_ET, 0);
        assert_ne!(conn & EV_ET, 0);
    }

    #[test]
    fn client_registrations_always_carry_oneshot_and_rdhup() {
        for mode in 0..=3 {
            let (_, conn) = event_mode(mode);
            assert_ne!(conn & EV_ONESHOT, 0);
            assert_ne!(conn & EV_RDHUP, 0);
        }
    }
}
