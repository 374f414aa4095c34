//! Event-notification abstraction over epoll, with a `poll(2)` fallback for
//! platforms that lack it (spec.md §4.2). Grounded on the raw syscall layer
//! in `examples/warpy-ai-script/src/runtime/async/reactor.rs`'s `sys` module,
//! generalized to the edge-triggered one-shot, mandatory-rearm contract this
//! core requires.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::Direction;

/// Interest bitmask, `{In, Out}` per spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Self = Self { readable: true, writable: false };
    pub const WRITE: Self = Self { readable: false, writable: true };
    pub const BOTH: Self = Self { readable: true, writable: true };

    pub fn from_direction(dir: Direction) -> Self {
        match dir {
            Direction::Read => Self::READ,
            Direction::Write => Self::WRITE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    /// Listener sockets: level-triggered, persistent (spec.md §4.2).
    Listener,
    /// Session sockets: edge-triggered, one-shot; must be rearmed explicitly
    /// after every worker turn unless the session is closing.
    Session,
}

/// One ready notification handed to a worker.
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

enum Backend {
    Epoll(EpollBackend),
    Poll(PollBackend),
}

pub struct Poller {
    backend: Backend,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        match EpollBackend::new() {
            Ok(b) => Ok(Self { backend: Backend::Epoll(b) }),
            Err(_) => Ok(Self { backend: Backend::Poll(PollBackend::new()) }),
        }
    }

    /// `add`/`rearm`/`del` take `&self`: the epoll backend's raw fd operations
    /// are safe to call concurrently from worker threads while the dedicated
    /// poller thread blocks in `wait` on the same epoll instance (the kernel
    /// serializes access to one epoll fd's interest list); the poll(2)
    /// fallback guards its registration array with a mutex to get the same
    /// property without relying on kernel semantics.
    pub fn add(&self, fd: RawFd, token: u64, interest: Interest, kind: RegistrationKind) -> io::Result<()> {
        match &self.backend {
            Backend::Epoll(b) => b.ctl(fd, token, interest, kind, libc::EPOLL_CTL_ADD),
            Backend::Poll(b) => b.add(fd, token, interest, kind),
        }
    }

    /// Rearm a session's registration. Mandatory on every worker turn that
    /// does not close the session, per spec.md §4.2, §9 — forgetting this
    /// stalls the session forever on an edge-triggered backend.
    pub fn rearm(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        match &self.backend {
            Backend::Epoll(b) => b.ctl(fd, token, interest, RegistrationKind::Session, libc::EPOLL_CTL_MOD),
            // the poll(2) fallback is level-triggered; re-arming is a no-op,
            // the fd is simply re-scanned next wait() call.
            Backend::Poll(b) => b.rearm(fd, interest),
        }
    }

    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        match &self.backend {
            Backend::Epoll(b) => b.del(fd),
            Backend::Poll(b) => b.del(fd),
        }
    }

    /// Only the dedicated poller thread should call `wait`.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<ReadyEvent>> {
        match &self.backend {
            Backend::Epoll(b) => b.wait(timeout_ms),
            Backend::Poll(b) => b.wait(timeout_ms),
        }
    }
}

struct EpollBackend {
    epoll_fd: RawFd,
}

impl EpollBackend {
    fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 is a plain syscall wrapper with no preconditions
        // beyond the flags argument, which is a constant.
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { epoll_fd: fd })
    }

    fn ctl(&self, fd: RawFd, token: u64, interest: Interest, kind: RegistrationKind, op: i32) -> io::Result<()> {
        let mut events = interest_to_bits(interest);
        if kind == RegistrationKind::Session {
            events |= (libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        }
        let mut event = libc::epoll_event { events, u64: token };
        // SAFETY: `event` is a valid, live pointer for the duration of the call;
        // `fd` and `self.epoll_fd` are both owned, open descriptors.
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn del(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: epoll_ctl with EPOLL_CTL_DEL ignores the event pointer on
        // modern kernels but older kernels require a non-null pointer.
        let mut dummy: libc::epoll_event = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut dummy) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn wait(&self, timeout_ms: i32) -> io::Result<Vec<ReadyEvent>> {
        let mut buf: Vec<libc::epoll_event> = vec![unsafe { std::mem::zeroed() }; 1024];
        // SAFETY: `buf` has capacity for `buf.len()` events and lives for the
        // duration of the call.
        let n = unsafe { libc::epoll_wait(self.epoll_fd, buf.as_mut_ptr(), buf.len() as i32, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        Ok(buf[..n as usize]
            .iter()
            .map(|e| ReadyEvent {
                token: e.u64,
                readable: e.events & libc::EPOLLIN as u32 != 0,
                writable: e.events & libc::EPOLLOUT as u32 != 0,
                error: e.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
            })
            .collect())
    }
}

impl Drop for EpollBackend {
    fn drop(&mut self) {
        // SAFETY: `epoll_fd` is owned exclusively by this struct.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

fn interest_to_bits(interest: Interest) -> u32 {
    let mut bits = 0u32;
    if interest.readable {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.writable {
        bits |= libc::EPOLLOUT as u32;
    }
    bits | (libc::EPOLLERR | libc::EPOLLHUP) as u32
}

/// `poll(2)`-based fallback used when epoll is unavailable. Level-triggered;
/// the registration array grows by 1024 entries at a time (spec.md §4.2).
/// Guarded by a mutex so `add`/`rearm`/`del`/`wait` can all take `&self`,
/// matching the epoll backend's calling convention.
struct PollBackend {
    state: std::sync::Mutex<PollState>,
}

struct PollState {
    fds: Vec<libc::pollfd>,
    tokens: Vec<u64>,
}

impl PollBackend {
    fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(PollState { fds: Vec::new(), tokens: Vec::new() }),
        }
    }

    fn add(&self, fd: RawFd, token: u64, interest: Interest, _kind: RegistrationKind) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fds.len() == state.fds.capacity() {
            state.fds.reserve(1024);
            state.tokens.reserve(1024);
        }
        state.fds.push(libc::pollfd { fd, events: poll_events(interest), revents: 0 });
        state.tokens.push(token);
        Ok(())
    }

    fn rearm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.fds.iter_mut().find(|p| p.fd == fd) {
            entry.events = poll_events(interest);
        }
        Ok(())
    }

    fn del(&self, fd: RawFd) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state.fds.iter().position(|p| p.fd == fd) {
            state.fds.remove(pos);
            state.tokens.remove(pos);
        }
        Ok(())
    }

    fn wait(&self, timeout_ms: i32) -> io::Result<Vec<ReadyEvent>> {
        let mut state = self.state.lock().unwrap();
        if state.fds.is_empty() {
            return Ok(Vec::new());
        }
        // SAFETY: `state.fds` is a valid, live slice for the duration of the call.
        let rc = unsafe { libc::poll(state.fds.as_mut_ptr(), state.fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }
        let mut ready = Vec::with_capacity(rc as usize);
        for (pfd, token) in state.fds.iter().zip(state.tokens.iter()) {
            if pfd.revents != 0 {
                ready.push(ReadyEvent {
                    token: *token,
                    readable: pfd.revents & libc::POLLIN != 0,
                    writable: pfd.revents & libc::POLLOUT != 0,
                    error: pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0,
                });
            }
        }
        Ok(ready)
    }
}

fn poll_events(interest: Interest) -> libc::c_short {
    let mut bits = 0;
    if interest.readable {
        bits |= libc::POLLIN;
    }
    if interest.writable {
        bits |= libc::POLLOUT;
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn add_then_del_leaves_registration_as_is() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let poller = Poller::new().unwrap();
        poller.add(server.as_raw_fd(), 1, Interest::READ, RegistrationKind::Session).unwrap();
        poller.del(server.as_raw_fd()).unwrap();
        // deleting twice (idempotent-ish) should not error when backend is epoll
        // (NotFound is swallowed) nor panic on the poll fallback.
        let _ = poller.del(server.as_raw_fd());
    }

    #[test]
    fn wait_reports_readable_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let poller = Poller::new().unwrap();
        poller
            .add(listener.as_raw_fd(), 42, Interest::READ, RegistrationKind::Listener)
            .unwrap();

        let _client = TcpStream::connect(addr).unwrap();

        let events = poller.wait(1000).unwrap();
        assert!(events.iter().any(|e| e.token == 42 && e.readable));
    }
}
