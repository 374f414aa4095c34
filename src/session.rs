//! Per-connection state: receive buffer, framing state machine, peer
//! identity, lifecycle, error accounting (spec.md §3, §4.4).

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::ListenerConfig;
use crate::driver::{Driver, HandshakeProgress, IoOutcome};
use crate::error::Direction;
use crate::framer::{FrameEvent, Framer, FramingKind};
use crate::peer::PeerIdentity;
use crate::poller::{Interest, Poller};
use crate::sink::{MessageSink, Record, SubmitOutcome};
use crate::tls_context::TlsContext;

/// `Session` lifecycle. Monotonic except for the terminal `Closed` state
/// (spec.md §3, §4.4, §8 invariant 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Established,
    Closing,
    Closed,
}

/// Maximum read/decode iterations a single worker turn performs before
/// yielding, to bound per-turn latency (spec.md §4.4).
const MAX_ITERATIONS_PER_TURN: u32 = 500;
const READ_CHUNK: usize = 16 * 1024 + 1;

pub struct SessionContext {
    pub listener_tag: String,
    pub listener_config: Arc<ListenerConfig>,
    pub tls: Option<Arc<TlsContext>>,
    pub sink: Arc<dyn MessageSink>,
}

struct Inner {
    driver: Driver,
    state: SessionState,
    framer: Framer,
    pending_direction: Direction,
    /// set once the framer's decode loop asks to stop reading this turn
    /// because the sink reported backpressure (spec.md §4.4, §7).
    backoff_read: bool,
    tls_validated: bool,
}

/// A session is advanced by exactly one worker at a time, enforced with
/// `try_lock` (spec.md §4.4, §8 invariant 3).
pub struct Session {
    pub id: u64,
    fd: RawFd,
    peer: PeerIdentity,
    in_error: AtomicBool,
    last_activity_secs: AtomicU64,
    epoch: Instant,
    ctx: Arc<SessionContext>,
    inner: Mutex<Inner>,
}

impl Session {
    pub fn new(id: u64, driver: Driver, ctx: Arc<SessionContext>, framing_kind: FramingKind) -> Self {
        let fd = driver.get_os_socket();
        let peer = PeerIdentity {
            fqdn: None,
            ip: driver.get_remote_ip(),
            port: driver.get_remote_port(),
        };
        let is_tls = driver.is_tls();
        let framer = Framer::new(
            framing_kind,
            ctx.listener_config.max_frame_size,
            ctx.listener_config.framing.clone(),
        );
        Self {
            id,
            fd,
            peer,
            in_error: AtomicBool::new(false),
            last_activity_secs: AtomicU64::new(0),
            epoch: Instant::now(),
            ctx,
            inner: Mutex::new(Inner {
                driver,
                state: if is_tls { SessionState::Handshaking } else { SessionState::Established },
                framer,
                pending_direction: Direction::Read,
                backoff_read: false,
                tls_validated: !is_tls,
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn set_peer_fqdn(&mut self, fqdn: Option<String>) {
        self.peer.fqdn = fqdn;
    }

    pub fn mark_in_error(&self) {
        self.in_error.store(true, Ordering::SeqCst);
    }

    pub fn in_error(&self) -> bool {
        self.in_error.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        let secs = self.last_activity_secs.load(Ordering::Relaxed);
        let last = self.epoch + Duration::from_secs(secs);
        Instant::now().saturating_duration_since(last)
    }

    fn touch(&self) {
        self.last_activity_secs
            .store(self.epoch.elapsed().as_secs(), Ordering::Relaxed);
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().unwrap().state
    }

    pub fn emit_msg_on_close(&self) -> bool {
        self.ctx.listener_config.emit_msg_on_close
    }

    /// Advance this session per spec.md §4.4's state table. Returns
    /// `Deferred` immediately without advancing if another worker currently
    /// holds the lock — the lock holder is responsible for rearming
    /// (spec.md §4.6). Returns `Closed` once the session has torn down, so
    /// the caller can unregister it; otherwise returns `Rearmed`.
    pub fn advance(&self, poller: &Poller) -> AdvanceOutcome {
        let mut guard = match self.inner.try_lock() {
            Ok(g) => g,
            Err(TryLockError::WouldBlock) => return AdvanceOutcome::Deferred,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
        };

        if self.in_error.load(Ordering::SeqCst) {
            Self::log_socket_error(self.fd, &self.peer);
            guard.state = SessionState::Closing;
        }

        let mut iterations = 0u32;
        while iterations < MAX_ITERATIONS_PER_TURN {
            iterations += 1;
            match guard.state {
                SessionState::Handshaking => match self.drive_handshake(&mut guard) {
                    HandshakeOutcome::Pending => break,
                    HandshakeOutcome::Established => continue,
                    HandshakeOutcome::Failed => {
                        guard.state = SessionState::Closing;
                    }
                },
                SessionState::Established => match self.drive_read(&mut guard) {
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Progressed => continue,
                    ReadOutcome::Backoff => break,
                    ReadOutcome::Closed => guard.state = SessionState::Closing,
                },
                SessionState::Closing => {
                    self.close(&mut guard);
                    guard.state = SessionState::Closed;
                    break;
                }
                SessionState::Closed => break,
            }
        }

        match guard.state {
            SessionState::Closed => AdvanceOutcome::Closed,
            SessionState::Handshaking => {
                let interest = Interest::from_direction(guard.pending_direction);
                let _ = poller.rearm(self.fd, self.id, interest);
                AdvanceOutcome::Rearmed
            }
            SessionState::Established => {
                let interest = if guard.backoff_read { Interest::WRITE } else { Interest::READ };
                let _ = poller.rearm(self.fd, self.id, interest);
                AdvanceOutcome::Rearmed
            }
            SessionState::Closing => {
                // entered Closing and not yet drained this turn; rearm read
                // so the next turn finishes the teardown.
                let _ = poller.rearm(self.fd, self.id, Interest::READ);
                AdvanceOutcome::Rearmed
            }
        }
    }

    fn drive_handshake(&self, guard: &mut Inner) -> HandshakeOutcome {
        match guard.driver.handshake() {
            Ok(HandshakeProgress::Established) => {
                if let Some(tls) = &self.ctx.tls {
                    let validated = match &guard.driver {
                        Driver::Ossl(d) => tls.validate_peer(d).is_ok(),
                        Driver::Plain(_) => true,
                    };
                    guard.tls_validated = validated;
                    if !validated {
                        // the operational warning (subject to the auth-err-
                        // reported latch) is emitted by `TlsContext::reject`.
                        debug!(peer = %self.peer, "tls peer validation failed, closing session");
                        return HandshakeOutcome::Failed;
                    }
                }
                guard.state = SessionState::Established;
                HandshakeOutcome::Established
            }
            Ok(HandshakeProgress::Pending(dir)) => {
                guard.pending_direction = dir;
                HandshakeOutcome::Pending
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "tls handshake failed");
                HandshakeOutcome::Failed
            }
        }
    }

    fn drive_read(&self, guard: &mut Inner) -> ReadOutcome {
        guard.backoff_read = false;
        let mut buf = [0u8; READ_CHUNK];
        match guard.driver.read(&mut buf) {
            Ok(IoOutcome::Ok(n)) => {
                self.touch();
                match guard.framer.feed(&buf[..n]) {
                    Ok(events) => self.dispatch_events(guard, events),
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "framing error");
                        ReadOutcome::Closed
                    }
                }
            }
            Ok(IoOutcome::WouldBlock(_)) => ReadOutcome::WouldBlock,
            Ok(IoOutcome::Eof) => {
                debug!(peer = %self.peer, "connection closed by peer");
                ReadOutcome::Closed
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "read error");
                ReadOutcome::Closed
            }
        }
    }

    fn dispatch_events(&self, guard: &mut Inner, events: Vec<FrameEvent>) -> ReadOutcome {
        for event in events {
            match event {
                FrameEvent::TruncationWarning => {
                    warn!(peer = %self.peer, "frame exceeded max_frame_size, truncating");
                }
                FrameEvent::Record(bytes) => {
                    let outcome = self.ctx.sink.submit(Record {
                        listener_tag: &self.ctx.listener_tag,
                        peer_ip: self.peer.ip,
                        peer_fqdn: self.peer.fqdn.as_deref(),
                        default_tz: &self.ctx.listener_config.default_tz,
                        bytes: &bytes,
                    });
                    match outcome {
                        SubmitOutcome::Ok => {}
                        SubmitOutcome::QueueFull => {
                            guard.backoff_read = true;
                            return ReadOutcome::Backoff;
                        }
                        SubmitOutcome::Fatal => return ReadOutcome::Closed,
                    }
                }
            }
        }
        ReadOutcome::Progressed
    }

    fn close(&self, guard: &mut Inner) {
        if self.ctx.listener_config.emit_msg_on_close {
            info!(peer = %self.peer, "session closing");
        }
        let _ = guard.driver.abort();
    }

    fn log_socket_error(fd: RawFd, peer: &PeerIdentity) {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: `err`/`len` are valid, appropriately-sized out-params for
        // SO_ERROR; `fd` is the session's own, still-open descriptor.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc == 0 {
            warn!(peer = %peer, so_error = err, "session socket error (EPOLLERR)");
        }
    }
}

/// Result of one `Session::advance` call (spec.md §4.6 step 2/4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Another worker already holds the session's lock; nothing was done.
    Deferred,
    /// The session is still open and has been rearmed with the poller.
    Rearmed,
    /// The session reached `Closed` this turn; the caller must unregister it.
    Closed,
}

enum HandshakeOutcome {
    Pending,
    Established,
    Failed,
}

enum ReadOutcome {
    WouldBlock,
    Progressed,
    Backoff,
    Closed,
}
