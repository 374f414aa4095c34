//! Binds one address/port, accepts connections, constructs `Session`s, and
//! applies per-listener policy (spec.md §4.3).

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::{info, warn};

use crate::acl::{Acl, Verdict};
use crate::config::{DriverKind, ListenerConfig};
use crate::driver::{Driver, PlainDriver};
use crate::framer::FramingKind;
use crate::ratelimit::RateLimiter;
use crate::session::{Session, SessionContext};
use crate::sink::MessageSink;
use crate::tls_context::TlsContext;

/// Default accept backlog, matching the teacher's `Builder::backlog` default.
const DEFAULT_BACKLOG: u32 = 2048;

pub struct Listener {
    std_listener: StdTcpListener,
    config: Arc<ListenerConfig>,
    tls: Option<Arc<TlsContext>>,
    acl: Acl,
    ratelimit: std::sync::Mutex<RateLimiter>,
    sink: Arc<dyn MessageSink>,
    next_session_id: AtomicU64,
    session_id_base: u64,
}

impl Listener {
    pub fn bind(
        config: Arc<ListenerConfig>,
        acl: Acl,
        sink: Arc<dyn MessageSink>,
        ocsp_cache: Arc<crate::ocsp::OcspCache>,
        session_id_base: u64,
    ) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.port)
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid bind_addr/port"))?;

        let socket = if addr.is_ipv4() {
            Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?
        } else {
            Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?
        };
        socket.set_nonblocking(true)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.listen(DEFAULT_BACKLOG as i32)?;
        let std_listener: StdTcpListener = socket.into();

        let tls = if config.tls_mode {
            Some(Arc::new(
                TlsContext::build(&config, ocsp_cache).map_err(io::Error::other)?,
            ))
        } else {
            None
        };

        info!(listener = %config.input_name, addr = %addr, "listener bound");
        let ratelimit = std::sync::Mutex::new(RateLimiter::new(&config.ratelimit));

        Ok(Self {
            std_listener,
            config,
            tls,
            acl,
            ratelimit,
            sink,
            next_session_id: AtomicU64::new(0),
            session_id_base,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.std_listener.as_raw_fd()
    }

    /// The socket's actual bound address; differs from `config.port` when
    /// the configured port was `0` (OS-assigned ephemeral port).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.std_listener.local_addr()
    }

    pub fn tag(&self) -> &str {
        &self.config.input_name
    }

    pub fn config(&self) -> &Arc<ListenerConfig> {
        &self.config
    }

    /// Accept every currently-pending connection (the listener fd is
    /// level-triggered; drain until `WouldBlock`). Returns newly constructed,
    /// not-yet-registered sessions.
    pub fn accept_ready(&self) -> Vec<Session> {
        let mut sessions = Vec::new();
        loop {
            match self.std_listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Some(session) = self.admit(stream, peer_addr) {
                        sessions.push(session);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if is_connection_error(&e) => continue,
                Err(e) => {
                    warn!(listener = %self.config.input_name, error = %e, "accept error");
                    break;
                }
            }
        }
        sessions
    }

    fn admit(&self, stream: std::net::TcpStream, peer_addr: SocketAddr) -> Option<Session> {
        // reverse DNS resolution is out of this core's scope (spec.md §1), so
        // a hostname rule that needs it can never be satisfied here; fail
        // closed rather than silently admitting every peer.
        let verdict = self.acl.check(peer_addr.ip(), None);
        let allowed = matches!(verdict, Ok(Verdict::Allow));
        if !allowed {
            if self.ratelimit.lock().unwrap().should_warn(peer_addr.ip()) {
                match verdict {
                    Err(crate::error::AclError::NeedDns) => {
                        warn!(listener = %self.config.input_name, peer = %peer_addr, "rejected: hostname ACL rule needs DNS, which this core does not resolve");
                    }
                    _ => warn!(listener = %self.config.input_name, peer = %peer_addr, "rejected by ACL"),
                }
            }
            return None;
        }

        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "set_nodelay failed");
        }

        let driver = match (self.config.driver, &self.tls) {
            (DriverKind::Ossl, Some(tls)) => match tls.accept(stream) {
                Ok(d) => Driver::Ossl(Box::new(d)),
                Err(e) => {
                    warn!(listener = %self.config.input_name, error = %e, "tls accept failed");
                    return None;
                }
            },
            (DriverKind::Gtls, _) | (DriverKind::Mbedtls, _) => {
                warn!(
                    listener = %self.config.input_name,
                    "driver kind is configured but not implemented by this core; rejecting connection"
                );
                return None;
            }
            _ => match PlainDriver::new(stream) {
                Ok(d) => Driver::Plain(d),
                Err(e) => {
                    warn!(error = %e, "plain driver setup failed");
                    return None;
                }
            },
        };

        if self.config.keepalive.enabled {
            let _ = driver.enable_keep_alive(
                self.config.keepalive.time_s,
                self.config.keepalive.intvl_s,
                self.config.keepalive.probes,
            );
        }

        let framing_kind = match self.config.framing_kind {
            crate::config::FramingKindConfig::OctetCounted => FramingKind::OctetCounted,
            crate::config::FramingKindConfig::LfDelimited => FramingKind::LfDelimited,
        };

        let ctx = Arc::new(SessionContext {
            listener_tag: self.config.input_name.clone(),
            listener_config: self.config.clone(),
            tls: self.tls.clone(),
            sink: self.sink.clone(),
        });

        let id = self.session_id_base + self.next_session_id.fetch_add(1, Ordering::Relaxed);
        Some(Session::new(id, driver, ctx, framing_kind))
    }

}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}
