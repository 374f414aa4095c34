mod plain;
mod tls;

pub use plain::PlainDriver;
pub use tls::OsslDriver;

use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;

use crate::error::{Direction, DriverError};

/// Outcome of a non-blocking driver operation (spec.md §4.1).
pub enum IoOutcome {
    Ok(usize),
    WouldBlock(Direction),
    Eof,
}

/// Transport abstraction over `{plain_tcp, openssl}`. GnuTLS and mbedTLS are
/// recognized `DriverKind` config values (spec.md §6) but this core only
/// implements the plain and OpenSSL backends; see DESIGN.md for why the
/// other two are left as unimplemented config tags rather than stubbed-out
/// driver bodies.
///
/// Enum dispatch, not a trait object, per the redesign note on the hot
/// `read`/`write` path (spec.md §9).
pub enum Driver {
    Plain(PlainDriver),
    Ossl(Box<OsslDriver>),
}

impl Driver {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome, DriverError> {
        match self {
            Self::Plain(d) => d.read(buf),
            Self::Ossl(d) => d.read(buf),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<IoOutcome, DriverError> {
        match self {
            Self::Plain(d) => d.write(buf),
            Self::Ossl(d) => d.write(buf),
        }
    }

    /// Drives the TLS handshake (or is a no-op for plain TCP) until it
    /// completes, fails, or would block. Idempotent: safe to call again after
    /// `WouldBlock` once the poller reports readiness (spec.md §4.1).
    pub fn handshake(&mut self) -> Result<HandshakeProgress, DriverError> {
        match self {
            Self::Plain(_) => Ok(HandshakeProgress::Established),
            Self::Ossl(d) => d.handshake(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Ossl(_))
    }

    pub fn get_os_socket(&self) -> RawFd {
        match self {
            Self::Plain(d) => d.fd(),
            Self::Ossl(d) => d.fd(),
        }
    }

    pub fn get_remote_ip(&self) -> IpAddr {
        match self {
            Self::Plain(d) => d.peer_addr().ip(),
            Self::Ossl(d) => d.peer_addr().ip(),
        }
    }

    pub fn get_remote_port(&self) -> u16 {
        match self {
            Self::Plain(d) => d.peer_addr().port(),
            Self::Ossl(d) => d.peer_addr().port(),
        }
    }

    pub fn get_remote_addr(&self) -> SocketAddr {
        match self {
            Self::Plain(d) => d.peer_addr(),
            Self::Ossl(d) => d.peer_addr(),
        }
    }

    pub fn enable_keep_alive(&self, time_s: u32, intvl_s: u32, probes: u32) -> std::io::Result<()> {
        match self {
            Self::Plain(d) => d.enable_keep_alive(time_s, intvl_s, probes),
            Self::Ossl(d) => d.enable_keep_alive(time_s, intvl_s, probes),
        }
    }

    /// Force TCP RST by setting `SO_LINGER` to zero (spec.md §4.1).
    pub fn abort(&self) -> std::io::Result<()> {
        match self {
            Self::Plain(d) => d.abort(),
            Self::Ossl(d) => d.abort(),
        }
    }

    /// Non-destructive liveness probe. Used only diagnostically by the plain
    /// TCP backend; TLS sessions always report alive since a dead peer
    /// surfaces as a read error instead (spec.md §4.1).
    pub fn check_connection(&self) -> bool {
        match self {
            Self::Plain(d) => d.check_connection(),
            Self::Ossl(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    Established,
    Pending(Direction),
}
