use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use openssl::ssl::{ErrorCode, MidHandshakeSslStream, Ssl, SslStream};

use crate::error::{Direction, DriverError};

use super::{HandshakeProgress, IoOutcome};

enum State {
    Handshaking(MidHandshakeSslStream<TcpStream>),
    Established(SslStream<TcpStream>),
    /// transient slot used only while moving between the two states above
    Taken,
}

/// OpenSSL-backed TLS transport. Corresponds to `driver: "ossl"` (spec.md §6).
///
/// Mirrors the `WANT_READ`/`WANT_WRITE` retry contract used by
/// `openssl::ssl::SslStream` directly: the session loop calls `handshake()`
/// again whenever the poller reports the previously-requested direction
/// ready, rather than blocking inside this driver.
pub struct OsslDriver {
    state: State,
    peer_addr: SocketAddr,
    fd: RawFd,
}

impl OsslDriver {
    pub fn accept(ssl: Ssl, stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer_addr = stream.peer_addr()?;
        let fd = stream.as_raw_fd();
        let state = match ssl.accept(stream) {
            Ok(established) => State::Established(established),
            Err(openssl::ssl::HandshakeError::WouldBlock(mid)) => State::Handshaking(mid),
            Err(openssl::ssl::HandshakeError::SetupFailure(e)) => return Err(io::Error::other(e)),
            Err(openssl::ssl::HandshakeError::Failure(mid)) => {
                return Err(io::Error::other(mid.into_error()));
            }
        };
        Ok(Self { state, peer_addr, fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Resumes a pending handshake. Returns `Established` once complete;
    /// otherwise reports which direction the caller must wait on before
    /// calling again (spec.md §4.1).
    pub fn handshake(&mut self) -> Result<HandshakeProgress, DriverError> {
        if matches!(self.state, State::Established(_)) {
            return Ok(HandshakeProgress::Established);
        }
        let mid = match std::mem::replace(&mut self.state, State::Taken) {
            State::Handshaking(mid) => mid,
            State::Established(s) => {
                self.state = State::Established(s);
                return Ok(HandshakeProgress::Established);
            }
            State::Taken => unreachable!("handshake() re-entered while a transition is in progress"),
        };
        match mid.handshake() {
            Ok(established) => {
                self.state = State::Established(established);
                Ok(HandshakeProgress::Established)
            }
            Err(openssl::ssl::HandshakeError::WouldBlock(mid)) => {
                let dir = match mid.error().code() {
                    ErrorCode::WANT_WRITE => Direction::Write,
                    _ => Direction::Read,
                };
                self.state = State::Handshaking(mid);
                Ok(HandshakeProgress::Pending(dir))
            }
            Err(openssl::ssl::HandshakeError::SetupFailure(e)) => Err(DriverError::TlsStack(e)),
            Err(openssl::ssl::HandshakeError::Failure(mid)) => Err(DriverError::Tls(mid.into_error())),
        }
    }

    pub fn established(&self) -> Option<&SslStream<TcpStream>> {
        match &self.state {
            State::Established(s) => Some(s),
            _ => None,
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome, DriverError> {
        let stream = match &mut self.state {
            State::Established(s) => s,
            _ => return Ok(IoOutcome::WouldBlock(Direction::Read)),
        };
        match stream.read(buf) {
            Ok(0) => Ok(IoOutcome::Eof),
            Ok(n) => Ok(IoOutcome::Ok(n)),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => Ok(IoOutcome::WouldBlock(Direction::Read)),
                ErrorCode::WANT_WRITE => Ok(IoOutcome::WouldBlock(Direction::Write)),
                ErrorCode::ZERO_RETURN => Ok(IoOutcome::Eof),
                _ => Err(DriverError::Tls(e)),
            },
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<IoOutcome, DriverError> {
        let stream = match &mut self.state {
            State::Established(s) => s,
            _ => return Ok(IoOutcome::WouldBlock(Direction::Write)),
        };
        match stream.write(buf) {
            Ok(n) => Ok(IoOutcome::Ok(n)),
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => Ok(IoOutcome::WouldBlock(Direction::Read)),
                ErrorCode::WANT_WRITE => Ok(IoOutcome::WouldBlock(Direction::Write)),
                _ => Err(DriverError::Tls(e)),
            },
        }
    }

    fn tcp(&self) -> &TcpStream {
        match &self.state {
            State::Established(s) => s.get_ref(),
            State::Handshaking(mid) => mid.get_ref(),
            State::Taken => unreachable!(),
        }
    }

    pub fn enable_keep_alive(&self, time_s: u32, intvl_s: u32, probes: u32) -> io::Result<()> {
        let sock = socket2::SockRef::from(self.tcp());
        sock.set_keepalive(true)?;
        sock.set_tcp_keepalive(
            &socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(time_s as u64))
                .with_interval(Duration::from_secs(intvl_s as u64))
                .with_retries(probes),
        )
    }

    pub fn abort(&self) -> io::Result<()> {
        let sock = socket2::SockRef::from(self.tcp());
        sock.set_linger(Some(Duration::from_secs(0)))
    }
}
