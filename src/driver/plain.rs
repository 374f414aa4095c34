use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::{Direction, DriverError};

use super::IoOutcome;

/// Plain, unencrypted TCP transport. Corresponds to `driver: "ptcp"` (spec.md §6).
pub struct PlainDriver {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl PlainDriver {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer_addr = stream.peer_addr()?;
        Ok(Self { stream, peer_addr })
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome, DriverError> {
        match self.stream.read(buf) {
            Ok(0) => Ok(IoOutcome::Eof),
            Ok(n) => Ok(IoOutcome::Ok(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock(Direction::Read)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<IoOutcome, DriverError> {
        match self.stream.write(buf) {
            Ok(n) => Ok(IoOutcome::Ok(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock(Direction::Write)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn enable_keep_alive(&self, time_s: u32, intvl_s: u32, probes: u32) -> io::Result<()> {
        let sock = socket2::SockRef::from(&self.stream);
        sock.set_keepalive(true)?;
        sock.set_tcp_keepalive(
            &socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(time_s as u64))
                .with_interval(Duration::from_secs(intvl_s as u64))
                .with_retries(probes),
        )
    }

    pub fn abort(&self) -> io::Result<()> {
        let sock = socket2::SockRef::from(&self.stream);
        sock.set_linger(Some(Duration::from_secs(0)))
    }

    pub fn check_connection(&self) -> bool {
        let sock = socket2::SockRef::from(&self.stream);
        sock.take_error().ok().flatten().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut server_driver = PlainDriver::new(server).unwrap();
        let _client_driver = PlainDriver::new(client).unwrap();

        let mut buf = [0u8; 16];
        loop {
            match server_driver.read(&mut buf) {
                Ok(IoOutcome::WouldBlock(Direction::Read)) => break,
                other => panic!("unexpected: {:?}", other.is_ok()),
            }
        }
    }
}
