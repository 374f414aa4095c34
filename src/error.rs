use std::io;

use thiserror::Error;

/// Errors surfaced at the driver boundary. `WouldBlock` is the common, expected
/// case during non-blocking I/O and handshake retry; callers rearm and wait
/// rather than treating it as failure.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("would block on {0:?}")]
    WouldBlock(Direction),
    #[error("connection closed by peer")]
    Eof,
    #[error("tls error: {0}")]
    Tls(#[from] openssl::ssl::Error),
    #[error("tls error stack: {0}")]
    TlsStack(#[from] openssl::error::ErrorStack),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Direction the caller must wait on before retrying a non-blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Debug, Error)]
pub enum FramerError {
    #[error("invalid octet count digit in frame header")]
    InvalidLengthDigit,
    #[error("frame exceeds max_frame_size ({size} > {max})")]
    Oversized { size: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate expired and permit_expired=deny")]
    ExpiredDenied,
    #[error("peer name does not match any permitted peer")]
    NameMismatch,
    #[error("peer fingerprint does not match any permitted peer")]
    FingerprintMismatch,
    #[error("certificate revoked per OCSP")]
    Revoked,
    #[error("certificate carries a CRL distribution point but no OCSP responder; CRL checking is not implemented")]
    CrlOnlyUnsupported,
    #[error("OCSP responder request failed: {0}")]
    OcspRequest(String),
    #[error("openssl error: {0}")]
    Ssl(#[from] openssl::ssl::Error),
    #[error("openssl error stack: {0}")]
    SslStack(#[from] openssl::error::ErrorStack),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum AclError {
    #[error("hostname resolution required but disabled")]
    NeedDns,
}
