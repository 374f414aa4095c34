//! OCSP revocation checking and the process-wide response cache.
//!
//! Grounded on `examples/original_source/runtime/net_ossl.c`'s
//! `ocsp_cache_head` / `ocsp_make_cache_key` / `ocsp_cache_lookup` /
//! `ocsp_cache_store`: a single mutex-protected bounded map, default cap 100,
//! default TTL 3600s, eviction prefers an already-expired entry, otherwise
//! FIFO from the tail of insertion order (spec.md §3).

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use openssl::hash::{hash, MessageDigest};
use openssl::ocsp::{OcspCertId, OcspFlag, OcspRequest, OcspResponse, OcspResponseStatus};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509;

use crate::error::TlsError;

pub const OCSP_TIMEOUT: Duration = Duration::from_secs(5);
pub const OCSP_CACHE_MAX_ENTRIES: usize = 100;
pub const OCSP_CACHE_DEFAULT_TTL: Duration = Duration::from_secs(3600);
const OCSP_RESPONSE_SIZE_CAP: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Good,
    Revoked,
    Unknown,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    key: String,
    status: CertStatus,
    expires_at: Instant,
}

/// Global OCSP response cache, shared by every `TlsContext` (spec.md §3, §4.7, §9).
pub struct OcspCache {
    inner: Mutex<VecDeque<CacheEntry>>,
    cap: usize,
}

impl Default for OcspCache {
    fn default() -> Self {
        Self::new(OCSP_CACHE_MAX_ENTRIES)
    }
}

impl OcspCache {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
        }
    }

    pub fn make_key(cert: &X509, issuer: &X509) -> Result<String, TlsError> {
        let serial = cert.serial_number().to_bn()?.to_hex_str()?.to_string();
        let issuer_name_der = issuer.subject_name().to_der()?;
        let issuer_pubkey_der = issuer.public_key()?.public_key_to_der()?;
        let name_hash = hash(MessageDigest::sha256(), &issuer_name_der)?;
        let pubkey_hash = hash(MessageDigest::sha256(), &issuer_pubkey_der)?;
        Ok(format!(
            "{}:{}:{}",
            serial.to_lowercase(),
            hex_encode(&name_hash),
            hex_encode(&pubkey_hash)
        ))
    }

    /// Returns `Some(status)` on a non-expired cache hit, evicting the entry
    /// first if it has in fact expired (spec.md §4.7, §8 invariant 5).
    pub fn lookup(&self, key: &str) -> Option<CertStatus> {
        let mut guard = self.inner.lock().unwrap();
        let now = Instant::now();
        guard.retain(|e| e.key != key || e.expires_at > now);
        guard.iter().find(|e| e.key == key).map(|e| e.status)
    }

    pub fn store(&self, key: String, status: CertStatus, ttl: Duration) {
        let mut guard = self.inner.lock().unwrap();
        let expires_at = Instant::now() + ttl;
        if let Some(existing) = guard.iter_mut().find(|e| e.key == key) {
            existing.status = status;
            existing.expires_at = expires_at;
            return;
        }
        if guard.len() >= self.cap {
            let now = Instant::now();
            if let Some(pos) = guard.iter().position(|e| e.expires_at <= now) {
                guard.remove(pos);
            } else {
                guard.pop_back();
            }
        }
        guard.push_front(CacheEntry { key, status, expires_at });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Extracts OCSP responder URLs from the certificate's Authority Information
/// Access extension, skipping any non-`http://` responder (HTTPS responders
/// are explicitly not contacted, per spec.md §4.7; `net_ossl.c` does the same
/// AIA walk before falling back to CRL-distribution-point detection).
pub fn responders_from_cert(cert: &X509) -> Vec<String> {
    let mut urls = Vec::new();
    if let Some(ad) = cert.ocsp_responders().ok().flatten() {
        for entry in ad {
            if entry.starts_with("http://") {
                urls.push(entry);
            }
        }
    }
    urls
}

/// Performs the request/response exchange against one responder over a plain
/// TCP socket with a `OCSP_TIMEOUT` send/recv timeout, per spec.md §6.
pub fn check_one_responder(
    responder_url: &str,
    cert: &X509,
    issuer: &X509,
    cert_id: &OcspCertId,
) -> Result<(CertStatus, Duration), TlsError> {
    let mut req = OcspRequest::new()?;
    req.add_id(cert_id.to_owned()?)?;
    req.add_nonce(&[])?;
    let der = req.to_der()?;

    let (host, path) = split_responder_url(responder_url)?;
    let mut stream =
        TcpStream::connect(&host).map_err(|e| TlsError::OcspRequest(format!("connect {host}: {e}")))?;
    stream.set_read_timeout(Some(OCSP_TIMEOUT)).ok();
    stream.set_write_timeout(Some(OCSP_TIMEOUT)).ok();

    let request = format!(
        "POST {path} HTTP/1.0\r\nHost: {host}\r\nContent-Type: application/ocsp-request\r\nContent-Length: {}\r\n\r\n",
        der.len()
    );
    stream
        .write_all(request.as_bytes())
        .and_then(|_| stream.write_all(&der))
        .map_err(|e| TlsError::OcspRequest(format!("write: {e}")))?;

    let mut response_bytes = Vec::new();
    stream
        .take(OCSP_RESPONSE_SIZE_CAP as u64 + 1)
        .read_to_end(&mut response_bytes)
        .map_err(|e| TlsError::OcspRequest(format!("read: {e}")))?;
    if response_bytes.len() > OCSP_RESPONSE_SIZE_CAP {
        return Err(TlsError::OcspRequest("response exceeded 1 MiB cap".into()));
    }

    let body = split_http_body(&response_bytes)
        .ok_or_else(|| TlsError::OcspRequest("malformed HTTP response".into()))?;
    let resp = OcspResponse::from_der(body)?;
    if resp.status() != OcspResponseStatus::SUCCESSFUL {
        return Err(TlsError::OcspRequest(format!("responder status {:?}", resp.status())));
    }

    let basic = resp.basic()?;
    let (status, ttl) = evaluate_basic_response(&basic, cert, issuer, cert_id)?;
    Ok((status, ttl))
}

fn evaluate_basic_response(
    basic: &openssl::ocsp::OcspBasicResponse,
    _cert: &X509,
    issuer: &X509,
    cert_id: &OcspCertId,
) -> Result<(CertStatus, Duration), TlsError> {
    // the responder's signature must chain to the cert's own issuer: without
    // this, a MITM on the plaintext OCSP connection could forge a `Good`
    // response for a revoked cert (spec.md §4.7).
    let mut store_builder = X509StoreBuilder::new()?;
    store_builder.add_cert(issuer.to_owned())?;
    let store = store_builder.build();
    let untrusted = Stack::<X509>::new()?;
    basic.verify(&untrusted, &store, OcspFlag::empty())?;

    let leeway = 300; // +/- 5 minutes, per spec.md §4.7
    let status = basic
        .find_status(cert_id)
        .ok_or_else(|| TlsError::OcspRequest("cert id not present in response".into()))?;
    status.check_validity(leeway, None)?;
    let cert_status = match OcspCertStatusShim::from(status.status) {
        OcspCertStatusShim::Good => CertStatus::Good,
        OcspCertStatusShim::Revoked => CertStatus::Revoked,
        OcspCertStatusShim::Unknown => CertStatus::Unknown,
    };
    Ok((cert_status, OCSP_CACHE_DEFAULT_TTL))
}

/// Thin shim over `openssl::ocsp::OcspCertStatus` so this module's match
/// arms stay readable; the openssl crate's enum is non-exhaustive.
enum OcspCertStatusShim {
    Good,
    Revoked,
    Unknown,
}

impl From<openssl::ocsp::OcspCertStatus> for OcspCertStatusShim {
    fn from(s: openssl::ocsp::OcspCertStatus) -> Self {
        match s {
            openssl::ocsp::OcspCertStatus::GOOD => Self::Good,
            openssl::ocsp::OcspCertStatus::REVOKED => Self::Revoked,
            _ => Self::Unknown,
        }
    }
}

fn split_responder_url(url: &str) -> Result<(String, String), TlsError> {
    let rest = url
        .strip_prefix("http://")
        .ok_or_else(|| TlsError::OcspRequest("only http:// responders are supported".into()))?;
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{authority}:80")
    };
    Ok((host, format!("/{path}")))
}

fn split_http_body(raw: &[u8]) -> Option<&[u8]> {
    let marker = b"\r\n\r\n";
    raw.windows(marker.len())
        .position(|w| w == marker)
        .map(|pos| &raw[pos + marker.len()..])
}
