//! End-to-end scenarios driving a real `Server` over loopback TCP/TLS.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::{X509Builder, X509Name, X509};

use syslog_ingest_core::{
    Acl, AclRule, CertStatus, CollectingSink, DriverKind, FramingConfig, FramingKindConfig, KeepAliveConfig,
    ListenerConfig, ListenerSpec, OcspCache, PermitExpired, RateLimitConfig, Server, ServerConfig,
};

fn base_config(port: u16) -> ListenerConfig {
    ListenerConfig {
        bind_addr: "127.0.0.1".into(),
        port,
        input_name: "imtcp".into(),
        driver: DriverKind::Ptcp,
        tls_mode: false,
        auth_mode: syslog_ingest_core::AuthMode::Anon,
        permit_expired: PermitExpired::Deny,
        permitted_peers: Vec::new(),
        ca_file: None,
        crl_file: None,
        cert_file: None,
        key_file: None,
        extra_ca_files: Vec::new(),
        priority_string: None,
        verify_depth: 2,
        prioritize_san: false,
        check_extended_key_usage: false,
        revocation_check: false,
        keepalive: KeepAliveConfig::default(),
        max_sessions: 200,
        max_lstn: 20,
        max_frame_size: 1024,
        framing_kind: FramingKindConfig::LfDelimited,
        framing: FramingConfig::default(),
        preserve_case: true,
        default_tz: String::new(),
        ratelimit: RateLimitConfig::default(),
        emit_msg_on_close: false,
    }
}

fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}

/// S1 — plain TCP, LF-delimited framing, two records in one write.
#[test]
fn s1_plain_tcp_lf_framing() {
    let sink = Arc::new(CollectingSink::new());
    let config = ServerConfig {
        listeners: vec![ListenerSpec { config: Arc::new(base_config(0)), acl: Acl::new(Vec::new(), false) }],
        worker_threads: 2,
        poll_timeout_ms: 50,
        ocsp_cache_cap: 16,
    };
    let mut server = Server::start(config, sink.clone()).unwrap();
    let addr = server.listener_addr(0).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"first\nsecond\n").unwrap();

    assert!(wait_for(|| sink.records().len() >= 2, Duration::from_secs(2)));
    assert_eq!(sink.records(), vec![b"first".to_vec(), b"second".to_vec()]);

    server.stop_flag().store(true, Ordering::SeqCst);
    server.run();
    server.shutdown();
}

/// S2 — octet-counted (RFC 6587) framing, two records in one write.
#[test]
fn s2_octet_counted_normal() {
    let sink = Arc::new(CollectingSink::new());
    let mut cfg = base_config(0);
    cfg.framing_kind = FramingKindConfig::OctetCounted;
    let config = ServerConfig {
        listeners: vec![ListenerSpec { config: Arc::new(cfg), acl: Acl::new(Vec::new(), false) }],
        worker_threads: 2,
        poll_timeout_ms: 50,
        ocsp_cache_cap: 16,
    };
    let mut server = Server::start(config, sink.clone()).unwrap();
    let addr = server.listener_addr(0).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"5 hello11 world test").unwrap();

    assert!(wait_for(|| sink.records().len() >= 2, Duration::from_secs(2)));
    assert_eq!(sink.records(), vec![b"hello".to_vec(), b"world test".to_vec()]);

    server.stop_flag().store(true, Ordering::SeqCst);
    server.run();
    server.shutdown();
}

/// S3 — an octet-counted frame exceeding `max_frame_size` is truncated and
/// forwarded (rather than dropped) when `discard_truncated_msg` is false.
#[test]
fn s3_octet_counted_oversize_truncated() {
    let sink = Arc::new(CollectingSink::new());
    let mut cfg = base_config(0);
    cfg.framing_kind = FramingKindConfig::OctetCounted;
    cfg.max_frame_size = 8;
    cfg.framing.discard_truncated_msg = false;
    let config = ServerConfig {
        listeners: vec![ListenerSpec { config: Arc::new(cfg), acl: Acl::new(Vec::new(), false) }],
        worker_threads: 1,
        poll_timeout_ms: 50,
        ocsp_cache_cap: 16,
    };
    let mut server = Server::start(config, sink.clone()).unwrap();
    let addr = server.listener_addr(0).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client.write_all(b"16 0123456789ABCDEF").unwrap();

    assert!(wait_for(|| !sink.records().is_empty(), Duration::from_secs(2)));
    assert_eq!(sink.records(), vec![b"01234567".to_vec()]);

    server.stop_flag().store(true, Ordering::SeqCst);
    server.run();
    server.shutdown();
}

fn generate_ca() -> (PKey<Private>, X509) {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();
    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "test-ca").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_serial_number(&BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(365).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (key, builder.build())
}

fn generate_leaf(ca_key: &PKey<Private>, ca_cert: &X509, cn: &str) -> (PKey<Private>, X509) {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();
    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_serial_number(&BigNum::from_u32(2).unwrap().to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(ca_cert.subject_name()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(365).unwrap()).unwrap();
    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    (key, builder.build())
}

fn write_pem(dir: &tempfile::TempDir, name: &str, pem: &[u8]) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, pem).unwrap();
    path.to_str().unwrap().to_string()
}

/// S4 — mutual TLS with `x509/name` peer authentication: a client cert whose
/// CN matches the configured wildcard is admitted and its records delivered.
#[test]
fn s4_tls_with_name_auth() {
    let dir = tempfile::tempdir().unwrap();
    let (ca_key, ca_cert) = generate_ca();
    let (client_key, client_cert) = generate_leaf(&ca_key, &ca_cert, "allowed.example.com");

    let ca_pem = write_pem(&dir, "ca.pem", &ca_cert.to_pem().unwrap());
    let ca_key_pem = write_pem(&dir, "ca.key.pem", &ca_key.private_key_to_pem_pkcs8().unwrap());

    let sink = Arc::new(CollectingSink::new());
    let mut cfg = base_config(0);
    cfg.driver = DriverKind::Ossl;
    cfg.tls_mode = true;
    cfg.auth_mode = syslog_ingest_core::AuthMode::X509Name;
    cfg.permitted_peers = vec!["*.example.com".to_string()];
    // the CA's own self-signed cert doubles as this listener's server identity.
    cfg.cert_file = Some(ca_pem.clone());
    cfg.key_file = Some(ca_key_pem);
    cfg.ca_file = Some(ca_pem);

    let config = ServerConfig {
        listeners: vec![ListenerSpec { config: Arc::new(cfg), acl: Acl::new(Vec::new(), false) }],
        worker_threads: 2,
        poll_timeout_ms: 50,
        ocsp_cache_cap: 16,
    };
    let mut server = Server::start(config, sink.clone()).unwrap();
    let addr = server.listener_addr(0).unwrap();

    let mut connector_builder = SslConnector::builder(SslMethod::tls()).unwrap();
    connector_builder.set_verify(SslVerifyMode::NONE);
    connector_builder.set_certificate(&client_cert).unwrap();
    connector_builder.set_private_key(&client_key).unwrap();
    let connector = connector_builder.build();

    let tcp = TcpStream::connect(addr).unwrap();
    let mut tls_stream = connector.connect("localhost", tcp).unwrap();
    tls_stream.write_all(b"authenticated hello\n").unwrap();

    assert!(wait_for(|| !sink.records().is_empty(), Duration::from_secs(5)));
    assert_eq!(sink.records(), vec![b"authenticated hello".to_vec()]);

    server.stop_flag().store(true, Ordering::SeqCst);
    server.run();
    server.shutdown();
}

/// S5 — two sequential OCSP lookups for the same cert within the cache TTL:
/// the first misses and stores, the second hits without another lookup.
#[test]
fn s5_ocsp_cache_hit_on_second_handshake() {
    let (ca_key, ca_cert) = generate_ca();
    let (_leaf_key, leaf_cert) = generate_leaf(&ca_key, &ca_cert, "peer.example.com");

    let cache = OcspCache::new(16);
    let key = OcspCache::make_key(&leaf_cert, &ca_cert).unwrap();

    assert_eq!(cache.lookup(&key), None);
    cache.store(key.clone(), CertStatus::Good, Duration::from_secs(60));

    // second handshake of the same cert derives the identical key and hits.
    let key_again = OcspCache::make_key(&leaf_cert, &ca_cert).unwrap();
    assert_eq!(key_again, key);
    assert_eq!(cache.lookup(&key_again), Some(CertStatus::Good));
}

/// S6 — a peer outside every configured ACL network is rejected at accept
/// time: no session is ever registered and no record reaches the sink.
#[test]
fn s6_acl_rejected_peer_yields_no_session() {
    let sink = Arc::new(CollectingSink::new());
    let cfg = base_config(0);
    // only a disjoint network is permitted, so the loopback client never matches.
    let acl = Acl::new(vec![AclRule::network("10.0.0.0".parse().unwrap(), 8)], false);
    let config = ServerConfig {
        listeners: vec![ListenerSpec { config: Arc::new(cfg), acl }],
        worker_threads: 2,
        poll_timeout_ms: 50,
        ocsp_cache_cap: 16,
    };
    let mut server = Server::start(config, sink.clone()).unwrap();
    let addr = server.listener_addr(0).unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    let _ = client.write_all(b"should never arrive\n");

    // give the poller a few iterations to act; absence can't be waited on, so
    // sleep past several poll_timeout_ms intervals instead.
    std::thread::sleep(Duration::from_millis(300));

    assert!(sink.records().is_empty());
    assert_eq!(server.session_count(), 0);

    server.stop_flag().store(true, Ordering::SeqCst);
    server.run();
    server.shutdown();
}
