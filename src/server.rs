//! Top-level composition: owns listeners, poller, worker pool, lifecycle
//! (spec.md §4.8). Grounded on the teacher's `server/src/server/mod.rs`
//! (`Server::new` spawning a dedicated accept thread plus a pool of worker
//! threads, joined on shutdown), adapted from the tokio/`xitca_io::Listener`
//! model to the raw-thread/epoll one this core requires.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::acl::Acl;
use crate::config::ListenerConfig;
use crate::listener::Listener;
use crate::ocsp::OcspCache;
use crate::poller::{Interest, Poller, RegistrationKind};
use crate::session::Session;
use crate::sink::MessageSink;
use crate::worker::WorkerPool;

/// One configured ingestion point plus the ACL that gates it.
pub struct ListenerSpec {
    pub config: Arc<ListenerConfig>,
    pub acl: Acl,
}

/// Top-level server configuration (spec.md §4.8).
pub struct ServerConfig {
    pub listeners: Vec<ListenerSpec>,
    /// Number of worker threads; spec.md §5 default is `max(1, cores)`.
    pub worker_threads: usize,
    /// `epoll_wait`/`poll` timeout per iteration of the poller thread, so it
    /// can periodically observe the stop flag even with no I/O activity.
    pub poll_timeout_ms: i32,
    pub ocsp_cache_cap: usize,
}

/// Listener tokens occupy `0..listeners.len()`; session tokens are offset
/// into a disjoint range per listener so the poller thread can tell which
/// registry to look a ready token up in without an extra indirection table.
const SESSION_TOKEN_BASE: u64 = 1 << 32;
const SESSION_TOKEN_STRIDE: u64 = 1 << 24;

/// Which listener's token range a session id falls in, so `max_sessions` can
/// be enforced per listener (spec.md §4.3) rather than against the whole
/// server's session map.
fn listener_idx_for_session(id: u64) -> usize {
    ((id - SESSION_TOKEN_BASE) / SESSION_TOKEN_STRIDE) as usize
}

struct ListenerEntry {
    listener: Arc<Listener>,
}

/// Owns every resource a running server holds: listeners, the poller, the
/// worker pool, and the session registry. Dropping or calling `shutdown`
/// tears all of it down per spec.md §4.8's exit sequence.
pub struct Server {
    poller: Arc<Poller>,
    listeners: Vec<ListenerEntry>,
    sessions: Arc<Mutex<HashMap<u64, Arc<Session>>>>,
    session_counts: Arc<Vec<AtomicUsize>>,
    pool: Arc<WorkerPool>,
    stop: Arc<AtomicBool>,
    poll_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// `Server::start(config)`: constructs `TlsContext`s (inside
    /// `Listener::bind`), listeners, the `Poller`, and the `WorkerPool`, then
    /// spawns the dedicated poller/accept thread.
    pub fn start(config: ServerConfig, sink: Arc<dyn MessageSink>) -> io::Result<Self> {
        let poller = Arc::new(Poller::new()?);
        let ocsp_cache = Arc::new(OcspCache::new(config.ocsp_cache_cap));

        let mut listeners = Vec::with_capacity(config.listeners.len());
        for (idx, spec) in config.listeners.into_iter().enumerate() {
            let session_id_base = SESSION_TOKEN_BASE + (idx as u64) * (1 << 24);
            let listener = Listener::bind(spec.config, spec.acl, sink.clone(), ocsp_cache.clone(), session_id_base)?;
            poller.add(listener.fd(), idx as u64, Interest::READ, RegistrationKind::Listener)?;
            listeners.push(ListenerEntry { listener: Arc::new(listener) });
        }

        let sessions: Arc<Mutex<HashMap<u64, Arc<Session>>>> = Arc::new(Mutex::new(HashMap::new()));
        let session_counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..listeners.len()).map(|_| AtomicUsize::new(0)).collect());
        let stop = Arc::new(AtomicBool::new(false));

        let on_closed = {
            let sessions = sessions.clone();
            let session_counts = session_counts.clone();
            let poller = poller.clone();
            Arc::new(move |session: &Arc<Session>| {
                let _ = poller.del(session.fd());
                if sessions.lock().unwrap().remove(&session.id).is_some() {
                    let idx = listener_idx_for_session(session.id);
                    if let Some(count) = session_counts.get(idx) {
                        count.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            })
        };

        let worker_threads = config.worker_threads.max(1);
        let pool = Arc::new(WorkerPool::start(worker_threads, poller.clone(), on_closed));

        let poll_handle = {
            let poller = poller.clone();
            let sessions = sessions.clone();
            let session_counts = session_counts.clone();
            let pool = pool.clone();
            let stop = stop.clone();
            let listener_count = listeners.len();
            let listener_lookup: Vec<Arc<Listener>> = listeners.iter().map(|e| e.listener.clone()).collect();
            thread::Builder::new()
                .name("syslog-ingest-poller".into())
                .spawn(move || {
                    poll_loop(
                        &poller,
                        &sessions,
                        &session_counts,
                        &pool,
                        &listener_lookup,
                        listener_count,
                        config.poll_timeout_ms,
                        &stop,
                    )
                })
                .expect("failed to spawn poller thread")
        };

        info!(listeners = listeners.len(), workers = worker_threads, "server started");

        Ok(Self {
            poller,
            listeners,
            sessions,
            session_counts,
            pool,
            stop,
            poll_handle: Some(poll_handle),
        })
    }

    /// A clone of the process-wide stop flag (spec.md §5). An embedder wires
    /// this to its own signal handler or control channel — signal handling
    /// itself is out of this core's scope — then calls `run` to block until
    /// the poller thread observes it and `shutdown` to finish teardown.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Blocks until the stop flag is set and the poller thread has noticed
    /// (within one `poll_timeout_ms` interval) and exited.
    pub fn run(&mut self) {
        if let Some(handle) = self.poll_handle.take() {
            let _ = handle.join();
        }
    }

    /// Sets the stop flag, unregisters listeners, waits for the poller
    /// thread and workers, closes any still-open sessions (synthesizing a
    /// warning per session if `emit_msg_on_close`), and drops the poller
    /// (spec.md §4.8).
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);

        for entry in &self.listeners {
            let _ = self.poller.del(entry.listener.fd());
        }

        if let Some(handle) = self.poll_handle.take() {
            let _ = handle.join();
        }

        self.pool.stop_and_join();

        let remaining: Vec<Arc<Session>> = self.sessions.lock().unwrap().drain().map(|(_, s)| s).collect();
        for session in remaining {
            if session.emit_msg_on_close() {
                info!(peer = %session.peer(), "session closed on shutdown");
            }
            let _ = self.poller.del(session.fd());
        }

        info!("server stopped");
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// The actual bound address of listener `idx`, useful when the
    /// configured port was `0` (OS-assigned).
    pub fn listener_addr(&self, idx: usize) -> io::Result<std::net::SocketAddr> {
        self.listeners
            .get(idx)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such listener"))?
            .listener
            .local_addr()
    }
}

#[allow(clippy::too_many_arguments)]
fn poll_loop(
    poller: &Poller,
    sessions: &Arc<Mutex<HashMap<u64, Arc<Session>>>>,
    session_counts: &[AtomicUsize],
    pool: &WorkerPool,
    listeners: &[Arc<Listener>],
    listener_count: usize,
    timeout_ms: i32,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::SeqCst) {
        let events = match poller.wait(timeout_ms) {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "poller wait failed");
                continue;
            }
        };

        for event in events {
            if (event.token as usize) < listener_count {
                let idx = event.token as usize;
                let listener = &listeners[idx];
                let count = &session_counts[idx];
                for mut session in listener.accept_ready() {
                    if count.load(Ordering::Relaxed) >= listener.config().max_sessions {
                        warn!(listener = %listener.tag(), "max_sessions reached, dropping new connection");
                        continue;
                    }
                    if let Err(e) = poller.add(session.fd(), session.id, Interest::READ, RegistrationKind::Session) {
                        warn!(error = %e, "failed to register session with poller");
                        continue;
                    }
                    // resolving the peer FQDN is out of this core's scope;
                    // ACL already ran on the raw IP at accept time (spec.md
                    // §4.3).
                    session.set_peer_fqdn(None);
                    let session = Arc::new(session);
                    sessions.lock().unwrap().insert(session.id, session.clone());
                    count.fetch_add(1, Ordering::Relaxed);
                    // an edge-triggered, one-shot registration can miss data
                    // that arrived between accept and `poller.add`; give the
                    // session one immediate turn to avoid a stalled session.
                    pool.submit(session);
                }
            } else if let Some(session) = sessions.lock().unwrap().get(&event.token).cloned() {
                if event.error {
                    session.mark_in_error();
                }
                pool.submit(session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Acl;
    use crate::config::{AuthMode, DriverKind, FramingConfig, FramingKindConfig, KeepAliveConfig, PermitExpired, RateLimitConfig};
    use crate::sink::CollectingSink;
    use std::io::Write;
    use std::net::TcpStream;
    use std::time::Duration;

    fn listener_config(port: u16) -> Arc<ListenerConfig> {
        Arc::new(ListenerConfig {
            bind_addr: "127.0.0.1".into(),
            port,
            input_name: "imtcp".into(),
            driver: DriverKind::Ptcp,
            tls_mode: false,
            auth_mode: AuthMode::Anon,
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
        })
    }

    #[test]
    fn plain_tcp_server_delivers_records_end_to_end() {
        let sink = Arc::new(CollectingSink::new());
        let config = ServerConfig {
            listeners: vec![ListenerSpec {
                config: listener_config(0),
                acl: Acl::new(Vec::new(), false),
            }],
            worker_threads: 2,
            poll_timeout_ms: 50,
            ocsp_cache_cap: 16,
        };
        let mut server = Server::start(config, sink.clone()).unwrap();
        let addr = server.listeners[0].listener.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"hello\nworld\n").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while sink.records().len() < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(sink.records(), vec![b"hello".to_vec(), b"world".to_vec()]);

        let stop = server.stop_flag();
        stop.store(true, Ordering::SeqCst);
        server.run();
        server.shutdown();
    }
}
