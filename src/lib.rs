//! TCP/TLS syslog ingestion core: session state machine, dual framing
//! disciplines, pluggable network drivers, an epoll-based poller, ACL
//! admission control, and a fixed worker-thread pool.
//!
//! Message/template rendering, the output/action pipeline, configuration
//! parsing, CLI, signal handling, and daemonization are all out of scope —
//! this crate is the ingestion engine an embedder wires a `MessageSink`
//! into.

mod acl;
mod config;
mod driver;
mod error;
mod framer;
mod listener;
mod ocsp;
mod peer;
mod poller;
mod ratelimit;
mod server;
mod session;
mod sink;
mod telemetry;
mod tls_context;
mod worker;

pub use acl::{Acl, AclRule, Verdict};
pub use config::{
    AuthMode, DriverKind, FramingConfig, FramingKindConfig, KeepAliveConfig, ListenerConfig, PermitExpired,
    RateLimitConfig,
};
pub use error::{AclError, DriverError, FramerError, TlsError};
pub use framer::FramingKind;
pub use ocsp::{CertStatus, OcspCache};
pub use peer::PeerIdentity;
pub use server::{ListenerSpec, Server, ServerConfig};
pub use sink::{CollectingSink, MessageSink, Record, SubmitOutcome};
pub use telemetry::{TelemetryConfig, TelemetryOutput};
pub use tls_context::TlsContext;
