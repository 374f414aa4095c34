//! Contract for the downstream collaborator that consumes framed records
//! (spec.md §3, §1 — the message object, template rendering, and output
//! pipeline are explicitly out of scope; only this submission contract is).

/// Outcome of handing a record to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Ok,
    QueueFull,
    Fatal,
}

/// A single decoded syslog record plus the context the sink needs to tag it.
pub struct Record<'a> {
    pub listener_tag: &'a str,
    pub peer_ip: std::net::IpAddr,
    pub peer_fqdn: Option<&'a str>,
    pub default_tz: &'a str,
    pub bytes: &'a [u8],
}

/// Anything that can receive framed records. The core never interprets the
/// bytes beyond framing; rendering and routing live entirely on the other
/// side of this trait.
pub trait MessageSink: Send + Sync {
    fn submit(&self, record: Record<'_>) -> SubmitOutcome;
}

/// A sink used in tests and examples: collects every accepted record in
/// memory under a mutex.
#[derive(Default)]
pub struct CollectingSink {
    records: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Vec<u8>> {
        self.records.lock().unwrap().clone()
    }
}

impl MessageSink for CollectingSink {
    fn submit(&self, record: Record<'_>) -> SubmitOutcome {
        self.records.lock().unwrap().push(record.bytes.to_vec());
        SubmitOutcome::Ok
    }
}
