use std::fmt;
use std::net::IpAddr;

/// Identity of the remote end of a session. Owned by `Session`; borrowed by
/// `Acl` and logging call sites.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    pub fqdn: Option<String>,
    pub ip: IpAddr,
    pub port: u16,
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fqdn {
            Some(fqdn) => write!(f, "{fqdn} ({}:{})", self.ip, self.port),
            None => write!(f, "{}:{}", self.ip, self.port),
        }
    }
}

/// A compiled wildcard pattern for hostname matching: split on `.`, each
/// component is a literal, `*` (match-all component), a `*`-suffixed prefix
/// (`mail*`), a `*`-prefixed suffix (`*mail`), or empty (spec.md §3, §... —
/// `*` is permitted as a whole component, or at the start or end of one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardPattern {
    components: Vec<WildcardComponent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WildcardComponent {
    Literal(String),
    /// a bare `*` component, matches exactly one dot-separated component
    MatchAll,
    /// `prefix*`: matches any component starting with `prefix`
    StartsWith(String),
    /// `*suffix`: matches any component ending with `suffix`
    EndsWith(String),
}

impl WildcardPattern {
    pub fn compile(pattern: &str) -> Self {
        let components = pattern
            .split('.')
            .map(|c| {
                if c == "*" {
                    WildcardComponent::MatchAll
                } else if c.len() > 1 && c.starts_with('*') {
                    WildcardComponent::EndsWith(c[1..].to_ascii_lowercase())
                } else if c.len() > 1 && c.ends_with('*') {
                    WildcardComponent::StartsWith(c[..c.len() - 1].to_ascii_lowercase())
                } else {
                    WildcardComponent::Literal(c.to_ascii_lowercase())
                }
            })
            .collect();
        Self { components }
    }

    /// Compiling an already-compiled pattern is a no-op; re-deriving from its
    /// own rendered form must yield an identical matcher (spec.md §8).
    pub fn recompile(&self) -> Self {
        Self {
            components: self.components.clone(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let name_components: Vec<&str> = name.split('.').collect();
        if name_components.len() != self.components.len() {
            return false;
        }
        self.components
            .iter()
            .zip(name_components.iter())
            .all(|(pat, actual)| match pat {
                WildcardComponent::MatchAll => true,
                WildcardComponent::Literal(lit) => lit.eq_ignore_ascii_case(actual),
                WildcardComponent::StartsWith(prefix) => {
                    actual.len() >= prefix.len() && actual[..prefix.len()].eq_ignore_ascii_case(prefix)
                }
                WildcardComponent::EndsWith(suffix) => {
                    actual.len() >= suffix.len()
                        && actual[actual.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
                }
            })
    }
}

/// A compiled fingerprint entry, e.g. `SHA256:AA:BB:...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintPattern {
    pub algo: FingerprintAlgo,
    /// normalized uppercase hex bytes, colon-joined
    pub hex: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintAlgo {
    Sha1,
    Sha256,
}

/// An allow-list entry for TLS peer authentication: a fingerprint, a plain
/// name, or a wildcard. Compiled lazily on first match (spec.md §3).
#[derive(Debug, Clone)]
pub enum PermittedPeer {
    Plain(String),
    Wildcard(WildcardPattern),
    Fingerprint(FingerprintPattern),
}

impl PermittedPeer {
    pub fn compile(raw: &str) -> Self {
        if let Some(rest) = raw.strip_prefix("SHA256:") {
            return Self::Fingerprint(FingerprintPattern {
                algo: FingerprintAlgo::Sha256,
                hex: normalize_hex(rest),
            });
        }
        if let Some(rest) = raw.strip_prefix("SHA1:") {
            return Self::Fingerprint(FingerprintPattern {
                algo: FingerprintAlgo::Sha1,
                hex: normalize_hex(rest),
            });
        }
        if raw.contains('*') {
            return Self::Wildcard(WildcardPattern::compile(raw));
        }
        Self::Plain(raw.to_ascii_lowercase())
    }

    pub fn matches_name(&self, name: &str) -> bool {
        match self {
            Self::Plain(p) => p.eq_ignore_ascii_case(name),
            Self::Wildcard(w) => w.matches(name),
            Self::Fingerprint(_) => false,
        }
    }

    pub fn matches_fingerprint(&self, algo: FingerprintAlgo, hex: &str) -> bool {
        match self {
            Self::Fingerprint(fp) => fp.algo == algo && fp.hex.eq_ignore_ascii_case(&normalize_hex(hex)),
            _ => false,
        }
    }
}

fn normalize_hex(s: &str) -> String {
    s.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_head() {
        let w = WildcardPattern::compile("*.example.com");
        assert!(w.matches("foo.example.com"));
        assert!(!w.matches("foo.bar.example.com"));
    }

    #[test]
    fn wildcard_tail() {
        let w = WildcardPattern::compile("example.*");
        assert!(w.matches("example.com"));
        assert!(!w.matches("example"));
    }

    #[test]
    fn wildcard_partial_suffix_within_component() {
        let w = WildcardPattern::compile("mail*.example.com");
        assert!(w.matches("mailgw.example.com"));
        assert!(w.matches("mail.example.com"));
        assert!(!w.matches("smtp.example.com"));
    }

    #[test]
    fn wildcard_partial_prefix_within_component() {
        let w = WildcardPattern::compile("*gw.example.com");
        assert!(w.matches("mailgw.example.com"));
        assert!(w.matches("gw.example.com"));
        assert!(!w.matches("gwnorth.example.com"));
    }

    #[test]
    fn wildcard_match_all_component_only() {
        let w = WildcardPattern::compile("*");
        assert!(w.matches("localhost"));
        assert!(!w.matches("a.b"));
    }

    #[test]
    fn wildcard_empty_component() {
        let w = WildcardPattern::compile("foo..com");
        assert!(w.matches("foo..com"));
        assert!(!w.matches("foo.bar.com"));
    }

    #[test]
    fn compile_is_idempotent() {
        let w = WildcardPattern::compile("*.example.com");
        let w2 = w.recompile();
        assert_eq!(w, w2);
    }

    #[test]
    fn fingerprint_matches_case_insensitively() {
        let p = PermittedPeer::compile("SHA256:AA:BB:CC");
        assert!(p.matches_fingerprint(FingerprintAlgo::Sha256, "aa:bb:cc"));
        assert!(!p.matches_fingerprint(FingerprintAlgo::Sha1, "aa:bb:cc"));
    }
}
