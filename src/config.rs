use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_max_sessions() -> usize {
    200
}

fn default_max_lstn() -> usize {
    20
}

fn default_max_frame_size() -> usize {
    200_000
}

fn default_verify_depth() -> u32 {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Ptcp,
    Ossl,
    Gtls,
    Mbedtls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Anon,
    #[serde(rename = "x509/name")]
    X509Name,
    #[serde(rename = "x509/fingerprint")]
    X509Fingerprint,
    #[serde(rename = "x509/certvalid")]
    X509CertValid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PermitExpired {
    #[default]
    Deny,
    Warn,
    Permit,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub time_s: u32,
    #[serde(default)]
    pub intvl_s: u32,
    #[serde(default)]
    pub probes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingKindConfig {
    OctetCounted,
    LfDelimited,
}

impl Default for FramingKindConfig {
    fn default() -> Self {
        Self::LfDelimited
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FramingConfig {
    #[serde(default)]
    pub addtl_frame_delim: Option<u8>,
    #[serde(default)]
    pub disable_lf_delim: bool,
    #[serde(default)]
    pub discard_truncated_msg: bool,
    #[serde(default)]
    pub sp_framing_fix: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub interval_s: u32,
    #[serde(default)]
    pub burst: u32,
}

/// Per-listener configuration. Immutable after `Server` start (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub input_name: String,
    pub driver: DriverKind,
    #[serde(default)]
    pub tls_mode: bool,
    #[serde(default = "default_anon")]
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub permit_expired: PermitExpired,
    #[serde(default)]
    pub permitted_peers: Vec<String>,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub crl_file: Option<String>,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub extra_ca_files: Vec<String>,
    #[serde(default)]
    pub priority_string: Option<String>,
    #[serde(default = "default_verify_depth")]
    pub verify_depth: u32,
    #[serde(default)]
    pub prioritize_san: bool,
    #[serde(default)]
    pub check_extended_key_usage: bool,
    #[serde(default)]
    pub revocation_check: bool,
    #[serde(default)]
    pub keepalive: KeepAliveConfig,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_lstn")]
    pub max_lstn: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default)]
    pub framing_kind: FramingKindConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default = "default_true")]
    pub preserve_case: bool,
    #[serde(default)]
    pub default_tz: String,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    /// Emit a synthesized warning message per still-open session on server shutdown.
    #[serde(default)]
    pub emit_msg_on_close: bool,
}

fn default_anon() -> AuthMode {
    AuthMode::Anon
}

impl ListenerConfig {
    pub fn verify_depth_effective(&self) -> u32 {
        self.verify_depth.max(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let json = serde_json::json!({
            "bind_addr": "0.0.0.0",
            "port": 6514,
            "input_name": "imtcp",
            "driver": "ptcp",
        });
        let cfg: ListenerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(cfg.max_sessions, 200);
        assert_eq!(cfg.max_lstn, 20);
        assert_eq!(cfg.max_frame_size, 200_000);
        assert!(cfg.preserve_case);
        assert_eq!(cfg.permit_expired, PermitExpired::Deny);
        assert_eq!(cfg.verify_depth_effective(), 2);
    }
}
