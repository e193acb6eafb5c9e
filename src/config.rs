//! Agent configuration
//!
//! Loaded from TOML with `${VAR}` / `${VAR:-default}` substitution applied to
//! the raw text before parsing. Durations accept humantime strings ("25s",
//! "2m").

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identity::AgentId;
use crate::transport::TransportKind;
use crate::WeftError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Wire identifiers, all optional, for blending with fronting
    /// infrastructure.
    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub socks5: Socks5Config,

    #[serde(default)]
    pub exit: ExitConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub connections: ConnectionsConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub management: ManagementConfig,

    #[serde(default)]
    pub udp: UdpConfig,

    #[serde(default)]
    pub forward: ForwardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// "auto" or a 32-char hex ID.
    #[serde(default = "default_agent_id")]
    pub id: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// error | warn | info | debug | trace
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// text | json
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            display_name: String::new(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_agent_id() -> String {
    "auto".into()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".weft")
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

impl AgentConfig {
    pub fn fixed_id(&self) -> Result<Option<AgentId>, WeftError> {
        if self.id == "auto" {
            Ok(None)
        } else {
            AgentId::from_hex(&self.id).map(Some)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM file paths. Inline PEM is accepted when the value starts with
    /// "-----BEGIN".
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,

    /// Verify peer certificates against the CA set. When off, ephemeral
    /// self-signed certificates are generated and accepted.
    #[serde(default)]
    pub strict: bool,

    /// Require client certificates on listeners.
    #[serde(default)]
    pub mtls: bool,

    /// Pin the peer certificate to this SHA-256 fingerprint (hex).
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// ALPN for QUIC and H2; impersonation values like "h2" are fine.
    pub alpn: Option<String>,
    /// Extra HTTP header sent on WS/H2 requests, "Name: value".
    pub http_header: Option<String>,
    pub ws_subprotocol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub transport: TransportKind,
    pub address: SocketAddr,
    /// URL path for WS/H2 listeners.
    #[serde(default = "default_path")]
    pub path: String,
    /// Accept plaintext WebSocket (reverse-proxy deployments).
    #[serde(default)]
    pub plaintext: bool,
}

fn default_path() -> String {
    "/".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Expected remote agent ID, if pinned.
    pub id: Option<String>,
    pub transport: TransportKind,
    pub address: String,
    #[serde(default = "default_path")]
    pub path: String,
    /// HTTP CONNECT proxy, host:port.
    pub proxy: Option<String>,
    /// "user:password" for proxy Basic auth.
    pub proxy_auth: Option<String>,
    /// Per-peer TLS overrides.
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Socks5Config {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_socks_addr")]
    pub address: SocketAddr,
    #[serde(default)]
    pub auth: SocksAuthConfig,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_socks_addr(),
            auth: SocksAuthConfig::default(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_socks_addr() -> SocketAddr {
    "127.0.0.1:1080".parse().unwrap()
}

fn default_max_connections() -> usize {
    1024
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocksAuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub users: Vec<SocksUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocksUser {
    pub username: String,
    /// bcrypt hash.
    pub password_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitConfig {
    #[serde(default)]
    pub enabled: bool,
    /// CIDR prefixes this node terminates.
    #[serde(default)]
    pub routes: Vec<String>,
    /// Domain patterns, exact or `*.label` wildcards.
    #[serde(default)]
    pub domain_routes: Vec<String>,
    #[serde(default)]
    pub dns: DnsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Upstream resolvers, host:port.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "default_dns_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            servers: vec![],
            timeout: default_dns_timeout(),
        }
    }
}

fn default_dns_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_advertise_interval", with = "humantime_serde")]
    pub advertise_interval: Duration,
    #[serde(default = "default_node_info_interval", with = "humantime_serde")]
    pub node_info_interval: Duration,
    #[serde(default = "default_route_ttl", with = "humantime_serde")]
    pub route_ttl: Duration,
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            advertise_interval: default_advertise_interval(),
            node_info_interval: default_node_info_interval(),
            route_ttl: default_route_ttl(),
            max_hops: default_max_hops(),
        }
    }
}

fn default_advertise_interval() -> Duration {
    Duration::from_secs(120)
}

fn default_node_info_interval() -> Duration {
    Duration::from_secs(120)
}

fn default_route_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_max_hops() -> u32 {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionsConfig {
    #[serde(default = "default_keepalive_interval", with = "humantime_serde")]
    pub keepalive_interval: Duration,
    #[serde(default = "default_keepalive_timeout", with = "humantime_serde")]
    pub keepalive_timeout: Duration,
    /// Fraction applied to the keepalive interval, 0.0..1.0.
    #[serde(default = "default_keepalive_jitter")]
    pub keepalive_jitter: f64,
    /// Idle threshold before a session is considered quiet.
    #[serde(default = "default_idle_threshold", with = "humantime_serde")]
    pub idle_threshold: Duration,
    /// Idle timeout after which a session is torn down.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: default_keepalive_interval(),
            keepalive_timeout: default_keepalive_timeout(),
            keepalive_jitter: default_keepalive_jitter(),
            idle_threshold: default_idle_threshold(),
            timeout: default_idle_timeout(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(25)
}

fn default_keepalive_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_keepalive_jitter() -> f64 {
    0.1
}

fn default_idle_threshold() -> Duration {
    Duration::from_secs(300)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(900)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction, 0.0..1.0.
    #[serde(default = "default_reconnect_jitter")]
    pub jitter: f64,
    /// 0 retries forever.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_reconnect_jitter(),
            max_retries: 0,
        }
    }
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_reconnect_jitter() -> f64 {
    0.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_streams_per_peer")]
    pub max_streams_per_peer: usize,
    #[serde(default = "default_max_streams_total")]
    pub max_streams_total: usize,
    #[serde(default = "default_max_pending_opens")]
    pub max_pending_opens: usize,
    #[serde(default = "default_stream_open_timeout", with = "humantime_serde")]
    pub stream_open_timeout: Duration,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_streams_per_peer: default_max_streams_per_peer(),
            max_streams_total: default_max_streams_total(),
            max_pending_opens: default_max_pending_opens(),
            stream_open_timeout: default_stream_open_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_max_streams_per_peer() -> usize {
    256
}

fn default_max_streams_total() -> usize {
    4096
}

fn default_max_pending_opens() -> usize {
    64
}

fn default_stream_open_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_buffer_size() -> usize {
    32 * 1024
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Base64 X25519 public key; sensitive node-info fields are sealed to it.
    pub public_key: Option<String>,
    /// Base64 X25519 private key, held by operator nodes only.
    pub private_key: Option<String>,
    /// Base64 Ed25519 public key verifying sleep/wake commands.
    pub signing_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    #[serde(default = "default_udp_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_associations")]
    pub max_associations: usize,
    #[serde(default = "default_udp_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: default_udp_enabled(),
            max_associations: default_max_associations(),
            idle_timeout: default_udp_idle_timeout(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

fn default_udp_enabled() -> bool {
    true
}

fn default_max_associations() -> usize {
    256
}

fn default_udp_idle_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_datagram_size() -> usize {
    1500
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwardConfig {
    /// Local TCP listeners feeding forward streams into the mesh.
    #[serde(default)]
    pub listeners: Vec<ForwardListener>,
    /// Exit endpoints this node terminates, by key.
    #[serde(default)]
    pub exits: Vec<ForwardExit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardListener {
    pub key: String,
    pub bind: SocketAddr,
    /// Bytes per second toward the mesh; unset means unpaced.
    pub rate: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardExit {
    pub key: String,
    /// host:port dialed for each forward stream.
    pub target: String,
}

impl Config {
    /// Load from a TOML file, expanding `${VAR}` and `${VAR:-default}` in
    /// the raw text first.
    pub fn from_file(path: &Path) -> Result<Self, WeftError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, WeftError> {
        let expanded = expand_env(raw, |name| std::env::var(name).ok());
        let config: Config = toml::from_str(&expanded)
            .map_err(|e| WeftError::Config(format!("parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WeftError> {
        if self.agent.id != "auto" {
            self.agent.fixed_id()?;
        }
        if self.socks5.enabled && self.socks5.auth.enabled && self.socks5.auth.users.is_empty() {
            return Err(WeftError::Config(
                "socks5 auth enabled with no users".into(),
            ));
        }
        if self.exit.enabled && self.exit.routes.is_empty() && self.exit.domain_routes.is_empty() {
            return Err(WeftError::Config(
                "exit enabled with no routes or domain_routes".into(),
            ));
        }
        for route in &self.exit.routes {
            route
                .parse::<ipnet::IpNet>()
                .map_err(|_| WeftError::Config(format!("bad exit route cidr: {}", route)))?;
        }
        for pattern in &self.exit.domain_routes {
            let body = pattern.strip_prefix("*.").unwrap_or(pattern);
            if body.is_empty() || body.contains('*') {
                return Err(WeftError::Config(format!(
                    "bad domain route pattern: {}",
                    pattern
                )));
            }
        }
        if !(0.0..1.0).contains(&self.connections.keepalive_jitter) {
            return Err(WeftError::Config("keepalive_jitter must be in [0, 1)".into()));
        }
        if !(0.0..1.0).contains(&self.connections.reconnect.jitter) {
            return Err(WeftError::Config("reconnect jitter must be in [0, 1)".into()));
        }
        if self.connections.reconnect.multiplier < 1.0 {
            return Err(WeftError::Config("reconnect multiplier must be >= 1".into()));
        }
        if self.limits.buffer_size == 0 {
            return Err(WeftError::Config("buffer_size must be positive".into()));
        }
        Ok(())
    }

    /// Parsed exit prefixes.
    pub fn exit_prefixes(&self) -> Vec<crate::routing::RoutePrefix> {
        let mut out = Vec::new();
        for route in &self.exit.routes {
            if let Ok(net) = route.parse() {
                out.push(crate::routing::RoutePrefix::Cidr(net));
            }
        }
        for pattern in &self.exit.domain_routes {
            out.push(crate::routing::RoutePrefix::Domain(pattern.clone()));
        }
        out
    }
}

/// Substitute `${VAR}` and `${VAR:-default}` using the provided resolver.
/// Unset variables without a default expand to the empty string.
fn expand_env<F: Fn(&str) -> Option<String>>(input: &str, resolve: F) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end_rel) => {
                let inner = &rest[start + 2..start + 2 + end_rel];
                let (name, default) = match inner.split_once(":-") {
                    Some((n, d)) => (n, Some(d)),
                    None => (inner, None),
                };
                match resolve(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(default.unwrap_or("")),
                }
                rest = &rest[start + 2 + end_rel + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_env_expansion() {
        let resolve = |name: &str| match name {
            "HOST" => Some("10.0.0.1".to_string()),
            _ => None,
        };
        assert_eq!(expand_env("addr = \"${HOST}:443\"", resolve), "addr = \"10.0.0.1:443\"");
        assert_eq!(
            expand_env("addr = \"${MISSING:-0.0.0.0}:443\"", resolve),
            "addr = \"0.0.0.0:443\""
        );
        assert_eq!(expand_env("addr = \"${MISSING}\"", resolve), "addr = \"\"");
        assert_eq!(expand_env("no vars here", resolve), "no vars here");
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
[agent]
display_name = "edge-1"
log_level = "debug"

[[listeners]]
transport = "quic"
address = "0.0.0.0:8443"

[[peers]]
transport = "ws"
address = "hub.example.com:443"
path = "/mesh"

[socks5]
enabled = true
address = "127.0.0.1:1080"

[exit]
enabled = true
routes = ["10.0.0.0/8"]
domain_routes = ["*.internal.example"]

[exit.dns]
servers = ["9.9.9.9:53"]
timeout = "3s"

[routing]
advertise_interval = "2m"
route_ttl = "5m"
max_hops = 6

[connections.reconnect]
initial_delay = "500ms"
max_delay = "30s"
multiplier = 2.0
jitter = 0.2
"#;
        let config = Config::parse(raw).unwrap();
        assert_eq!(config.agent.display_name, "edge-1");
        assert_eq!(config.listeners.len(), 1);
        assert_eq!(config.peers[0].path, "/mesh");
        assert!(config.socks5.enabled);
        assert_eq!(config.exit_prefixes().len(), 2);
        assert_eq!(config.routing.max_hops, 6);
        assert_eq!(config.exit.dns.timeout, Duration::from_secs(3));
        assert_eq!(
            config.connections.reconnect.initial_delay,
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_bad_exit_route_rejected() {
        let raw = r#"
[exit]
enabled = true
routes = ["not-a-cidr"]
"#;
        assert!(Config::parse(raw).is_err());
    }

    #[test]
    fn test_exit_without_routes_rejected() {
        let raw = r#"
[exit]
enabled = true
"#;
        assert!(Config::parse(raw).is_err());
    }

    #[test]
    fn test_auth_without_users_rejected() {
        let raw = r#"
[socks5]
enabled = true

[socks5.auth]
enabled = true
"#;
        assert!(Config::parse(raw).is_err());
    }
}
