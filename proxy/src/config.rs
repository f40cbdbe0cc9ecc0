//! Balancer configuration.

use crate::types::GroupKey;
use serde::Deserialize;
use sha2::{Digest, Sha512};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Main balancer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the frontend listener binds.
    #[serde(default = "Config::default_cluster_address")]
    pub cluster_address: String,

    /// Port the frontend listener binds.
    #[serde(default = "Config::default_cluster_port")]
    pub cluster_port: u16,

    /// Seconds a routed client may wait while its route has no idle backend.
    #[serde(default = "Config::default_timeout")]
    pub timeout: f64,

    /// Access key. Accepted for compatibility and logged, never checked.
    #[serde(default)]
    pub key: Option<String>,

    /// Route map entries.
    #[serde(default)]
    pub map: Vec<MapEntry>,

    #[serde(default)]
    pub timers: TimersConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        content.parse()
    }

    /// Address of the frontend listener.
    pub fn cluster_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Ok(ip) = self.cluster_address.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.cluster_port));
        }
        (self.cluster_address.as_str(), self.cluster_port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| {
                ConfigError::InvalidAddress(format!(
                    "{}:{}",
                    self.cluster_address, self.cluster_port
                ))
            })
    }

    /// How long a client may wait before it is answered with a 503.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Derive the route table and the backend listener plan from the map.
    ///
    /// Only keepalive entries take part. Each outgoing address gets exactly
    /// one listener even when several entries name it; the first entry wins.
    pub fn routing(&self) -> Result<RoutingTable, ConfigError> {
        let mut table = RoutingTable::default();

        for entry in &self.map {
            if !entry.keepalive {
                info!(incoming = ?entry.incoming, "skipping map entry without keepalive");
                continue;
            }
            let group = group_key(&entry.incoming);

            for name in &entry.incoming {
                if table.routes.iter().any(|(existing, _)| existing == name) {
                    warn!(name = %name, "route name mapped twice, keeping the first");
                    continue;
                }
                table.routes.push((name.clone(), group.clone()));
            }

            // every default entry overrides the previous one
            if entry.default {
                table.default_route = entry.incoming.last().cloned();
            }

            for outgoing in &entry.outgoing {
                let address = resolve(outgoing)?;
                if table.backends.iter().any(|b| b.address == address) {
                    debug!(address = %address, "backend listener already planned");
                    continue;
                }
                table.backends.push(BackendListener {
                    address,
                    group: group.clone(),
                });
            }
        }

        Ok(table)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match Duration::try_from_secs_f64(self.timeout) {
            Ok(timeout) if !timeout.is_zero() => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "timeout must be a positive number of seconds, got {}",
                    self.timeout
                )));
            }
        }
        if self.timers.clock_tick_ms == 0 || self.timers.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "timer intervals must be non-zero".to_string(),
            ));
        }
        if self.limits.max_request_head == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_request_head must be non-zero".to_string(),
            ));
        }
        for (index, entry) in self.map.iter().enumerate() {
            if !entry.keepalive {
                continue;
            }
            if entry.incoming.is_empty() {
                return Err(ConfigError::InvalidMap {
                    index,
                    reason: "no incoming names",
                });
            }
            if entry.outgoing.is_empty() {
                return Err(ConfigError::InvalidMap {
                    index,
                    reason: "no outgoing addresses",
                });
            }
        }
        Ok(())
    }

    fn default_cluster_address() -> String {
        "0.0.0.0".to_string()
    }

    fn default_cluster_port() -> u16 {
        8080
    }

    fn default_timeout() -> f64 {
        6.0
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

/// One `[[map]]` entry: a set of host names served by a set of backend
/// listener addresses.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapEntry {
    /// Host names routed to this group.
    pub incoming: Vec<String>,

    /// `host:port` addresses backends connect to.
    pub outgoing: Vec<String>,

    /// Only keepalive entries are served.
    #[serde(default)]
    pub keepalive: bool,

    /// Route requests without a Host header here. When several entries set
    /// it, the last one wins, and its last incoming name becomes the default
    /// route.
    #[serde(default)]
    pub default: bool,
}

/// Timer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimersConfig {
    /// How often the cached clock is refreshed.
    #[serde(default = "TimersConfig::default_clock_tick_ms")]
    pub clock_tick_ms: u64,

    /// How often waiting clients are checked for eviction.
    #[serde(default = "TimersConfig::default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            clock_tick_ms: Self::default_clock_tick_ms(),
            sweep_interval_ms: Self::default_sweep_interval_ms(),
        }
    }
}

impl TimersConfig {
    fn default_clock_tick_ms() -> u64 {
        1000
    }

    fn default_sweep_interval_ms() -> u64 {
        2000
    }

    pub fn clock_tick(&self) -> Duration {
        Duration::from_millis(self.clock_tick_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Resource limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsConfig {
    /// Bytes an unrouted request head may reach before the client is closed.
    #[serde(default = "LimitsConfig::default_max_request_head")]
    pub max_request_head: usize,

    /// Apply the unavailable timeout to clients waiting on a session id.
    #[serde(default = "LimitsConfig::default_evict_sticky")]
    pub evict_sticky: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_head: Self::default_max_request_head(),
            evict_sticky: Self::default_evict_sticky(),
        }
    }
}

impl LimitsConfig {
    fn default_max_request_head() -> usize {
        64 * 1024
    }

    fn default_evict_sticky() -> bool {
        true
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level, or any `EnvFilter` directive.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Upper bound on flushing queued writes after a shutdown signal.
    #[serde(default = "ShutdownConfig::default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: Self::default_drain_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    fn default_drain_timeout_secs() -> u64 {
        5
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Routing derived from the map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    /// Route names and the group key each maps to, in configuration order.
    pub routes: Vec<(String, GroupKey)>,

    /// Route name used when a request has no Host header.
    pub default_route: Option<String>,

    /// One entry per distinct backend listener address.
    pub backends: Vec<BackendListener>,
}

/// A listener backends connect to, and the group they serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendListener {
    pub address: SocketAddr,
    pub group: GroupKey,
}

/// Key shared by every backend of a map entry: hex SHA-512 of its incoming
/// names joined with `|`.
pub fn group_key(incoming: &[String]) -> GroupKey {
    let digest = Sha512::digest(incoming.join("|").as_bytes());
    GroupKey::new(hex::encode(digest))
}

fn resolve(address: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = address.parse() {
        return Ok(addr);
    }
    address
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidAddress(address.to_string()))
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("map entry {index}: {reason}")]
    InvalidMap { index: usize, reason: &'static str },

    #[error("{0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
cluster_address = "127.0.0.1"
cluster_port = 8080
timeout = 2.5
key = "secret"

[[map]]
incoming = ["app.example.com", "www.example.com"]
outgoing = ["127.0.0.1:9000", "127.0.0.1:9001"]
keepalive = true
default = true

[[map]]
incoming = ["api.example.com"]
outgoing = ["127.0.0.1:9001", "127.0.0.1:9002"]
keepalive = true

[[map]]
incoming = ["legacy.example.com"]
outgoing = ["127.0.0.1:9100"]
"#;

    fn sample() -> Config {
        SAMPLE.parse().unwrap()
    }

    #[test]
    fn defaults() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config.cluster_port, 8080);
        assert_eq!(config.timeout(), Duration::from_secs(6));
        assert_eq!(config.timers.clock_tick(), Duration::from_secs(1));
        assert_eq!(config.timers.sweep_interval(), Duration::from_secs(2));
        assert_eq!(config.limits.max_request_head, 65536);
        assert!(config.limits.evict_sticky);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.map.is_empty());
    }

    #[test]
    fn parses_sample() {
        let config = sample();
        assert_eq!(
            config.cluster_addr().unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.timeout(), Duration::from_millis(2500));
        assert_eq!(config.key.as_deref(), Some("secret"));
        assert_eq!(config.map.len(), 3);
        assert!(!config.map[2].keepalive);
    }

    #[test]
    fn group_key_is_sha512_hex_of_joined_names() {
        let key = group_key(&["a".to_string(), "b".to_string()]);
        assert_eq!(key.as_str().len(), 128);
        assert_eq!(key, group_key(&["a".to_string(), "b".to_string()]));
        assert_ne!(key, group_key(&["b".to_string(), "a".to_string()]));
        assert_eq!(key, GroupKey::new(hex::encode(Sha512::digest(b"a|b"))));
    }

    #[test]
    fn routing_maps_every_incoming_name() {
        let routing = sample().routing().unwrap();
        let app = group_key(&["app.example.com".into(), "www.example.com".into()]);
        let api = group_key(&["api.example.com".into()]);

        assert_eq!(
            routing.routes,
            vec![
                ("app.example.com".to_string(), app.clone()),
                ("www.example.com".to_string(), app),
                ("api.example.com".to_string(), api),
            ]
        );
        assert_eq!(routing.default_route.as_deref(), Some("www.example.com"));
    }

    #[test]
    fn duplicate_outgoing_gets_one_listener() {
        let routing = sample().routing().unwrap();
        let addresses: Vec<String> = routing
            .backends
            .iter()
            .map(|b| b.address.to_string())
            .collect();
        assert_eq!(
            addresses,
            vec!["127.0.0.1:9000", "127.0.0.1:9001", "127.0.0.1:9002"]
        );
        // the first entry naming 9001 owns it
        let app = group_key(&["app.example.com".into(), "www.example.com".into()]);
        assert_eq!(routing.backends[1].group, app);
    }

    #[test]
    fn non_keepalive_entries_are_skipped() {
        let routing = sample().routing().unwrap();
        assert!(
            !routing
                .routes
                .iter()
                .any(|(name, _)| name == "legacy.example.com")
        );
        assert!(
            !routing
                .backends
                .iter()
                .any(|b| b.address.port() == 9100)
        );
    }

    #[test]
    fn last_default_entry_wins() {
        let config: Config = r#"
[[map]]
incoming = ["a.example.com", "b.example.com"]
outgoing = ["127.0.0.1:9000"]
keepalive = true
default = true

[[map]]
incoming = ["c.example.com", "d.example.com"]
outgoing = ["127.0.0.1:9001"]
keepalive = true
default = true

[[map]]
incoming = ["e.example.com"]
outgoing = ["127.0.0.1:9002"]
keepalive = true
"#
        .parse()
        .unwrap();
        let routing = config.routing().unwrap();
        assert_eq!(routing.default_route.as_deref(), Some("d.example.com"));
    }

    #[test]
    fn rejects_bad_timeout() {
        assert!(matches!(
            "timeout = 0".parse::<Config>(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            "timeout = -1.0".parse::<Config>(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            "timeout = 1e30".parse::<Config>(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            "timeout = nan".parse::<Config>(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_keepalive_entry_without_backends() {
        let err = r#"
[[map]]
incoming = ["a.example.com"]
outgoing = []
keepalive = true
"#
        .parse::<Config>()
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMap { index: 0, .. }));
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(matches!(
            "daemonise = true".parse::<Config>(),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn unresolvable_outgoing_is_an_error() {
        let config: Config = r#"
[[map]]
incoming = ["a.example.com"]
outgoing = ["not an address"]
keepalive = true
"#
        .parse()
        .unwrap();
        assert!(matches!(
            config.routing(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.map.len(), 3);

        assert!(matches!(
            Config::load(Path::new("/nonexistent/balancer.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
