//! Configuration loading and runtime snapshots.
//!
//! The config file is TOML. Every field has a default so a minimal file (or
//! none at all) still yields a working single-host setup. At runtime the
//! active configuration is an immutable snapshot behind [`ConfigHandle`];
//! replacing it swaps the whole snapshot, so readers never observe a
//! half-updated config.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Hostname advertised to clients and used as the server prefix.
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Human-readable server title, shown in the welcome burst.
    #[serde(default)]
    pub title: Option<String>,

    /// Address the IRC listener binds to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// SQLite database path.
    #[serde(default = "default_database")]
    pub database: String,

    /// Root directory for on-disk message logs. Absent means the
    /// non-persistent in-memory store: no backlog, no delivery receipts.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Maximum networks per user. Negative means unlimited.
    #[serde(default = "default_max_user_networks")]
    pub max_user_networks: i32,

    /// Whether clients may attach to all of a user's networks over a single
    /// connection.
    #[serde(default = "default_true")]
    pub multi_upstream: bool,

    /// Message of the day.
    #[serde(default)]
    pub motd: Option<String>,

    /// Proxies trusted to carry the original client address.
    #[serde(default)]
    pub accept_proxy_ips: Vec<IpNet>,

    /// CIDR ranges used to derive a deterministic per-user egress address
    /// for upstream connections (one range per address family).
    #[serde(default)]
    pub upstream_user_ips: Vec<IpNet>,

    /// Upstream reconnect pacing. Not read from the config file; tests
    /// shrink it to keep reconnect scenarios fast.
    #[serde(skip)]
    pub retry: RetryPolicy,
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub min: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            min: Duration::from_secs(60),
            max: Duration::from_secs(600),
            jitter: Duration::from_secs(60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hostname: default_hostname(),
            title: None,
            listen: default_listen(),
            database: default_database(),
            log_path: None,
            max_user_networks: default_max_user_networks(),
            multi_upstream: true,
            motd: None,
            accept_proxy_ips: Vec::new(),
            upstream_user_ips: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

fn default_hostname() -> String {
    "localhost".to_owned()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 6667))
}

fn default_database() -> String {
    "pontoon.db".to_owned()
}

fn default_max_user_networks() -> i32 {
    -1
}

fn default_true() -> bool {
    true
}

/// Shared handle to the active configuration snapshot.
#[derive(Clone)]
pub struct ConfigHandle(Arc<RwLock<Arc<Config>>>);

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        ConfigHandle(Arc::new(RwLock::new(Arc::new(config))))
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<Config> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the snapshot.
    pub fn set(&self, config: Config) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.hostname, "localhost");
        assert_eq!(cfg.max_user_networks, -1);
        assert!(cfg.multi_upstream);
        assert!(cfg.log_path.is_none());
    }

    #[test]
    fn parses_recognized_options() {
        let cfg: Config = toml::from_str(
            r#"
            hostname = "bnc.example.org"
            title = "example bouncer"
            listen = "0.0.0.0:6697"
            log_path = "/var/lib/pontoon/logs"
            max_user_networks = 8
            multi_upstream = false
            upstream_user_ips = ["192.0.2.0/24", "2001:db8::/56"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.hostname, "bnc.example.org");
        assert_eq!(cfg.listen.port(), 6697);
        assert_eq!(cfg.max_user_networks, 8);
        assert!(!cfg.multi_upstream);
        assert_eq!(cfg.upstream_user_ips.len(), 2);
    }

    #[test]
    fn handle_swaps_whole_snapshots() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.get();
        let mut next = Config::default();
        next.hostname = "new.example.org".to_owned();
        handle.set(next);
        assert_eq!(before.hostname, "localhost");
        assert_eq!(handle.get().hostname, "new.example.org");
    }
}
