//! Environment configuration: WINS endpoints, naming port, cluster map and
//! topic names, timers. Loaded from TOML; a `clap` CLI lets a test harness
//! override the bind address and port during tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Result, ServerError};

/// Default NetBIOS name service UDP port (RFC 1001).
pub const DEFAULT_NAMING_PORT: u16 = 137;

/// Default oplock-break timeout.
pub const DEFAULT_OPLOCK_BREAK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default refresh-scheduler wakeup interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(180);

/// Default bound on a node's deferred-request queue.
pub const DEFAULT_DEFERRED_QUEUE_CAPACITY: usize = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Primary WINS server; `None` means broadcast-only (B-node) operation.
    pub wins_primary: Option<SocketAddr>,
    /// Secondary WINS server, tried if the primary doesn't answer.
    pub wins_secondary: Option<SocketAddr>,
    /// Subnet broadcast address used when no WINS server is configured.
    #[serde(default = "default_broadcast")]
    pub broadcast_addr: SocketAddr,
    /// Local address the name service binds to.
    #[serde(default = "default_bind")]
    pub bind_addr: IpAddr,
    /// Name service UDP port.
    #[serde(default = "default_naming_port")]
    pub naming_port: u16,
    /// This node's primary NetBIOS server name.
    pub server_name: String,
    /// Additional names this node should also register.
    #[serde(default)]
    pub aliases: Vec<String>,
    /// NetBIOS domain/workgroup name.
    pub domain_name: String,
    /// How often the refresh scheduler wakes up.
    #[serde(default = "default_refresh_interval", with = "duration_secs")]
    pub refresh_interval: Duration,
    /// How long an oplock break may stay outstanding before timing out.
    #[serde(default = "default_break_timeout", with = "duration_secs")]
    pub oplock_break_timeout: Duration,
    /// Name of the replicated cluster map holding `ClusterFileState`.
    #[serde(default = "default_map_name")]
    pub cluster_map_name: String,
    /// Name of the cluster pub/sub topic used for break/eviction events.
    #[serde(default = "default_topic_name")]
    pub cluster_topic_name: String,
    /// Capacity of each node's deferred-request queue.
    #[serde(default = "default_deferred_capacity")]
    pub deferred_queue_capacity: usize,
}

fn default_broadcast() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 255)), DEFAULT_NAMING_PORT)
}
fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_naming_port() -> u16 {
    DEFAULT_NAMING_PORT
}
fn default_refresh_interval() -> Duration {
    DEFAULT_REFRESH_INTERVAL
}
fn default_break_timeout() -> Duration {
    DEFAULT_OPLOCK_BREAK_TIMEOUT
}
fn default_map_name() -> String {
    "fileStateCache".to_owned()
}
fn default_topic_name() -> String {
    "fileStateEvents".to_owned()
}
fn default_deferred_capacity() -> usize {
    DEFAULT_DEFERRED_QUEUE_CAPACITY
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Config {
    /// Loads configuration from a TOML file at `path`.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// A self-contained configuration for demos and tests, no WINS server.
    pub fn demo(server_name: impl Into<String>) -> Config {
        Config {
            wins_primary: None,
            wins_secondary: None,
            broadcast_addr: default_broadcast(),
            bind_addr: default_bind(),
            naming_port: 0, // let the OS pick a port in tests
            server_name: server_name.into(),
            aliases: Vec::new(),
            domain_name: "WORKGROUP".to_owned(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            oplock_break_timeout: DEFAULT_OPLOCK_BREAK_TIMEOUT,
            cluster_map_name: default_map_name(),
            cluster_topic_name: default_topic_name(),
            deferred_queue_capacity: DEFAULT_DEFERRED_QUEUE_CAPACITY,
        }
    }
}

/// CLI overrides for the demo binary / test harnesses.
#[derive(Debug, Parser)]
pub struct ConfigArgs {
    /// Path to a TOML configuration file.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    /// Override the naming service bind port.
    #[arg(long)]
    pub naming_port: Option<u16>,
}

impl ConfigArgs {
    /// Resolves into a `Config`, applying CLI overrides on top of the file
    /// (or the demo default when no file is given).
    pub fn resolve(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::demo("DEMOSRV"),
        };
        if let Some(port) = self.naming_port {
            config.naming_port = port;
        }
        Ok(config)
    }
}
