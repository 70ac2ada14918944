//! Daemon configuration: command line, environment and TOML file

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ordo_core::config::DEFAULT_INGRESS_NAME;
use ordo_core::{Error, OrderingConfig};
use ordo_transport::RateLimitConfig;
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 7400;
pub const DEFAULT_METRICS_PORT: u16 = 9400;
pub const DEFAULT_LOG_POLL: Duration = Duration::from_millis(50);

/// Ordo Daemon - operation ordering for collaborative documents
#[derive(Parser, Debug, Default)]
#[command(name = "ordod")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, env = "ORDO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Identity of this node in the fleet (default: derived from the hostname;
    /// required with the sqlite backend)
    #[arg(long, env = "ORDO_NODE_ID")]
    pub node_id: Option<String>,

    /// Bind address
    #[arg(long, env = "ORDO_BIND")]
    pub bind: Option<String>,

    /// TCP port to listen on
    #[arg(long, env = "ORDO_PORT")]
    pub port: Option<u16>,

    /// Metrics HTTP port
    #[arg(long, env = "ORDO_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Storage backend for the log, documents, leases and nodes
    #[arg(long, env = "ORDO_BACKEND", value_enum)]
    pub backend: Option<Backend>,

    /// SQLite database path (sqlite backend)
    #[arg(long, env = "ORDO_DB")]
    pub db: Option<PathBuf>,

    /// Document lease lifetime in milliseconds
    #[arg(long, env = "ORDO_LEASE_TTL_MS")]
    pub lease_ttl_ms: Option<u64>,

    /// Lease renewal period in milliseconds
    #[arg(long, env = "ORDO_RENEW_INTERVAL_MS")]
    pub renew_interval_ms: Option<u64>,

    /// Node heartbeat period in milliseconds
    #[arg(long, env = "ORDO_HEARTBEAT_INTERVAL_MS")]
    pub heartbeat_interval_ms: Option<u64>,

    /// How long a node stays live without a heartbeat, in milliseconds
    #[arg(long, env = "ORDO_NODE_GRACE_MS")]
    pub node_grace_ms: Option<u64>,

    /// How often the sqlite backend polls the shared log, in milliseconds
    #[arg(long, env = "ORDO_LOG_POLL_MS")]
    pub log_poll_ms: Option<u64>,

    /// Service name stamped on start traces
    #[arg(long, env = "ORDO_INGRESS_NAME")]
    pub ingress_name: Option<String>,

    /// Order leased documents in memory on this node
    #[arg(long, env = "ORDO_LOCAL_ORDERING")]
    pub local_ordering: Option<bool>,

    /// Rate limit: max submits per second per client (0 = disabled)
    #[arg(long, env = "ORDO_RATE_LIMIT")]
    pub rate_limit: Option<u32>,

    /// Rate limit burst size (default: 2x rate limit)
    #[arg(long, env = "ORDO_RATE_BURST")]
    pub rate_burst: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ORDO_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Sqlite,
}

/// Contents of the `--config` file. Every key is optional.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub node_id: Option<String>,
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub backend: Option<Backend>,
    pub db: Option<PathBuf>,
    pub lease_ttl_ms: Option<u64>,
    pub renew_interval_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub node_grace_ms: Option<u64>,
    pub log_poll_ms: Option<u64>,
    pub ingress_name: Option<String>,
    pub local_ordering: Option<bool>,
    pub rate_limit: Option<u32>,
    pub rate_burst: Option<u32>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }
}

/// Fully resolved daemon settings
#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,
    pub bind: String,
    pub port: u16,
    pub metrics_port: u16,
    pub backend: Backend,
    pub db: Option<PathBuf>,
    pub ordering: OrderingConfig,
    pub log_poll: Duration,
    pub local_ordering: bool,
    pub rate_limit: Option<RateLimitConfig>,
    pub log_level: String,
}

impl Config {
    /// Load the file named by `--config` (if any) and resolve against it
    pub fn from_args(args: Args) -> Result<Self, Error> {
        let file = match &args.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(args, file)
    }

    /// Merge flags over file values over defaults, then validate
    pub fn resolve(args: Args, file: FileConfig) -> Result<Self, Error> {
        let defaults = OrderingConfig::default();
        let millis = |flag: Option<u64>, key: Option<u64>, default: Duration| {
            flag.or(key).map(Duration::from_millis).unwrap_or(default)
        };

        let port = args.port.or(file.port).unwrap_or(DEFAULT_PORT);
        let explicit_node_id = args.node_id.or(file.node_id);
        let node_id = explicit_node_id
            .clone()
            .unwrap_or_else(|| default_node_id(port));

        let rate = args.rate_limit.or(file.rate_limit).unwrap_or(0);
        let rate_limit = (rate > 0).then(|| match args.rate_burst.or(file.rate_burst) {
            Some(burst) => RateLimitConfig::new(rate, burst),
            None => RateLimitConfig::from_rate(rate),
        });

        let config = Config {
            node_id,
            bind: args.bind.or(file.bind).unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            metrics_port: args.metrics_port.or(file.metrics_port).unwrap_or(DEFAULT_METRICS_PORT),
            backend: args.backend.or(file.backend).unwrap_or(Backend::Memory),
            db: args.db.or(file.db),
            ordering: OrderingConfig {
                lease_ttl: millis(args.lease_ttl_ms, file.lease_ttl_ms, defaults.lease_ttl),
                renew_interval: millis(args.renew_interval_ms, file.renew_interval_ms, defaults.renew_interval),
                heartbeat_interval: millis(
                    args.heartbeat_interval_ms,
                    file.heartbeat_interval_ms,
                    defaults.heartbeat_interval,
                ),
                node_grace: millis(args.node_grace_ms, file.node_grace_ms, defaults.node_grace),
                ingress_name: args
                    .ingress_name
                    .or(file.ingress_name)
                    .unwrap_or_else(|| DEFAULT_INGRESS_NAME.to_string()),
            },
            log_poll: millis(args.log_poll_ms, file.log_poll_ms, DEFAULT_LOG_POLL),
            local_ordering: args.local_ordering.or(file.local_ordering).unwrap_or(true),
            rate_limit,
            log_level: args.log_level.or(file.log_level).unwrap_or_else(|| "info".to_string()),
        };

        config.validate()?;

        // Lease ownership is keyed by node id, so nodes sharing a database
        // must not fall back to a derived one
        if config.backend == Backend::Sqlite && explicit_node_id.is_none() {
            return Err(Error::Configuration(
                "node_id must be set explicitly with the sqlite backend".into(),
            ));
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.ordering.validate()?;

        if self.node_id.trim().is_empty() {
            return Err(Error::Configuration("node_id must not be empty".into()));
        }
        if self.backend == Backend::Sqlite && self.db.is_none() {
            return Err(Error::Configuration("the sqlite backend requires db".into()));
        }
        if self.log_poll.is_zero() {
            return Err(Error::Configuration("log_poll_ms must be positive".into()));
        }
        if let Some(limit) = &self.rate_limit {
            if limit.burst_size == 0 {
                return Err(Error::Configuration("rate_burst must be positive".into()));
            }
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, Error> {
        parse_addr(&self.bind, self.port)
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, Error> {
        parse_addr(&self.bind, self.metrics_port)
    }

    /// Address other nodes use to reach this one
    pub fn advertised_address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_addr(bind: &str, port: u16) -> Result<SocketAddr, Error> {
    format!("{}:{}", bind, port)
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid bind address {}: {}", bind, e)))
}

fn default_node_id(port: u16) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}-{}", host, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::resolve(Args::default(), FileConfig::default()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.ordering, OrderingConfig::default());
        assert!(config.local_ordering);
        assert!(config.rate_limit.is_none());
        assert!(config.node_id.ends_with("-7400"));
    }

    #[test]
    fn test_flags_override_file() {
        let file = FileConfig::parse(
            r#"
            node_id = "from-file"
            port = 7500
            lease_ttl_ms = 30000
            renew_interval_ms = 10000
            "#,
        )
        .unwrap();
        let args = Args::parse_from(["ordod", "--port", "7600"]);

        let config = Config::resolve(args, file).unwrap();
        assert_eq!(config.node_id, "from-file");
        assert_eq!(config.port, 7600);
        assert_eq!(config.ordering.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.ordering.renew_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_renew_must_be_shorter_than_ttl() {
        let args = Args::parse_from(["ordod", "--lease-ttl-ms", "1000", "--renew-interval-ms", "1000"]);
        let err = Config::resolve(args, FileConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_sqlite_requires_db() {
        let file = FileConfig::parse("backend = \"sqlite\"").unwrap();
        let err = Config::resolve(Args::default(), file).unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("db")));
    }

    #[test]
    fn test_sqlite_requires_explicit_node_id() {
        let args = Args::parse_from(["ordod", "--backend", "sqlite", "--db", "/tmp/ordo.db"]);
        let err = Config::resolve(args, FileConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(ref m) if m.contains("node_id")));

        let file = FileConfig::parse("node_id = \"a\"\nbackend = \"sqlite\"\ndb = \"/tmp/ordo.db\"").unwrap();
        let config = Config::resolve(Args::default(), file).unwrap();
        assert_eq!(config.node_id, "a");
        assert_eq!(config.log_poll, DEFAULT_LOG_POLL);
    }

    #[test]
    fn test_unknown_file_keys_are_rejected() {
        assert!(FileConfig::parse("lease_ttl = 5").is_err());
    }

    #[test]
    fn test_rate_burst_defaults_to_double() {
        let args = Args::parse_from(["ordod", "--rate-limit", "25"]);
        let config = Config::resolve(args, FileConfig::default()).unwrap();
        assert_eq!(config.rate_limit, Some(RateLimitConfig::new(25, 50)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ordo.toml");
        std::fs::write(&path, "bind = \"127.0.0.1\"\nlocal_ordering = false\n").unwrap();

        let args = Args::parse_from(["ordod", "--config", path.to_str().unwrap()]);
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.bind, "127.0.0.1");
        assert!(!config.local_ordering);
        assert_eq!(config.listen_addr().unwrap().port(), DEFAULT_PORT);
    }
}
