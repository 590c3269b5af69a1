//! `key=value` configuration files.
//!
//! Two profiles share the same syntax: the RPC/registry config
//! (`mprpc.conf`) and the connection-pool config (`mysql.conf`).
//! Lines starting with `#` and blank lines are ignored; keys and values
//! are trimmed of surrounding whitespace.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Errors raised while loading or reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be opened or read.
    #[error("config file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// A required key is absent.
    #[error("config key `{0}` is missing")]
    MissingKey(&'static str),
    /// A key is present but does not parse as the requested type.
    #[error("config key `{key}` has invalid value `{value}`")]
    InvalidValue { key: &'static str, value: String },
}

/// Parsed `key=value` configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    entries: HashMap<String, String>,
}

impl Config {
    /// Load a config file from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// Parse config text. Unparseable lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(line, "ignoring config line without `=`");
                continue;
            };
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Override one entry (command-line positionals beat the file).
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Required string key.
    pub fn require(&self, key: &'static str) -> Result<&str, ConfigError> {
        self.get(key).ok_or(ConfigError::MissingKey(key))
    }

    /// Required key parsed into `T`.
    pub fn require_parsed<T: std::str::FromStr>(&self, key: &'static str) -> Result<T, ConfigError> {
        let raw = self.require(key)?;
        raw.parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw.to_string() })
    }

    /// Optional key parsed into `T`, falling back to `default`.
    pub fn parsed_or<T: std::str::FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key, value: raw.to_string() }),
        }
    }

    /// `rpcserverip:rpcserverport` as one address string.
    pub fn rpc_server_addr(&self) -> Result<String, ConfigError> {
        let ip = self.require("rpcserverip")?;
        let port: u16 = self.require_parsed("rpcserverport")?;
        Ok(format!("{ip}:{port}"))
    }

    /// `zookeeperip:zookeeperport` as one address string.
    pub fn registry_addr(&self) -> Result<String, ConfigError> {
        let ip = self.require("zookeeperip")?;
        let port: u16 = self.require_parsed("zookeeperport")?;
        Ok(format!("{ip}:{port}"))
    }

    /// Provider worker cap, default 4.
    pub fn rpc_workers(&self) -> Result<usize, ConfigError> {
        self.parsed_or("rpcworkers", 4)
    }
}

/// Connection-pool settings, loaded from `mysql.conf`.
///
/// Any missing key falls back to its default; a missing file yields the
/// full default set.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub dbname: String,
    /// Connections opened at construction.
    pub init_size: usize,
    /// Hard cap on total connections.
    pub max_size: usize,
    /// Idle connections older than this are reaped.
    pub max_idle_time: Duration,
    /// Upper bound on a single acquisition.
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: "123456".to_string(),
            dbname: "chat".to_string(),
            init_size: 10,
            max_size: 1024,
            max_idle_time: Duration::from_secs(60),
            connection_timeout: Duration::from_millis(10_000),
        }
    }
}

impl PoolConfig {
    /// Load from a `mysql.conf`-style file, defaulting when absent.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "pool config missing, using defaults");
            return Ok(Self::default());
        }
        Ok(Self::from_config(&Config::load(path)?))
    }

    /// Build from an already-parsed [`Config`], defaulting missing keys.
    pub fn from_config(cfg: &Config) -> Self {
        let d = Self::default();
        let parse = |key: &str, fallback: u64| {
            cfg.get(key).and_then(|v| v.parse().ok()).unwrap_or(fallback)
        };
        Self {
            ip: cfg.get("ip").unwrap_or(&d.ip).to_string(),
            port: cfg.get("port").and_then(|v| v.parse().ok()).unwrap_or(d.port),
            username: cfg.get("username").unwrap_or(&d.username).to_string(),
            password: cfg.get("password").unwrap_or(&d.password).to_string(),
            dbname: cfg.get("dbname").unwrap_or(&d.dbname).to_string(),
            init_size: parse("initSize", d.init_size as u64) as usize,
            max_size: parse("maxSize", d.max_size as u64) as usize,
            max_idle_time: Duration::from_secs(parse("maxIdleTime", d.max_idle_time.as_secs())),
            connection_timeout: Duration::from_millis(parse(
                "connectionTimeOut",
                d.connection_timeout.as_millis() as u64,
            )),
        }
    }
}
