//! Adapter configuration parsed from runtime metadata.
//!
//! The calling runtime hands the adapter a flat map of string key/value
//! pairs at `init`. This module validates required keys, parses numbers and
//! durations, and produces an immutable [`StoreConfig`].
//!
//! Durations accept `ms`, `s` and `m` suffixes; a bare number is read as
//! milliseconds.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Default number of items at or below which bulk calls go item-by-item.
pub const DEFAULT_BULK_THRESHOLD: usize = 5;

/// Backend family an adapter instance talks to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Graph database speaking nGQL (spaces, tags, vertices).
    Graph,
    /// Wide-column database speaking CQL (keyspaces, tables).
    Cql,
}

impl BackendKind {
    /// Default service port for the backend family.
    pub fn default_port(self) -> u16 {
        match self {
            BackendKind::Graph => 9669,
            BackendKind::Cql => 9042,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Graph => write!(f, "graph"),
            BackendKind::Cql => write!(f, "cql"),
        }
    }
}

/// A host/port pair the pool can connect to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Login credentials. `Debug` redacts the password.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Connection pool sizing and timing.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Sessions opened eagerly at init and kept through reaping (default: 1).
    pub min_size: usize,
    /// Upper bound on concurrently open sessions (default: 10).
    pub max_size: usize,
    /// Bound on waiting for a pool slot and on establishing a session (default: 5s).
    pub connect_timeout: Duration,
    /// Bound on a single statement execution (default: 10s).
    pub execute_timeout: Duration,
    /// Idle sessions older than this are closed by the reaper (default: 300s).
    pub idle_timeout: Duration,
    /// Interval of the background health check / reap pass (default: 30s).
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            connect_timeout: Duration::from_secs(5),
            execute_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Retry tuning for session acquisition.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one (default: 3).
    pub max_attempts: u32,
    /// Seed of the backoff curve (default: 100ms).
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Graph-only schema settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphSchema {
    pub partitions: u32,
    pub replicas: u32,
    /// Fixed vertex id length; longer keys are rejected.
    pub vid_length: usize,
}

impl Default for GraphSchema {
    fn default() -> Self {
        Self {
            partitions: 10,
            replicas: 1,
            vid_length: 256,
        }
    }
}

/// Immutable adapter configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub kind: BackendKind,
    pub hosts: Vec<Endpoint>,
    pub credentials: Credentials,
    /// Graph space or CQL keyspace.
    pub namespace: String,
    /// Graph tag or CQL table (default: `state`).
    pub table: String,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub bulk_threshold: usize,
    pub graph: GraphSchema,
    /// CQL keyspace replication factor (default: 1).
    pub replication_factor: u32,
}

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,47}$").expect("identifier pattern is valid")
});

const KNOWN_KEYS: &[&str] = &[
    "hosts",
    "port",
    "username",
    "password",
    "namespace",
    "space",
    "keyspace",
    "table",
    "tag",
    "minPoolSize",
    "maxPoolSize",
    "connectTimeout",
    "executeTimeout",
    "maxRetries",
    "retryBaseDelay",
    "idleTimeout",
    "healthCheckInterval",
    "bulkThreshold",
    "partitions",
    "replicas",
    "vidLength",
    "replicationFactor",
];

impl StoreConfig {
    /// Parse runtime metadata into a validated config.
    pub fn from_metadata(kind: BackendKind, metadata: &HashMap<String, String>) -> StoreResult<Self> {
        for key in metadata.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                debug!(%key, "ignoring unknown metadata key");
            }
        }

        let lookup = |name: &str| {
            metadata
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let port = match lookup("port") {
            Some(raw) => parse_number::<u16>("port", raw)?,
            None => kind.default_port(),
        };
        let hosts = parse_hosts(lookup("hosts").ok_or_else(|| missing("hosts"))?, port)?;

        let namespace = lookup("namespace")
            .or_else(|| lookup("space"))
            .or_else(|| lookup("keyspace"))
            .ok_or_else(|| missing("namespace"))?
            .to_string();
        validate_identifier("namespace", &namespace)?;

        let table = lookup("table")
            .or_else(|| lookup("tag"))
            .unwrap_or("state")
            .to_string();
        validate_identifier("table", &table)?;

        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            min_size: opt_number("minPoolSize", lookup("minPoolSize"))?.unwrap_or(defaults.min_size),
            max_size: opt_number("maxPoolSize", lookup("maxPoolSize"))?.unwrap_or(defaults.max_size),
            connect_timeout: opt_duration("connectTimeout", lookup("connectTimeout"))?
                .unwrap_or(defaults.connect_timeout),
            execute_timeout: opt_duration("executeTimeout", lookup("executeTimeout"))?
                .unwrap_or(defaults.execute_timeout),
            idle_timeout: opt_duration("idleTimeout", lookup("idleTimeout"))?
                .unwrap_or(defaults.idle_timeout),
            health_check_interval: opt_duration("healthCheckInterval", lookup("healthCheckInterval"))?
                .unwrap_or(defaults.health_check_interval),
        };
        if pool.max_size == 0 {
            return Err(StoreError::Config("maxPoolSize must be at least 1".into()));
        }
        if pool.max_size > Semaphore::MAX_PERMITS {
            return Err(StoreError::Config(format!(
                "maxPoolSize ({}) exceeds {}",
                pool.max_size,
                Semaphore::MAX_PERMITS
            )));
        }
        if pool.min_size > pool.max_size {
            return Err(StoreError::Config(format!(
                "minPoolSize ({}) exceeds maxPoolSize ({})",
                pool.min_size, pool.max_size
            )));
        }

        let retry_defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_attempts: opt_number("maxRetries", lookup("maxRetries"))?
                .unwrap_or(retry_defaults.max_attempts)
                .max(1),
            base_delay: opt_duration("retryBaseDelay", lookup("retryBaseDelay"))?
                .unwrap_or(retry_defaults.base_delay),
        };

        let graph_defaults = GraphSchema::default();
        let graph = GraphSchema {
            partitions: opt_number("partitions", lookup("partitions"))?.unwrap_or(graph_defaults.partitions),
            replicas: opt_number("replicas", lookup("replicas"))?.unwrap_or(graph_defaults.replicas),
            vid_length: opt_number("vidLength", lookup("vidLength"))?.unwrap_or(graph_defaults.vid_length),
        };

        Ok(Self {
            kind,
            hosts,
            credentials: Credentials {
                username: lookup("username").unwrap_or_default().to_string(),
                password: metadata.get("password").cloned().unwrap_or_default(),
            },
            namespace,
            table,
            pool,
            retry,
            bulk_threshold: opt_number("bulkThreshold", lookup("bulkThreshold"))?
                .unwrap_or(DEFAULT_BULK_THRESHOLD),
            graph,
            replication_factor: opt_number("replicationFactor", lookup("replicationFactor"))?
                .unwrap_or(1),
        })
    }

    /// Parse a TOML table of scalar values into a validated config.
    ///
    /// Strings, integers, floats and booleans are flattened to their string
    /// form; arrays of strings are joined with commas (so `hosts` may be
    /// written as a list).
    pub fn from_toml_str(kind: BackendKind, content: &str) -> StoreResult<Self> {
        let table: toml::Table = toml::from_str(content)
            .map_err(|e| StoreError::Config(format!("invalid toml: {e}")))?;
        let mut metadata = HashMap::new();
        for (key, value) in table {
            let flat = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        toml::Value::String(s) => Ok(s.clone()),
                        other => Err(StoreError::Config(format!(
                            "{key}: unsupported array element {other}"
                        ))),
                    })
                    .collect::<StoreResult<Vec<_>>>()?
                    .join(","),
                other => {
                    return Err(StoreError::Config(format!(
                        "{key}: unsupported value {other}"
                    )));
                }
            };
            metadata.insert(key, flat);
        }
        Self::from_metadata(kind, &metadata)
    }
}

fn missing(key: &str) -> StoreError {
    StoreError::Config(format!("missing required metadata key `{key}`"))
}

fn validate_identifier(key: &str, value: &str) -> StoreResult<()> {
    if IDENTIFIER.is_match(value) {
        Ok(())
    } else {
        Err(StoreError::Config(format!(
            "{key} `{value}` must start with a letter or underscore and contain only [A-Za-z0-9_]"
        )))
    }
}

/// Parse `host[:port],host[:port]` into endpoints, filling in `default_port`.
fn parse_hosts(raw: &str, default_port: u16) -> StoreResult<Vec<Endpoint>> {
    let mut hosts = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let endpoint = match item.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.ends_with(':') => Endpoint {
                host: host.to_string(),
                port: parse_number("hosts", port)?,
            },
            _ => Endpoint {
                host: item.to_string(),
                port: default_port,
            },
        };
        hosts.push(endpoint);
    }
    if hosts.is_empty() {
        return Err(missing("hosts"));
    }
    Ok(hosts)
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> StoreResult<T> {
    raw.parse::<T>()
        .map_err(|_| StoreError::Config(format!("{key}: `{raw}` is not a valid number")))
}

fn opt_number<T: std::str::FromStr>(key: &str, raw: Option<&str>) -> StoreResult<Option<T>> {
    raw.map(|r| parse_number(key, r)).transpose()
}

fn opt_duration(key: &str, raw: Option<&str>) -> StoreResult<Option<Duration>> {
    raw.map(|r| parse_duration(r).ok_or_else(|| {
        StoreError::Config(format!("{key}: `{r}` is not a valid duration"))
    }))
    .transpose()
}

/// Parse `250ms`, `5s`, `2m`, or a bare millisecond count.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_millis)
    }
}
