//! Configuration module for HealthTrail.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Which append-only store backs the observation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Elasticsearch,
    Sqlite,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "elasticsearch" | "es" => Ok(Self::Elasticsearch),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store kind: {}", other)),
        }
    }
}

/// How the monitored dependencies are probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Handshake with each dependency over the network.
    Network,
    /// Ask systemd whether each unit is active.
    Systemd,
}

impl FromStr for ProbeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "network" => Ok(Self::Network),
            "systemd" => Ok(Self::Systemd),
            other => Err(format!("unknown probe mode: {}", other)),
        }
    }
}

/// Connection parameters for one probed dependency.
#[derive(Debug, Clone)]
pub struct DependencyConfig {
    pub host: String,
    pub port: u16,
    /// systemd unit name used in [`ProbeMode::Systemd`]
    pub unit: String,
}

/// PostgreSQL probe parameters.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub endpoint: DependencyConfig,
    pub user: String,
    pub database: String,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 5000)
    pub http_port: u16,
    /// Host name stamped on every observation this process produces
    pub host_name: String,
    /// Name of the pseudo-service carrying the aggregate verdict (default: "rbcapp1")
    pub aggregate_name: String,
    pub store: StoreKind,
    pub es_host: String,
    pub es_port: u16,
    pub es_index: String,
    /// Path to the SQLite database file (default: "healthtrail.db")
    pub db_path: String,
    pub store_timeout: Duration,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    /// Readiness attempts made against the store at start-up, two seconds apart
    pub store_wait_retries: u32,
    pub probe_mode: ProbeMode,
    pub httpd: DependencyConfig,
    pub rabbitmq: DependencyConfig,
    pub postgres: PostgresConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 5000,
            host_name: "localhost".to_string(),
            aggregate_name: "rbcapp1".to_string(),
            store: StoreKind::Elasticsearch,
            es_host: "127.0.0.1".to_string(),
            es_port: 9200,
            es_index: "rbcapp-monitoring".to_string(),
            db_path: "healthtrail.db".to_string(),
            store_timeout: Duration::from_millis(3000),
            probe_timeout: Duration::from_millis(2000),
            request_timeout: Duration::from_millis(10000),
            store_wait_retries: 30,
            probe_mode: ProbeMode::Network,
            httpd: DependencyConfig {
                host: "127.0.0.1".to_string(),
                port: 80,
                unit: "apache2".to_string(),
            },
            rabbitmq: DependencyConfig {
                host: "127.0.0.1".to_string(),
                port: 5672,
                unit: "rabbitmq-server".to_string(),
            },
            postgres: PostgresConfig {
                endpoint: DependencyConfig {
                    host: "127.0.0.1".to_string(),
                    port: 5432,
                    unit: "postgresql".to_string(),
                },
                user: "postgres".to_string(),
                database: "postgres".to_string(),
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `HEALTHTRAIL_HTTP_PORT`: HTTP port (default: 5000)
    /// - `HEALTHTRAIL_HOST_NAME`: reporting host (default: `HOSTNAME`, `/etc/hostname`, "localhost")
    /// - `HEALTHTRAIL_AGGREGATE_NAME`: aggregate pseudo-service (default: "rbcapp1")
    /// - `HEALTHTRAIL_STORE`: "elasticsearch" or "sqlite" (default: "elasticsearch")
    /// - `ELASTICSEARCH_HOST` / `ELASTICSEARCH_PORT` / `ELASTICSEARCH_INDEX`
    /// - `HEALTHTRAIL_DB_PATH`: SQLite file (default: "healthtrail.db")
    /// - `HEALTHTRAIL_STORE_TIMEOUT_MS`, `HEALTHTRAIL_PROBE_TIMEOUT_MS`, `HEALTHTRAIL_REQUEST_TIMEOUT_MS`
    /// - `HEALTHTRAIL_STORE_WAIT_RETRIES`: start-up readiness attempts (default: 30)
    /// - `HEALTHTRAIL_PROBE_MODE`: "network" or "systemd" (default: "network")
    /// - `HTTPD_HOST` / `HTTPD_PORT` / `HTTPD_UNIT`
    /// - `RABBITMQ_HOST` / `RABBITMQ_PORT` / `RABBITMQ_UNIT`
    /// - `POSTGRES_HOST` / `POSTGRES_PORT` / `POSTGRES_USER` / `POSTGRES_DB` / `POSTGRES_UNIT`
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Values that fail to parse are ignored and the default is kept.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        cfg.host_name = lookup("HEALTHTRAIL_HOST_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .or_else(read_etc_hostname)
            .unwrap_or(cfg.host_name);

        set_parsed(&lookup, "HEALTHTRAIL_HTTP_PORT", &mut cfg.http_port);
        set_string(&lookup, "HEALTHTRAIL_AGGREGATE_NAME", &mut cfg.aggregate_name);
        set_parsed(&lookup, "HEALTHTRAIL_STORE", &mut cfg.store);
        set_string(&lookup, "ELASTICSEARCH_HOST", &mut cfg.es_host);
        set_parsed(&lookup, "ELASTICSEARCH_PORT", &mut cfg.es_port);
        set_string(&lookup, "ELASTICSEARCH_INDEX", &mut cfg.es_index);
        set_string(&lookup, "HEALTHTRAIL_DB_PATH", &mut cfg.db_path);
        set_millis(&lookup, "HEALTHTRAIL_STORE_TIMEOUT_MS", &mut cfg.store_timeout);
        set_millis(&lookup, "HEALTHTRAIL_PROBE_TIMEOUT_MS", &mut cfg.probe_timeout);
        set_millis(&lookup, "HEALTHTRAIL_REQUEST_TIMEOUT_MS", &mut cfg.request_timeout);
        set_parsed(&lookup, "HEALTHTRAIL_STORE_WAIT_RETRIES", &mut cfg.store_wait_retries);
        set_parsed(&lookup, "HEALTHTRAIL_PROBE_MODE", &mut cfg.probe_mode);

        load_dependency(&lookup, "HTTPD", &mut cfg.httpd);
        load_dependency(&lookup, "RABBITMQ", &mut cfg.rabbitmq);
        load_dependency(&lookup, "POSTGRES", &mut cfg.postgres.endpoint);
        set_string(&lookup, "POSTGRES_USER", &mut cfg.postgres.user);
        set_string(&lookup, "POSTGRES_DB", &mut cfg.postgres.database);

        cfg
    }

    /// Base URL of the Elasticsearch cluster.
    pub fn es_url(&self) -> String {
        format!("http://{}:{}", self.es_host, self.es_port)
    }
}

fn load_dependency<F>(lookup: &F, prefix: &str, dep: &mut DependencyConfig)
where
    F: Fn(&str) -> Option<String>,
{
    set_string(lookup, &format!("{}_HOST", prefix), &mut dep.host);
    set_parsed(lookup, &format!("{}_PORT", prefix), &mut dep.port);
    set_string(lookup, &format!("{}_UNIT", prefix), &mut dep.unit);
}

fn set_string<F>(lookup: &F, key: &str, slot: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(key) {
        if !value.is_empty() {
            *slot = value;
        }
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key) {
        match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", key, value),
        }
    }
}

fn set_millis<F>(lookup: &F, key: &str, slot: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    let mut millis = slot.as_millis() as u64;
    set_parsed(lookup, key, &mut millis);
    if millis > 0 {
        *slot = Duration::from_millis(millis);
    }
}

fn read_etc_hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
