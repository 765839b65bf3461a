//! # Relay Configuration
//!
//! Load order: built-in defaults, then an optional JSON file, then
//! environment overrides, then validation. Every field has a serde default so
//! a config file only needs to mention what it changes.

mod errors;

pub use errors::{ConfigError, ConfigResult};

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub durable_log: DurableLogConfig,
    pub rate_limit: RateLimitConfig,
    pub connection: ConnectionConfig,
    pub consumer: ConsumerConfig,
    pub hub: HubConfig,
    pub logging: LoggingConfig,
    /// Accepted values of the `X-API-Key` header
    pub api_keys: Vec<String>,
    pub transform_stage: TransformStage,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to (default: "0.0.0.0")
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to (default: 8000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// CORS allowed origins; empty means permissive
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which durable log implementation backs the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogBackendKind {
    /// In-process log; state is lost on restart
    #[default]
    Memory,
    /// Apache Kafka (requires the `kafka` cargo feature)
    Kafka,
}

/// Durable log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableLogConfig {
    #[serde(default)]
    pub backend: LogBackendKind,

    /// Comma separated broker list
    #[serde(default = "default_brokers")]
    pub brokers: String,

    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Bounded wait for a delivery acknowledgment (default: 30s)
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Most records the in-process log keeps, committed or not (default: 100000)
    #[serde(default = "default_retention_records")]
    pub retention_records: usize,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_topic() -> String {
    "streamrelay".to_string()
}

fn default_group_id() -> String {
    "streamrelay".to_string()
}

fn default_delivery_timeout_ms() -> u64 {
    30_000
}

fn default_retention_records() -> usize {
    100_000
}

impl Default for DurableLogConfig {
    fn default() -> Self {
        Self {
            backend: LogBackendKind::default(),
            brokers: default_brokers(),
            topic: default_topic(),
            group_id: default_group_id(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            retention_records: default_retention_records(),
        }
    }
}

impl DurableLogConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Token bucket parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained rate in requests per second
    #[serde(default = "default_rate")]
    pub rate_per_sec: f64,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Upper bound on tracked client keys; least recently used are dropped
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,

    /// Buckets untouched for this long are swept
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

fn default_rate() -> f64 {
    10.0
}

fn default_burst() -> u32 {
    20
}

fn default_max_keys() -> usize {
    100_000
}

fn default_idle_ttl_secs() -> u64 {
    600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: default_rate(),
            burst: default_burst(),
            max_keys: default_max_keys(),
            idle_ttl_secs: default_idle_ttl_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst,
            ..Default::default()
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// Subscriber connection constants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Outbound frames buffered per subscriber
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Read liveness deadline
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Largest inbound frame accepted
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_write_timeout_secs() -> u64 {
    10
}

fn default_max_frame_bytes() -> usize {
    512
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            read_timeout_secs: default_read_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ConnectionConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Probe period is 9/10 of the read deadline
    pub fn probe_period(&self) -> Duration {
        self.read_timeout() * 9 / 10
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Read-loop backoff of the durable log consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5_000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Registry housekeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Prune subscriber-less streams idle for this long; `None` keeps them forever
    #[serde(default)]
    pub stream_idle_ttl_secs: Option<u64>,

    /// How often the maintenance task runs
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

fn default_maintenance_interval_secs() -> u64 {
    30
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            stream_idle_ttl_secs: None,
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl HubConfig {
    pub fn stream_idle_ttl(&self) -> Option<Duration> {
        self.stream_idle_ttl_secs.map(Duration::from_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Where the uppercase/timestamp transform runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStage {
    /// Ingress canonicalizes; the consumer transforms before broadcast
    #[default]
    Consumer,
    /// Ingress transforms before producing; the consumer passes through
    Ingress,
}

impl RelayConfig {
    /// Load from an optional file, apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(port) = lookup("API_PORT") {
            self.server.port = parse_env("API_PORT", &port)?;
        }
        if let Some(keys) = lookup("API_KEYS").or_else(|| lookup("API_KEY")) {
            self.api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(brokers) = lookup("KAFKA_BROKERS") {
            self.durable_log.brokers = brokers;
        }
        if let Some(topic) = lookup("KAFKA_TOPIC") {
            self.durable_log.topic = topic;
        }
        if let Some(group) = lookup("KAFKA_GROUP_ID") {
            self.durable_log.group_id = group;
        }
        if let Some(rate) = lookup("RATE_LIMIT_RATE") {
            self.rate_limit.rate_per_sec = parse_env("RATE_LIMIT_RATE", &rate)?;
        }
        if let Some(burst) = lookup("RATE_LIMIT_BURST") {
            self.rate_limit.burst = parse_env("RATE_LIMIT_BURST", &burst)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Reject configurations the relay cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.api_keys.is_empty() {
            return Err(ConfigError::invalid("api_keys", "at least one key is required"));
        }
        if self.durable_log.topic.trim().is_empty() {
            return Err(ConfigError::invalid("durable_log.topic", "must not be empty"));
        }
        if self.durable_log.delivery_timeout_ms == 0 {
            return Err(ConfigError::invalid("durable_log.delivery_timeout_ms", "must be > 0"));
        }
        if self.durable_log.retention_records == 0 {
            return Err(ConfigError::invalid("durable_log.retention_records", "must be > 0"));
        }
        if self.durable_log.backend == LogBackendKind::Kafka && !cfg!(feature = "kafka") {
            return Err(ConfigError::invalid(
                "durable_log.backend",
                "kafka backend requires the `kafka` feature",
            ));
        }
        if self.rate_limit.rate_per_sec <= 0.0 || !self.rate_limit.rate_per_sec.is_finite() {
            return Err(ConfigError::invalid("rate_limit.rate_per_sec", "must be a positive number"));
        }
        if self.rate_limit.burst == 0 {
            return Err(ConfigError::invalid("rate_limit.burst", "must be > 0"));
        }
        if self.rate_limit.max_keys == 0 {
            return Err(ConfigError::invalid("rate_limit.max_keys", "must be > 0"));
        }
        if self.connection.queue_capacity == 0 {
            return Err(ConfigError::invalid("connection.queue_capacity", "must be > 0"));
        }
        if self.connection.read_timeout_secs == 0 || self.connection.write_timeout_secs == 0 {
            return Err(ConfigError::invalid("connection", "timeouts must be > 0"));
        }
        if self.consumer.backoff_initial_ms == 0
            || self.consumer.backoff_max_ms < self.consumer.backoff_initial_ms
        {
            return Err(ConfigError::invalid(
                "consumer",
                "backoff_initial_ms must be > 0 and <= backoff_max_ms",
            ));
        }
        if self.hub.maintenance_interval_secs == 0 {
            return Err(ConfigError::invalid("hub.maintenance_interval_secs", "must be > 0"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}
