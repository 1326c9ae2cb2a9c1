//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use gogo_shared::constants::{
    CACHE_LIST_LIMIT, CACHE_TTL_SECS, CHANNEL_SIZE, DEFAULT_HTTP_PORT,
    MIN_DEADLINE_TO_PING_RATIO, PING_INTERVAL_SECS, READ_DEADLINE_SECS, RPC_TIMEOUT_SECS,
};

/// How inbound chat payloads reach the hub's routing stage.
///
/// Fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageMode {
    /// In-process bounded channel.
    Channel,
    /// Durable Redis stream, re-injected by a consumer.
    RedisStream,
    /// Durable Kafka topic, re-injected by a consumer.
    Kafka,
}

impl FromStr for MessageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "channel" => Ok(Self::Channel),
            "redis_stream" | "redis" => Ok(Self::RedisStream),
            "kafka" => Ok(Self::Kafka),
            other => Err(format!("unknown message mode: {other}")),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP / WebSocket server.
    /// Env: `HTTP_ADDR`
    pub http_addr: SocketAddr,

    /// SQLite file holding messages and group snapshots.
    /// Env: `DATABASE_PATH`
    pub database_path: PathBuf,

    /// Redis used for the message cache and the stream broker.
    /// Env: `REDIS_URL`
    /// Default: unset (in-process cache).
    pub redis_url: Option<String>,

    /// Env: `MESSAGE_MODE` (`channel`, `redis_stream`, `kafka`)
    pub message_mode: MessageMode,

    /// Capacity of every bounded channel.
    /// Env: `CHANNEL_SIZE`
    pub channel_size: usize,

    /// Env: `KAFKA_BROKERS`
    pub kafka_brokers: String,
    /// Env: `KAFKA_TOPIC`
    pub kafka_topic: String,
    /// Env: `KAFKA_GROUP`
    pub kafka_group: String,

    /// Number of partitions of the queued transport.
    /// Env: `BROKER_PARTITIONS`
    pub broker_partitions: u32,

    /// Consumer name inside the Redis stream group. Must be stable across
    /// restarts so unacknowledged entries are read again.
    /// Env: `BROKER_CONSUMER`
    pub broker_consumer: String,

    /// Base URL of the relationship lookup service.
    /// Env: `USER_SERVICE_URL`
    pub user_service_url: String,

    /// Base URL of the conversation service.
    /// Env: `SESSION_SERVICE_URL`
    pub session_service_url: String,

    /// Env: `RPC_TIMEOUT_SECS`
    pub rpc_timeout: Duration,

    /// Env: `CACHE_TTL_SECS`
    pub cache_ttl: Duration,

    /// Env: `CACHE_LIST_LIMIT`
    pub cache_list_limit: usize,

    /// Env: `PING_INTERVAL_SECS`
    pub ping_interval: Duration,

    /// Clamped to at least three ping intervals.
    /// Env: `READ_DEADLINE_SECS`
    pub read_deadline: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./gogochat.db"),
            redis_url: None,
            message_mode: MessageMode::Channel,
            channel_size: CHANNEL_SIZE,
            kafka_brokers: "localhost:9092".to_string(),
            kafka_topic: "chat_message".to_string(),
            kafka_group: "chat".to_string(),
            broker_partitions: 3,
            broker_consumer: "gogo-hub".to_string(),
            user_service_url: "http://127.0.0.1:8001".to_string(),
            session_service_url: "http://127.0.0.1:8002".to_string(),
            rpc_timeout: Duration::from_secs(RPC_TIMEOUT_SECS),
            cache_ttl: Duration::from_secs(CACHE_TTL_SECS),
            cache_list_limit: CACHE_LIST_LIMIT,
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            read_deadline: Duration::from_secs(READ_DEADLINE_SECS),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(url) = lookup("REDIS_URL") {
            if !url.is_empty() {
                config.redis_url = Some(url);
            }
        }

        if let Some(mode) = lookup("MESSAGE_MODE") {
            match mode.parse() {
                Ok(parsed) => config.message_mode = parsed,
                Err(e) => tracing::warn!(error = %e, "Invalid MESSAGE_MODE, using channel"),
            }
        }

        parse_into(&lookup, "CHANNEL_SIZE", &mut config.channel_size);
        if config.channel_size == 0 {
            tracing::warn!("CHANNEL_SIZE must be positive, using default");
            config.channel_size = CHANNEL_SIZE;
        }

        if let Some(brokers) = lookup("KAFKA_BROKERS") {
            config.kafka_brokers = brokers;
        }
        if let Some(topic) = lookup("KAFKA_TOPIC") {
            config.kafka_topic = topic;
        }
        if let Some(group) = lookup("KAFKA_GROUP") {
            config.kafka_group = group;
        }
        parse_into(&lookup, "BROKER_PARTITIONS", &mut config.broker_partitions);
        config.broker_partitions = config.broker_partitions.max(1);
        if let Some(consumer) = lookup("BROKER_CONSUMER").filter(|c| !c.trim().is_empty()) {
            config.broker_consumer = consumer.trim().to_string();
        }

        if let Some(url) = lookup("USER_SERVICE_URL") {
            config.user_service_url = url;
        }
        if let Some(url) = lookup("SESSION_SERVICE_URL") {
            config.session_service_url = url;
        }

        parse_secs_into(&lookup, "RPC_TIMEOUT_SECS", &mut config.rpc_timeout);
        parse_secs_into(&lookup, "CACHE_TTL_SECS", &mut config.cache_ttl);
        parse_into(&lookup, "CACHE_LIST_LIMIT", &mut config.cache_list_limit);
        parse_secs_into(&lookup, "PING_INTERVAL_SECS", &mut config.ping_interval);
        parse_secs_into(&lookup, "READ_DEADLINE_SECS", &mut config.read_deadline);

        let min_deadline = config.ping_interval * MIN_DEADLINE_TO_PING_RATIO as u32;
        if config.read_deadline < min_deadline {
            tracing::warn!(
                read_deadline = ?config.read_deadline,
                ping_interval = ?config.ping_interval,
                "Read deadline shorter than three ping intervals, clamping"
            );
            config.read_deadline = min_deadline;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!(key, value = %raw, "Invalid value, using default"),
        }
    }
}

fn parse_secs_into(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    parse_into(lookup, key, &mut secs);
    if secs == 0 {
        tracing::warn!(key, "Duration must be positive, using default");
        return;
    }
    *slot = Duration::from_secs(secs);
}
