use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Socket address the API server binds to (default: 0.0.0.0:3000)
    pub bind_addr: String,

    /// PostgreSQL connection string. In-memory storage is used when unset.
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Seconds a store call waits for a pooled connection (default: 5)
    pub db_acquire_timeout_secs: u64,

    /// Redis connection string. Redis event ingestion is disabled when unset.
    pub redis_url: Option<String>,

    /// Redis list that collaborators push JSON events onto
    pub redis_event_key: String,

    /// JWT secret for API and live-channel authentication
    pub jwt_secret: String,

    /// JSON file with rule definitions (built-in defaults when unset)
    pub rules_path: Option<String>,

    /// JSON file with template definitions (built-in defaults when unset)
    pub templates_path: Option<String>,

    /// Live connection heartbeat interval in seconds; connections silent for
    /// twice this long are closed (default: 30)
    pub heartbeat_interval_secs: u64,

    /// Stale-connection sweep period in seconds (default: 10)
    pub sweep_interval_secs: u64,

    /// Capacity of each bounded queue between pipeline stages (default: 1024)
    pub pipeline_queue_capacity: usize,

    /// Capacity of each per-channel send queue (default: 512)
    pub channel_queue_capacity: usize,

    /// Fixed delay between delivery retries in milliseconds (default: 500)
    pub retry_delay_ms: u64,

    /// Additional attempts after a transient failure (default: 2)
    pub max_retries: u32,

    /// Consecutive permanent failures before a channel is disabled (default: 3)
    pub permanent_failure_threshold: u32,

    /// Whether urgent notifications also ignore the daily frequency cap (default: false)
    pub urgent_bypasses_frequency_cap: bool,

    /// Offset of subscriber-local time from UTC, in minutes (default: 0)
    pub local_utc_offset_minutes: i32,

    /// Mobile push gateway webhook
    pub push_webhook_url: Option<String>,

    /// Push gateway quota, sends per minute (default: 100)
    pub push_rate_per_minute: u32,

    /// Email gateway webhook
    pub email_webhook_url: Option<String>,

    /// Email gateway quota, sends per minute (default: 60)
    pub email_rate_per_minute: u32,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            bind_addr: std::env::var("HERALD_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 20)?,
            db_acquire_timeout_secs: parse_env("DB_ACQUIRE_TIMEOUT_SECS", 5)?,
            redis_url: std::env::var("REDIS_URL").ok(),
            redis_event_key: std::env::var("REDIS_EVENT_KEY")
                .unwrap_or_else(|_| "herald:events".to_string()),
            jwt_secret: std::env::var("JWT_SECRET")
                .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required"))?,
            rules_path: std::env::var("RULES_PATH").ok(),
            templates_path: std::env::var("TEMPLATES_PATH").ok(),
            heartbeat_interval_secs: parse_env("HEARTBEAT_INTERVAL_SECS", 30)?,
            sweep_interval_secs: parse_env("SWEEP_INTERVAL_SECS", 10)?,
            pipeline_queue_capacity: parse_env("PIPELINE_QUEUE_CAPACITY", 1024)?,
            channel_queue_capacity: parse_env("CHANNEL_QUEUE_CAPACITY", 512)?,
            retry_delay_ms: parse_env("RETRY_DELAY_MS", 500)?,
            max_retries: parse_env("MAX_RETRIES", 2)?,
            permanent_failure_threshold: parse_env("PERMANENT_FAILURE_THRESHOLD", 3)?,
            urgent_bypasses_frequency_cap: parse_env("URGENT_BYPASSES_FREQUENCY_CAP", false)?,
            local_utc_offset_minutes: parse_env("LOCAL_UTC_OFFSET_MINUTES", 0)?,
            push_webhook_url: std::env::var("PUSH_WEBHOOK_URL").ok(),
            push_rate_per_minute: parse_env("PUSH_RATE_PER_MINUTE", 100)?,
            email_webhook_url: std::env::var("EMAIL_WEBHOOK_URL").ok(),
            email_rate_per_minute: parse_env("EMAIL_RATE_PER_MINUTE", 60)?,
        })
    }

    /// Subscriber-local timezone used for quiet hours, active windows and daily resets.
    pub fn local_offset(&self) -> anyhow::Result<chrono::FixedOffset> {
        chrono::FixedOffset::east_opt(self.local_utc_offset_minutes * 60).ok_or_else(|| {
            anyhow::anyhow!(
                "LOCAL_UTC_OFFSET_MINUTES out of range: {}",
                self.local_utc_offset_minutes
            )
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            database_url: None,
            db_max_connections: 20,
            db_acquire_timeout_secs: 5,
            redis_url: None,
            redis_event_key: "herald:events".to_string(),
            jwt_secret: String::new(),
            rules_path: None,
            templates_path: None,
            heartbeat_interval_secs: 30,
            sweep_interval_secs: 10,
            pipeline_queue_capacity: 1024,
            channel_queue_capacity: 512,
            retry_delay_ms: 500,
            max_retries: 2,
            permanent_failure_threshold: 3,
            urgent_bypasses_frequency_cap: false,
            local_utc_offset_minutes: 0,
            push_webhook_url: None,
            push_rate_per_minute: 100,
            email_webhook_url: None,
            email_rate_per_minute: 60,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
