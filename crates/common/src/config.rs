use std::str::FromStr;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
///
/// Credentials (sink API key, producer API keys) are only ever read from the
/// environment; nothing secret has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string. When absent the in-memory store is used.
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the ingress/admin API listens on (default: 3000)
    pub api_port: u16,

    /// Accepted `X-API-Key` values for producers. Empty disables the check.
    pub ingress_api_keys: Vec<String>,

    /// Delivery attempts before a notification is failed permanently (default: 8)
    pub max_attempts: i32,

    /// Backoff base delay in milliseconds (default: 1000)
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds (default: 300000 = 5 min)
    pub backoff_cap_ms: u64,

    /// Upper bound of the random jitter added to each backoff (default: 1000)
    pub backoff_jitter_ms: u64,

    /// Number of concurrent dispatcher workers (default: 4)
    pub dispatcher_workers: usize,

    /// Notifications claimed per worker batch (default: 16)
    pub dispatcher_batch_size: usize,

    /// Idle sleep between empty claims in milliseconds (default: 500)
    pub dispatcher_poll_interval_ms: u64,

    /// Per-send timeout in milliseconds (default: 10000)
    pub send_timeout_ms: u64,

    /// Age after which an in-flight claim is considered abandoned (default: 60)
    pub stale_after_secs: u64,

    /// Interval of the stale-claim recovery sweep (default: 30)
    pub sweep_interval_secs: u64,

    /// Whether the API process also runs the dispatcher (default: true)
    pub run_dispatcher: bool,

    /// Sink provider: `sendgrid`, `webhook` or `log` (default: `log`)
    pub sink_provider: String,

    /// API key for the sink provider
    pub sink_api_key: Option<String>,

    /// Endpoint override for the sink provider (required for `webhook`)
    pub sink_endpoint: Option<String>,

    /// Email sender address
    pub email_from: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Self {
            database_url: optional("DATABASE_URL"),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 20)?,
            api_port: parse_or("API_PORT", 3000)?,
            ingress_api_keys: optional("INGRESS_API_KEYS")
                .map(|keys| split_list(&keys))
                .unwrap_or_default(),
            max_attempts: parse_or("MAX_ATTEMPTS", 8)?,
            backoff_base_ms: parse_or("BACKOFF_BASE_MS", 1_000)?,
            backoff_cap_ms: parse_or("BACKOFF_CAP_MS", 300_000)?,
            backoff_jitter_ms: parse_or("BACKOFF_JITTER_MS", 1_000)?,
            dispatcher_workers: parse_or("DISPATCHER_WORKERS", 4)?,
            dispatcher_batch_size: parse_or("DISPATCHER_BATCH_SIZE", 16)?,
            dispatcher_poll_interval_ms: parse_or("DISPATCHER_POLL_INTERVAL_MS", 500)?,
            send_timeout_ms: parse_or("SEND_TIMEOUT_MS", 10_000)?,
            stale_after_secs: parse_or("STALE_AFTER_SECS", 60)?,
            sweep_interval_secs: parse_or("SWEEP_INTERVAL_SECS", 30)?,
            run_dispatcher: parse_or("RUN_DISPATCHER", true)?,
            sink_provider: optional("SINK_PROVIDER").unwrap_or_else(|| "log".to_string()),
            sink_api_key: optional("SINK_API_KEY"),
            sink_endpoint: optional("SINK_ENDPOINT"),
            email_from: optional("EMAIL_FROM"),
        }
        .validated()
    }

    /// Reject combinations that cannot work at runtime.
    pub fn validated(self) -> anyhow::Result<Self> {
        if self.max_attempts < 1 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }
        if self.dispatcher_workers == 0 {
            anyhow::bail!("DISPATCHER_WORKERS must be at least 1");
        }
        if self.dispatcher_batch_size == 0 {
            anyhow::bail!("DISPATCHER_BATCH_SIZE must be at least 1");
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            anyhow::bail!("BACKOFF_CAP_MS must not be smaller than BACKOFF_BASE_MS");
        }
        // Workers renew their claims before each send, so a live claim is at
        // most one send old when the sweeper looks at it.
        if self.stale_after_secs.saturating_mul(1_000) < self.send_timeout_ms.saturating_mul(2) {
            anyhow::bail!("STALE_AFTER_SECS must be at least twice SEND_TIMEOUT_MS");
        }
        Ok(self)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 20,
            api_port: 3000,
            ingress_api_keys: Vec::new(),
            max_attempts: 8,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            backoff_jitter_ms: 1_000,
            dispatcher_workers: 4,
            dispatcher_batch_size: 16,
            dispatcher_poll_interval_ms: 500,
            send_timeout_ms: 10_000,
            stale_after_secs: 60,
            sweep_interval_secs: 30,
            run_dispatcher: true,
            sink_provider: "log".to_string(),
            sink_api_key: None,
            sink_endpoint: None,
            email_from: None,
        }
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match optional(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        }),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
