//! Process configuration loaded from the environment.

use std::env;

use anyhow::Result;

use crate::trading::ReplicationConfig;

/// Production and sandbox endpoints of the broker's order API.
const BROKER_PROD_URL: &str = "https://dataservice.iifl.in/openapi/prod";
const BROKER_SANDBOX_URL: &str = "https://dataservice.iifl.in/openapi/uat";

/// Everything the process needs to assemble the component graph.
#[derive(Debug, Clone)]
pub struct Config {
    /// sqlx database URL.
    pub database_url: String,

    /// Broker HTTPS endpoint; `broker_sandbox` flips to the UAT host.
    pub broker_base_url: String,
    pub broker_sandbox: bool,

    /// Key for unsealing stored broker credentials, base64-encoded 32
    /// bytes. Required by every command that touches the vault.
    pub vault_key_b64: Option<String>,

    /// tracing filter, e.g. "info" or "copyrelay=debug".
    pub log_level: String,

    pub replication: ReplicationConfig,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load from the environment, falling back to defaults for every knob.
    ///
    /// `VAULT_KEY` has no default: sealed credentials are unreadable
    /// without it.
    pub fn from_env() -> Result<Self> {
        let defaults = ReplicationConfig::default();
        let replication = ReplicationConfig {
            max_in_flight_broker_calls: env_parse(
                "MAX_IN_FLIGHT_BROKER_CALLS",
                defaults.max_in_flight_broker_calls,
            ),
            dispatch_timeout_ms: env_parse("DISPATCH_TIMEOUT_MS", defaults.dispatch_timeout_ms),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),
            retry_base_ms: env_parse("RETRY_BASE_MS", defaults.retry_base_ms),
            retry_cap_ms: env_parse("RETRY_CAP_MS", defaults.retry_cap_ms),
            retry_jitter_pct: env_parse("RETRY_JITTER_PCT", defaults.retry_jitter_pct),
            follower_snapshot_ttl_ms: env_parse(
                "FOLLOWER_SNAPSHOT_TTL_MS",
                defaults.follower_snapshot_ttl_ms,
            ),
            worker_pool_multiplier: env_parse(
                "WORKER_POOL_MULTIPLIER",
                defaults.worker_pool_multiplier,
            ),
            session_refresh_guard_ms: env_parse(
                "SESSION_REFRESH_GUARD_MS",
                defaults.session_refresh_guard_ms,
            ),
            reconcile_interval_ms: env_parse(
                "RECONCILE_INTERVAL_MS",
                defaults.reconcile_interval_ms,
            ),
            reconcile_max_attempts: env_parse(
                "RECONCILE_MAX_ATTEMPTS",
                defaults.reconcile_max_attempts,
            ),
            follower_lock_stripes: defaults.follower_lock_stripes,
        };

        let broker_sandbox = env_parse("BROKER_SANDBOX", false);
        let broker_base_url = env::var("BROKER_BASE_URL").unwrap_or_else(|_| {
            if broker_sandbox {
                BROKER_SANDBOX_URL.to_string()
            } else {
                BROKER_PROD_URL.to_string()
            }
        });

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:copyrelay.db".to_string()),
            broker_base_url,
            broker_sandbox,
            vault_key_b64: env::var("VAULT_KEY").ok(),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            replication,
        })
    }
}
