use std::net::SocketAddr;

use axum::http::HeaderValue;
use env_helpers::{get_env, get_env_default};
use secrecy::SecretString;
use url::Url;

use crate::infra::{card_billing_client::PlanPrices, error::InfraError, retry::RetryPolicy};

pub struct CardBillingSettings {
    pub api_base: Url,
    pub secret_key: SecretString,
    /// Unset means deliveries are accepted without signature checks.
    pub webhook_secret: Option<SecretString>,
    pub prices: PlanPrices,
}

pub struct StoreAggregatorSettings {
    pub api_base: Url,
    pub api_key: SecretString,
    /// Unset means deliveries are accepted without signature checks.
    pub webhook_secret: Option<SecretString>,
}

pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: SecretString,
    pub cors_origin: HeaderValue,
    pub card_billing: CardBillingSettings,
    pub store_aggregator: StoreAggregatorSettings,
    pub retry: RetryPolicy,
    /// Upper bound for a whole pull sync, retries included.
    pub sync_timeout: std::time::Duration,
    pub event_dedup_window_secs: u64,
    pub lapse_sweep_interval: std::time::Duration,
    /// How far ahead of `current_period_end` the sweep starts rechecking.
    pub lapse_lookahead: chrono::Duration,
    /// Notifications are only logged when unset.
    pub push_gateway_url: Option<Url>,
    /// JSON log file; console only when unset.
    pub log_file: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, InfraError> {
        let bind_addr: SocketAddr = get_env_default(
            "BIND_ADDR",
            SocketAddr::from(([127, 0, 0, 1], 3001)),
        );
        let database_url: String = get_env("DATABASE_URL");
        let redis_url: String = get_env_default("REDIS_URL", "redis://127.0.0.1:6379".to_string());
        let jwt_secret = SecretString::new(get_env::<String>("JWT_SECRET").into());
        let cors_origin: HeaderValue =
            get_env_default("CORS_ORIGIN", String::from("http://localhost:3000"))
                .parse()
                .map_err(|_| InfraError::ConfigInvalid { var: "CORS_ORIGIN" })?;

        let card_billing = CardBillingSettings {
            api_base: get_env("CARD_BILLING_API_BASE"),
            secret_key: SecretString::new(get_env::<String>("CARD_BILLING_SECRET_KEY").into()),
            webhook_secret: optional_secret("CARD_BILLING_WEBHOOK_SECRET"),
            prices: PlanPrices {
                weekly: optional_var("CARD_BILLING_PRICE_WEEKLY"),
                monthly: optional_var("CARD_BILLING_PRICE_MONTHLY"),
                yearly: optional_var("CARD_BILLING_PRICE_YEARLY"),
            },
        };

        let store_aggregator = StoreAggregatorSettings {
            api_base: get_env("STORE_AGGREGATOR_API_BASE"),
            api_key: SecretString::new(get_env::<String>("STORE_AGGREGATOR_API_KEY").into()),
            webhook_secret: optional_secret("STORE_AGGREGATOR_WEBHOOK_SECRET"),
        };

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_retries: get_env_default("PROVIDER_MAX_RETRIES", defaults.max_retries),
            base_delay_ms: get_env_default("PROVIDER_RETRY_BASE_MS", defaults.base_delay_ms),
            max_delay_ms: get_env_default("PROVIDER_RETRY_MAX_MS", defaults.max_delay_ms),
        };

        let sync_timeout_secs: u64 = get_env_default("SYNC_TIMEOUT_SECS", 8);
        let event_dedup_window_secs: u64 = get_env_default("EVENT_DEDUP_WINDOW_SECS", 72 * 3600);
        let lapse_sweep_interval_secs: u64 = get_env_default("LAPSE_SWEEP_INTERVAL_SECS", 300);
        let lapse_lookahead_secs: i64 = get_env_default("LAPSE_LOOKAHEAD_SECS", 3600);

        let push_gateway_url: Option<Url> = std::env::var("PUSH_GATEWAY_URL")
            .ok()
            .and_then(|s| s.parse().ok());
        let log_file = optional_var("LOG_FILE");

        Ok(Self {
            bind_addr,
            database_url,
            redis_url,
            jwt_secret,
            cors_origin,
            card_billing,
            store_aggregator,
            retry,
            sync_timeout: std::time::Duration::from_secs(sync_timeout_secs),
            event_dedup_window_secs,
            lapse_sweep_interval: std::time::Duration::from_secs(lapse_sweep_interval_secs.max(1)),
            lapse_lookahead: chrono::Duration::seconds(lapse_lookahead_secs.max(0)),
            push_gateway_url,
            log_file,
        })
    }
}

fn optional_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn optional_secret(key: &str) -> Option<SecretString> {
    optional_var(key).map(|v| SecretString::new(v.into()))
}
