use std::fs::File;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    adapters::{
        http::app_state::{AppState, HttpConfig},
        notifications::push_gateway::PushGatewayNotifier,
        webhooks,
    },
    application::ports::{
        identity::IdentityDirectory, notifier::Notifier, provider_client::ProviderClient,
    },
    infra::{
        card_billing_client::CardBillingClient, config::AppConfig, error::InfraError,
        http_client::build_client, postgres_persistence,
        processed_events::RedisProcessedEventStore,
        store_aggregator_client::StoreAggregatorClient, webhook_verifier::WebhookVerifier,
    },
    use_cases::{
        reconciliation::{ReconciliationUseCases, SubscriptionRepoTrait},
        webhook::{ProcessedEventStore, WebhookUseCases},
    },
};

pub async fn init_app_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let postgres_arc = Arc::new(postgres_persistence(&config.database_url).await?);

    let processed_events = Arc::new(
        RedisProcessedEventStore::new(&config.redis_url, config.event_dedup_window_secs)
            .await
            .map_err(InfraError::RedisConnection)?,
    );

    let http = build_client().map_err(InfraError::HttpClient)?;

    let card_billing = Arc::new(CardBillingClient::new(
        http.clone(),
        config.card_billing.api_base.clone(),
        config.card_billing.secret_key.clone(),
        config.card_billing.prices.clone(),
        config.retry,
    ));
    let store_aggregator = Arc::new(StoreAggregatorClient::new(
        http.clone(),
        config.store_aggregator.api_base.clone(),
        config.store_aggregator.api_key.clone(),
        config.retry,
    ));

    if config.push_gateway_url.is_none() {
        tracing::warn!("PUSH_GATEWAY_URL not set, notifications will only be logged");
    }
    let notifier = Arc::new(PushGatewayNotifier::new(
        http,
        config.push_gateway_url.clone(),
    ));

    let repo_arc = postgres_arc.clone() as Arc<dyn SubscriptionRepoTrait>;
    let identity_arc = postgres_arc as Arc<dyn IdentityDirectory>;

    let reconciliation = Arc::new(ReconciliationUseCases::new(
        repo_arc,
        identity_arc,
        vec![
            card_billing as Arc<dyn ProviderClient>,
            store_aggregator as Arc<dyn ProviderClient>,
        ],
        notifier as Arc<dyn Notifier>,
        config.sync_timeout,
    ));

    let webhook_use_cases = WebhookUseCases::new(
        webhooks::dispatcher(),
        processed_events as Arc<dyn ProcessedEventStore>,
        reconciliation.clone(),
    );

    let webhook_verifier = WebhookVerifier::new(
        config.card_billing.webhook_secret.clone(),
        config.store_aggregator.webhook_secret.clone(),
    );

    Ok(AppState {
        config: Arc::new(HttpConfig {
            jwt_secret: config.jwt_secret.clone(),
        }),
        reconciliation,
        webhooks: Arc::new(webhook_use_cases),
        webhook_verifier: Arc::new(webhook_verifier),
    })
}

pub fn init_tracing(log_file: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "entitlement_sync=debug,tower_http=debug".into());

    // Console (pretty logs)
    let console_layer = fmt::layer().with_target(false).with_level(true).pretty();

    // File (structured JSON logs)
    let json_layer = log_file
        .and_then(|path| match File::create(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("cannot create log file {path}: {e}");
                None
            }
        })
        .map(|file| {
            fmt::layer()
                .json()
                .with_writer(file)
                .with_current_span(true)
                .with_span_list(true)
        });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .try_init()
        .ok();
}
