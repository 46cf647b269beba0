//! Provider webhook payloads, translated into reconciliation events.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::{
    app_error::{AppError, AppResult},
    domain::entities::provider::Provider,
    use_cases::webhook::{EventDispatcher, InboundEvent},
};

pub mod card_billing;
pub mod store_aggregator;

/// Dispatcher with every supported provider event registered.
pub fn dispatcher() -> EventDispatcher {
    EventDispatcher::new()
        .with_handlers(Provider::CardBilling, card_billing::HANDLERS)
        .with_handlers(Provider::StoreAggregator, store_aggregator::HANDLERS)
}

pub fn parse_envelope(
    provider: Provider,
    body: &[u8],
    received_at: DateTime<Utc>,
) -> AppResult<InboundEvent> {
    match provider {
        Provider::CardBilling => card_billing::parse_envelope(body, received_at),
        Provider::StoreAggregator => store_aggregator::parse_envelope(body, received_at),
    }
}

/// Deserialize a payload field, reporting failures as validation errors.
fn field<T: DeserializeOwned>(event: &InboundEvent, name: &str) -> AppResult<T> {
    let value = event
        .payload
        .get(name)
        .cloned()
        .ok_or_else(|| AppError::Validation(format!("{} payload missing `{}`", event.event_type, name)))?;
    serde_json::from_value(value)
        .map_err(|e| AppError::Validation(format!("{} payload `{}`: {}", event.event_type, name, e)))
}
