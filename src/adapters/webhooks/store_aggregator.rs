use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    domain::entities::{
        provider::Provider,
        reconcile_event::{EventKind, ProviderSubscription, ReconcileEvent, SubscriptionRef},
        subscription::{Plan, SubscriptionStatus},
    },
    use_cases::webhook::{EventHandler, InboundEvent},
};

pub const HANDLERS: &[(&str, EventHandler)] = &[
    ("INITIAL_PURCHASE", initial_purchase),
    ("RENEWAL", renewal),
    ("SUBSCRIPTION_EXTENDED", renewal),
    ("PRODUCT_CHANGE", product_change),
    ("CANCELLATION", cancellation),
    ("UNCANCELLATION", uncancellation),
    ("BILLING_ISSUE", billing_issue),
    ("EXPIRATION", expiration),
];

/// Refunds issued through store support end access immediately.
const IMMEDIATE_CANCEL_REASONS: &[&str] = &["CUSTOMER_SUPPORT"];

#[derive(Debug, Deserialize)]
struct Envelope {
    event: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct EventHeader {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    event_timestamp_ms: i64,
}

/// Envelope: `{ event: { id, type, event_timestamp_ms, ... } }`; the inner
/// event object becomes the payload.
pub fn parse_envelope(body: &[u8], received_at: DateTime<Utc>) -> AppResult<InboundEvent> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid store aggregator payload: {}", e)))?;
    let header: EventHeader = serde_json::from_value(envelope.event.clone())
        .map_err(|e| AppError::Validation(format!("Invalid store aggregator event: {}", e)))?;

    Ok(InboundEvent {
        provider: Provider::StoreAggregator,
        external_event_id: header.id,
        event_type: header.event_type,
        occurred_at: millis(header.event_timestamp_ms, "event_timestamp_ms")?,
        payload: envelope.event,
        received_at,
    })
}

fn millis(ms: i64, field: &str) -> AppResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AppError::Validation(format!("{} out of range: {}", field, ms)))
}

#[derive(Debug, Deserialize)]
struct StoreEvent {
    app_user_id: String,
    original_app_user_id: Option<String>,
    product_id: String,
    new_product_id: Option<String>,
    period_type: Option<String>,
    purchased_at_ms: i64,
    expiration_at_ms: Option<i64>,
    original_transaction_id: String,
    cancel_reason: Option<String>,
}

impl StoreEvent {
    fn parse(event: &InboundEvent) -> AppResult<Self> {
        serde_json::from_value(event.payload.clone()).map_err(|e| {
            AppError::Validation(format!("{} payload: {}", event.event_type, e))
        })
    }

    /// App user ids are local user ids unless the app assigned anonymous ones.
    fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.app_user_id).ok().or_else(|| {
            self.original_app_user_id
                .as_deref()
                .and_then(|id| Uuid::parse_str(id).ok())
        })
    }

    fn plan(&self, product_id: &str) -> AppResult<Plan> {
        Plan::from_product_id(product_id)
            .ok_or_else(|| AppError::Validation(format!("Unknown store product {}", product_id)))
    }

    fn is_trial(&self) -> bool {
        self.period_type
            .as_deref()
            .is_some_and(|p| p.eq_ignore_ascii_case("trial"))
    }

    fn period(&self) -> AppResult<(DateTime<Utc>, DateTime<Utc>)> {
        let end = self.expiration_at_ms.ok_or_else(|| {
            AppError::Validation("Store event without expiration_at_ms".into())
        })?;
        Ok((
            millis(self.purchased_at_ms, "purchased_at_ms")?,
            millis(end, "expiration_at_ms")?,
        ))
    }

    fn subject(&self) -> SubscriptionRef {
        SubscriptionRef {
            provider: Provider::StoreAggregator,
            external_subscription_id: self.original_transaction_id.clone(),
            external_customer_id: self.app_user_id.clone(),
            user_id: self.user_id(),
        }
    }

    /// Live subscription for the period the event reports.
    fn baseline(&self) -> AppResult<ProviderSubscription> {
        let (period_start, period_end) = self.period()?;
        Ok(ProviderSubscription {
            provider: Provider::StoreAggregator,
            external_subscription_id: self.original_transaction_id.clone(),
            external_customer_id: self.app_user_id.clone(),
            plan: self.plan(&self.product_id)?,
            status: if self.is_trial() {
                SubscriptionStatus::Trialing
            } else {
                SubscriptionStatus::Active
            },
            current_period_start: period_start,
            current_period_end: period_end,
            cancelled_at: None,
        })
    }
}

fn initial_purchase(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let store = StoreEvent::parse(event)?;
    let (period_start, period_end) = store.period()?;
    Ok(ReconcileEvent::new(
        store.subject(),
        event.occurred_at,
        EventKind::Purchased {
            plan: store.plan(&store.product_id)?,
            period_start,
            period_end,
            trial: store.is_trial(),
        },
    ))
}

fn renewal(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let store = StoreEvent::parse(event)?;
    let (period_start, period_end) = store.period()?;
    Ok(ReconcileEvent::new(
        store.subject(),
        event.occurred_at,
        EventKind::Renewed {
            plan: store.plan(&store.product_id)?,
            period_start,
            period_end,
        },
    ))
}

fn product_change(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let store = StoreEvent::parse(event)?;
    let (period_start, period_end) = store.period()?;
    let product_id = store.new_product_id.as_deref().unwrap_or(&store.product_id);
    Ok(ReconcileEvent::new(
        store.subject(),
        event.occurred_at,
        EventKind::Renewed {
            plan: store.plan(product_id)?,
            period_start,
            period_end,
        },
    ))
}

fn cancellation(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let store = StoreEvent::parse(event)?;
    let at_period_end = !store
        .cancel_reason
        .as_deref()
        .is_some_and(|reason| IMMEDIATE_CANCEL_REASONS.contains(&reason));
    Ok(ReconcileEvent::new(
        store.subject(),
        event.occurred_at,
        EventKind::CancellationRequested { at_period_end },
    )
    .with_baseline(store.baseline()?))
}

fn uncancellation(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let store = StoreEvent::parse(event)?;
    let baseline = ProviderSubscription {
        cancelled_at: Some(event.occurred_at),
        ..store.baseline()?
    };
    Ok(
        ReconcileEvent::new(store.subject(), event.occurred_at, EventKind::Uncancelled)
            .with_baseline(baseline),
    )
}

fn billing_issue(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let store = StoreEvent::parse(event)?;
    Ok(
        ReconcileEvent::new(store.subject(), event.occurred_at, EventKind::PaymentFailed)
            .with_baseline(store.baseline()?),
    )
}

fn expiration(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let store = StoreEvent::parse(event)?;
    Ok(
        ReconcileEvent::new(store.subject(), event.occurred_at, EventKind::Expired)
            .with_baseline(store.baseline()?),
    )
}
