use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    adapters::webhooks::field,
    app_error::{AppError, AppResult},
    domain::entities::{
        provider::Provider,
        reconcile_event::{EventKind, ProviderSubscription, ReconcileEvent, SubscriptionRef},
        subscription::SubscriptionStatus,
    },
    infra::card_billing_client::{CardInvoice, CardSubscription},
    use_cases::webhook::{EventHandler, InboundEvent},
};

pub const HANDLERS: &[(&str, EventHandler)] = &[
    ("customer.subscription.created", subscription_created),
    ("customer.subscription.updated", subscription_updated),
    ("customer.subscription.deleted", subscription_deleted),
    ("customer.subscription.trial_will_end", trial_will_end),
    ("invoice.payment_failed", invoice_payment_failed),
    ("invoice.payment_succeeded", invoice_paid),
    ("invoice.paid", invoice_paid),
];

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: serde_json::Value,
}

/// Envelope: `{ id, type, created, data: { object, previous_attributes? } }`.
pub fn parse_envelope(body: &[u8], received_at: DateTime<Utc>) -> AppResult<InboundEvent> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid card billing payload: {}", e)))?;
    let occurred_at = DateTime::from_timestamp(envelope.created, 0)
        .ok_or_else(|| AppError::Validation(format!("Invalid event time {}", envelope.created)))?;

    Ok(InboundEvent {
        provider: Provider::CardBilling,
        external_event_id: envelope.id,
        event_type: envelope.event_type,
        payload: envelope.data,
        occurred_at,
        received_at,
    })
}

fn subscription_object(event: &InboundEvent) -> AppResult<(CardSubscription, ProviderSubscription)> {
    let subscription: CardSubscription = field(event, "object")?;
    let snapshot = subscription.to_provider_subscription(event.occurred_at)?;
    Ok((subscription, snapshot))
}

fn seconds(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

fn subscription_created(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let (subscription, snapshot) = subscription_object(event)?;
    Ok(ReconcileEvent::snapshot(
        snapshot,
        subscription.user_id(),
        event.occurred_at,
    ))
}

/// A flip of `cancel_at_period_end` is a user decision and bypasses ordering;
/// any other update is taken as a full snapshot.
fn subscription_updated(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let (subscription, snapshot) = subscription_object(event)?;
    let cancel_flag_changed = event
        .payload
        .get("previous_attributes")
        .and_then(|p| p.get("cancel_at_period_end"))
        .is_some();

    if !cancel_flag_changed {
        return Ok(ReconcileEvent::snapshot(
            snapshot,
            subscription.user_id(),
            event.occurred_at,
        ));
    }

    let subject = snapshot.subject(subscription.user_id());
    if subscription.cancel_at_period_end {
        let effective_at = seconds(subscription.canceled_at).unwrap_or(event.occurred_at);
        let baseline = ProviderSubscription {
            cancelled_at: None,
            ..snapshot
        };
        Ok(ReconcileEvent::new(
            subject,
            effective_at,
            EventKind::CancellationRequested {
                at_period_end: true,
            },
        )
        .with_baseline(baseline))
    } else {
        let baseline = ProviderSubscription {
            cancelled_at: Some(event.occurred_at),
            ..snapshot
        };
        Ok(ReconcileEvent::new(subject, event.occurred_at, EventKind::Uncancelled)
            .with_baseline(baseline))
    }
}

/// Subscription ended. When it had been scheduled to cancel, ending at the
/// period boundary resolves to expiry in the transition.
fn subscription_deleted(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let (subscription, snapshot) = subscription_object(event)?;
    let effective_at = seconds(subscription.ended_at).unwrap_or(event.occurred_at);
    let baseline = ProviderSubscription {
        status: SubscriptionStatus::Active,
        cancelled_at: if subscription.cancel_at_period_end {
            snapshot.cancelled_at
        } else {
            None
        },
        ..snapshot.clone()
    };
    Ok(ReconcileEvent::new(
        snapshot.subject(subscription.user_id()),
        effective_at,
        EventKind::CancellationRequested {
            at_period_end: false,
        },
    )
    .with_baseline(baseline))
}

fn trial_will_end(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let (subscription, snapshot) = subscription_object(event)?;
    Ok(ReconcileEvent::new(
        snapshot.subject(subscription.user_id()),
        event.occurred_at,
        EventKind::TrialEnding,
    )
    .with_baseline(snapshot))
}

fn invoice_subject(event: &InboundEvent) -> AppResult<(CardInvoice, SubscriptionRef)> {
    let invoice: CardInvoice = field(event, "object")?;
    let subscription_id = invoice.subscription.clone().ok_or_else(|| {
        AppError::Validation(format!("Invoice {} is not for a subscription", invoice.id))
    })?;
    let subject = SubscriptionRef {
        provider: Provider::CardBilling,
        external_subscription_id: subscription_id,
        external_customer_id: invoice.customer.clone(),
        user_id: None,
    };
    Ok((invoice, subject))
}

/// Invoices only carry the subscription id, so they update known rows and
/// are rejected for unknown ones; the subscription events create rows.
fn invoice_payment_failed(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let (_, subject) = invoice_subject(event)?;
    Ok(ReconcileEvent::new(
        subject,
        event.occurred_at,
        EventKind::PaymentFailed,
    ))
}

fn invoice_paid(event: &InboundEvent) -> AppResult<ReconcileEvent> {
    let (invoice, subject) = invoice_subject(event)?;
    Ok(ReconcileEvent::new(
        subject,
        event.occurred_at,
        EventKind::PaymentSucceeded {
            period_end: invoice.period_end()?,
        },
    ))
}
