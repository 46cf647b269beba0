//! Pure state transition for subscription records.
//!
//! `reconcile` folds one normalized event into the current record and decides
//! whether anything has to be written. It never touches I/O, so webhook
//! handling, pull sync and the lapse sweep all share exactly the same rules.

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{AsRefStr, Display};
use uuid::Uuid;

use super::{
    reconcile_event::{EventKind, ProviderSubscription, ReconcileEvent, SubscriptionRef},
    subscription::{Subscription, SubscriptionStatus},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationKind {
    Welcome,
    Renewed,
    CancellationScheduled,
    CancellationConfirmed,
    Reactivated,
    PaymentFailed,
    PaymentSucceeded,
    TrialEnding,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Create {
        subscription: Subscription,
        notification: Option<NotificationKind>,
    },
    Update {
        subscription: Subscription,
        notification: Option<NotificationKind>,
    },
    /// Replay or no-op: the record already reflects the event.
    Unchanged,
    /// Event is older than the record's state and carried nothing newer.
    Stale,
    /// Event cannot be applied (unknown subscription, unresolved user).
    Rejected(String),
}

pub fn reconcile(
    current: Option<&Subscription>,
    event: &ReconcileEvent,
    now: DateTime<Utc>,
) -> Transition {
    match current {
        None => create(event, now),
        Some(current) => update(current, event, now),
    }
}

/// Internal event that expires a record whose paid period has elapsed.
/// Effective at the period end so a late renewal for that period still wins.
pub fn lapse_event(subscription: &Subscription) -> ReconcileEvent {
    ReconcileEvent::new(
        SubscriptionRef {
            provider: subscription.provider,
            external_subscription_id: subscription.external_subscription_id.clone(),
            external_customer_id: subscription.external_customer_id.clone(),
            user_id: Some(subscription.user_id),
        },
        subscription.current_period_end,
        EventKind::LapseDetected,
    )
}

fn create(event: &ReconcileEvent, now: DateTime<Utc>) -> Transition {
    let Some(user_id) = event.subject.user_id else {
        return Transition::Rejected(format!(
            "no local user for {} customer {}",
            event.subject.provider, event.subject.external_customer_id
        ));
    };

    let (mut record, is_purchase) = match &event.kind {
        EventKind::Purchased {
            plan,
            period_start,
            period_end,
            trial,
        } => {
            let status = if *trial {
                SubscriptionStatus::Trialing
            } else {
                SubscriptionStatus::Active
            };
            let seed = ProviderSubscription {
                provider: event.subject.provider,
                external_subscription_id: event.subject.external_subscription_id.clone(),
                external_customer_id: event.subject.external_customer_id.clone(),
                plan: *plan,
                status,
                current_period_start: *period_start,
                current_period_end: *period_end,
                cancelled_at: None,
            };
            (new_record(user_id, &seed, event.effective_at, now), true)
        }
        EventKind::Renewed {
            plan,
            period_start,
            period_end,
        } => {
            let seed = ProviderSubscription {
                provider: event.subject.provider,
                external_subscription_id: event.subject.external_subscription_id.clone(),
                external_customer_id: event.subject.external_customer_id.clone(),
                plan: *plan,
                status: SubscriptionStatus::Active,
                current_period_start: *period_start,
                current_period_end: *period_end,
                cancelled_at: None,
            };
            (new_record(user_id, &seed, event.effective_at, now), true)
        }
        EventKind::Snapshot(snapshot) => (new_record(user_id, snapshot, event.effective_at, now), true),
        kind => match &event.baseline {
            Some(baseline) => (new_record(user_id, baseline, event.effective_at, now), false),
            None => {
                return Transition::Rejected(format!(
                    "{} for unknown subscription {}",
                    kind.name(),
                    event.subject.external_subscription_id
                ));
            }
        },
    };

    let notification = if is_purchase {
        expire_if_lapsed(&mut record, now);
        record.has_entitlement(now).then_some(NotificationKind::Welcome)
    } else {
        let before = record.clone();
        apply_kind(&mut record, &event.kind, event.effective_at);
        expire_if_lapsed(&mut record, now);
        notification_for(&before, &record, &event.kind)
    };

    Transition::Create {
        subscription: record,
        notification,
    }
}

fn update(current: &Subscription, event: &ReconcileEvent, now: DateTime<Utc>) -> Transition {
    let mut next = current.clone();
    let stale = is_stale(current, event);

    if stale {
        extend_paid_window(&mut next, &event.kind);
    } else {
        apply_kind(&mut next, &event.kind, event.effective_at);
        if !matches!(event.kind, EventKind::LapseDetected) {
            next.last_event_at = next.last_event_at.max(event.effective_at);
        }
    }
    expire_if_lapsed(&mut next, now);

    if next == *current {
        return if stale {
            Transition::Stale
        } else {
            Transition::Unchanged
        };
    }

    let notification = notification_for(current, &next, &event.kind);
    next.updated_at = now;
    Transition::Update {
        subscription: next,
        notification,
    }
}

fn new_record(
    user_id: Uuid,
    seed: &ProviderSubscription,
    effective_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Subscription {
    Subscription {
        id: Uuid::new_v4(),
        user_id,
        provider: seed.provider,
        external_customer_id: seed.external_customer_id.clone(),
        external_subscription_id: seed.external_subscription_id.clone(),
        plan: seed.plan,
        status: seed.status,
        current_period_start: seed.current_period_start,
        current_period_end: seed.current_period_end,
        cancelled_at: seed.cancelled_at,
        last_event_at: effective_at,
        created_at: now,
        updated_at: now,
    }
}

fn is_stale(current: &Subscription, event: &ReconcileEvent) -> bool {
    match &event.kind {
        // An uncancel older than the recorded cancellation was superseded by it.
        EventKind::Uncancelled => current
            .cancelled_at
            .is_some_and(|cancelled_at| event.effective_at < cancelled_at),
        kind if kind.bypasses_ordering() => false,
        _ => event.effective_at < current.last_event_at,
    }
}

fn apply_kind(record: &mut Subscription, kind: &EventKind, at: DateTime<Utc>) {
    use SubscriptionStatus::*;

    match kind {
        EventKind::Purchased {
            plan,
            period_start,
            period_end,
            trial,
        } => {
            record.plan = *plan;
            record.current_period_start = *period_start;
            record.current_period_end = *period_end;
            record.status = if *trial { Trialing } else { Active };
            record.cancelled_at = None;
        }
        EventKind::Renewed {
            plan,
            period_start,
            period_end,
        } => {
            record.plan = *plan;
            record.current_period_start = *period_start;
            record.current_period_end = *period_end;
            record.status = Active;
            record.cancelled_at = None;
        }
        EventKind::CancellationRequested { at_period_end } => {
            if record.status.is_terminal() {
                return;
            }
            let scheduled = record.cancelled_at.is_some();
            record.cancelled_at = record.cancelled_at.or(Some(at));
            if !*at_period_end {
                // A scheduled cancellation that reached its end is an expiry.
                record.status = if scheduled && at >= record.current_period_end {
                    Expired
                } else {
                    Cancelled
                };
            }
        }
        EventKind::Uncancelled => match record.status {
            Cancelled => {
                record.status = Active;
                record.cancelled_at = None;
            }
            Trialing | Active | PastDue => record.cancelled_at = None,
            Expired => {}
        },
        EventKind::PaymentFailed => {
            if matches!(record.status, Active | Trialing) {
                record.status = PastDue;
            }
        }
        EventKind::PaymentSucceeded { .. } => {
            if record.status == PastDue {
                record.status = Active;
            }
            extend_paid_window(record, kind);
        }
        EventKind::TrialEnding | EventKind::LapseDetected => {}
        EventKind::Expired => {
            if !record.status.is_terminal() {
                record.status = Expired;
            }
        }
        EventKind::Snapshot(snapshot) => {
            record.plan = snapshot.plan;
            record.status = snapshot.status;
            record.current_period_start = snapshot.current_period_start;
            record.current_period_end = snapshot.current_period_end;
            record.cancelled_at = match (snapshot.cancelled_at, record.cancelled_at) {
                (Some(provider), _) => Some(provider),
                // Provider reports cancellation without a timestamp.
                (None, existing) if snapshot.status == Cancelled => existing.or(Some(at)),
                (None, _) => None,
            };
        }
    }
}

/// Period bounds only ever move forward, so a late event that carries a newer
/// paid window still extends it without touching status.
fn extend_paid_window(record: &mut Subscription, kind: &EventKind) {
    if record.status.is_terminal() {
        return;
    }
    let (start, end) = match kind {
        EventKind::Purchased {
            period_start,
            period_end,
            ..
        }
        | EventKind::Renewed {
            period_start,
            period_end,
            ..
        } => (Some(*period_start), *period_end),
        EventKind::PaymentSucceeded {
            period_end: Some(period_end),
        } => (None, *period_end),
        EventKind::Snapshot(snapshot) => (
            Some(snapshot.current_period_start),
            snapshot.current_period_end,
        ),
        _ => return,
    };
    if end > record.current_period_end {
        record.current_period_start = start.unwrap_or(record.current_period_end);
        record.current_period_end = end;
    }
}

fn expire_if_lapsed(record: &mut Subscription, now: DateTime<Utc>) {
    if record.is_lapsed(now) {
        record.status = SubscriptionStatus::Expired;
    }
}

fn notification_for(
    before: &Subscription,
    after: &Subscription,
    kind: &EventKind,
) -> Option<NotificationKind> {
    use SubscriptionStatus::*;

    if matches!(kind, EventKind::TrialEnding) && after.status == Trialing {
        return Some(NotificationKind::TrialEnding);
    }

    match (before.status, after.status) {
        (b, a) if b == a => {
            if before.cancelled_at.is_none() && after.cancelled_at.is_some() {
                Some(NotificationKind::CancellationScheduled)
            } else if before.cancelled_at.is_some() && after.cancelled_at.is_none() {
                Some(NotificationKind::Reactivated)
            } else if after.current_period_end > before.current_period_end && !a.is_terminal() {
                Some(NotificationKind::Renewed)
            } else {
                None
            }
        }
        (_, Expired) => Some(NotificationKind::Expired),
        (_, Cancelled) => Some(NotificationKind::CancellationConfirmed),
        (Cancelled | Expired, _) => Some(NotificationKind::Reactivated),
        (_, PastDue) => Some(NotificationKind::PaymentFailed),
        (PastDue, Active) => Some(NotificationKind::PaymentSucceeded),
        (Trialing, Active) => Some(NotificationKind::Renewed),
        _ => None,
    }
}
