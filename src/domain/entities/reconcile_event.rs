use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{
    provider::Provider,
    subscription::{Plan, SubscriptionStatus},
};

/// Identifies the subscription an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRef {
    pub provider: Provider,
    pub external_subscription_id: String,
    pub external_customer_id: String,
    /// Local user, when the payload carries it. Otherwise resolved through the
    /// identity directory before a new row is created.
    pub user_id: Option<Uuid>,
}

/// Full provider-side state of one subscription, either fetched on demand or
/// implied by a webhook payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSubscription {
    pub provider: Provider,
    pub external_subscription_id: String,
    pub external_customer_id: String,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl ProviderSubscription {
    pub fn subject(&self, user_id: Option<Uuid>) -> SubscriptionRef {
        SubscriptionRef {
            provider: self.provider,
            external_subscription_id: self.external_subscription_id.clone(),
            external_customer_id: self.external_customer_id.clone(),
            user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Purchased {
        plan: Plan,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        trial: bool,
    },
    Renewed {
        plan: Plan,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    },
    CancellationRequested {
        at_period_end: bool,
    },
    Uncancelled,
    PaymentFailed,
    PaymentSucceeded {
        period_end: Option<DateTime<Utc>>,
    },
    TrialEnding,
    Expired,
    /// Raised internally once `current_period_end` has passed without renewal.
    LapseDetected,
    Snapshot(ProviderSubscription),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Purchased { .. } => "purchased",
            EventKind::Renewed { .. } => "renewed",
            EventKind::CancellationRequested { .. } => "cancellation_requested",
            EventKind::Uncancelled => "uncancelled",
            EventKind::PaymentFailed => "payment_failed",
            EventKind::PaymentSucceeded { .. } => "payment_succeeded",
            EventKind::TrialEnding => "trial_ending",
            EventKind::Expired => "expired",
            EventKind::LapseDetected => "lapse_detected",
            EventKind::Snapshot(_) => "snapshot",
        }
    }

    /// User-initiated changes apply even when they arrive after newer state.
    pub fn bypasses_ordering(&self) -> bool {
        matches!(
            self,
            EventKind::CancellationRequested { .. } | EventKind::Uncancelled | EventKind::LapseDetected
        )
    }
}

/// Provider-agnostic input to the transition function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileEvent {
    pub subject: SubscriptionRef,
    pub effective_at: DateTime<Utc>,
    pub kind: EventKind,
    /// Provider state before this event as implied by the payload. Lets an
    /// event that arrives ahead of the purchase still create the row.
    pub baseline: Option<ProviderSubscription>,
}

impl ReconcileEvent {
    pub fn new(subject: SubscriptionRef, effective_at: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            subject,
            effective_at,
            kind,
            baseline: None,
        }
    }

    pub fn with_baseline(mut self, baseline: ProviderSubscription) -> Self {
        self.baseline = Some(baseline);
        self
    }

    /// Wrap a fetched provider state as a synthetic event.
    pub fn snapshot(
        snapshot: ProviderSubscription,
        user_id: Option<Uuid>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            snapshot.subject(user_id),
            observed_at,
            EventKind::Snapshot(snapshot),
        )
    }
}
