use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::provider::Provider;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "subscription_plan", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Plan {
    Weekly,
    Monthly,
    Yearly,
}

impl Plan {
    /// Map a card-billing recurring interval (`week`, `month`, `year`).
    pub fn from_interval(interval: &str) -> Option<Self> {
        match interval {
            "week" => Some(Plan::Weekly),
            "month" => Some(Plan::Monthly),
            "year" => Some(Plan::Yearly),
            _ => None,
        }
    }

    /// Map a store product identifier such as `premium_monthly` or `pro.annual`.
    pub fn from_product_id(product_id: &str) -> Option<Self> {
        let id = product_id.to_lowercase();
        if id.contains("week") {
            Some(Plan::Weekly)
        } else if id.contains("month") {
            Some(Plan::Monthly)
        } else if id.contains("year") || id.contains("annual") {
            Some(Plan::Yearly)
        } else {
            None
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    AsRefStr,
    Display,
    EnumString,
)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    /// Terminal rows are history; at most one non-terminal row exists per user.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired
        )
    }

    /// Statuses that grant access while the paid period has not elapsed.
    /// `PastDue` is a grace period: access is kept until the period ends.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trialing | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

/// Canonical local record of one provider subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: Provider,
    pub external_customer_id: String,
    pub external_subscription_id: String,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Effective timestamp of the newest provider state folded into this row.
    pub last_event_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn has_entitlement(&self, now: DateTime<Utc>) -> bool {
        self.status.grants_access() && now < self.current_period_end
    }

    /// Still access-granting but will not renew.
    pub fn cancels_at_period_end(&self) -> bool {
        self.cancelled_at.is_some() && !self.status.is_terminal()
    }

    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.current_period_end <= now
    }
}

/// Drop sub-microsecond precision so values survive a Postgres round trip
/// unchanged, which the `updated_at` compare-and-swap relies on.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(ts.nanosecond() / 1_000 * 1_000)
        .unwrap_or(ts)
}
