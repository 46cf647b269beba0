//! Test data factories for creating valid test fixtures.
//!
//! Each factory function creates a complete, valid object with sensible defaults.
//! Use the closure parameter to override specific fields as needed.

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use uuid::Uuid;

use crate::{
    application::jwt,
    domain::entities::{
        provider::Provider,
        reconcile_event::ProviderSubscription,
        subscription::{Plan, Subscription, SubscriptionStatus, truncate_to_micros},
    },
};

pub const TEST_JWT_SECRET: &str = "test_jwt_secret";

/// Current time at storage precision.
pub fn test_now() -> DateTime<Utc> {
    truncate_to_micros(Utc::now())
}

/// Create an active monthly card-billing subscription in the middle of its period.
pub fn create_test_subscription(
    user_id: Uuid,
    overrides: impl FnOnce(&mut Subscription),
) -> Subscription {
    let now = test_now();
    let suffix = Uuid::new_v4().simple().to_string();
    let mut subscription = Subscription {
        id: Uuid::new_v4(),
        user_id,
        provider: Provider::CardBilling,
        external_customer_id: format!("cus_{}", &suffix[..12]),
        external_subscription_id: format!("sub_{}", &suffix[..12]),
        plan: Plan::Monthly,
        status: SubscriptionStatus::Active,
        current_period_start: now - Duration::days(10),
        current_period_end: now + Duration::days(20),
        cancelled_at: None,
        last_event_at: now - Duration::days(10),
        created_at: now - Duration::days(10),
        updated_at: now - Duration::days(10),
    };
    overrides(&mut subscription);
    subscription
}

/// Create provider-side state for an active monthly card-billing subscription.
pub fn create_test_snapshot(
    overrides: impl FnOnce(&mut ProviderSubscription),
) -> ProviderSubscription {
    let now = test_now();
    let mut snapshot = ProviderSubscription {
        provider: Provider::CardBilling,
        external_subscription_id: "sub_test".to_string(),
        external_customer_id: "cus_test".to_string(),
        plan: Plan::Monthly,
        status: SubscriptionStatus::Active,
        current_period_start: now - Duration::days(1),
        current_period_end: now + Duration::days(29),
        cancelled_at: None,
    };
    overrides(&mut snapshot);
    snapshot
}

/// Access token for `user_id` signed with [`TEST_JWT_SECRET`].
pub fn test_access_token(user_id: Uuid) -> String {
    jwt::issue(
        user_id,
        &SecretString::new(TEST_JWT_SECRET.into()),
        time::Duration::hours(1),
    )
    .expect("test token should sign")
}
