use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    app_error::AppResult,
    domain::entities::{
        provider::Provider, reconcile_event::ProviderSubscription, subscription::Plan,
    },
};

// ============================================================================
// Port Types - Provider-agnostic identifiers
// ============================================================================

/// Customer identifier inside a provider (card-billing customer, store app user)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub String);

impl CustomerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CustomerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription identifier inside a provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    Immediate,
    AtPeriodEnd,
}

impl CancelMode {
    pub fn from_at_period_end(at_period_end: bool) -> Self {
        if at_period_end {
            CancelMode::AtPeriodEnd
        } else {
            CancelMode::Immediate
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateSubscriptionRequest {
    pub customer_id: CustomerId,
    pub plan: Plan,
    pub payment_method_id: String,
}

/// Purchase token submitted by a mobile client after a store purchase.
#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseReceipt {
    pub purchase_token: String,
    pub product_id: Option<String>,
}

// ============================================================================
// Provider Client Port
// ============================================================================

/// Capability interface shared by both billing integrations.
///
/// Implementations retry transient failures internally and surface them as
/// `AppError::ProviderUnavailable` once retries are exhausted. Operations a
/// provider does not offer return `AppError::ProviderNotSupported`.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Returns the provider-side customer for a local user, creating it when
    /// the provider requires one.
    async fn create_customer(&self, user_id: Uuid) -> AppResult<CustomerId>;

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> AppResult<ProviderSubscription>;

    async fn cancel_subscription(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        mode: CancelMode,
    ) -> AppResult<ProviderSubscription>;

    async fn update_payment_method(
        &self,
        customer_id: &CustomerId,
        payment_method_id: &str,
    ) -> AppResult<()>;

    /// `Ok(None)` when the provider does not know the subscription.
    async fn retrieve_subscription(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
    ) -> AppResult<Option<ProviderSubscription>>;

    /// Most relevant subscription of a customer, if any.
    async fn find_customer_subscription(
        &self,
        customer_id: &CustomerId,
    ) -> AppResult<Option<ProviderSubscription>>;

    async fn verify_purchase_receipt(
        &self,
        customer_id: &CustomerId,
        receipt: &PurchaseReceipt,
    ) -> AppResult<ProviderSubscription>;
}
