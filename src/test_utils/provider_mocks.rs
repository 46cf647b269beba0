//! Scripted stand-in for a billing provider.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::ports::provider_client::{
        CancelMode, CreateSubscriptionRequest, CustomerId, ProviderClient, PurchaseReceipt,
        SubscriptionId,
    },
    domain::entities::{
        provider::Provider,
        reconcile_event::ProviderSubscription,
        subscription::{SubscriptionStatus, truncate_to_micros},
    },
};

/// Holds provider-side state in memory. Can be switched to fail every call
/// with `ProviderUnavailable` or to stall before answering.
pub struct ScriptedProviderClient {
    provider: Provider,
    subscriptions: Mutex<HashMap<String, ProviderSubscription>>,
    receipts: Mutex<HashMap<String, ProviderSubscription>>,
    payment_methods: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<&'static str>>,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    stall_after_answer: Mutex<Option<Duration>>,
}

impl ScriptedProviderClient {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            subscriptions: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            payment_methods: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
            delay: Mutex::new(None),
            stall_after_answer: Mutex::new(None),
        }
    }

    pub fn with_subscription(self, subscription: ProviderSubscription) -> Self {
        self.set_subscription(subscription);
        self
    }

    /// Purchase token that verifies to `subscription`.
    pub fn with_receipt(self, purchase_token: &str, subscription: ProviderSubscription) -> Self {
        self.receipts
            .lock()
            .unwrap()
            .insert(purchase_token.to_string(), subscription);
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    /// Lookups read their answer first, then wait before returning it, so
    /// local state can move on while the answer is in flight.
    pub fn with_stall_after_answer(self, stall: Duration) -> Self {
        *self.stall_after_answer.lock().unwrap() = Some(stall);
        self
    }

    /// Replace the provider's view of one subscription.
    pub fn set_subscription(&self, subscription: ProviderSubscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.external_subscription_id.clone(), subscription);
    }

    pub fn subscription(&self, external_subscription_id: &str) -> Option<ProviderSubscription> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(external_subscription_id)
            .cloned()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn default_payment_method(&self, customer_id: &str) -> Option<String> {
        self.payment_methods.lock().unwrap().get(customer_id).cloned()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    async fn enter(&self, operation: &'static str) -> AppResult<()> {
        self.calls.lock().unwrap().push(operation);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::ProviderUnavailable(format!(
                "{} {} unavailable",
                self.provider, operation
            )));
        }
        Ok(())
    }

    async fn stall(&self) {
        let stall = *self.stall_after_answer.lock().unwrap();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
    }
}

#[async_trait]
impl ProviderClient for ScriptedProviderClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn create_customer(&self, user_id: Uuid) -> AppResult<CustomerId> {
        self.enter("create_customer").await?;
        Ok(match self.provider {
            Provider::CardBilling => CustomerId::new(format!("cus_{}", user_id.simple())),
            Provider::StoreAggregator => CustomerId::new(user_id.to_string()),
        })
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> AppResult<ProviderSubscription> {
        self.enter("create_subscription").await?;
        if self.provider == Provider::StoreAggregator {
            return Err(AppError::ProviderNotSupported);
        }
        let now = truncate_to_micros(Utc::now());
        let subscription = ProviderSubscription {
            provider: self.provider,
            external_subscription_id: format!("sub_{}", Uuid::new_v4().simple()),
            external_customer_id: request.customer_id.to_string(),
            plan: request.plan,
            status: SubscriptionStatus::Active,
            current_period_start: now,
            current_period_end: now + chrono::Duration::days(30),
            cancelled_at: None,
        };
        self.payment_methods.lock().unwrap().insert(
            request.customer_id.to_string(),
            request.payment_method_id.clone(),
        );
        self.set_subscription(subscription.clone());
        Ok(subscription)
    }

    async fn cancel_subscription(
        &self,
        _customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        mode: CancelMode,
    ) -> AppResult<ProviderSubscription> {
        self.enter("cancel_subscription").await?;
        let mut subscriptions = self.subscriptions.lock().unwrap();
        let subscription = subscriptions
            .get_mut(subscription_id.as_str())
            .ok_or(AppError::NotFound)?;
        let now = truncate_to_micros(Utc::now());
        subscription.cancelled_at = subscription.cancelled_at.or(Some(now));
        if mode == CancelMode::Immediate {
            subscription.status = SubscriptionStatus::Cancelled;
        }
        Ok(subscription.clone())
    }

    async fn update_payment_method(
        &self,
        customer_id: &CustomerId,
        payment_method_id: &str,
    ) -> AppResult<()> {
        self.enter("update_payment_method").await?;
        if self.provider == Provider::StoreAggregator {
            return Err(AppError::ProviderNotSupported);
        }
        self.payment_methods
            .lock()
            .unwrap()
            .insert(customer_id.to_string(), payment_method_id.to_string());
        Ok(())
    }

    async fn retrieve_subscription(
        &self,
        _customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
    ) -> AppResult<Option<ProviderSubscription>> {
        self.enter("retrieve_subscription").await?;
        let answer = self.subscription(subscription_id.as_str());
        self.stall().await;
        Ok(answer)
    }

    async fn find_customer_subscription(
        &self,
        customer_id: &CustomerId,
    ) -> AppResult<Option<ProviderSubscription>> {
        self.enter("find_customer_subscription").await?;
        let answer = {
            let subscriptions = self.subscriptions.lock().unwrap();
            let mut owned: Vec<&ProviderSubscription> = subscriptions
                .values()
                .filter(|s| s.external_customer_id == customer_id.as_str())
                .collect();
            owned.sort_by_key(|s| (!s.status.is_terminal(), s.current_period_end));
            owned.last().map(|s| (*s).clone())
        };
        self.stall().await;
        Ok(answer)
    }

    async fn verify_purchase_receipt(
        &self,
        _customer_id: &CustomerId,
        receipt: &PurchaseReceipt,
    ) -> AppResult<ProviderSubscription> {
        self.enter("verify_purchase_receipt").await?;
        if self.provider == Provider::CardBilling {
            return Err(AppError::ProviderNotSupported);
        }
        let subscription = self
            .receipts
            .lock()
            .unwrap()
            .get(&receipt.purchase_token)
            .cloned()
            .ok_or_else(|| AppError::InvalidInput("Receipt not recognized".into()))?;
        self.set_subscription(subscription.clone());
        Ok(subscription)
    }
}
