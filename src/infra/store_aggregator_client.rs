use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;
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
        subscription::{Plan, SubscriptionStatus},
    },
    infra::{
        http_client::map_transport_error,
        retry::{RetryPolicy, with_retry},
    },
};

/// Client for the aggregator that relays app store purchases. Purchases and
/// payment instruments live in the stores, so only reads, receipt
/// validation and refund-style revocation are available here.
#[derive(Clone)]
pub struct StoreAggregatorClient {
    client: Client,
    api_base: Url,
    api_key: SecretString,
    retry: RetryPolicy,
}

impl StoreAggregatorClient {
    pub fn new(client: Client, api_base: Url, api_key: SecretString, retry: RetryPolicy) -> Self {
        Self {
            client,
            api_base,
            api_key,
            retry,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base.as_str().trim_end_matches('/'), path)
    }

    async fn send<T, F>(&self, operation: &str, build: F) -> AppResult<T>
    where
        T: for<'de> Deserialize<'de>,
        F: Fn(&Client) -> RequestBuilder,
    {
        let build = &build;
        let client = &self.client;
        let api_key = self.api_key.expose_secret();
        with_retry(&self.retry, operation, || async move {
            let response = build(client)
                .bearer_auth(api_key)
                .send()
                .await
                .map_err(|e| map_transport_error("Store aggregator", e))?;
            handle_response(response).await
        })
        .await
    }

    async fn get_subscriber(&self, app_user_id: &str) -> AppResult<StoreSubscriber> {
        let url = self.url(&format!("/subscribers/{}", app_user_id));
        let response: StoreSubscriberResponse = self
            .send("get_subscriber", |client| client.get(&url))
            .await?;
        Ok(response.subscriber)
    }
}

#[async_trait]
impl ProviderClient for StoreAggregatorClient {
    fn provider(&self) -> Provider {
        Provider::StoreAggregator
    }

    /// App users are created implicitly by the aggregator; the local user id
    /// is used as the app user id.
    async fn create_customer(&self, user_id: Uuid) -> AppResult<CustomerId> {
        Ok(CustomerId::new(user_id.to_string()))
    }

    async fn create_subscription(
        &self,
        _request: &CreateSubscriptionRequest,
    ) -> AppResult<ProviderSubscription> {
        Err(AppError::ProviderNotSupported)
    }

    async fn cancel_subscription(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        mode: CancelMode,
    ) -> AppResult<ProviderSubscription> {
        // Scheduled cancellation is only possible from the store itself.
        if mode == CancelMode::AtPeriodEnd {
            return Err(AppError::ProviderNotSupported);
        }

        let subscriber = self.get_subscriber(customer_id.as_str()).await?;
        let (product_id, _) = subscriber
            .entry(subscription_id.as_str())
            .ok_or(AppError::NotFound)?;

        let url = self.url(&format!(
            "/subscribers/{}/subscriptions/{}/revoke",
            customer_id, product_id
        ));
        let response: StoreSubscriberResponse = self
            .send("revoke_subscription", |client| client.post(&url))
            .await?;

        response
            .subscriber
            .snapshot_for(customer_id.as_str(), subscription_id.as_str())
            .transpose()
            .ok_or(AppError::NotFound)?
    }

    async fn update_payment_method(
        &self,
        _customer_id: &CustomerId,
        _payment_method_id: &str,
    ) -> AppResult<()> {
        Err(AppError::ProviderNotSupported)
    }

    async fn retrieve_subscription(
        &self,
        customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
    ) -> AppResult<Option<ProviderSubscription>> {
        let subscriber = match self.get_subscriber(customer_id.as_str()).await {
            Ok(subscriber) => subscriber,
            Err(AppError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        subscriber.snapshot_for(customer_id.as_str(), subscription_id.as_str())
    }

    async fn find_customer_subscription(
        &self,
        customer_id: &CustomerId,
    ) -> AppResult<Option<ProviderSubscription>> {
        let subscriber = match self.get_subscriber(customer_id.as_str()).await {
            Ok(subscriber) => subscriber,
            Err(AppError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        subscriber.latest_snapshot(customer_id.as_str(), None)
    }

    async fn verify_purchase_receipt(
        &self,
        customer_id: &CustomerId,
        receipt: &PurchaseReceipt,
    ) -> AppResult<ProviderSubscription> {
        let url = self.url("/receipts");
        let body = ReceiptRequest {
            app_user_id: customer_id.as_str(),
            fetch_token: &receipt.purchase_token,
            product_id: receipt.product_id.as_deref(),
        };
        let response: StoreSubscriberResponse = self
            .send("verify_purchase_receipt", |client| client.post(&url).json(&body))
            .await?;

        response
            .subscriber
            .latest_snapshot(customer_id.as_str(), receipt.product_id.as_deref())?
            .ok_or_else(|| AppError::InvalidInput("Receipt does not contain a subscription".into()))
    }
}

// ============================================================================
// Response handling
// ============================================================================

async fn handle_response<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> AppResult<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AppError::ProviderUnavailable(format!("Failed to read response: {}", e)))?;

    if !status.is_success() {
        let message = serde_json::from_str::<StoreErrorResponse>(&body)
            .ok()
            .map(|e| e.message)
            .unwrap_or_else(|| status.to_string());

        return Err(match status {
            StatusCode::NOT_FOUND => AppError::NotFound,
            StatusCode::TOO_MANY_REQUESTS => {
                AppError::ProviderUnavailable(format!("Store aggregator rate limited: {}", message))
            }
            s if s.is_server_error() => {
                tracing::warn!(status = %s, "Store aggregator server error");
                AppError::ProviderUnavailable(format!("Store aggregator error {}: {}", s, message))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::error!(status = %status, "Store aggregator rejected API key");
                AppError::Internal("Store aggregator rejected API key".into())
            }
            _ => {
                tracing::warn!(status = %status, message = %message, "Store aggregator request rejected");
                AppError::InvalidInput(format!("Store aggregator error: {}", message))
            }
        });
    }

    serde_json::from_str(&body).map_err(|e| {
        tracing::error!(error = %e, "Failed to parse store aggregator response");
        AppError::Internal(format!("Failed to parse store aggregator response: {}", e))
    })
}

// ============================================================================
// Store Aggregator Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ReceiptRequest<'a> {
    app_user_id: &'a str,
    fetch_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    product_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
pub struct StoreSubscriberResponse {
    pub subscriber: StoreSubscriber,
}

#[derive(Debug, Deserialize)]
pub struct StoreSubscriber {
    /// Keyed by store product id.
    #[serde(default)]
    pub subscriptions: HashMap<String, StoreSubscription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSubscription {
    pub original_transaction_id: String,
    pub purchase_date: DateTime<Utc>,
    pub expires_date: DateTime<Utc>,
    #[serde(default)]
    pub period_type: String,
    pub unsubscribe_detected_at: Option<DateTime<Utc>>,
    pub billing_issues_detected_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl StoreSubscriber {
    /// Product id and entry for a given original transaction id.
    pub fn entry(&self, original_transaction_id: &str) -> Option<(&str, &StoreSubscription)> {
        self.subscriptions
            .iter()
            .find(|(_, s)| s.original_transaction_id == original_transaction_id)
            .map(|(product_id, s)| (product_id.as_str(), s))
    }

    pub fn snapshot_for(
        &self,
        app_user_id: &str,
        original_transaction_id: &str,
    ) -> AppResult<Option<ProviderSubscription>> {
        self.entry(original_transaction_id)
            .map(|(product_id, s)| s.to_provider_subscription(app_user_id, product_id))
            .transpose()
    }

    /// Entry with the latest expiry, optionally restricted to one product.
    pub fn latest_snapshot(
        &self,
        app_user_id: &str,
        product_id: Option<&str>,
    ) -> AppResult<Option<ProviderSubscription>> {
        self.subscriptions
            .iter()
            .filter(|(id, _)| product_id.is_none_or(|wanted| wanted == id.as_str()))
            .max_by_key(|(_, s)| s.expires_date)
            .map(|(id, s)| s.to_provider_subscription(app_user_id, id))
            .transpose()
    }
}

impl StoreSubscription {
    /// Expiry is left to the lapse check; the aggregator keeps reporting the
    /// last period after it ends.
    pub fn status(&self) -> SubscriptionStatus {
        if self.refunded_at.is_some() {
            SubscriptionStatus::Cancelled
        } else if self.billing_issues_detected_at.is_some() {
            SubscriptionStatus::PastDue
        } else if self.period_type.eq_ignore_ascii_case("trial") {
            SubscriptionStatus::Trialing
        } else {
            SubscriptionStatus::Active
        }
    }

    pub fn to_provider_subscription(
        &self,
        app_user_id: &str,
        product_id: &str,
    ) -> AppResult<ProviderSubscription> {
        let plan = Plan::from_product_id(product_id)
            .ok_or_else(|| AppError::Validation(format!("Unknown store product {}", product_id)))?;
        Ok(ProviderSubscription {
            provider: Provider::StoreAggregator,
            external_subscription_id: self.original_transaction_id.clone(),
            external_customer_id: app_user_id.to_string(),
            plan,
            status: self.status(),
            current_period_start: self.purchase_date,
            current_period_end: self.expires_date,
            cancelled_at: self.refunded_at.or(self.unsubscribe_detected_at),
        })
    }
}

#[derive(Debug, Deserialize)]
struct StoreErrorResponse {
    message: String,
}
