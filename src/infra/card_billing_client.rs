use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
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

const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Price ids per plan, as configured at the card-billing provider.
#[derive(Debug, Clone, Default)]
pub struct PlanPrices {
    pub weekly: Option<String>,
    pub monthly: Option<String>,
    pub yearly: Option<String>,
}

impl PlanPrices {
    pub fn price_for(&self, plan: Plan) -> Option<&str> {
        match plan {
            Plan::Weekly => self.weekly.as_deref(),
            Plan::Monthly => self.monthly.as_deref(),
            Plan::Yearly => self.yearly.as_deref(),
        }
    }
}

#[derive(Clone)]
pub struct CardBillingClient {
    client: Client,
    api_base: Url,
    secret_key: SecretString,
    prices: PlanPrices,
    retry: RetryPolicy,
}

impl CardBillingClient {
    pub fn new(
        client: Client,
        api_base: Url,
        secret_key: SecretString,
        prices: PlanPrices,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            api_base,
            secret_key,
            prices,
            retry,
        }
    }

    fn auth_header(&self) -> String {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:", self.secret_key.expose_secret()));
        format!("Basic {}", encoded)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base.as_str().trim_end_matches('/'), path)
    }

    /// Send a request built fresh per attempt, with retries on transient failures.
    ///
    /// Mutating calls pass an idempotency key. It is fixed before the first
    /// attempt and repeated on every retry, so a retry after a lost response
    /// cannot apply the change twice.
    async fn send<T, F>(&self, operation: &str, idempotency_key: Option<&str>, build: F) -> AppResult<T>
    where
        T: for<'de> Deserialize<'de>,
        F: Fn(&Client) -> RequestBuilder,
    {
        let build = &build;
        let client = &self.client;
        let auth = self.auth_header();
        let auth = auth.as_str();
        with_retry(&self.retry, operation, || async move {
            let mut request = build(client).header("Authorization", auth);
            if let Some(key) = idempotency_key {
                request = request.header(IDEMPOTENCY_KEY_HEADER, key);
            }
            let response = request
                .send()
                .await
                .map_err(|e| map_transport_error("Card billing", e))?;
            handle_response(response).await
        })
        .await
    }

    async fn attach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> AppResult<()> {
        let url = self.url(&format!("/payment_methods/{}/attach", payment_method_id));
        let key = format!("attach_{}_{}", payment_method_id, customer_id);
        let _: CardPaymentMethod = self
            .send("attach_payment_method", Some(&key), |client| {
                client.post(&url).form(&[("customer", customer_id)])
            })
            .await?;
        Ok(())
    }

    async fn get_subscription(&self, subscription_id: &str) -> AppResult<CardSubscription> {
        let url = self.url(&format!("/subscriptions/{}", subscription_id));
        self.send("retrieve_subscription", None, |client| client.get(&url))
            .await
    }
}

#[async_trait]
impl ProviderClient for CardBillingClient {
    fn provider(&self) -> Provider {
        Provider::CardBilling
    }

    async fn create_customer(&self, user_id: Uuid) -> AppResult<CustomerId> {
        let url = self.url("/customers");
        let key = format!("customer_{}", user_id);
        let user_id = user_id.to_string();
        let customer: CardCustomer = self
            .send("create_customer", Some(&key), |client| {
                client
                    .post(&url)
                    .form(&[("metadata[user_id]", user_id.as_str())])
            })
            .await?;
        Ok(CustomerId::new(customer.id))
    }

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> AppResult<ProviderSubscription> {
        let price_id = self.prices.price_for(request.plan).ok_or_else(|| {
            AppError::InvalidInput(format!("No price configured for the {} plan", request.plan))
        })?;

        self.attach_payment_method(request.customer_id.as_str(), &request.payment_method_id)
            .await?;

        let url = self.url("/subscriptions");
        let params = [
            ("customer", request.customer_id.as_str()),
            ("items[0][price]", price_id),
            ("default_payment_method", request.payment_method_id.as_str()),
        ];
        let key = format!(
            "subscription_{}_{}_{}_{}",
            request.customer_id,
            price_id,
            request.payment_method_id,
            Utc::now().timestamp()
        );
        let subscription: CardSubscription = self
            .send("create_subscription", Some(&key), |client| {
                client.post(&url).form(&params)
            })
            .await?;
        subscription.to_provider_subscription(Utc::now())
    }

    async fn cancel_subscription(
        &self,
        _customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
        mode: CancelMode,
    ) -> AppResult<ProviderSubscription> {
        let url = self.url(&format!("/subscriptions/{}", subscription_id));
        let key = format!("cancel_{}_{:?}", subscription_id, mode);
        let subscription: CardSubscription = match mode {
            CancelMode::AtPeriodEnd => {
                self.send("cancel_subscription", Some(&key), |client| {
                    client
                        .post(&url)
                        .form(&[("cancel_at_period_end", "true")])
                })
                .await?
            }
            CancelMode::Immediate => {
                self.send("cancel_subscription", Some(&key), |client| client.delete(&url))
                    .await?
            }
        };
        subscription.to_provider_subscription(Utc::now())
    }

    async fn update_payment_method(
        &self,
        customer_id: &CustomerId,
        payment_method_id: &str,
    ) -> AppResult<()> {
        self.attach_payment_method(customer_id.as_str(), payment_method_id)
            .await?;

        let url = self.url(&format!("/customers/{}", customer_id));
        let key = format!("default_pm_{}_{}", customer_id, payment_method_id);
        let _: CardCustomer = self
            .send("update_payment_method", Some(&key), |client| {
                client.post(&url).form(&[(
                    "invoice_settings[default_payment_method]",
                    payment_method_id,
                )])
            })
            .await?;
        Ok(())
    }

    async fn retrieve_subscription(
        &self,
        _customer_id: &CustomerId,
        subscription_id: &SubscriptionId,
    ) -> AppResult<Option<ProviderSubscription>> {
        match self.get_subscription(subscription_id.as_str()).await {
            Ok(subscription) => Ok(Some(subscription.to_provider_subscription(Utc::now())?)),
            Err(AppError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn find_customer_subscription(
        &self,
        customer_id: &CustomerId,
    ) -> AppResult<Option<ProviderSubscription>> {
        let url = self.url("/subscriptions");
        let list: CardSubscriptionList = self
            .send("find_customer_subscription", None, |client| {
                client.get(&url).query(&[
                    ("customer", customer_id.as_str()),
                    ("status", "all"),
                    ("limit", "10"),
                ])
            })
            .await?;

        let now = Utc::now();
        let mut snapshots = list
            .data
            .iter()
            .map(|s| s.to_provider_subscription(now))
            .collect::<AppResult<Vec<_>>>()?;
        // Newest first from the provider; prefer a live subscription over history.
        let live = snapshots.iter().position(|s| !s.status.is_terminal());
        Ok(match live {
            Some(index) => Some(snapshots.swap_remove(index)),
            None => snapshots.into_iter().next(),
        })
    }

    async fn verify_purchase_receipt(
        &self,
        _customer_id: &CustomerId,
        _receipt: &PurchaseReceipt,
    ) -> AppResult<ProviderSubscription> {
        Err(AppError::ProviderNotSupported)
    }
}

// ============================================================================
// Response handling
// ============================================================================

/// 404 → `NotFound`, 429/5xx → `ProviderUnavailable` (retried),
/// rejected credentials → `Internal`, other 4xx → `InvalidInput`.
async fn handle_response<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> AppResult<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AppError::ProviderUnavailable(format!("Failed to read response: {}", e)))?;

    if !status.is_success() {
        let message = serde_json::from_str::<CardErrorResponse>(&body)
            .ok()
            .and_then(|e| e.error.message.or(e.error.error_type))
            .unwrap_or_else(|| status.to_string());

        return Err(match status {
            StatusCode::NOT_FOUND => AppError::NotFound,
            StatusCode::TOO_MANY_REQUESTS => {
                AppError::ProviderUnavailable(format!("Card billing rate limited: {}", message))
            }
            s if s.is_server_error() => {
                tracing::warn!(status = %s, "Card billing server error");
                AppError::ProviderUnavailable(format!("Card billing error {}: {}", s, message))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                tracing::error!(status = %status, "Card billing rejected API credentials");
                AppError::Internal("Card billing rejected API credentials".into())
            }
            _ => {
                tracing::warn!(status = %status, message = %message, "Card billing request rejected");
                AppError::InvalidInput(format!("Card billing error: {}", message))
            }
        });
    }

    serde_json::from_str(&body).map_err(|e| {
        tracing::error!(error = %e, "Failed to parse card billing response");
        AppError::Internal(format!("Failed to parse card billing response: {}", e))
    })
}

fn timestamp(secs: i64, field: &str) -> AppResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| AppError::Validation(format!("{} out of range: {}", field, secs)))
}

// ============================================================================
// Card Billing Types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CardCustomer {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardPaymentMethod {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardSubscription {
    pub id: String,
    pub customer: String,
    pub status: String,
    pub current_period_start: i64,
    pub current_period_end: i64,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub items: CardSubscriptionItems,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CardSubscription {
    pub fn plan(&self) -> Option<Plan> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.recurring.as_ref())
            .and_then(|recurring| Plan::from_interval(&recurring.interval))
    }

    /// Local user id stamped into the subscription metadata, if any.
    pub fn user_id(&self) -> Option<Uuid> {
        self.metadata
            .get("user_id")
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    pub fn status(&self) -> SubscriptionStatus {
        map_status(&self.status)
    }

    /// Convert to the provider-agnostic shape. `observed_at` stands in for a
    /// cancellation the provider reports without a timestamp.
    pub fn to_provider_subscription(
        &self,
        observed_at: DateTime<Utc>,
    ) -> AppResult<ProviderSubscription> {
        let plan = self.plan().ok_or_else(|| {
            AppError::Validation(format!("Subscription {} has no recurring price", self.id))
        })?;
        let status = self.status();
        let cancelled_at = if status == SubscriptionStatus::Cancelled || self.cancel_at_period_end {
            let at = self.canceled_at.or(self.ended_at);
            Some(match at {
                Some(secs) => timestamp(secs, "canceled_at")?,
                None => observed_at,
            })
        } else {
            None
        };

        Ok(ProviderSubscription {
            provider: Provider::CardBilling,
            external_subscription_id: self.id.clone(),
            external_customer_id: self.customer.clone(),
            plan,
            status,
            current_period_start: timestamp(self.current_period_start, "current_period_start")?,
            current_period_end: timestamp(self.current_period_end, "current_period_end")?,
            cancelled_at,
        })
    }
}

/// `incomplete` and `paused` never paid for the current period.
pub fn map_status(status: &str) -> SubscriptionStatus {
    match status {
        "trialing" => SubscriptionStatus::Trialing,
        "active" => SubscriptionStatus::Active,
        "past_due" | "unpaid" => SubscriptionStatus::PastDue,
        "canceled" => SubscriptionStatus::Cancelled,
        _ => SubscriptionStatus::Expired,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CardSubscriptionItems {
    #[serde(default)]
    pub data: Vec<CardSubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardSubscriptionItem {
    pub price: CardPrice,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardPrice {
    pub id: String,
    pub recurring: Option<CardPriceRecurring>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardPriceRecurring {
    pub interval: String,
}

#[derive(Debug, Deserialize)]
pub struct CardSubscriptionList {
    pub data: Vec<CardSubscription>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardInvoice {
    pub id: String,
    pub customer: String,
    pub subscription: Option<String>,
    #[serde(default)]
    pub lines: CardInvoiceLines,
}

impl CardInvoice {
    /// Latest period end covered by the invoice lines.
    pub fn period_end(&self) -> AppResult<Option<DateTime<Utc>>> {
        self.lines
            .data
            .iter()
            .filter_map(|line| line.period.as_ref().map(|p| p.end))
            .max()
            .map(|secs| timestamp(secs, "period.end"))
            .transpose()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CardInvoiceLines {
    #[serde(default)]
    pub data: Vec<CardInvoiceLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardInvoiceLine {
    pub period: Option<CardPeriod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardPeriod {
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Deserialize)]
struct CardErrorResponse {
    error: CardError,
}

#[derive(Debug, Deserialize)]
struct CardError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: Option<String>,
}
