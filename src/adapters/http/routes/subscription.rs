use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    adapters::http::{app_state::AppState, middleware::current_user_id},
    app_error::{AppError, AppResult},
    application::ports::provider_client::PurchaseReceipt,
    domain::entities::{
        provider::Provider,
        subscription::{Plan, Subscription, SubscriptionStatus},
    },
};

/// Client-facing view of the caller's subscription.
#[derive(Debug, Serialize)]
struct SubscriptionResponse {
    id: Uuid,
    provider: Provider,
    plan: Plan,
    status: SubscriptionStatus,
    current_period_end: DateTime<Utc>,
    cancelled_at: Option<DateTime<Utc>>,
    entitled: bool,
    /// Provider could not be reached; this is the last known state.
    stale: bool,
}

impl SubscriptionResponse {
    fn project(subscription: &Subscription, stale: bool) -> Self {
        Self {
            id: subscription.id,
            provider: subscription.provider,
            plan: subscription.plan,
            status: subscription.status,
            current_period_end: subscription.current_period_end,
            cancelled_at: subscription.cancelled_at,
            entitled: subscription.has_entitlement(Utc::now()),
            stale,
        }
    }
}

#[derive(Deserialize)]
struct CreatePayload {
    plan: Plan,
    payment_method_id: String,
}

#[derive(Deserialize)]
struct CancelPayload {
    subscription_id: Uuid,
    #[serde(default = "default_at_period_end")]
    cancel_at_period_end: bool,
}

fn default_at_period_end() -> bool {
    true
}

#[derive(Deserialize)]
struct PaymentMethodPayload {
    payment_method_id: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_subscription).post(create_subscription))
        .route("/sync", post(sync_subscription))
        .route("/cancel", post(cancel_subscription))
        .route("/receipts", post(submit_receipt))
        .route("/payment-method", post(update_payment_method))
}

/// GET /api/subscription
async fn get_subscription(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    cookies: CookieJar,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&app_state, &headers, &cookies)?;
    let subscription = app_state
        .reconciliation
        .current_subscription(user_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(SubscriptionResponse::project(&subscription, false)))
}

/// POST /api/subscription/sync
async fn sync_subscription(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    cookies: CookieJar,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&app_state, &headers, &cookies)?;
    let outcome = app_state.reconciliation.sync_now(user_id).await?;
    let subscription = outcome.subscription.ok_or(AppError::NotFound)?;
    Ok(Json(SubscriptionResponse::project(
        &subscription,
        outcome.stale,
    )))
}

/// POST /api/subscription/cancel
async fn cancel_subscription(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    cookies: CookieJar,
    Json(payload): Json<CancelPayload>,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&app_state, &headers, &cookies)?;
    let subscription = app_state
        .reconciliation
        .cancel(
            user_id,
            payload.subscription_id,
            payload.cancel_at_period_end,
        )
        .await?;
    Ok(Json(SubscriptionResponse::project(&subscription, false)))
}

/// POST /api/subscription/receipts
async fn submit_receipt(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    cookies: CookieJar,
    Json(receipt): Json<PurchaseReceipt>,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&app_state, &headers, &cookies)?;
    if receipt.purchase_token.trim().is_empty() {
        return Err(AppError::InvalidInput("purchase_token is required".into()));
    }
    let subscription = app_state
        .reconciliation
        .verify_receipt(user_id, &receipt)
        .await?;
    Ok(Json(SubscriptionResponse::project(&subscription, false)))
}

/// POST /api/subscription
async fn create_subscription(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    cookies: CookieJar,
    Json(payload): Json<CreatePayload>,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&app_state, &headers, &cookies)?;
    if payload.payment_method_id.trim().is_empty() {
        return Err(AppError::InvalidInput("payment_method_id is required".into()));
    }
    let subscription = app_state
        .reconciliation
        .create_card_subscription(user_id, payload.plan, &payload.payment_method_id)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SubscriptionResponse::project(&subscription, false)),
    ))
}

/// POST /api/subscription/payment-method
async fn update_payment_method(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    cookies: CookieJar,
    Json(payload): Json<PaymentMethodPayload>,
) -> AppResult<impl IntoResponse> {
    let user_id = current_user_id(&app_state, &headers, &cookies)?;
    if payload.payment_method_id.trim().is_empty() {
        return Err(AppError::InvalidInput("payment_method_id is required".into()));
    }
    app_state
        .reconciliation
        .update_payment_method(user_id, &payload.payment_method_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum_test::TestServer;
    use chrono::Duration;
    use serde_json::json;

    use crate::test_utils::{
        InMemoryIdentityDirectory, InMemorySubscriptionRepo, ScriptedProviderClient,
        TestAppStateBuilder, create_test_snapshot, create_test_subscription, test_access_token,
    };

    fn build_test_router(app_state: AppState) -> Router<()> {
        router().with_state(app_state)
    }

    fn bearer(user_id: Uuid) -> String {
        format!("Bearer {}", test_access_token(user_id))
    }

    // =========================================================================
    // GET /
    // =========================================================================

    #[tokio::test]
    async fn get_without_token_returns_401() {
        let app_state = TestAppStateBuilder::new().build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server.get("/").await;

        response.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn get_without_subscription_returns_404() {
        let app_state = TestAppStateBuilder::new().build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .get("/")
            .add_header("Authorization", bearer(Uuid::new_v4()))
            .await;

        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_returns_projection() {
        let user_id = Uuid::new_v4();
        let subscription = create_test_subscription(user_id, |s| {
            s.plan = Plan::Yearly;
        });
        let app_state = TestAppStateBuilder::new()
            .with_subscription(subscription.clone())
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .get("/")
            .add_header("Authorization", bearer(user_id))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["id"], json!(subscription.id));
        assert_eq!(body["provider"], "card_billing");
        assert_eq!(body["plan"], "yearly");
        assert_eq!(body["status"], "active");
        assert_eq!(body["entitled"], true);
        assert_eq!(body["stale"], false);
    }

    #[tokio::test]
    async fn get_does_not_expose_other_users_subscription() {
        let owner = Uuid::new_v4();
        let app_state = TestAppStateBuilder::new()
            .with_subscription(create_test_subscription(owner, |_| {}))
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .get("/")
            .add_header("Authorization", bearer(Uuid::new_v4()))
            .await;

        response.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_expires_elapsed_subscription() {
        let user_id = Uuid::new_v4();
        let subscription = create_test_subscription(user_id, |s| {
            s.current_period_end = Utc::now() - Duration::seconds(5);
        });
        let app_state = TestAppStateBuilder::new()
            .with_subscription(subscription)
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .get("/")
            .add_header("Authorization", bearer(user_id))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "expired");
        assert_eq!(body["entitled"], false);
    }

    // =========================================================================
    // POST /sync
    // =========================================================================

    #[tokio::test]
    async fn sync_applies_provider_state() {
        let user_id = Uuid::new_v4();
        let local = create_test_subscription(user_id, |s| {
            s.external_subscription_id = "sub_sync".into();
        });
        let remote = create_test_snapshot(|s| {
            s.external_subscription_id = "sub_sync".into();
            s.external_customer_id = local.external_customer_id.clone();
            s.status = SubscriptionStatus::PastDue;
        });
        let card = Arc::new(ScriptedProviderClient::new(Provider::CardBilling).with_subscription(remote));
        let app_state = TestAppStateBuilder::new()
            .with_subscription(local)
            .with_provider(card)
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/sync")
            .add_header("Authorization", bearer(user_id))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "past_due");
        assert_eq!(body["entitled"], true);
        assert_eq!(body["stale"], false);
    }

    #[tokio::test]
    async fn sync_with_provider_down_serves_stale_cache() {
        let user_id = Uuid::new_v4();
        let card = Arc::new(ScriptedProviderClient::new(Provider::CardBilling));
        card.set_unavailable(true);
        let app_state = TestAppStateBuilder::new()
            .with_subscription(create_test_subscription(user_id, |_| {}))
            .with_provider(card)
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/sync")
            .add_header("Authorization", bearer(user_id))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "active");
        assert_eq!(body["stale"], true);
    }

    #[tokio::test]
    async fn sync_with_provider_down_and_no_cache_returns_503() {
        let card = Arc::new(ScriptedProviderClient::new(Provider::CardBilling));
        card.set_unavailable(true);
        let user_id = Uuid::new_v4();
        let identity = Arc::new(InMemoryIdentityDirectory::new());
        identity.seed(user_id, Provider::CardBilling, "cus_down");
        let app_state = TestAppStateBuilder::new()
            .with_identity(identity)
            .with_provider(card)
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/sync")
            .add_header("Authorization", bearer(user_id))
            .await;

        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    }

    // =========================================================================
    // POST /cancel
    // =========================================================================

    #[tokio::test]
    async fn cancel_at_period_end_keeps_entitlement() {
        let user_id = Uuid::new_v4();
        let local = create_test_subscription(user_id, |_| {});
        let remote = create_test_snapshot(|s| {
            s.external_subscription_id = local.external_subscription_id.clone();
            s.external_customer_id = local.external_customer_id.clone();
            s.current_period_start = local.current_period_start;
            s.current_period_end = local.current_period_end;
        });
        let card = Arc::new(ScriptedProviderClient::new(Provider::CardBilling).with_subscription(remote));
        let app_state = TestAppStateBuilder::new()
            .with_subscription(local.clone())
            .with_provider(card)
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/cancel")
            .add_header("Authorization", bearer(user_id))
            .json(&json!({ "subscription_id": local.id, "cancel_at_period_end": true }))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "active");
        assert_eq!(body["entitled"], true);
        assert!(!body["cancelled_at"].is_null());
    }

    #[tokio::test]
    async fn cancel_immediately_revokes_access() {
        let user_id = Uuid::new_v4();
        let local = create_test_subscription(user_id, |_| {});
        let remote = create_test_snapshot(|s| {
            s.external_subscription_id = local.external_subscription_id.clone();
            s.external_customer_id = local.external_customer_id.clone();
        });
        let card = Arc::new(ScriptedProviderClient::new(Provider::CardBilling).with_subscription(remote));
        let app_state = TestAppStateBuilder::new()
            .with_subscription(local.clone())
            .with_provider(card)
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/cancel")
            .add_header("Authorization", bearer(user_id))
            .json(&json!({ "subscription_id": local.id, "cancel_at_period_end": false }))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["status"], "cancelled");
        assert_eq!(body["entitled"], false);
    }

    #[tokio::test]
    async fn cancel_other_users_subscription_returns_403() {
        let local = create_test_subscription(Uuid::new_v4(), |_| {});
        let app_state = TestAppStateBuilder::new()
            .with_subscription(local.clone())
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/cancel")
            .add_header("Authorization", bearer(Uuid::new_v4()))
            .json(&json!({ "subscription_id": local.id }))
            .await;

        response.assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn cancel_unknown_subscription_returns_404() {
        let app_state = TestAppStateBuilder::new().build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/cancel")
            .add_header("Authorization", bearer(Uuid::new_v4()))
            .json(&json!({ "subscription_id": Uuid::new_v4() }))
            .await;

        response.assert_status(StatusCode::NOT_FOUND);
    }

    // =========================================================================
    // POST /receipts
    // =========================================================================

    #[tokio::test]
    async fn receipt_records_store_subscription() {
        let user_id = Uuid::new_v4();
        let snapshot = create_test_snapshot(|s| {
            s.provider = Provider::StoreAggregator;
            s.external_subscription_id = "txn_receipt".into();
            s.external_customer_id = user_id.to_string();
        });
        let store = Arc::new(
            ScriptedProviderClient::new(Provider::StoreAggregator)
                .with_receipt("token-1", snapshot),
        );
        let repo = Arc::new(InMemorySubscriptionRepo::new());
        let app_state = TestAppStateBuilder::new()
            .with_repo(repo.clone())
            .with_provider(store)
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/receipts")
            .add_header("Authorization", bearer(user_id))
            .json(&json!({ "purchase_token": "token-1", "product_id": "premium_monthly" }))
            .await;

        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert_eq!(body["provider"], "store_aggregator");
        assert_eq!(body["entitled"], true);
        assert!(repo.current_for_user(user_id).is_some());
    }

    #[tokio::test]
    async fn receipt_with_unknown_token_returns_400() {
        let store = Arc::new(ScriptedProviderClient::new(Provider::StoreAggregator));
        let app_state = TestAppStateBuilder::new().with_provider(store).build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/receipts")
            .add_header("Authorization", bearer(Uuid::new_v4()))
            .json(&json!({ "purchase_token": "forged" }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn receipt_with_empty_token_returns_400() {
        let app_state = TestAppStateBuilder::new().build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/receipts")
            .add_header("Authorization", bearer(Uuid::new_v4()))
            .json(&json!({ "purchase_token": "  " }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    // =========================================================================
    // POST /
    // =========================================================================

    #[tokio::test]
    async fn create_starts_card_subscription() {
        let user_id = Uuid::new_v4();
        let identity = Arc::new(InMemoryIdentityDirectory::new());
        let app_state = TestAppStateBuilder::new()
            .with_identity(identity.clone())
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/")
            .add_header("Authorization", bearer(user_id))
            .json(&json!({ "plan": "monthly", "payment_method_id": "pm_card" }))
            .await;

        response.assert_status(StatusCode::CREATED);
        let body: serde_json::Value = response.json();
        assert_eq!(body["provider"], "card_billing");
        assert_eq!(body["plan"], "monthly");
        assert_eq!(body["status"], "active");
        assert!(identity.linked(user_id, Provider::CardBilling).is_some());
    }

    #[tokio::test]
    async fn create_while_entitled_returns_400() {
        let user_id = Uuid::new_v4();
        let app_state = TestAppStateBuilder::new()
            .with_subscription(create_test_subscription(user_id, |_| {}))
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/")
            .add_header("Authorization", bearer(user_id))
            .json(&json!({ "plan": "weekly", "payment_method_id": "pm_card" }))
            .await;

        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_with_unknown_plan_returns_422() {
        let app_state = TestAppStateBuilder::new().build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/")
            .add_header("Authorization", bearer(Uuid::new_v4()))
            .json(&json!({ "plan": "lifetime", "payment_method_id": "pm_card" }))
            .await;

        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
    }

    // =========================================================================
    // POST /payment-method
    // =========================================================================

    #[tokio::test]
    async fn payment_method_update_returns_204() {
        let user_id = Uuid::new_v4();
        let identity = Arc::new(InMemoryIdentityDirectory::new());
        identity.seed(user_id, Provider::CardBilling, "cus_pm");
        let card = Arc::new(ScriptedProviderClient::new(Provider::CardBilling));
        let app_state = TestAppStateBuilder::new()
            .with_identity(identity)
            .with_provider(card.clone())
            .build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/payment-method")
            .add_header("Authorization", bearer(user_id))
            .json(&json!({ "payment_method_id": "pm_new" }))
            .await;

        response.assert_status(StatusCode::NO_CONTENT);
        assert_eq!(card.default_payment_method("cus_pm").as_deref(), Some("pm_new"));
    }

    #[tokio::test]
    async fn payment_method_without_customer_returns_404() {
        let app_state = TestAppStateBuilder::new().build();
        let server = TestServer::new(build_test_router(app_state)).unwrap();

        let response = server
            .post("/payment-method")
            .add_header("Authorization", bearer(Uuid::new_v4()))
            .json(&json!({ "payment_method_id": "pm_new" }))
            .await;

        response.assert_status(StatusCode::NOT_FOUND);
    }
}
