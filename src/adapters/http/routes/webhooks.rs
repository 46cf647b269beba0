//! Inbound provider webhooks.
//!
//! Each delivery is verified, parsed and reconciled before the response is
//! sent. A 2xx tells the provider to stop redelivering, so only transient
//! failures answer with 5xx.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::{
    adapters::{http::app_state::AppState, webhooks::parse_envelope},
    app_error::AppError,
    domain::entities::provider::Provider,
    infra::webhook_verifier::VerificationMode,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/card-billing", post(handle_card_billing))
        .route("/store-aggregator", post(handle_store_aggregator))
}

/// POST /api/webhooks/card-billing
async fn handle_card_billing(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_webhook(&app_state, Provider::CardBilling, &headers, &body).await
}

/// POST /api/webhooks/store-aggregator
async fn handle_store_aggregator(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_webhook(&app_state, Provider::StoreAggregator, &headers, &body).await
}

async fn handle_webhook(
    app_state: &AppState,
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    let received_at = Utc::now();

    let mode = match app_state
        .webhook_verifier
        .verify(provider, headers, body, received_at)
    {
        Ok(mode) => mode,
        Err(e) => return e.into_response(),
    };

    let event = match parse_envelope(provider, body, received_at) {
        Ok(event) => event,
        Err(e) => {
            warn!(provider = %provider, error = %e, "Unparseable webhook envelope");
            return e.into_response();
        }
    };
    let event_type = event.event_type.clone();
    let event_id = event.external_event_id.clone();

    match app_state.webhooks.process(event).await {
        Ok(result) => {
            info!(
                provider = %provider,
                event_type = %event_type,
                event_id = %event_id,
                result = result.label(),
                unverified = mode == VerificationMode::Unverified,
                "Webhook processed"
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({ "result": result.label() })),
            )
                .into_response()
        }
        Err(e) if e.is_retryable() => {
            webhook_retryable_error(&e, provider, &event_type, &event_id).into_response()
        }
        Err(e) => {
            warn!(
                provider = %provider,
                event_type = %event_type,
                event_id = %event_id,
                error = %e,
                retryable = false,
                "Webhook processing failed, acknowledging"
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({ "result": "rejected" })),
            )
                .into_response()
        }
    }
}

/// Returns 500 so the provider redelivers the event.
fn webhook_retryable_error(
    error: &AppError,
    provider: Provider,
    event_type: &str,
    event_id: &str,
) -> StatusCode {
    error!(
        error = %error,
        provider = %provider,
        event_type,
        event_id,
        retryable = true,
        "Webhook processing failed, returning 500 for provider retry"
    );
    StatusCode::INTERNAL_SERVER_ERROR
}
