use axum::{
    extract::{Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::CookieJar;
use uuid::Uuid;

use crate::{
    adapters::http::app_state::AppState,
    app_error::{AppError, AppResult},
    application::jwt,
};

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// Authenticated caller, inserted into request extensions by
/// [`require_entitlement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitledUser(pub Uuid);

/// Resolve the caller from the `Authorization: Bearer` header, falling back to
/// the access token cookie.
pub fn current_user_id(
    app_state: &AppState,
    headers: &HeaderMap,
    cookies: &CookieJar,
) -> AppResult<Uuid> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());

    let token = match bearer {
        Some(token) => token.to_owned(),
        None => cookies
            .get(ACCESS_TOKEN_COOKIE)
            .map(|c| c.value().to_owned())
            .ok_or(AppError::InvalidCredentials)?,
    };

    jwt::verify(&token, &app_state.config.jwt_secret)?.user_id()
}

/// Gate a route on an active entitlement.
///
/// ```ignore
/// Router::new()
///     .route("/premium", get(handler))
///     .layer(axum::middleware::from_fn_with_state(state.clone(), require_entitlement))
/// ```
pub async fn require_entitlement(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    cookies: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user_id = current_user_id(&app_state, &headers, &cookies)?;

    if !app_state
        .reconciliation
        .has_active_entitlement(user_id)
        .await?
    {
        tracing::debug!(user_id = %user_id, "Entitlement required");
        return Err(AppError::PaymentRequired);
    }

    request.extensions_mut().insert(EntitledUser(user_id));
    Ok(next.run(request).await)
}
