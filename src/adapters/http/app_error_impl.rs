use crate::app_error::{AppError, ErrorCode};
use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        match self {
            AppError::Authentication(msg) => {
                tracing::warn!(reason = %msg, "Webhook authentication failed");
                error_resp(StatusCode::UNAUTHORIZED, code, None)
            }
            AppError::InvalidCredentials => error_resp(StatusCode::UNAUTHORIZED, code, None),
            AppError::Validation(msg) | AppError::InvalidInput(msg) => {
                tracing::debug!(message = %msg, "Rejected request");
                error_resp(StatusCode::BAD_REQUEST, code, Some(msg))
            }
            AppError::ProviderNotSupported => error_resp(
                StatusCode::BAD_REQUEST,
                code,
                Some("Operation not supported by this provider".into()),
            ),
            AppError::NotFound => error_resp(StatusCode::NOT_FOUND, code, None),
            AppError::Forbidden => error_resp(StatusCode::FORBIDDEN, code, None),
            AppError::PaymentRequired => error_resp(StatusCode::PAYMENT_REQUIRED, code, None),
            AppError::ProviderUnavailable(msg) => {
                tracing::error!(error = %msg, "Provider unavailable");
                error_resp(StatusCode::SERVICE_UNAVAILABLE, code, None)
            }
            AppError::Persistence(msg) | AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                error_resp(StatusCode::INTERNAL_SERVER_ERROR, code, None)
            }
        }
    }
}

fn error_resp(status: StatusCode, code: ErrorCode, message: Option<String>) -> Response {
    let body = match message {
        Some(msg) => serde_json::json!({ "code": code.as_str(), "message": msg }),
        None => serde_json::json!({ "code": code.as_str() }),
    };
    (status, Json(body)).into_response()
}
