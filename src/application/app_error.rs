use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    /// Webhook signature missing, malformed or mismatched.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Inbound payload could not be understood.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transient provider failure: timeout, connection error, 429 or 5xx.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Operation not supported by this provider")]
    ProviderNotSupported,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Not found")]
    NotFound,

    #[error("Forbidden")]
    Forbidden,

    #[error("Active subscription required")]
    PaymentRequired,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a webhook that failed with this error should be left
    /// unacknowledged so the provider redelivers it.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::ProviderUnavailable(_) => true,
            AppError::Persistence(_) => true,
            AppError::Internal(_) => true,

            AppError::Authentication(_) => false,
            AppError::InvalidCredentials => false,
            AppError::Validation(_) => false,
            AppError::InvalidInput(_) => false,
            AppError::ProviderNotSupported => false,
            AppError::NotFound => false,
            AppError::Forbidden => false,
            AppError::PaymentRequired => false,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Authentication(_) => ErrorCode::AuthenticationFailed,
            AppError::InvalidCredentials => ErrorCode::InvalidCredentials,
            AppError::Validation(_) => ErrorCode::ValidationError,
            AppError::InvalidInput(_) => ErrorCode::InvalidInput,
            AppError::ProviderUnavailable(_) => ErrorCode::ProviderUnavailable,
            AppError::ProviderNotSupported => ErrorCode::ProviderNotSupported,
            AppError::Persistence(_) => ErrorCode::PersistenceError,
            AppError::NotFound => ErrorCode::NotFound,
            AppError::Forbidden => ErrorCode::Forbidden,
            AppError::PaymentRequired => ErrorCode::PaymentRequired,
            AppError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    AuthenticationFailed,
    InvalidCredentials,
    ValidationError,
    InvalidInput,
    ProviderUnavailable,
    ProviderNotSupported,
    PersistenceError,
    NotFound,
    Forbidden,
    PaymentRequired,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::InvalidCredentials => "INVALID_CREDENTIALS",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            ErrorCode::ProviderNotSupported => "PROVIDER_NOT_SUPPORTED",
            ErrorCode::PersistenceError => "PERSISTENCE_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::PaymentRequired => "PAYMENT_REQUIRED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
