use sqlx::PgPool;

use crate::app_error::AppError;

pub mod provider_customer;
pub mod subscription;

#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        PostgresPersistence { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Name of the partial unique index allowing one live subscription per user.
pub(crate) const ONE_LIVE_PER_USER: &str = "subscriptions_one_live_per_user";

pub(crate) fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.is_unique_violation() && db_err.constraint() == Some(constraint)
    )
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() {
                    AppError::InvalidInput("A record with this value already exists".into())
                } else if db_err.is_foreign_key_violation() {
                    AppError::InvalidInput("Referenced record not found".into())
                } else {
                    tracing::error!(error = %err, "Database error");
                    AppError::Persistence("Database operation failed".into())
                }
            }
            _ => {
                tracing::error!(error = %err, "Database error");
                AppError::Persistence("Database operation failed".into())
            }
        }
    }
}
