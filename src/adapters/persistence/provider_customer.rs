use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::ports::identity::IdentityDirectory,
    domain::entities::provider::Provider,
};

/// Customer ids users hold at each provider, recorded when a subscription is
/// first created or a card-billing customer is opened.
#[async_trait]
impl IdentityDirectory for PostgresPersistence {
    async fn user_for_customer(
        &self,
        provider: Provider,
        external_customer_id: &str,
    ) -> AppResult<Option<Uuid>> {
        sqlx::query_scalar(
            "SELECT user_id FROM provider_customers WHERE provider = $1 AND external_customer_id = $2",
        )
        .bind(provider)
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)
    }

    async fn customer_for_user(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> AppResult<Option<String>> {
        sqlx::query_scalar(
            "SELECT external_customer_id FROM provider_customers WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)
    }

    async fn link_customer(
        &self,
        user_id: Uuid,
        provider: Provider,
        external_customer_id: &str,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO provider_customers (user_id, provider, external_customer_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(provider)
        .bind(external_customer_id)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                user_id = %user_id,
                provider = %provider,
                "Provider customer already linked"
            );
        }
        Ok(())
    }
}
