use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{
    adapters::persistence::{ONE_LIVE_PER_USER, PostgresPersistence, is_unique_violation},
    app_error::{AppError, AppResult},
    application::use_cases::reconciliation::SubscriptionRepoTrait,
    domain::entities::{provider::Provider, subscription::Subscription},
};

const SELECT_COLS: &str = r#"
    id, user_id, provider, external_customer_id, external_subscription_id,
    plan, status, current_period_start, current_period_end, cancelled_at,
    last_event_at, created_at, updated_at
"#;

const LIVE_STATUSES: &str = "('trialing', 'active', 'past_due')";

fn row_to_subscription(row: &sqlx::postgres::PgRow) -> Subscription {
    Subscription {
        id: row.get("id"),
        user_id: row.get("user_id"),
        provider: row.get("provider"),
        external_customer_id: row.get("external_customer_id"),
        external_subscription_id: row.get("external_subscription_id"),
        plan: row.get("plan"),
        status: row.get("status"),
        current_period_start: row.get("current_period_start"),
        current_period_end: row.get("current_period_end"),
        cancelled_at: row.get("cancelled_at"),
        last_event_at: row.get("last_event_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Cancels every other live row of the subscription's user so that at most
/// one lineage stays current.
async fn supersede_other_lineages(
    tx: &mut Transaction<'_, Postgres>,
    subscription: &Subscription,
) -> AppResult<()> {
    if subscription.status.is_terminal() {
        return Ok(());
    }

    let superseded = sqlx::query(&format!(
        r#"
        UPDATE subscriptions
        SET status = 'cancelled',
            cancelled_at = COALESCE(cancelled_at, $3),
            updated_at = $3
        WHERE user_id = $1 AND id <> $2 AND status IN {}
        "#,
        LIVE_STATUSES
    ))
    .bind(subscription.user_id)
    .bind(subscription.id)
    .bind(subscription.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(AppError::from)?;

    if superseded.rows_affected() > 0 {
        tracing::info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            superseded = superseded.rows_affected(),
            "Superseded previous subscription lineage"
        );
    }
    Ok(())
}

#[async_trait]
impl SubscriptionRepoTrait for PostgresPersistence {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1",
            SELECT_COLS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_subscription))
    }

    async fn get_by_external_id(
        &self,
        provider: Provider,
        external_subscription_id: &str,
    ) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE provider = $1 AND external_subscription_id = $2",
            SELECT_COLS
        ))
        .bind(provider)
        .bind(external_subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_subscription))
    }

    async fn get_current_for_user(&self, user_id: Uuid) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE user_id = $1
            ORDER BY (status IN {}) DESC, updated_at DESC
            LIMIT 1
            "#,
            SELECT_COLS, LIVE_STATUSES
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_subscription))
    }

    async fn insert(&self, subscription: &Subscription) -> AppResult<bool> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;

        supersede_other_lineages(&mut tx, subscription).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, provider, external_customer_id, external_subscription_id,
                plan, status, current_period_start, current_period_end, cancelled_at,
                last_event_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (provider, external_subscription_id) DO NOTHING
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.user_id)
        .bind(subscription.provider)
        .bind(&subscription.external_customer_id)
        .bind(&subscription.external_subscription_id)
        .bind(subscription.plan)
        .bind(subscription.status)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancelled_at)
        .bind(subscription.last_event_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                tx.commit().await.map_err(AppError::from)?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            // Another lineage for the same user went live concurrently.
            Err(e) if is_unique_violation(&e, ONE_LIVE_PER_USER) => Ok(false),
            Err(e) => Err(AppError::from(e)),
        }
    }

    async fn update_if_unchanged(
        &self,
        subscription: &Subscription,
        expected_updated_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;

        supersede_other_lineages(&mut tx, subscription).await?;

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET plan = $3,
                status = $4,
                current_period_start = $5,
                current_period_end = $6,
                cancelled_at = $7,
                last_event_at = $8,
                updated_at = $9
            WHERE id = $1 AND updated_at = $2
            "#,
        )
        .bind(subscription.id)
        .bind(expected_updated_at)
        .bind(subscription.plan)
        .bind(subscription.status)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancelled_at)
        .bind(subscription.last_event_at)
        .bind(subscription.updated_at)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => {
                tx.commit().await.map_err(AppError::from)?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) if is_unique_violation(&e, ONE_LIVE_PER_USER) => Ok(false),
            Err(e) => Err(AppError::from(e)),
        }
    }

    async fn list_lapse_candidates(
        &self,
        period_end_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE status IN {} AND current_period_end <= $1
            ORDER BY current_period_end ASC
            LIMIT $2
            "#,
            SELECT_COLS, LIVE_STATUSES
        ))
        .bind(period_end_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_subscription).collect())
    }
}
