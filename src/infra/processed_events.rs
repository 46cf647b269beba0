use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

use crate::{
    app_error::{AppError, AppResult},
    domain::entities::provider::Provider,
    use_cases::webhook::ProcessedEventStore,
};

/// Webhook delivery ids seen within the dedup window, kept in Redis with a TTL.
#[derive(Clone)]
pub struct RedisProcessedEventStore {
    manager: ConnectionManager,
    window_secs: u64,
}

impl RedisProcessedEventStore {
    pub async fn new(redis_url: &str, window_secs: u64) -> AppResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            AppError::Internal(format!(
                "Redis connection failed (check redis password/URL): {e}"
            ))
        })?;
        let manager = ConnectionManager::new(client).await.map_err(|e| {
            AppError::Internal(format!(
                "Redis auth/connection failed (check redis password/URL): {e}"
            ))
        })?;

        Ok(Self {
            manager,
            window_secs: window_secs.max(1),
        })
    }

    fn key(provider: Provider, external_event_id: &str) -> String {
        format!("webhook:processed:{provider}:{external_event_id}")
    }
}

#[async_trait]
impl ProcessedEventStore for RedisProcessedEventStore {
    async fn is_processed(&self, provider: Provider, external_event_id: &str) -> AppResult<bool> {
        let mut conn = self.manager.clone();
        conn.exists(Self::key(provider, external_event_id))
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))
    }

    async fn mark_processed(&self, provider: Provider, external_event_id: &str) -> AppResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(Self::key(provider, external_event_id), 1, self.window_secs)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;
        Ok(())
    }
}
