use async_trait::async_trait;
use uuid::Uuid;

use crate::{app_error::AppResult, domain::entities::provider::Provider};

/// Mapping between local users and each provider's customer identifiers.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn user_for_customer(
        &self,
        provider: Provider,
        external_customer_id: &str,
    ) -> AppResult<Option<Uuid>>;

    async fn customer_for_user(&self, user_id: Uuid, provider: Provider)
    -> AppResult<Option<String>>;

    async fn link_customer(
        &self,
        user_id: Uuid,
        provider: Provider,
        external_customer_id: &str,
    ) -> AppResult<()>;
}
