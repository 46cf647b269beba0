use crate::{adapters::persistence::PostgresPersistence, infra::db::init_db};

pub mod app;
pub mod card_billing_client;
pub mod config;
pub mod db;
pub mod error;
pub mod http_client;
pub mod lapse_sweeper;
pub mod processed_events;
pub mod retry;
pub mod setup;
pub mod store_aggregator_client;
pub mod webhook_verifier;

pub async fn postgres_persistence(database_url: &str) -> anyhow::Result<PostgresPersistence> {
    let pool = init_db(database_url).await?;
    let persistence = PostgresPersistence::new(pool);
    Ok(persistence)
}
