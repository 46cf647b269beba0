pub mod identity;
pub mod notifier;
pub mod provider_client;
