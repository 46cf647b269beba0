pub mod http;
pub mod notifications;
pub mod persistence;
pub mod webhooks;
