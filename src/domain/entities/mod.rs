pub mod provider;
pub mod reconcile_event;
pub mod subscription;
pub mod subscription_transition;
