use uuid::Uuid;

use crate::domain::entities::subscription_transition::NotificationKind;

/// Outbound user notifications fired after a subscription write commits.
///
/// Calls must return immediately. Delivery failures are logged by the
/// implementation and never surface to the caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, user_id: Uuid, kind: NotificationKind, metadata: serde_json::Value);
}
