use reqwest::Client;
use serde::Serialize;
use url::Url;
use uuid::Uuid;

use crate::{
    application::ports::notifier::Notifier,
    domain::entities::subscription_transition::NotificationKind,
};

#[derive(Debug, Serialize)]
struct PushRequest {
    user_id: Uuid,
    kind: NotificationKind,
    metadata: serde_json::Value,
}

/// Sends notifications to the push gateway on a detached task. Without a
/// gateway URL notifications are only logged.
#[derive(Clone)]
pub struct PushGatewayNotifier {
    client: Client,
    gateway_url: Option<Url>,
}

impl PushGatewayNotifier {
    pub fn new(client: Client, gateway_url: Option<Url>) -> Self {
        Self {
            client,
            gateway_url,
        }
    }
}

impl Notifier for PushGatewayNotifier {
    fn notify(&self, user_id: Uuid, kind: NotificationKind, metadata: serde_json::Value) {
        let Some(url) = self.gateway_url.clone() else {
            tracing::info!(user_id = %user_id, kind = %kind, "Notification (no push gateway configured)");
            return;
        };

        let client = self.client.clone();
        let request = PushRequest {
            user_id,
            kind,
            metadata,
        };

        tokio::spawn(async move {
            match client.post(url).json(&request).send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(user_id = %user_id, kind = %kind, "Notification delivered");
                }
                Ok(response) => {
                    tracing::warn!(
                        user_id = %user_id,
                        kind = %kind,
                        status = %response.status(),
                        "Push gateway rejected notification"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        kind = %kind,
                        error = %e,
                        "Failed to deliver notification"
                    );
                }
            }
        });
    }
}
