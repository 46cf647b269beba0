use std::sync::Arc;

use axum::extract::FromRef;
use secrecy::SecretString;

use crate::{
    infra::webhook_verifier::WebhookVerifier,
    use_cases::{reconciliation::ReconciliationUseCases, webhook::WebhookUseCases},
};

/// Settings the HTTP layer reads per request.
pub struct HttpConfig {
    pub jwt_secret: SecretString,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HttpConfig>,
    pub reconciliation: Arc<ReconciliationUseCases>,
    pub webhooks: Arc<WebhookUseCases>,
    pub webhook_verifier: Arc<WebhookVerifier>,
}

impl FromRef<AppState> for Arc<ReconciliationUseCases> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.reconciliation.clone()
    }
}
