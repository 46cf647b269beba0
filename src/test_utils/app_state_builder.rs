//! Builder for `AppState` backed entirely by in-memory mocks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;

use super::{
    InMemoryIdentityDirectory, InMemoryProcessedEventStore, InMemorySubscriptionRepo,
    RecordingNotifier, ScriptedProviderClient, TEST_JWT_SECRET,
};
use crate::{
    adapters::{
        http::app_state::{AppState, HttpConfig},
        webhooks,
    },
    application::{
        ports::provider_client::ProviderClient,
        use_cases::{reconciliation::ReconciliationUseCases, webhook::WebhookUseCases},
    },
    domain::entities::{provider::Provider, subscription::Subscription},
    infra::webhook_verifier::WebhookVerifier,
};

pub const TEST_SYNC_TIMEOUT: Duration = Duration::from_secs(2);

pub struct TestAppStateBuilder {
    subscriptions: Vec<Subscription>,
    repo: Option<Arc<InMemorySubscriptionRepo>>,
    identity: Option<Arc<InMemoryIdentityDirectory>>,
    notifier: Option<Arc<RecordingNotifier>>,
    processed_events: Option<Arc<InMemoryProcessedEventStore>>,
    providers: HashMap<Provider, Arc<ScriptedProviderClient>>,
    webhook_verifier: WebhookVerifier,
    sync_timeout: Duration,
}

impl TestAppStateBuilder {
    pub fn new() -> Self {
        Self {
            subscriptions: vec![],
            repo: None,
            identity: None,
            notifier: None,
            processed_events: None,
            providers: HashMap::new(),
            webhook_verifier: WebhookVerifier::default(),
            sync_timeout: TEST_SYNC_TIMEOUT,
        }
    }

    /// Seed a subscription row.
    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    /// Share a repo with the test for assertions.
    pub fn with_repo(mut self, repo: Arc<InMemorySubscriptionRepo>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn with_identity(mut self, identity: Arc<InMemoryIdentityDirectory>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<RecordingNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_processed_events(mut self, store: Arc<InMemoryProcessedEventStore>) -> Self {
        self.processed_events = Some(store);
        self
    }

    /// Replace the client for the provider it reports.
    pub fn with_provider(mut self, client: Arc<ScriptedProviderClient>) -> Self {
        self.providers.insert(client.provider(), client);
        self
    }

    /// Defaults to no secrets, which accepts unsigned deliveries.
    pub fn with_webhook_verifier(mut self, verifier: WebhookVerifier) -> Self {
        self.webhook_verifier = verifier;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn build(self) -> AppState {
        let repo = self
            .repo
            .unwrap_or_else(|| Arc::new(InMemorySubscriptionRepo::new()));
        for subscription in self.subscriptions {
            repo.seed(subscription);
        }
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(InMemoryIdentityDirectory::new()));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(RecordingNotifier::new()));
        let processed_events = self
            .processed_events
            .unwrap_or_else(|| Arc::new(InMemoryProcessedEventStore::new()));

        let mut providers = self.providers;
        let clients: Vec<Arc<dyn ProviderClient>> = Provider::ALL
            .into_iter()
            .map(|provider| {
                let client = providers
                    .remove(&provider)
                    .unwrap_or_else(|| Arc::new(ScriptedProviderClient::new(provider)));
                client as Arc<dyn ProviderClient>
            })
            .collect();

        let reconciliation = Arc::new(ReconciliationUseCases::new(
            repo,
            identity,
            clients,
            notifier,
            self.sync_timeout,
        ));
        let webhooks = Arc::new(WebhookUseCases::new(
            webhooks::dispatcher(),
            processed_events,
            reconciliation.clone(),
        ));

        AppState {
            config: Arc::new(HttpConfig {
                jwt_secret: SecretString::new(TEST_JWT_SECRET.into()),
            }),
            reconciliation,
            webhooks,
            webhook_verifier: Arc::new(self.webhook_verifier),
        }
    }
}

impl Default for TestAppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}
