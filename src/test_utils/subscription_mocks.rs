//! In-memory implementations of the reconciliation ports.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::{identity::IdentityDirectory, notifier::Notifier},
        use_cases::{reconciliation::SubscriptionRepoTrait, webhook::ProcessedEventStore},
    },
    domain::entities::{
        provider::Provider,
        subscription::{Subscription, SubscriptionStatus},
        subscription_transition::NotificationKind,
    },
};

// ============================================================================
// InMemorySubscriptionRepo
// ============================================================================

#[derive(Default)]
pub struct InMemorySubscriptionRepo {
    pub subscriptions: Mutex<HashMap<Uuid, Subscription>>,
    fail_writes: AtomicBool,
    pending_conflicts: AtomicUsize,
}

impl InMemorySubscriptionRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriptions(subscriptions: Vec<Subscription>) -> Self {
        let repo = Self::new();
        for subscription in subscriptions {
            repo.seed(subscription);
        }
        repo
    }

    /// Store a row as-is, bypassing lineage handling.
    pub fn seed(&self, subscription: Subscription) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.id, subscription);
    }

    /// Make every insert and update fail with a persistence error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Simulate another writer touching the row before each of the next `n`
    /// compare-and-swap updates.
    pub fn conflict_next_updates(&self, n: usize) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<Subscription> {
        self.subscriptions.lock().unwrap().values().cloned().collect()
    }

    pub fn current_for_user(&self, user_id: Uuid) -> Option<Subscription> {
        current_for(&self.subscriptions.lock().unwrap(), user_id)
    }

    pub fn live_count(&self, user_id: Uuid) -> usize {
        self.subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.user_id == user_id && !s.status.is_terminal())
            .count()
    }

    fn check_writable(&self) -> AppResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::Persistence("simulated write failure".into()));
        }
        Ok(())
    }
}

fn current_for(rows: &HashMap<Uuid, Subscription>, user_id: Uuid) -> Option<Subscription> {
    rows.values()
        .filter(|s| s.user_id == user_id)
        .max_by_key(|s| (!s.status.is_terminal(), s.updated_at))
        .cloned()
}

fn supersede_other_lineages(rows: &mut HashMap<Uuid, Subscription>, subscription: &Subscription) {
    if subscription.status.is_terminal() {
        return;
    }
    for other in rows.values_mut() {
        if other.user_id == subscription.user_id
            && other.id != subscription.id
            && !other.status.is_terminal()
        {
            other.status = SubscriptionStatus::Cancelled;
            other.cancelled_at = other.cancelled_at.or(Some(subscription.updated_at));
            other.updated_at = subscription.updated_at;
        }
    }
}

#[async_trait]
impl SubscriptionRepoTrait for InMemorySubscriptionRepo {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>> {
        Ok(self.subscriptions.lock().unwrap().get(&id).cloned())
    }

    async fn get_by_external_id(
        &self,
        provider: Provider,
        external_subscription_id: &str,
    ) -> AppResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.provider == provider && s.external_subscription_id == external_subscription_id)
            .cloned())
    }

    async fn get_current_for_user(&self, user_id: Uuid) -> AppResult<Option<Subscription>> {
        Ok(current_for(&self.subscriptions.lock().unwrap(), user_id))
    }

    async fn insert(&self, subscription: &Subscription) -> AppResult<bool> {
        self.check_writable()?;
        let mut rows = self.subscriptions.lock().unwrap();
        if rows.values().any(|s| {
            s.provider == subscription.provider
                && s.external_subscription_id == subscription.external_subscription_id
        }) {
            return Ok(false);
        }
        supersede_other_lineages(&mut rows, subscription);
        rows.insert(subscription.id, subscription.clone());
        Ok(true)
    }

    async fn update_if_unchanged(
        &self,
        subscription: &Subscription,
        expected_updated_at: DateTime<Utc>,
    ) -> AppResult<bool> {
        self.check_writable()?;
        let mut rows = self.subscriptions.lock().unwrap();

        let conflict = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflict && let Some(row) = rows.get_mut(&subscription.id) {
            row.updated_at += Duration::microseconds(1);
        }

        match rows.get(&subscription.id) {
            Some(row) if row.updated_at == expected_updated_at => {}
            _ => return Ok(false),
        }
        supersede_other_lineages(&mut rows, subscription);
        rows.insert(subscription.id, subscription.clone());
        Ok(true)
    }

    async fn list_lapse_candidates(
        &self,
        period_end_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Subscription>> {
        let mut candidates: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|s| !s.status.is_terminal() && s.current_period_end <= period_end_before)
            .cloned()
            .collect();
        candidates.sort_by_key(|s| s.current_period_end);
        candidates.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(candidates)
    }
}

// ============================================================================
// InMemoryIdentityDirectory
// ============================================================================

#[derive(Default)]
pub struct InMemoryIdentityDirectory {
    links: Mutex<HashMap<(Provider, String), Uuid>>,
}

impl InMemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, user_id: Uuid, provider: Provider, external_customer_id: &str) {
        self.links
            .lock()
            .unwrap()
            .insert((provider, external_customer_id.to_string()), user_id);
    }

    pub fn linked(&self, user_id: Uuid, provider: Provider) -> Option<String> {
        self.links
            .lock()
            .unwrap()
            .iter()
            .find(|((p, _), u)| *p == provider && **u == user_id)
            .map(|((_, customer), _)| customer.clone())
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryIdentityDirectory {
    async fn user_for_customer(
        &self,
        provider: Provider,
        external_customer_id: &str,
    ) -> AppResult<Option<Uuid>> {
        Ok(self
            .links
            .lock()
            .unwrap()
            .get(&(provider, external_customer_id.to_string()))
            .copied())
    }

    async fn customer_for_user(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> AppResult<Option<String>> {
        Ok(self.linked(user_id, provider))
    }

    async fn link_customer(
        &self,
        user_id: Uuid,
        provider: Provider,
        external_customer_id: &str,
    ) -> AppResult<()> {
        self.links
            .lock()
            .unwrap()
            .entry((provider, external_customer_id.to_string()))
            .or_insert(user_id);
        Ok(())
    }
}

// ============================================================================
// InMemoryProcessedEventStore
// ============================================================================

#[derive(Default)]
pub struct InMemoryProcessedEventStore {
    processed: Mutex<HashSet<(Provider, String)>>,
}

impl InMemoryProcessedEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, provider: Provider, external_event_id: &str) -> bool {
        self.processed
            .lock()
            .unwrap()
            .contains(&(provider, external_event_id.to_string()))
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedEventStore {
    async fn is_processed(&self, provider: Provider, external_event_id: &str) -> AppResult<bool> {
        Ok(self.contains(provider, external_event_id))
    }

    async fn mark_processed(&self, provider: Provider, external_event_id: &str) -> AppResult<()> {
        self.processed
            .lock()
            .unwrap()
            .insert((provider, external_event_id.to_string()));
        Ok(())
    }
}

// ============================================================================
// RecordingNotifier
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Uuid, NotificationKind)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Uuid, NotificationKind)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.sent().into_iter().map(|(_, kind)| kind).collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, user_id: Uuid, kind: NotificationKind, _metadata: serde_json::Value) {
        self.sent.lock().unwrap().push((user_id, kind));
    }
}
