use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        helpers::keyed_lock::KeyedLocks,
        ports::{
            identity::IdentityDirectory,
            notifier::Notifier,
            provider_client::{
                CancelMode, CreateSubscriptionRequest, CustomerId, ProviderClient, PurchaseReceipt,
                SubscriptionId,
            },
        },
    },
    domain::entities::{
        provider::Provider,
        reconcile_event::{EventKind, ProviderSubscription, ReconcileEvent},
        subscription::{Plan, Subscription, SubscriptionStatus, truncate_to_micros},
        subscription_transition::{NotificationKind, Transition, lapse_event, reconcile},
    },
};

/// Effective time for provider state fetched from now on. Provider event
/// timestamps have whole-second precision, so the stamp is floored to the
/// second: an event from the same second as the request still applies over it.
fn snapshot_stamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Read-modify-write attempts before a contended key gives up.
const MAX_WRITE_ATTEMPTS: usize = 3;
const LAPSE_SWEEP_BATCH: i64 = 500;

// ============================================================================
// Repository Trait
// ============================================================================

#[async_trait]
pub trait SubscriptionRepoTrait: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> AppResult<Option<Subscription>>;

    async fn get_by_external_id(
        &self,
        provider: Provider,
        external_subscription_id: &str,
    ) -> AppResult<Option<Subscription>>;

    /// The user's non-terminal row if one exists, otherwise their most
    /// recently updated row.
    async fn get_current_for_user(&self, user_id: Uuid) -> AppResult<Option<Subscription>>;

    /// Inserts a row. When the row is non-terminal, any other non-terminal row
    /// of the same user is cancelled in the same transaction. Returns `false`
    /// if a row with the same `(provider, external_subscription_id)` exists.
    async fn insert(&self, subscription: &Subscription) -> AppResult<bool>;

    /// Compare-and-swap on `updated_at`, with the same lineage handling as
    /// `insert`. Returns `false` when the row changed since it was read.
    async fn update_if_unchanged(
        &self,
        subscription: &Subscription,
        expected_updated_at: DateTime<Utc>,
    ) -> AppResult<bool>;

    /// Non-terminal rows whose period ends at or before `period_end_before`.
    async fn list_lapse_candidates(
        &self,
        period_end_before: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Subscription>>;
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied(Subscription),
    /// Replay of state already recorded.
    Unchanged(Subscription),
    /// Older than the record's state; discarded.
    Stale(Subscription),
    Rejected(String),
}

impl ReconcileOutcome {
    pub fn subscription(&self) -> Option<&Subscription> {
        match self {
            ReconcileOutcome::Applied(s)
            | ReconcileOutcome::Unchanged(s)
            | ReconcileOutcome::Stale(s) => Some(s),
            ReconcileOutcome::Rejected(_) => None,
        }
    }

    pub fn into_subscription(self) -> Option<Subscription> {
        match self {
            ReconcileOutcome::Applied(s)
            | ReconcileOutcome::Unchanged(s)
            | ReconcileOutcome::Stale(s) => Some(s),
            ReconcileOutcome::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub subscription: Option<Subscription>,
    /// Provider could not be reached; `subscription` is the last known state.
    pub stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub refreshed: usize,
    pub expired: usize,
    pub failed: usize,
}

// ============================================================================
// Use Cases
// ============================================================================

pub struct ReconciliationUseCases {
    repo: Arc<dyn SubscriptionRepoTrait>,
    identity: Arc<dyn IdentityDirectory>,
    providers: HashMap<Provider, Arc<dyn ProviderClient>>,
    notifier: Arc<dyn Notifier>,
    locks: KeyedLocks<(Provider, String)>,
    sync_timeout: Duration,
}

impl ReconciliationUseCases {
    pub fn new(
        repo: Arc<dyn SubscriptionRepoTrait>,
        identity: Arc<dyn IdentityDirectory>,
        providers: Vec<Arc<dyn ProviderClient>>,
        notifier: Arc<dyn Notifier>,
        sync_timeout: Duration,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|client| (client.provider(), client))
            .collect();
        Self {
            repo,
            identity,
            providers,
            notifier,
            locks: KeyedLocks::new(),
            sync_timeout,
        }
    }

    fn client(&self, provider: Provider) -> AppResult<&Arc<dyn ProviderClient>> {
        self.providers
            .get(&provider)
            .ok_or_else(|| AppError::Internal(format!("No client configured for {provider}")))
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Fold one event into the store under the per-subscription lock.
    pub async fn apply_event(&self, event: ReconcileEvent) -> AppResult<ReconcileOutcome> {
        let provider = event.subject.provider;
        let external_id = event.subject.external_subscription_id.clone();
        let _guard = self.locks.lock((provider, external_id.clone())).await;

        let mut event = event;
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.repo.get_by_external_id(provider, &external_id).await?;

            if current.is_none() && event.subject.user_id.is_none() {
                event.subject.user_id = self
                    .identity
                    .user_for_customer(provider, &event.subject.external_customer_id)
                    .await?;
            }

            let now = truncate_to_micros(Utc::now());
            match reconcile(current.as_ref(), &event, now) {
                Transition::Create {
                    subscription,
                    notification,
                } => {
                    if !self.repo.insert(&subscription).await? {
                        debug!(
                            provider = %provider,
                            external_id = %external_id,
                            attempt,
                            "Subscription inserted concurrently, re-reading"
                        );
                        continue;
                    }
                    info!(
                        subscription_id = %subscription.id,
                        user_id = %subscription.user_id,
                        provider = %provider,
                        status = %subscription.status,
                        event = event.kind.name(),
                        "Subscription created"
                    );
                    self.link_customer(&subscription).await;
                    self.fire(notification, &subscription);
                    return Ok(ReconcileOutcome::Applied(subscription));
                }
                Transition::Update {
                    subscription,
                    notification,
                } => {
                    let Some(previous) = current else {
                        continue;
                    };
                    if !self
                        .repo
                        .update_if_unchanged(&subscription, previous.updated_at)
                        .await?
                    {
                        debug!(
                            subscription_id = %subscription.id,
                            attempt,
                            "Subscription changed concurrently, recomputing"
                        );
                        continue;
                    }
                    info!(
                        subscription_id = %subscription.id,
                        user_id = %subscription.user_id,
                        from = %previous.status,
                        to = %subscription.status,
                        event = event.kind.name(),
                        "Subscription updated"
                    );
                    self.fire(notification, &subscription);
                    return Ok(ReconcileOutcome::Applied(subscription));
                }
                Transition::Unchanged => {
                    debug!(
                        provider = %provider,
                        external_id = %external_id,
                        event = event.kind.name(),
                        "Event already reflected, skipping write"
                    );
                    return Ok(match current {
                        Some(current) => ReconcileOutcome::Unchanged(current),
                        None => ReconcileOutcome::Rejected("no subscription".into()),
                    });
                }
                Transition::Stale => {
                    debug!(
                        provider = %provider,
                        external_id = %external_id,
                        event = event.kind.name(),
                        effective_at = %event.effective_at,
                        "Discarding event older than current state"
                    );
                    return Ok(match current {
                        Some(current) => ReconcileOutcome::Stale(current),
                        None => ReconcileOutcome::Rejected("no subscription".into()),
                    });
                }
                Transition::Rejected(reason) => {
                    info!(
                        provider = %provider,
                        external_id = %external_id,
                        event = event.kind.name(),
                        reason = %reason,
                        "Event not applicable"
                    );
                    return Ok(ReconcileOutcome::Rejected(reason));
                }
            }
        }

        Err(AppError::Persistence(format!(
            "Subscription {external_id} kept changing during reconciliation"
        )))
    }

    /// `requested_at` must come from [`snapshot_stamp`] taken before the
    /// provider call, so events applied while the call was in flight win.
    async fn apply_snapshot(
        &self,
        snapshot: ProviderSubscription,
        user_id: Uuid,
        requested_at: DateTime<Utc>,
    ) -> AppResult<ReconcileOutcome> {
        self.apply_event(ReconcileEvent::snapshot(snapshot, Some(user_id), requested_at))
            .await
    }

    async fn expire_if_lapsed(&self, subscription: Subscription) -> AppResult<Subscription> {
        if !subscription.is_lapsed(Utc::now()) {
            return Ok(subscription);
        }
        let outcome = self.apply_event(lapse_event(&subscription)).await?;
        Ok(outcome.into_subscription().unwrap_or(subscription))
    }

    async fn link_customer(&self, subscription: &Subscription) {
        if let Err(e) = self
            .identity
            .link_customer(
                subscription.user_id,
                subscription.provider,
                &subscription.external_customer_id,
            )
            .await
        {
            warn!(
                user_id = %subscription.user_id,
                provider = %subscription.provider,
                error = %e,
                "Failed to record provider customer mapping"
            );
        }
    }

    fn fire(&self, notification: Option<NotificationKind>, subscription: &Subscription) {
        let Some(kind) = notification else {
            return;
        };
        self.notifier.notify(
            subscription.user_id,
            kind,
            serde_json::json!({
                "subscription_id": subscription.id,
                "provider": subscription.provider,
                "plan": subscription.plan,
                "status": subscription.status,
                "current_period_end": subscription.current_period_end,
                "cancelled_at": subscription.cancelled_at,
            }),
        );
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Local view of the user's subscription, with lapse applied.
    pub async fn current_subscription(&self, user_id: Uuid) -> AppResult<Option<Subscription>> {
        match self.repo.get_current_for_user(user_id).await? {
            Some(subscription) => Ok(Some(self.expire_if_lapsed(subscription).await?)),
            None => Ok(None),
        }
    }

    pub async fn has_active_entitlement(&self, user_id: Uuid) -> AppResult<bool> {
        Ok(self
            .current_subscription(user_id)
            .await?
            .is_some_and(|s| s.has_entitlement(Utc::now())))
    }

    /// Pull authoritative state from the owning provider and reconcile it.
    ///
    /// The provider call runs outside any lock and under `sync_timeout`. When
    /// it fails the last known record is returned with `stale = true`.
    pub async fn sync_now(&self, user_id: Uuid) -> AppResult<SyncOutcome> {
        let cached = self.repo.get_current_for_user(user_id).await?;

        let requested_at = snapshot_stamp();
        let fetched = tokio::time::timeout(
            self.sync_timeout,
            self.fetch_provider_state(user_id, cached.as_ref()),
        )
        .await;

        let snapshot = match fetched {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(user_id = %user_id, error = %e, "Provider sync failed, serving cached state");
                return self.stale_outcome(cached, e).await;
            }
            Err(_) => {
                warn!(
                    user_id = %user_id,
                    timeout_secs = self.sync_timeout.as_secs(),
                    "Provider sync timed out, serving cached state"
                );
                let e = AppError::ProviderUnavailable("sync timed out".into());
                return self.stale_outcome(cached, e).await;
            }
        };

        let subscription = match snapshot {
            Some(snapshot) => match self.apply_snapshot(snapshot, user_id, requested_at).await? {
                ReconcileOutcome::Rejected(reason) => {
                    warn!(user_id = %user_id, reason = %reason, "Provider state not applied");
                    cached
                }
                outcome => outcome.into_subscription(),
            },
            None => cached,
        };

        let subscription = match subscription {
            Some(s) => Some(self.expire_if_lapsed(s).await?),
            None => None,
        };
        Ok(SyncOutcome {
            subscription,
            stale: false,
        })
    }

    async fn stale_outcome(
        &self,
        cached: Option<Subscription>,
        error: AppError,
    ) -> AppResult<SyncOutcome> {
        match cached {
            Some(subscription) => Ok(SyncOutcome {
                subscription: Some(self.expire_if_lapsed(subscription).await?),
                stale: true,
            }),
            None => Err(match error {
                e @ AppError::ProviderUnavailable(_) => e,
                e => AppError::ProviderUnavailable(e.to_string()),
            }),
        }
    }

    async fn fetch_provider_state(
        &self,
        user_id: Uuid,
        cached: Option<&Subscription>,
    ) -> AppResult<Option<ProviderSubscription>> {
        if let Some(current) = cached.filter(|s| !s.status.is_terminal()) {
            let client = self.client(current.provider)?;
            return client
                .retrieve_subscription(
                    &CustomerId::new(&current.external_customer_id),
                    &SubscriptionId::new(&current.external_subscription_id),
                )
                .await;
        }

        // No live lineage: look for one at every provider the user is known to.
        for provider in Provider::ALL {
            let Some(client) = self.providers.get(&provider) else {
                continue;
            };
            let Some(customer) = self.customer_for(user_id, provider).await? else {
                continue;
            };
            if let Some(found) = client.find_customer_subscription(&customer).await? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Store app users default to the local user id when not linked explicitly.
    async fn customer_for(&self, user_id: Uuid, provider: Provider) -> AppResult<Option<CustomerId>> {
        let linked = self.identity.customer_for_user(user_id, provider).await?;
        Ok(match (linked, provider) {
            (Some(id), _) => Some(CustomerId::new(id)),
            (None, Provider::StoreAggregator) => Some(CustomerId::new(user_id.to_string())),
            (None, Provider::CardBilling) => None,
        })
    }

    // ========================================================================
    // Lapse detection
    // ========================================================================

    /// One serialized pass over subscriptions at or near the end of their
    /// paid period. Each is refreshed from its provider when reachable, then
    /// expired if the period has elapsed.
    pub async fn sweep_lapsed(
        &self,
        now: DateTime<Utc>,
        lookahead: chrono::Duration,
    ) -> AppResult<SweepReport> {
        let candidates = self
            .repo
            .list_lapse_candidates(now + lookahead, LAPSE_SWEEP_BATCH)
            .await?;

        let mut report = SweepReport::default();
        for candidate in candidates {
            report.checked += 1;
            match self.recheck(candidate, now, &mut report).await {
                Ok(()) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(error = %e, "Lapse check failed");
                }
            }
        }
        Ok(report)
    }

    async fn recheck(
        &self,
        candidate: Subscription,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> AppResult<()> {
        let client = self.client(candidate.provider)?;
        let requested_at = snapshot_stamp();
        let fetched = tokio::time::timeout(
            self.sync_timeout,
            client.retrieve_subscription(
                &CustomerId::new(&candidate.external_customer_id),
                &SubscriptionId::new(&candidate.external_subscription_id),
            ),
        )
        .await;

        let mut latest = candidate;
        match fetched {
            Ok(Ok(Some(snapshot))) => {
                if let ReconcileOutcome::Applied(s) =
                    self.apply_snapshot(snapshot, latest.user_id, requested_at).await?
                {
                    report.refreshed += 1;
                    latest = s;
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                debug!(subscription_id = %latest.id, error = %e, "Refresh failed, checking local state");
            }
            Err(_) => {
                debug!(subscription_id = %latest.id, "Refresh timed out, checking local state");
            }
        }

        if latest.is_lapsed(now)
            && let ReconcileOutcome::Applied(s) = self.apply_event(lapse_event(&latest)).await?
        {
            latest = s;
        }
        if latest.status == SubscriptionStatus::Expired {
            report.expired += 1;
        }
        Ok(())
    }

    // ========================================================================
    // Client-initiated operations
    // ========================================================================

    /// Cancel at the provider, then record the cancellation locally.
    pub async fn cancel(
        &self,
        user_id: Uuid,
        subscription_id: Uuid,
        at_period_end: bool,
    ) -> AppResult<Subscription> {
        let subscription = self
            .repo
            .get_by_id(subscription_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if subscription.user_id != user_id {
            return Err(AppError::Forbidden);
        }
        if subscription.status.is_terminal() {
            return Err(AppError::InvalidInput("Subscription has already ended".into()));
        }

        let client = self.client(subscription.provider)?;
        let snapshot = client
            .cancel_subscription(
                &CustomerId::new(&subscription.external_customer_id),
                &SubscriptionId::new(&subscription.external_subscription_id),
                CancelMode::from_at_period_end(at_period_end),
            )
            .await?;

        let effective_at = snapshot
            .cancelled_at
            .unwrap_or_else(|| truncate_to_micros(Utc::now()));
        let event = ReconcileEvent::new(
            snapshot.subject(Some(user_id)),
            effective_at,
            EventKind::CancellationRequested { at_period_end },
        );
        let outcome = self.apply_event(event).await?;
        Ok(outcome.into_subscription().unwrap_or(subscription))
    }

    /// Validate a store purchase token and record the resulting subscription.
    pub async fn verify_receipt(
        &self,
        user_id: Uuid,
        receipt: &PurchaseReceipt,
    ) -> AppResult<Subscription> {
        let client = self.client(Provider::StoreAggregator)?;
        let customer = self
            .customer_for(user_id, Provider::StoreAggregator)
            .await?
            .ok_or(AppError::NotFound)?;

        let requested_at = snapshot_stamp();
        let snapshot = client.verify_purchase_receipt(&customer, receipt).await?;
        if let Some(owner) = self
            .repo
            .get_by_external_id(snapshot.provider, &snapshot.external_subscription_id)
            .await?
            && owner.user_id != user_id
        {
            return Err(AppError::Forbidden);
        }

        match self.apply_snapshot(snapshot, user_id, requested_at).await? {
            ReconcileOutcome::Rejected(reason) => Err(AppError::Validation(reason)),
            outcome => outcome.into_subscription().ok_or(AppError::NotFound),
        }
    }

    /// Start a card-billing subscription for a user without an entitlement.
    pub async fn create_card_subscription(
        &self,
        user_id: Uuid,
        plan: Plan,
        payment_method_id: &str,
    ) -> AppResult<Subscription> {
        if self.has_active_entitlement(user_id).await? {
            return Err(AppError::InvalidInput("User already has an active subscription".into()));
        }

        let client = self.client(Provider::CardBilling)?;
        let customer_id = match self.customer_for(user_id, Provider::CardBilling).await? {
            Some(customer_id) => customer_id,
            None => {
                let customer_id = client.create_customer(user_id).await?;
                self.identity
                    .link_customer(user_id, Provider::CardBilling, customer_id.as_str())
                    .await?;
                customer_id
            }
        };

        let requested_at = snapshot_stamp();
        let snapshot = client
            .create_subscription(&CreateSubscriptionRequest {
                customer_id,
                plan,
                payment_method_id: payment_method_id.to_string(),
            })
            .await?;

        match self.apply_snapshot(snapshot, user_id, requested_at).await? {
            ReconcileOutcome::Rejected(reason) => Err(AppError::Internal(reason)),
            outcome => outcome.into_subscription().ok_or(AppError::NotFound),
        }
    }

    pub async fn update_payment_method(
        &self,
        user_id: Uuid,
        payment_method_id: &str,
    ) -> AppResult<()> {
        let client = self.client(Provider::CardBilling)?;
        let customer_id = self
            .customer_for(user_id, Provider::CardBilling)
            .await?
            .ok_or(AppError::NotFound)?;
        client
            .update_payment_method(&customer_id, payment_method_id)
            .await
    }
}
