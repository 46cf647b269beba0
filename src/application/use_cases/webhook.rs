use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    app_error::{AppError, AppResult},
    application::use_cases::reconciliation::{ReconcileOutcome, ReconciliationUseCases},
    domain::entities::{
        provider::Provider, reconcile_event::ReconcileEvent, subscription::Subscription,
    },
};

// ============================================================================
// Types
// ============================================================================

/// A verified provider delivery, parsed from its envelope.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub provider: Provider,
    pub external_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    Applied(Subscription),
    /// Event matched state already recorded.
    NoChange,
    /// Older than the recorded state; discarded.
    Stale,
    /// No handler for this provider/type pair.
    Ignored,
    /// Delivery id seen within the dedup window.
    Duplicate,
    /// Payload understood but not applicable, or malformed.
    Rejected(String),
}

impl ProcessingResult {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessingResult::Applied(_) => "applied",
            ProcessingResult::NoChange => "no_change",
            ProcessingResult::Stale => "stale",
            ProcessingResult::Ignored => "ignored",
            ProcessingResult::Duplicate => "duplicate",
            ProcessingResult::Rejected(_) => "rejected",
        }
    }
}

/// Translates one provider event type into a normalized reconciliation event.
/// Handlers are pure so a replayed delivery routes and parses identically.
pub type EventHandler = fn(&InboundEvent) -> AppResult<ReconcileEvent>;

/// Dedup window for delivery ids.
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    async fn is_processed(&self, provider: Provider, external_event_id: &str) -> AppResult<bool>;
    async fn mark_processed(&self, provider: Provider, external_event_id: &str) -> AppResult<()>;
}

// ============================================================================
// Dispatcher
// ============================================================================

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<Provider, HashMap<&'static str, EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Provider, event_type: &'static str, handler: EventHandler) {
        self.handlers
            .entry(provider)
            .or_default()
            .insert(event_type, handler);
    }

    pub fn with_handlers(
        mut self,
        provider: Provider,
        handlers: &[(&'static str, EventHandler)],
    ) -> Self {
        for (event_type, handler) in handlers {
            self.register(provider, *event_type, *handler);
        }
        self
    }

    pub fn route(&self, provider: Provider, event_type: &str) -> Option<EventHandler> {
        self.handlers.get(&provider)?.get(event_type).copied()
    }

    pub fn handles(&self, provider: Provider, event_type: &str) -> bool {
        self.route(provider, event_type).is_some()
    }
}

// ============================================================================
// Use Cases
// ============================================================================

pub struct WebhookUseCases {
    dispatcher: EventDispatcher,
    processed_events: Arc<dyn ProcessedEventStore>,
    reconciliation: Arc<ReconciliationUseCases>,
}

impl WebhookUseCases {
    pub fn new(
        dispatcher: EventDispatcher,
        processed_events: Arc<dyn ProcessedEventStore>,
        reconciliation: Arc<ReconciliationUseCases>,
    ) -> Self {
        Self {
            dispatcher,
            processed_events,
            reconciliation,
        }
    }

    /// Dedup, dispatch and reconcile one verified delivery.
    ///
    /// The delivery id is recorded only once processing finished, so an error
    /// leaves the event eligible for provider redelivery.
    pub async fn process(&self, event: InboundEvent) -> AppResult<ProcessingResult> {
        if self
            .processed_events
            .is_processed(event.provider, &event.external_event_id)
            .await?
        {
            debug!(
                provider = %event.provider,
                event_id = %event.external_event_id,
                "Duplicate delivery"
            );
            return Ok(ProcessingResult::Duplicate);
        }

        let result = self.dispatch(&event).await?;

        if let Err(e) = self
            .processed_events
            .mark_processed(event.provider, &event.external_event_id)
            .await
        {
            warn!(
                provider = %event.provider,
                event_id = %event.external_event_id,
                error = %e,
                "Failed to record processed event"
            );
        }

        Ok(result)
    }

    async fn dispatch(&self, event: &InboundEvent) -> AppResult<ProcessingResult> {
        let Some(handler) = self.dispatcher.route(event.provider, &event.event_type) else {
            info!(
                provider = %event.provider,
                event_type = %event.event_type,
                event_id = %event.external_event_id,
                "Unhandled webhook event type, acknowledging"
            );
            return Ok(ProcessingResult::Ignored);
        };

        let reconcile_event = match handler(event) {
            Ok(reconcile_event) => reconcile_event,
            Err(AppError::Validation(reason)) => {
                warn!(
                    provider = %event.provider,
                    event_type = %event.event_type,
                    event_id = %event.external_event_id,
                    reason = %reason,
                    "Malformed webhook payload, acknowledging without applying"
                );
                return Ok(ProcessingResult::Rejected(reason));
            }
            Err(e) => return Err(e),
        };

        Ok(
            match self.reconciliation.apply_event(reconcile_event).await? {
                ReconcileOutcome::Applied(subscription) => ProcessingResult::Applied(subscription),
                ReconcileOutcome::Unchanged(_) => ProcessingResult::NoChange,
                ReconcileOutcome::Stale(_) => ProcessingResult::Stale,
                ReconcileOutcome::Rejected(reason) => ProcessingResult::Rejected(reason),
            },
        )
    }
}
