use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc::{channel, Sender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::adapters::ProviderKind;
use super::models::{
    Applied, PaymentEvent, PaymentEventType, RecordOutcome, SubscriptionEventPatch,
    SubscriptionStatus,
};
use super::plans::PlanCatalog;
use super::service::BillingService;
use crate::audit::{self, AuditRecord, ACTOR_RECONCILER};
use crate::connect::gateway::account_snapshot;
use crate::connect::models::{AccountSnapshot, AccountStatus, PaymentEventPatch, PaymentStatus};
use crate::error::{BillingError, BillingResult};
use crate::store::Transition;

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessorEnvelope {
    pub id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
}

impl ProcessorEnvelope {
    /// Only the envelope is validated here; the embedded object is parsed at reconcile time
    /// so that malformed objects end up recorded as failed events.
    pub fn parse(payload: Value, received_at: DateTime<Utc>) -> BillingResult<Self> {
        let id = payload["id"]
            .as_str()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| BillingError::validation("event id is required"))?
            .to_string();
        let event_type = payload["type"]
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BillingError::validation("event type is required"))?
            .to_string();
        let occurred_at = payload["created"]
            .as_i64()
            .and_then(from_unix)
            .unwrap_or(received_at);
        Ok(Self {
            id,
            event_type,
            occurred_at,
            payload,
        })
    }
}

/// Business event type recorded for a processor event name.
pub fn event_type_for(processor_event_type: &str) -> PaymentEventType {
    match processor_event_type {
        "checkout.session.completed" | "customer.subscription.created" => {
            PaymentEventType::Created
        }
        "customer.subscription.updated" | "payment_intent.processing" | "charge.refunded"
        | "account.updated" => PaymentEventType::Updated,
        "customer.subscription.deleted" | "payment_intent.canceled" => PaymentEventType::Cancelled,
        "invoice.payment_succeeded" | "invoice.paid" | "payment_intent.succeeded" => {
            PaymentEventType::PaymentSucceeded
        }
        "invoice.payment_failed" | "payment_intent.payment_failed" => {
            PaymentEventType::PaymentFailed
        }
        "customer.subscription.trial_will_end" => PaymentEventType::TrialEnded,
        _ => PaymentEventType::Other,
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProcessorEvent {
    SubscriptionCheckoutCompleted {
        owner_id: String,
        customer_id: Option<String>,
        external_subscription_id: Option<String>,
        plan_id: Option<String>,
        price_id: Option<String>,
    },
    PaymentCheckoutCompleted {
        session_id: String,
        payment_intent_id: Option<String>,
        patch: PaymentEventPatch,
    },
    SubscriptionChanged {
        external_subscription_id: String,
        price_id: Option<String>,
        patch: SubscriptionEventPatch,
    },
    PaymentChanged {
        payment_intent_id: String,
        patch: PaymentEventPatch,
    },
    AccountUpdated(AccountSnapshot),
    Unsupported,
}

impl ProcessorEvent {
    pub fn parse(processor_event_type: &str, object: &Value) -> Result<Self, String> {
        let event = match processor_event_type {
            "checkout.session.completed" => parse_checkout(object)?,
            "customer.subscription.created" | "customer.subscription.updated" => {
                let mut patch = SubscriptionEventPatch {
                    status: object["status"].as_str().map(subscription_status),
                    customer_id: str_field(object, "/customer"),
                    current_period_start: ts_field(object, "/current_period_start")
                        .or_else(|| ts_field(object, "/items/data/0/current_period_start")),
                    current_period_end: ts_field(object, "/current_period_end")
                        .or_else(|| ts_field(object, "/items/data/0/current_period_end")),
                    trial_end_date: ts_field(object, "/trial_end"),
                    cancel_at_period_end: object["cancel_at_period_end"].as_bool(),
                    ..Default::default()
                };
                if patch.status.is_none() {
                    patch.status = Some(SubscriptionStatus::Active);
                }
                ProcessorEvent::SubscriptionChanged {
                    external_subscription_id: required(object, "/id")?,
                    price_id: str_field(object, "/items/data/0/price/id"),
                    patch,
                }
            }
            "customer.subscription.deleted" => ProcessorEvent::SubscriptionChanged {
                external_subscription_id: required(object, "/id")?,
                price_id: None,
                patch: SubscriptionEventPatch {
                    status: Some(SubscriptionStatus::Cancelled),
                    cancel_at_period_end: Some(false),
                    ..Default::default()
                },
            },
            "invoice.payment_succeeded" | "invoice.paid" | "invoice.payment_failed" => {
                let failed = processor_event_type == "invoice.payment_failed";
                let Some(external_subscription_id) = str_field(object, "/subscription") else {
                    // one-off invoices carry no subscription to update
                    return Ok(ProcessorEvent::Unsupported);
                };
                ProcessorEvent::SubscriptionChanged {
                    external_subscription_id,
                    price_id: None,
                    patch: SubscriptionEventPatch {
                        status: Some(if failed {
                            SubscriptionStatus::PastDue
                        } else {
                            SubscriptionStatus::Active
                        }),
                        current_period_end: if failed {
                            None
                        } else {
                            ts_field(object, "/lines/data/0/period/end")
                        },
                        ..Default::default()
                    },
                }
            }
            "payment_intent.succeeded"
            | "payment_intent.payment_failed"
            | "payment_intent.processing"
            | "payment_intent.canceled" => {
                let status = match processor_event_type {
                    "payment_intent.succeeded" => PaymentStatus::Succeeded,
                    "payment_intent.payment_failed" => PaymentStatus::Failed,
                    "payment_intent.processing" => PaymentStatus::Processing,
                    _ => PaymentStatus::Cancelled,
                };
                ProcessorEvent::PaymentChanged {
                    payment_intent_id: required(object, "/id")?,
                    patch: PaymentEventPatch {
                        status: Some(status),
                        amount: amount_field(object, "/amount")?,
                        application_fee_amount: amount_field(object, "/application_fee_amount")?,
                        customer_email: str_field(object, "/receipt_email"),
                        failure_reason: str_field(object, "/last_payment_error/message")
                            .or_else(|| str_field(object, "/cancellation_reason")),
                        ..Default::default()
                    },
                }
            }
            "charge.refunded" => {
                let refunded = amount_field(object, "/amount_refunded")?.unwrap_or(0);
                let amount = amount_field(object, "/amount")?;
                let fully_refunded = object["refunded"].as_bool().unwrap_or(false)
                    || amount.map_or(false, |amount| refunded >= amount);
                ProcessorEvent::PaymentChanged {
                    payment_intent_id: required(object, "/payment_intent")?,
                    patch: PaymentEventPatch {
                        status: fully_refunded.then_some(PaymentStatus::Refunded),
                        refunded_amount: Some(refunded),
                        ..Default::default()
                    },
                }
            }
            "account.updated" => ProcessorEvent::AccountUpdated(account_snapshot(object)?),
            _ => ProcessorEvent::Unsupported,
        };
        Ok(event)
    }
}

fn parse_checkout(object: &Value) -> Result<ProcessorEvent, String> {
    if object["metadata"]["client_payment_id"].is_string() {
        let paid = object["payment_status"].as_str() == Some("paid");
        return Ok(ProcessorEvent::PaymentCheckoutCompleted {
            session_id: required(object, "/id")?,
            payment_intent_id: str_field(object, "/payment_intent"),
            patch: PaymentEventPatch {
                status: Some(if paid {
                    PaymentStatus::Succeeded
                } else {
                    PaymentStatus::Processing
                }),
                customer_email: str_field(object, "/customer_details/email"),
                customer_name: str_field(object, "/customer_details/name"),
                ..Default::default()
            },
        });
    }
    if object["mode"].as_str() != Some("subscription") {
        return Ok(ProcessorEvent::Unsupported);
    }
    let owner_id = str_field(object, "/client_reference_id")
        .or_else(|| str_field(object, "/metadata/owner_id"))
        .ok_or_else(|| "checkout session carries no owner reference".to_string())?;
    Ok(ProcessorEvent::SubscriptionCheckoutCompleted {
        owner_id,
        customer_id: str_field(object, "/customer"),
        external_subscription_id: str_field(object, "/subscription"),
        plan_id: str_field(object, "/metadata/plan_id"),
        price_id: str_field(object, "/metadata/price_id"),
    })
}

/// Processor subscription status onto the local status set.
pub fn subscription_status(value: &str) -> SubscriptionStatus {
    match value {
        "active" => SubscriptionStatus::Active,
        "trialing" => SubscriptionStatus::Trialing,
        "past_due" | "unpaid" => SubscriptionStatus::PastDue,
        "canceled" | "cancelled" => SubscriptionStatus::Cancelled,
        _ => SubscriptionStatus::Inactive,
    }
}

pub(crate) fn from_unix(seconds: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(seconds, 0).single()
}

fn str_field(object: &Value, pointer: &str) -> Option<String> {
    object
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn ts_field(object: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    object.pointer(pointer).and_then(Value::as_i64).and_then(from_unix)
}

/// Minor-unit amounts; negative values are rejected.
fn amount_field(object: &Value, pointer: &str) -> Result<Option<i64>, String> {
    match object.pointer(pointer).and_then(Value::as_i64) {
        Some(amount) if amount < 0 => Err(format!("event object has negative {pointer}")),
        amount => Ok(amount),
    }
}

fn required(object: &Value, pointer: &str) -> Result<String, String> {
    str_field(object, pointer).ok_or_else(|| format!("event object is missing {pointer}"))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied,
    /// The target already reflects a newer event.
    Stale,
    /// Recorded and acknowledged; nothing in local state tracks this kind.
    Ignored,
    AlreadyProcessed,
    Failed(String),
}

#[derive(Default)]
struct Effect {
    owner_id: Option<String>,
    subscription_id: Option<Uuid>,
    stale: bool,
    ignored: bool,
    entity: Option<(&'static str, String)>,
    before: Option<Value>,
    after: Option<Value>,
}

// key: billing-reconciler -> idempotent upsert of processor events
#[derive(Clone)]
pub struct Reconciler {
    billing: BillingService,
    catalog: Arc<PlanCatalog>,
    provider: Option<ProviderKind>,
}

impl Reconciler {
    pub fn new(
        billing: BillingService,
        catalog: Arc<PlanCatalog>,
        provider: Option<ProviderKind>,
    ) -> Self {
        Self {
            billing,
            catalog,
            provider,
        }
    }

    /// Durably record a delivered event, deduplicating on its processor id.
    pub async fn ingest(&self, envelope: ProcessorEnvelope) -> BillingResult<RecordOutcome> {
        let event = PaymentEvent::from_processor(
            envelope.id.clone(),
            envelope.event_type.clone(),
            event_type_for(&envelope.event_type),
            envelope.payload,
            envelope.occurred_at,
            Utc::now(),
        );
        let outcome = self.billing.store().record_event(&event).await?;
        match &outcome {
            RecordOutcome::Inserted(event) => info!(
                event = %event.id,
                external_event = %envelope.id,
                kind = %envelope.event_type,
                "processor event recorded"
            ),
            RecordOutcome::Duplicate(event) => debug!(
                event = %event.id,
                external_event = %envelope.id,
                processed = event.processed,
                "duplicate processor event delivery"
            ),
        }
        Ok(outcome)
    }

    /// Record then reconcile inline. Duplicates of processed events are no-ops.
    pub async fn ingest_and_reconcile(
        &self,
        envelope: ProcessorEnvelope,
    ) -> BillingResult<ReconcileOutcome> {
        let event = match self.ingest(envelope).await? {
            RecordOutcome::Inserted(event) | RecordOutcome::Duplicate(event) => event,
        };
        if event.processed {
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }
        Ok(self.reconcile_event(&event).await)
    }

    /// Never fails: every error is recorded on the event instead.
    pub async fn reconcile(&self, event_id: Uuid) -> ReconcileOutcome {
        let event = match self.billing.store().find_event(event_id).await {
            Ok(Some(event)) => event,
            Ok(None) => return ReconcileOutcome::Failed("payment event not found".to_string()),
            Err(err) => {
                error!(?err, event = %event_id, "failed to load payment event");
                return ReconcileOutcome::Failed(err.to_string());
            }
        };
        if event.processed {
            return ReconcileOutcome::AlreadyProcessed;
        }
        self.reconcile_event(&event).await
    }

    /// Re-run events left unprocessed, oldest first.
    pub async fn replay_failed(&self, limit: i64) -> BillingResult<Vec<(Uuid, ReconcileOutcome)>> {
        let pending = self.billing.store().unprocessed_events(limit).await?;
        let mut outcomes = Vec::with_capacity(pending.len());
        for event in pending {
            let outcome = self.reconcile_event(&event).await;
            outcomes.push((event.id, outcome));
        }
        Ok(outcomes)
    }

    /// Operator reset so a processed event can be replayed.
    pub async fn clear_processed(&self, event_id: Uuid, actor: &str) -> BillingResult<PaymentEvent> {
        let event = self.billing.store().clear_processed(event_id).await?;
        warn!(event = %event_id, %actor, "processed flag cleared for replay");
        let record = AuditRecord::new(
            actor,
            "payment_event.cleared",
            "payment_event",
            event_id,
            Utc::now(),
        );
        audit::emit(self.billing.audit_sink().as_ref(), record).await;
        Ok(event)
    }

    async fn reconcile_event(&self, event: &PaymentEvent) -> ReconcileOutcome {
        let now = Utc::now();
        let effect = match self.apply(event, now).await {
            Ok(effect) => effect,
            Err(err) => {
                let message = err.to_string();
                warn!(
                    event = %event.id,
                    kind = event.processor_event_type.as_deref().unwrap_or("unknown"),
                    error_kind = err.kind(),
                    %message,
                    "processor event reconciliation failed"
                );
                if let Err(mark_err) = self
                    .billing
                    .store()
                    .mark_event_failed(event.id, &message)
                    .await
                {
                    error!(?mark_err, event = %event.id, "failed to record reconciliation error");
                }
                return ReconcileOutcome::Failed(message);
            }
        };

        if let Err(err) = self
            .billing
            .store()
            .mark_event_processed(
                event.id,
                effect.owner_id.as_deref(),
                effect.subscription_id,
                now,
            )
            .await
        {
            error!(?err, event = %event.id, "failed to mark payment event processed");
            return ReconcileOutcome::Failed(err.to_string());
        }

        let outcome = if effect.ignored {
            ReconcileOutcome::Ignored
        } else if effect.stale {
            ReconcileOutcome::Stale
        } else {
            ReconcileOutcome::Applied
        };
        info!(event = %event.id, ?outcome, "processor event reconciled");

        let (entity_type, entity_id) = effect
            .entity
            .clone()
            .unwrap_or(("payment_event", event.id.to_string()));
        let record = AuditRecord::new(
            ACTOR_RECONCILER,
            "payment_event.processed",
            entity_type,
            entity_id,
            now,
        )
        .with_change(effect.before, effect.after);
        audit::emit(self.billing.audit_sink().as_ref(), record).await;
        outcome
    }

    async fn apply(&self, event: &PaymentEvent, now: DateTime<Utc>) -> BillingResult<Effect> {
        let kind = event.processor_event_type.as_deref().unwrap_or_default();
        let object = event
            .payload
            .pointer("/data/object")
            .cloned()
            .unwrap_or(Value::Null);
        let parsed = ProcessorEvent::parse(kind, &object).map_err(BillingError::validation)?;
        let store = self.billing.store();

        match parsed {
            ProcessorEvent::Unsupported => Ok(Effect {
                ignored: true,
                ..Default::default()
            }),
            ProcessorEvent::SubscriptionCheckoutCompleted {
                owner_id,
                customer_id,
                external_subscription_id,
                plan_id,
                price_id,
            } => {
                let plan = plan_id
                    .as_deref()
                    .and_then(|id| self.catalog.find(id))
                    .or_else(|| price_id.as_deref().and_then(|p| self.catalog.find_by_price(p)))
                    .ok_or_else(|| {
                        BillingError::not_found(format!(
                            "plan {}",
                            plan_id.as_deref().or(price_id.as_deref()).unwrap_or_default()
                        ))
                    })?;
                let status = if plan.trial_days.is_some() {
                    SubscriptionStatus::Trialing
                } else {
                    SubscriptionStatus::Active
                };
                let mut attrs = plan.subscription_attrs(status, now);
                attrs.provider = self.provider.map(|kind| kind.as_str().to_string());
                attrs.customer_id = customer_id;
                attrs.external_subscription_id = external_subscription_id;
                let applied = self
                    .billing
                    .sync_subscription_from_event(
                        &owner_id,
                        &attrs,
                        event.occurred_at,
                        ACTOR_RECONCILER,
                    )
                    .await?;
                Ok(subscription_effect(applied))
            }
            ProcessorEvent::SubscriptionChanged {
                external_subscription_id,
                price_id,
                mut patch,
            } => {
                if let Some(plan) = price_id.as_deref().and_then(|p| self.catalog.find_by_price(p)) {
                    patch.plan_id = Some(plan.id.clone());
                    patch.plan_type = Some(plan.plan_type);
                    patch.features = Some(plan.features.clone());
                    patch.limits = Some(plan.limits.clone());
                }
                let applied = store
                    .apply_subscription_event(&external_subscription_id, &patch, event.occurred_at, now)
                    .await?;
                Ok(subscription_effect(applied))
            }
            ProcessorEvent::PaymentChanged {
                payment_intent_id,
                patch,
            } => {
                let applied = store
                    .apply_payment_event(&payment_intent_id, &patch, event.occurred_at, now)
                    .await?;
                Ok(payment_effect(applied))
            }
            ProcessorEvent::PaymentCheckoutCompleted {
                session_id,
                payment_intent_id,
                patch,
            } => {
                let keys = payment_intent_id
                    .into_iter()
                    .chain(std::iter::once(session_id.clone()));
                for key in keys {
                    match store
                        .apply_payment_event(&key, &patch, event.occurred_at, now)
                        .await
                    {
                        Err(BillingError::NotFound(_)) => continue,
                        other => return other.map(payment_effect),
                    }
                }
                Err(BillingError::not_found(format!("payment {session_id}")))
            }
            ProcessorEvent::AccountUpdated(snapshot) => {
                let applied = store
                    .apply_account_snapshot(&snapshot, Some(event.occurred_at), now)
                    .await?;
                let stale = applied.is_stale();
                let (previous, account) = applied.into_inner();
                if !stale
                    && previous != AccountStatus::Active
                    && account.account_status == AccountStatus::Active
                {
                    info!(account = %account.id, owner_id = %account.owner_id, "connected account onboarded");
                    let record = AuditRecord::new(
                        ACTOR_RECONCILER,
                        "account.onboarded",
                        "connected_account",
                        account.id,
                        now,
                    )
                    .with_change(
                        Some(json!({ "account_status": previous.as_str() })),
                        Some(account.audit_summary()),
                    );
                    audit::emit(self.billing.audit_sink().as_ref(), record).await;
                }
                Ok(Effect {
                    owner_id: Some(account.owner_id.clone()),
                    stale,
                    entity: Some(("connected_account", account.id.to_string())),
                    before: Some(json!({ "account_status": previous.as_str() })),
                    after: Some(account.audit_summary()),
                    ..Default::default()
                })
            }
        }
    }
}

fn subscription_effect(applied: Applied<Transition<crate::billing::models::Subscription>>) -> Effect {
    let stale = applied.is_stale();
    let transition = applied.into_inner();
    Effect {
        owner_id: Some(transition.after.owner_id.clone()),
        subscription_id: Some(transition.after.id),
        stale,
        entity: Some(("subscription", transition.after.id.to_string())),
        before: transition.before.as_ref().map(|s| s.audit_summary()),
        after: Some(transition.after.audit_summary()),
        ..Default::default()
    }
}

fn payment_effect(applied: Applied<Transition<crate::connect::models::ClientPayment>>) -> Effect {
    let stale = applied.is_stale();
    let transition = applied.into_inner();
    let summary = |p: &crate::connect::models::ClientPayment| {
        json!({
            "status": p.status.as_str(),
            "amount": p.amount,
            "refunded_amount": p.refunded_amount,
        })
    };
    Effect {
        stale,
        entity: Some(("client_payment", transition.after.id.to_string())),
        before: transition.before.as_ref().map(summary),
        after: Some(summary(&transition.after)),
        ..Default::default()
    }
}

#[derive(Debug)]
pub enum ReconciliationJob {
    Reconcile { event_id: Uuid },
    ReplayFailed { limit: i64 },
}

#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<ReconciliationJob>,
}

impl ReconciliationHandle {
    pub async fn dispatch(&self, job: ReconciliationJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|err| anyhow!("failed to enqueue billing reconciliation job: {err}"))
    }
}

/// Processes jobs off the request path. The loop has no caller to fail into, so every
/// outcome ends up on the event row or in the log.
pub fn start_reconciliation_worker(reconciler: Reconciler) -> ReconciliationHandle {
    let (tx, mut rx) = channel(64);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                ReconciliationJob::Reconcile { event_id } => {
                    match reconciler.reconcile(event_id).await {
                        ReconcileOutcome::Failed(message) => {
                            warn!(event = %event_id, %message, "reconciliation job left event unprocessed")
                        }
                        outcome => debug!(event = %event_id, ?outcome, "reconciliation job done"),
                    }
                }
                ReconciliationJob::ReplayFailed { limit } => {
                    match reconciler.replay_failed(limit).await {
                        Ok(outcomes) => {
                            let failed = outcomes
                                .iter()
                                .filter(|(_, o)| matches!(o, ReconcileOutcome::Failed(_)))
                                .count();
                            info!(replayed = outcomes.len(), failed, "replayed unprocessed events");
                        }
                        Err(err) => error!(?err, "failed to load unprocessed payment events"),
                    }
                }
            }
        }
    });

    ReconciliationHandle { sender: tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::models::CapabilityState;

    #[test]
    fn envelope_requires_id_and_type() {
        let now = Utc::now();
        assert!(ProcessorEnvelope::parse(json!({"type": "x"}), now).is_err());
        assert!(ProcessorEnvelope::parse(json!({"id": "evt_1"}), now).is_err());

        let envelope =
            ProcessorEnvelope::parse(json!({"id": "evt_1", "type": "x", "created": 1_700_000_000}), now)
                .unwrap();
        assert_eq!(envelope.occurred_at, from_unix(1_700_000_000).unwrap());

        let undated = ProcessorEnvelope::parse(json!({"id": "evt_2", "type": "x"}), now).unwrap();
        assert_eq!(undated.occurred_at, now);
    }

    #[test]
    fn subscription_updated_carries_present_fields_only() {
        let object = json!({
            "id": "sub_1",
            "status": "past_due",
            "cancel_at_period_end": true,
            "items": {"data": [{"price": {"id": "price_pro"}, "current_period_end": 1_700_000_000}]},
        });
        let ProcessorEvent::SubscriptionChanged { external_subscription_id, price_id, patch } =
            ProcessorEvent::parse("customer.subscription.updated", &object).unwrap()
        else {
            panic!("expected subscription change");
        };
        assert_eq!(external_subscription_id, "sub_1");
        assert_eq!(price_id.as_deref(), Some("price_pro"));
        assert_eq!(patch.status, Some(SubscriptionStatus::PastDue));
        assert_eq!(patch.cancel_at_period_end, Some(true));
        assert_eq!(patch.current_period_end, from_unix(1_700_000_000));
        assert_eq!(patch.trial_end_date, None);
    }

    #[test]
    fn partial_refund_keeps_status() {
        let object = json!({"payment_intent": "pi_1", "amount": 1000, "amount_refunded": 400, "refunded": false});
        let ProcessorEvent::PaymentChanged { patch, .. } =
            ProcessorEvent::parse("charge.refunded", &object).unwrap()
        else {
            panic!("expected payment change");
        };
        assert_eq!(patch.status, None);
        assert_eq!(patch.refunded_amount, Some(400));
    }

    #[test]
    fn account_snapshot_reads_disable_reason() {
        let object = json!({
            "id": "acct_1",
            "charges_enabled": false,
            "payouts_enabled": false,
            "details_submitted": true,
            "requirements": {"disabled_reason": "rejected.fraud"},
            "capabilities": {"card_payments": "inactive"},
        });
        let ProcessorEvent::AccountUpdated(snapshot) =
            ProcessorEvent::parse("account.updated", &object).unwrap()
        else {
            panic!("expected account update");
        };
        assert_eq!(snapshot.disabled_reason.as_deref(), Some("rejected.fraud"));
        assert_eq!(snapshot.card_payments, CapabilityState::Inactive);
        assert_eq!(snapshot.transfers, CapabilityState::Unrequested);
    }

    #[test]
    fn unknown_kinds_are_unsupported_not_errors() {
        assert_eq!(
            ProcessorEvent::parse("customer.created", &json!({})).unwrap(),
            ProcessorEvent::Unsupported
        );
        assert_eq!(event_type_for("customer.created"), PaymentEventType::Other);
    }

    #[test]
    fn negative_amounts_are_parse_errors() {
        let intent = json!({"id": "pi_1", "amount": -5});
        assert!(ProcessorEvent::parse("payment_intent.succeeded", &intent).is_err());
        let fee = json!({"id": "pi_1", "amount": 100, "application_fee_amount": -1});
        assert!(ProcessorEvent::parse("payment_intent.succeeded", &fee).is_err());
        let refund = json!({"payment_intent": "pi_1", "amount": 100, "amount_refunded": -1});
        assert!(ProcessorEvent::parse("charge.refunded", &refund).is_err());
    }

    #[test]
    fn missing_identifier_is_a_parse_error() {
        assert!(ProcessorEvent::parse("payment_intent.succeeded", &json!({"amount": 5})).is_err());
    }
}
