use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::apply;
use super::{
    ConnectStore, NewUsage, PaymentEventStore, SubscriptionStore, TimeWindow, Transition,
};
use crate::billing::models::{
    Applied, PaymentEvent, RecordOutcome, Subscription, SubscriptionAttrs,
    SubscriptionEventPatch, SubscriptionStatus, UsageLogEntry,
};
use crate::connect::models::{
    AccountSnapshot, AccountStatus, ClientPayment, ClientProduct, ConnectedAccount,
    OnboardingLink, PaymentEventPatch,
};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Default)]
struct MemoryState {
    subscriptions: HashMap<Uuid, Subscription>,
    usage_log: Vec<UsageLogEntry>,
    events: Vec<PaymentEvent>,
    accounts: HashMap<Uuid, ConnectedAccount>,
    products: HashMap<Uuid, ClientProduct>,
    payments: HashMap<Uuid, ClientPayment>,
}

impl MemoryState {
    fn live_subscription_mut(&mut self, owner_id: &str) -> Option<&mut Subscription> {
        self.subscriptions
            .values_mut()
            .find(|s| s.owner_id == owner_id && s.deleted_at.is_none())
    }

    fn live_subscription_or_missing(&mut self, owner_id: &str) -> BillingResult<&mut Subscription> {
        self.live_subscription_mut(owner_id)
            .ok_or_else(|| BillingError::not_found("subscription"))
    }

    fn ensure_external_id_free(&self, owner_id: &str, attrs: &SubscriptionAttrs) -> BillingResult<()> {
        let Some(external_id) = attrs.external_subscription_id.as_deref() else {
            return Ok(());
        };
        let taken = self.subscriptions.values().any(|s| {
            s.deleted_at.is_none()
                && s.owner_id != owner_id
                && s.external_subscription_id.as_deref() == Some(external_id)
        });
        if taken {
            return Err(BillingError::conflict(
                "external subscription id belongs to another owner",
            ));
        }
        Ok(())
    }
}

/// Each trait call holds the lock for its whole body, which makes every call a
/// serialized transaction. Used by tests and `BILLING_STORE=memory`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger entries for a subscription and feature, for assertions.
    pub async fn usage_entry_count(&self, subscription_id: Uuid, feature_key: &str) -> usize {
        self.state
            .lock()
            .await
            .usage_log
            .iter()
            .filter(|e| e.subscription_id == subscription_id && e.feature_key == feature_key)
            .count()
    }

    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn find_subscription(&self, owner_id: &str) -> BillingResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        Ok(state.live_subscription_mut(owner_id).map(|s| s.clone()))
    }

    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| {
                s.deleted_at.is_none()
                    && s.external_subscription_id.as_deref() == Some(external_subscription_id)
            })
            .cloned())
    }

    async fn upsert_subscription(
        &self,
        owner_id: &str,
        attrs: &SubscriptionAttrs,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>> {
        let mut state = self.state.lock().await;
        state.ensure_external_id_free(owner_id, attrs)?;
        if let Some(existing) = state.live_subscription_mut(owner_id) {
            let before = existing.clone();
            apply::sync_subscription(existing, attrs, now);
            return Ok(Transition {
                before: Some(before),
                after: existing.clone(),
            });
        }
        let created = apply::new_subscription(owner_id, attrs, now);
        state.subscriptions.insert(created.id, created.clone());
        Ok(Transition {
            before: None,
            after: created,
        })
    }

    async fn upsert_subscription_from_event(
        &self,
        owner_id: &str,
        attrs: &SubscriptionAttrs,
        event_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<Transition<Subscription>>> {
        let mut state = self.state.lock().await;
        state.ensure_external_id_free(owner_id, attrs)?;
        if let Some(existing) = state.live_subscription_mut(owner_id) {
            let before = existing.clone();
            if !apply::sync_subscription_from_event(existing, attrs, event_at, now) {
                return Ok(Applied::Stale(Transition {
                    before: Some(before.clone()),
                    after: before,
                }));
            }
            return Ok(Applied::Updated(Transition {
                before: Some(before),
                after: existing.clone(),
            }));
        }
        let mut created = apply::new_subscription(owner_id, attrs, now);
        created.last_event_at = Some(event_at);
        state.subscriptions.insert(created.id, created.clone());
        Ok(Applied::Updated(Transition {
            before: None,
            after: created,
        }))
    }

    async fn update_status(
        &self,
        owner_id: &str,
        status: SubscriptionStatus,
        end_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>> {
        let mut state = self.state.lock().await;
        let subscription = state.live_subscription_or_missing(owner_id)?;
        let before = subscription.clone();
        subscription.status = status;
        if let Some(end) = end_date {
            subscription.current_period_end = Some(end);
        }
        subscription.updated_at = now;
        Ok(Transition {
            before: Some(before),
            after: subscription.clone(),
        })
    }

    async fn reset_usage(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>> {
        let mut state = self.state.lock().await;
        let subscription = state.live_subscription_or_missing(owner_id)?;
        let before = subscription.clone();
        apply::reset_counters(subscription, now);
        Ok(Transition {
            before: Some(before),
            after: subscription.clone(),
        })
    }

    async fn roll_period(
        &self,
        subscription_id: Uuid,
        expected_period_end: DateTime<Utc>,
        next_period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Subscription>> {
        let mut state = self.state.lock().await;
        let Some(subscription) = state
            .subscriptions
            .get_mut(&subscription_id)
            .filter(|s| s.deleted_at.is_none())
        else {
            return Ok(None);
        };
        if subscription.current_period_end != Some(expected_period_end) {
            return Ok(None);
        }
        apply::reset_counters(subscription, now);
        subscription.current_period_start = expected_period_end;
        subscription.current_period_end = Some(next_period_end);
        Ok(Some(subscription.clone()))
    }

    async fn soft_delete_subscription(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>> {
        let mut state = self.state.lock().await;
        let subscription = state.live_subscription_or_missing(owner_id)?;
        let before = subscription.clone();
        subscription.deleted_at = Some(now);
        subscription.updated_at = now;
        Ok(Transition {
            before: Some(before),
            after: subscription.clone(),
        })
    }

    async fn track_usage(
        &self,
        owner_id: &str,
        usage: &NewUsage,
        now: DateTime<Utc>,
    ) -> BillingResult<(UsageLogEntry, Subscription)> {
        let mut state = self.state.lock().await;
        let subscription = state.live_subscription_or_missing(owner_id)?;
        let next = subscription
            .usage
            .get(&usage.feature_key)
            .checked_add(usage.quantity)
            .ok_or_else(|| {
                BillingError::validation(format!("usage counter for {} overflows", usage.feature_key))
            })?;
        subscription
            .usage
            .counters
            .insert(usage.feature_key.clone(), next);
        subscription.updated_at = now;
        let snapshot = subscription.clone();

        let entry = UsageLogEntry {
            id: Uuid::new_v4(),
            subscription_id: snapshot.id,
            owner_id: owner_id.to_string(),
            feature_key: usage.feature_key.clone(),
            quantity: usage.quantity,
            unit: usage.options.unit.clone(),
            context: usage.options.context.clone(),
            synced_to_processor: false,
            created_at: now,
            updated_at: now,
        };
        state.usage_log.push(entry.clone());
        Ok((entry, snapshot))
    }

    async fn list_usage(
        &self,
        subscription_id: Uuid,
        feature_key: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> BillingResult<Vec<UsageLogEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<UsageLogEntry> = state
            .usage_log
            .iter()
            .rev()
            .filter(|e| e.subscription_id == subscription_id)
            .filter(|e| feature_key.map_or(true, |key| e.feature_key == key))
            .filter(|e| since.map_or(true, |since| e.created_at >= since))
            .cloned()
            .collect();
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn unsynced_usage(&self, limit: i64) -> BillingResult<Vec<UsageLogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .usage_log
            .iter()
            .filter(|e| !e.synced_to_processor)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_usage_synced(&self, ids: &[Uuid], now: DateTime<Utc>) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for entry in state.usage_log.iter_mut() {
            if !entry.synced_to_processor && ids.contains(&entry.id) {
                entry.synced_to_processor = true;
                entry.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut subscriptions: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.deleted_at.is_none())
            .cloned()
            .collect();
        subscriptions.sort_by_key(|s| s.created_at);
        Ok(subscriptions)
    }

    async fn apply_subscription_event(
        &self,
        external_subscription_id: &str,
        patch: &SubscriptionEventPatch,
        event_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<Transition<Subscription>>> {
        let mut state = self.state.lock().await;
        let subscription = state
            .subscriptions
            .values_mut()
            .find(|s| {
                s.deleted_at.is_none()
                    && s.external_subscription_id.as_deref() == Some(external_subscription_id)
            })
            .ok_or_else(|| {
                BillingError::not_found(format!("subscription {external_subscription_id}"))
            })?;
        let before = subscription.clone();
        if !apply::patch_subscription(subscription, patch, event_at, now) {
            return Ok(Applied::Stale(Transition {
                before: Some(before.clone()),
                after: before,
            }));
        }
        Ok(Applied::Updated(Transition {
            before: Some(before),
            after: subscription.clone(),
        }))
    }
}

#[async_trait]
impl PaymentEventStore for MemoryStore {
    async fn record_event(&self, event: &PaymentEvent) -> BillingResult<RecordOutcome> {
        let mut state = self.state.lock().await;
        if let Some(external_id) = event.external_event_id.as_deref() {
            if let Some(existing) = state
                .events
                .iter()
                .find(|e| e.external_event_id.as_deref() == Some(external_id))
            {
                return Ok(RecordOutcome::Duplicate(existing.clone()));
            }
        }
        state.events.push(event.clone());
        Ok(RecordOutcome::Inserted(event.clone()))
    }

    async fn find_event(&self, id: Uuid) -> BillingResult<Option<PaymentEvent>> {
        let state = self.state.lock().await;
        Ok(state.events.iter().find(|e| e.id == id).cloned())
    }

    async fn mark_event_processed(
        &self,
        id: Uuid,
        owner_id: Option<&str>,
        subscription_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| BillingError::not_found("payment event"))?;
        event.processed = true;
        event.error = None;
        event.processed_at = Some(now);
        if owner_id.is_some() {
            event.owner_id = owner_id.map(str::to_string);
        }
        if subscription_id.is_some() {
            event.subscription_id = subscription_id;
        }
        Ok(())
    }

    async fn mark_event_failed(&self, id: Uuid, error: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| BillingError::not_found("payment event"))?;
        event.processed = false;
        event.error = Some(error.to_string());
        Ok(())
    }

    async fn clear_processed(&self, id: Uuid) -> BillingResult<PaymentEvent> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| BillingError::not_found("payment event"))?;
        event.processed = false;
        event.processed_at = None;
        Ok(event.clone())
    }

    async fn unprocessed_events(&self, limit: i64) -> BillingResult<Vec<PaymentEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<PaymentEvent> =
            state.events.iter().filter(|e| !e.processed).cloned().collect();
        events.sort_by_key(|e| e.received_at);
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn list_events_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<PaymentEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<PaymentEvent> = state
            .events
            .iter()
            .rev()
            .filter(|e| e.owner_id.as_deref() == Some(owner_id))
            .cloned()
            .collect();
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }
}

#[async_trait]
impl ConnectStore for MemoryStore {
    async fn find_account_by_owner(
        &self,
        owner_id: &str,
    ) -> BillingResult<Option<ConnectedAccount>> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|a| a.owner_id == owner_id)
            .cloned())
    }

    async fn find_account_by_external_id(
        &self,
        external_account_id: &str,
    ) -> BillingResult<Option<ConnectedAccount>> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|a| a.external_account_id == external_account_id)
            .cloned())
    }

    async fn insert_account(&self, account: &ConnectedAccount) -> BillingResult<ConnectedAccount> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .accounts
            .values()
            .find(|a| a.owner_id == account.owner_id)
        {
            return Ok(existing.clone());
        }
        if state
            .accounts
            .values()
            .any(|a| a.external_account_id == account.external_account_id)
        {
            return Err(BillingError::conflict(
                "external account id is already linked to another owner",
            ));
        }
        state.accounts.insert(account.id, account.clone());
        Ok(account.clone())
    }

    async fn apply_account_snapshot(
        &self,
        snapshot: &AccountSnapshot,
        event_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<(AccountStatus, ConnectedAccount)>> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .values_mut()
            .find(|a| a.external_account_id == snapshot.external_account_id)
            .ok_or_else(|| {
                BillingError::not_found(format!(
                    "connected account {}",
                    snapshot.external_account_id
                ))
            })?;
        let previous = account.account_status;
        if !apply::sync_account(account, snapshot, event_at, now) {
            return Ok(Applied::Stale((previous, account.clone())));
        }
        Ok(Applied::Updated((previous, account.clone())))
    }

    async fn store_onboarding_link(
        &self,
        account_id: Uuid,
        link: &OnboardingLink,
        now: DateTime<Utc>,
    ) -> BillingResult<ConnectedAccount> {
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| BillingError::not_found("connected account"))?;
        account.onboarding_link = Some(link.clone());
        account.updated_at = now;
        Ok(account.clone())
    }

    async fn insert_product(&self, product: &ClientProduct) -> BillingResult<ClientProduct> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&product.account_id) {
            return Err(BillingError::not_found("connected account"));
        }
        state.products.insert(product.id, product.clone());
        Ok(product.clone())
    }

    async fn find_product(&self, id: Uuid) -> BillingResult<Option<ClientProduct>> {
        let state = self.state.lock().await;
        Ok(state.products.get(&id).cloned())
    }

    async fn list_products(
        &self,
        account_id: Uuid,
        active_only: bool,
    ) -> BillingResult<Vec<ClientProduct>> {
        let state = self.state.lock().await;
        let mut products: Vec<ClientProduct> = state
            .products
            .values()
            .filter(|p| p.account_id == account_id && (!active_only || p.active))
            .cloned()
            .collect();
        products.sort_by_key(|p| p.created_at);
        Ok(products)
    }

    async fn set_product_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> BillingResult<ClientProduct> {
        let mut state = self.state.lock().await;
        let product = state
            .products
            .get_mut(&id)
            .ok_or_else(|| BillingError::not_found("product"))?;
        product.active = active;
        product.updated_at = now;
        Ok(product.clone())
    }

    async fn insert_payment(&self, payment: &ClientPayment) -> BillingResult<ClientPayment> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .payments
            .values()
            .find(|p| p.payment_intent_id == payment.payment_intent_id)
        {
            return Ok(existing.clone());
        }
        state.payments.insert(payment.id, payment.clone());
        Ok(payment.clone())
    }

    async fn apply_payment_event(
        &self,
        payment_intent_id: &str,
        patch: &PaymentEventPatch,
        event_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<Transition<ClientPayment>>> {
        let mut state = self.state.lock().await;
        let payment = state
            .payments
            .values_mut()
            .find(|p| p.payment_intent_id == payment_intent_id)
            .ok_or_else(|| BillingError::not_found(format!("payment {payment_intent_id}")))?;
        let before = payment.clone();
        if !apply::patch_payment(payment, patch, event_at, now) {
            return Ok(Applied::Stale(Transition {
                before: Some(before.clone()),
                after: before,
            }));
        }
        Ok(Applied::Updated(Transition {
            before: Some(before),
            after: payment.clone(),
        }))
    }

    async fn list_payments(
        &self,
        account_id: Option<Uuid>,
        window: TimeWindow,
    ) -> BillingResult<Vec<ClientPayment>> {
        let state = self.state.lock().await;
        let mut payments: Vec<ClientPayment> = state
            .payments
            .values()
            .filter(|p| account_id.map_or(true, |id| p.account_id == id))
            .filter(|p| window.contains(p.created_at))
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(payments)
    }
}
