//! Transactional persistence seam for the billing core.
//!
//! Every method is one atomic unit against the backing store: counters and
//! statuses are re-read inside the same transaction that writes them.

pub(crate) mod apply;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::billing::models::{
    Applied, PaymentEvent, RecordOutcome, Subscription, SubscriptionAttrs,
    SubscriptionEventPatch, SubscriptionStatus, UsageLogEntry, UsageOptions,
};
use crate::connect::models::{
    AccountSnapshot, AccountStatus, ClientPayment, ClientProduct, ConnectedAccount,
    OnboardingLink, PaymentEventPatch,
};
use crate::error::BillingResult;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Before/after pair returned by mutations so callers can audit the change.
#[derive(Clone, Debug)]
pub struct Transition<T> {
    pub before: Option<T>,
    pub after: T,
}

/// Usage appended by `track_usage`.
#[derive(Clone, Debug)]
pub struct NewUsage {
    pub feature_key: String,
    pub quantity: i64,
    pub options: UsageOptions,
}

/// Optional creation-time window for payment queries, `[from, to)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeWindow {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at < to)
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Non-deleted subscription for the owner.
    async fn find_subscription(&self, owner_id: &str) -> BillingResult<Option<Subscription>>;

    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Create with zeroed usage, or patch everything except usage.
    async fn upsert_subscription(
        &self,
        owner_id: &str,
        attrs: &SubscriptionAttrs,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>>;

    /// Upsert driven by a processor event; an existing subscription that has already seen
    /// a newer event is left untouched.
    async fn upsert_subscription_from_event(
        &self,
        owner_id: &str,
        attrs: &SubscriptionAttrs,
        event_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<Transition<Subscription>>>;

    /// Fails with not-found when the owner has no live subscription.
    async fn update_status(
        &self,
        owner_id: &str,
        status: SubscriptionStatus,
        end_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>>;

    async fn reset_usage(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>>;

    /// Reset counters and move the period forward, only if the stored period still ends at
    /// `expected_period_end`. Returns `None` when another writer already rolled it.
    async fn roll_period(
        &self,
        subscription_id: Uuid,
        expected_period_end: DateTime<Utc>,
        next_period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Subscription>>;

    async fn soft_delete_subscription(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>>;

    /// Append a ledger entry and increment the counter in one transaction.
    async fn track_usage(
        &self,
        owner_id: &str,
        usage: &NewUsage,
        now: DateTime<Utc>,
    ) -> BillingResult<(UsageLogEntry, Subscription)>;

    /// Newest first.
    async fn list_usage(
        &self,
        subscription_id: Uuid,
        feature_key: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> BillingResult<Vec<UsageLogEntry>>;

    async fn unsynced_usage(&self, limit: i64) -> BillingResult<Vec<UsageLogEntry>>;

    async fn mark_usage_synced(&self, ids: &[Uuid], now: DateTime<Utc>) -> BillingResult<u64>;

    /// All non-deleted subscriptions.
    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>>;

    /// Last-write-wins on present fields, unless the stored entity has seen a newer event.
    async fn apply_subscription_event(
        &self,
        external_subscription_id: &str,
        patch: &SubscriptionEventPatch,
        event_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<Transition<Subscription>>>;
}

#[async_trait]
pub trait PaymentEventStore: Send + Sync {
    /// Processor events dedupe on `external_event_id`.
    async fn record_event(&self, event: &PaymentEvent) -> BillingResult<RecordOutcome>;

    async fn find_event(&self, id: Uuid) -> BillingResult<Option<PaymentEvent>>;

    async fn mark_event_processed(
        &self,
        id: Uuid,
        owner_id: Option<&str>,
        subscription_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> BillingResult<()>;

    async fn mark_event_failed(&self, id: Uuid, error: &str) -> BillingResult<()>;

    /// Manual reset so an operator can force a replay.
    async fn clear_processed(&self, id: Uuid) -> BillingResult<PaymentEvent>;

    /// Oldest first.
    async fn unprocessed_events(&self, limit: i64) -> BillingResult<Vec<PaymentEvent>>;

    async fn list_events_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<PaymentEvent>>;
}

#[async_trait]
pub trait ConnectStore: Send + Sync {
    async fn find_account_by_owner(&self, owner_id: &str)
        -> BillingResult<Option<ConnectedAccount>>;

    async fn find_account_by_external_id(
        &self,
        external_account_id: &str,
    ) -> BillingResult<Option<ConnectedAccount>>;

    /// Returns the existing row when the owner already has an account.
    async fn insert_account(&self, account: &ConnectedAccount) -> BillingResult<ConnectedAccount>;

    /// Write processor flags and recompute the derived status in one transaction.
    async fn apply_account_snapshot(
        &self,
        snapshot: &AccountSnapshot,
        event_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<(AccountStatus, ConnectedAccount)>>;

    async fn store_onboarding_link(
        &self,
        account_id: Uuid,
        link: &OnboardingLink,
        now: DateTime<Utc>,
    ) -> BillingResult<ConnectedAccount>;

    /// Product and price identifiers are persisted together.
    async fn insert_product(&self, product: &ClientProduct) -> BillingResult<ClientProduct>;

    async fn find_product(&self, id: Uuid) -> BillingResult<Option<ClientProduct>>;

    async fn list_products(
        &self,
        account_id: Uuid,
        active_only: bool,
    ) -> BillingResult<Vec<ClientProduct>>;

    async fn set_product_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> BillingResult<ClientProduct>;

    /// Idempotent on `payment_intent_id`.
    async fn insert_payment(&self, payment: &ClientPayment) -> BillingResult<ClientPayment>;

    async fn apply_payment_event(
        &self,
        payment_intent_id: &str,
        patch: &PaymentEventPatch,
        event_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<Transition<ClientPayment>>>;

    /// Newest first; `account_id = None` spans every account.
    async fn list_payments(
        &self,
        account_id: Option<Uuid>,
        window: TimeWindow,
    ) -> BillingResult<Vec<ClientPayment>>;
}

/// Everything the services need, behind one object.
pub trait BillingStore: SubscriptionStore + PaymentEventStore + ConnectStore {}

impl<T> BillingStore for T where T: SubscriptionStore + PaymentEventStore + ConnectStore {}
