use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

use super::apply;
use super::{
    ConnectStore, NewUsage, PaymentEventStore, SubscriptionStore, TimeWindow, Transition,
};
use crate::billing::models::{
    Applied, EventSource, PaymentEvent, PaymentEventType, PlanType, RecordOutcome, Subscription,
    SubscriptionAttrs, SubscriptionEventPatch, SubscriptionStatus, UsageCounters, UsageLogEntry,
};
use crate::connect::models::{
    AccountSnapshot, AccountStatus, AccountType, CapabilityState, ClientPayment, ClientProduct,
    ConnectedAccount, OnboardingLink, PaymentEventPatch, PaymentStatus, ProductInterval,
};
use crate::error::{BillingError, BillingResult};

const SUBSCRIPTION_COLUMNS: &str = "id, owner_id, provider, customer_id, external_subscription_id, \
    plan_id, plan_type, status, features, limits, usage, last_reset_at, current_period_start, \
    current_period_end, trial_end_date, cancel_at_period_end, metadata, last_event_at, deleted_at, \
    created_at, updated_at";

const USAGE_COLUMNS: &str = "id, subscription_id, owner_id, feature_key, quantity, unit, context, \
    synced_to_processor, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, owner_id, subscription_id, external_event_id, event_type, \
    processor_event_type, source, payload, processed, error, occurred_at, received_at, processed_at";

const ACCOUNT_COLUMNS: &str = "id, owner_id, display_name, email, country, external_account_id, \
    account_type, account_status, charges_enabled, payouts_enabled, details_submitted, \
    onboarding_completed, card_payments, transfers, disabled_reason, default_currency, \
    onboarding_link_url, onboarding_link_expires_at, metadata, last_event_at, last_synced_at, \
    created_at, updated_at";

const PRODUCT_COLUMNS: &str = "id, account_id, external_product_id, external_price_id, name, \
    description, amount, currency, interval, active, metadata, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, account_id, product_id, payment_intent_id, checkout_url, amount, \
    currency, status, application_fee_amount, customer_email, customer_name, refunded_amount, \
    refunded_at, failure_reason, metadata, last_event_at, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn unique_violation(err: sqlx::Error, message: &str) -> BillingError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return BillingError::conflict(message);
        }
    }
    BillingError::Database(err)
}

async fn lock_live_subscription(
    conn: &mut PgConnection,
    owner_id: &str,
) -> BillingResult<Option<Subscription>> {
    let sql = format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM billing_subscriptions \
         WHERE owner_id = $1 AND deleted_at IS NULL FOR UPDATE"
    );
    let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
        .bind(owner_id)
        .fetch_optional(conn)
        .await?;
    Ok(row.map(Subscription::from))
}

async fn insert_subscription_row(conn: &mut PgConnection, s: &Subscription) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO billing_subscriptions (
            id, owner_id, provider, customer_id, external_subscription_id, plan_id, plan_type,
            status, features, limits, usage, last_reset_at, current_period_start,
            current_period_end, trial_end_date, cancel_at_period_end, metadata, last_event_at,
            deleted_at, created_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21)
        "#,
    )
    .bind(s.id)
    .bind(&s.owner_id)
    .bind(&s.provider)
    .bind(&s.customer_id)
    .bind(&s.external_subscription_id)
    .bind(&s.plan_id)
    .bind(s.plan_type.as_str())
    .bind(s.status.as_str())
    .bind(Json(&s.features))
    .bind(Json(&s.limits))
    .bind(Json(&s.usage.counters))
    .bind(s.usage.last_reset_at)
    .bind(s.current_period_start)
    .bind(s.current_period_end)
    .bind(s.trial_end_date)
    .bind(s.cancel_at_period_end)
    .bind(&s.metadata)
    .bind(s.last_event_at)
    .bind(s.deleted_at)
    .bind(s.created_at)
    .bind(s.updated_at)
    .execute(conn)
    .await
    .map_err(|err| unique_violation(err, "owner already has a live subscription"))?;
    Ok(())
}

async fn write_subscription_row(conn: &mut PgConnection, s: &Subscription) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE billing_subscriptions SET
            provider = $2,
            customer_id = $3,
            external_subscription_id = $4,
            plan_id = $5,
            plan_type = $6,
            status = $7,
            features = $8,
            limits = $9,
            usage = $10,
            last_reset_at = $11,
            current_period_start = $12,
            current_period_end = $13,
            trial_end_date = $14,
            cancel_at_period_end = $15,
            metadata = $16,
            last_event_at = $17,
            deleted_at = $18,
            updated_at = $19
        WHERE id = $1
        "#,
    )
    .bind(s.id)
    .bind(&s.provider)
    .bind(&s.customer_id)
    .bind(&s.external_subscription_id)
    .bind(&s.plan_id)
    .bind(s.plan_type.as_str())
    .bind(s.status.as_str())
    .bind(Json(&s.features))
    .bind(Json(&s.limits))
    .bind(Json(&s.usage.counters))
    .bind(s.usage.last_reset_at)
    .bind(s.current_period_start)
    .bind(s.current_period_end)
    .bind(s.trial_end_date)
    .bind(s.cancel_at_period_end)
    .bind(&s.metadata)
    .bind(s.last_event_at)
    .bind(s.deleted_at)
    .bind(s.updated_at)
    .execute(conn)
    .await
    .map_err(|err| unique_violation(err, "external subscription id belongs to another owner"))?;
    Ok(())
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn find_subscription(&self, owner_id: &str) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM billing_subscriptions \
             WHERE owner_id = $1 AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Subscription::from))
    }

    async fn find_subscription_by_external_id(
        &self,
        external_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM billing_subscriptions \
             WHERE external_subscription_id = $1 AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(external_subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Subscription::from))
    }

    async fn upsert_subscription(
        &self,
        owner_id: &str,
        attrs: &SubscriptionAttrs,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>> {
        let mut tx = self.pool.begin().await?;
        let transition = match lock_live_subscription(&mut *tx, owner_id).await? {
            Some(mut existing) => {
                let before = existing.clone();
                apply::sync_subscription(&mut existing, attrs, now);
                write_subscription_row(&mut *tx, &existing).await?;
                Transition {
                    before: Some(before),
                    after: existing,
                }
            }
            None => {
                let created = apply::new_subscription(owner_id, attrs, now);
                insert_subscription_row(&mut *tx, &created).await?;
                Transition {
                    before: None,
                    after: created,
                }
            }
        };
        tx.commit().await?;
        Ok(transition)
    }

    async fn upsert_subscription_from_event(
        &self,
        owner_id: &str,
        attrs: &SubscriptionAttrs,
        event_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<Transition<Subscription>>> {
        let mut tx = self.pool.begin().await?;
        let applied = match lock_live_subscription(&mut *tx, owner_id).await? {
            Some(mut existing) => {
                let before = existing.clone();
                if !apply::sync_subscription_from_event(&mut existing, attrs, event_at, now) {
                    tx.rollback().await?;
                    return Ok(Applied::Stale(Transition {
                        before: Some(before.clone()),
                        after: before,
                    }));
                }
                write_subscription_row(&mut *tx, &existing).await?;
                Applied::Updated(Transition {
                    before: Some(before),
                    after: existing,
                })
            }
            None => {
                let mut created = apply::new_subscription(owner_id, attrs, now);
                created.last_event_at = Some(event_at);
                insert_subscription_row(&mut *tx, &created).await?;
                Applied::Updated(Transition {
                    before: None,
                    after: created,
                })
            }
        };
        tx.commit().await?;
        Ok(applied)
    }

    async fn update_status(
        &self,
        owner_id: &str,
        status: SubscriptionStatus,
        end_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>> {
        let mut tx = self.pool.begin().await?;
        let mut subscription = lock_live_subscription(&mut *tx, owner_id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription"))?;
        let before = subscription.clone();
        subscription.status = status;
        if let Some(end) = end_date {
            subscription.current_period_end = Some(end);
        }
        subscription.updated_at = now;
        write_subscription_row(&mut *tx, &subscription).await?;
        tx.commit().await?;
        Ok(Transition {
            before: Some(before),
            after: subscription,
        })
    }

    async fn reset_usage(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>> {
        let mut tx = self.pool.begin().await?;
        let mut subscription = lock_live_subscription(&mut *tx, owner_id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription"))?;
        let before = subscription.clone();
        apply::reset_counters(&mut subscription, now);
        write_subscription_row(&mut *tx, &subscription).await?;
        tx.commit().await?;
        Ok(Transition {
            before: Some(before),
            after: subscription,
        })
    }

    async fn roll_period(
        &self,
        subscription_id: Uuid,
        expected_period_end: DateTime<Utc>,
        next_period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "UPDATE billing_subscriptions SET usage = '{{}}'::jsonb, last_reset_at = $4, \
                current_period_start = $2, current_period_end = $3, updated_at = $4 \
             WHERE id = $1 AND deleted_at IS NULL AND current_period_end = $2 \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(subscription_id)
            .bind(expected_period_end)
            .bind(next_period_end)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Subscription::from))
    }

    async fn soft_delete_subscription(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<Transition<Subscription>> {
        let mut tx = self.pool.begin().await?;
        let mut subscription = lock_live_subscription(&mut *tx, owner_id)
            .await?
            .ok_or_else(|| BillingError::not_found("subscription"))?;
        let before = subscription.clone();
        subscription.deleted_at = Some(now);
        subscription.updated_at = now;
        write_subscription_row(&mut *tx, &subscription).await?;
        tx.commit().await?;
        Ok(Transition {
            before: Some(before),
            after: subscription,
        })
    }

    async fn track_usage(
        &self,
        owner_id: &str,
        usage: &NewUsage,
        now: DateTime<Utc>,
    ) -> BillingResult<(UsageLogEntry, Subscription)> {
        let mut tx = self.pool.begin().await?;
        // The increment reads the stored counter under the row lock taken by UPDATE.
        let sql = format!(
            "UPDATE billing_subscriptions SET \
                usage = jsonb_set(usage, ARRAY[$2::text], \
                    to_jsonb(COALESCE((usage ->> $2)::bigint, 0) + $3), true), \
                updated_at = $4 \
             WHERE owner_id = $1 AND deleted_at IS NULL \
               AND COALESCE((usage ->> $2)::bigint, 0) <= 9223372036854775807 - $3 \
             RETURNING {SUBSCRIPTION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(owner_id)
            .bind(&usage.feature_key)
            .bind(usage.quantity)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            let exists = lock_live_subscription(&mut *tx, owner_id).await?.is_some();
            tx.rollback().await?;
            return Err(if exists {
                BillingError::validation(format!(
                    "usage counter for {} overflows",
                    usage.feature_key
                ))
            } else {
                BillingError::not_found("subscription")
            });
        };
        let subscription = Subscription::from(row);

        let entry_sql = format!(
            "INSERT INTO billing_usage_log ({USAGE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, $8, $8) RETURNING {USAGE_COLUMNS}"
        );
        let entry = sqlx::query_as::<_, UsageLogRow>(&entry_sql)
            .bind(Uuid::new_v4())
            .bind(subscription.id)
            .bind(owner_id)
            .bind(&usage.feature_key)
            .bind(usage.quantity)
            .bind(&usage.options.unit)
            .bind(&usage.options.context)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((UsageLogEntry::from(entry), subscription))
    }

    async fn list_usage(
        &self,
        subscription_id: Uuid,
        feature_key: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> BillingResult<Vec<UsageLogEntry>> {
        let sql = format!(
            "SELECT {USAGE_COLUMNS} FROM billing_usage_log \
             WHERE subscription_id = $1 \
               AND ($2::text IS NULL OR feature_key = $2) \
               AND ($3::timestamptz IS NULL OR created_at >= $3) \
             ORDER BY created_at DESC LIMIT $4"
        );
        let rows = sqlx::query_as::<_, UsageLogRow>(&sql)
            .bind(subscription_id)
            .bind(feature_key)
            .bind(since)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(UsageLogEntry::from).collect())
    }

    async fn unsynced_usage(&self, limit: i64) -> BillingResult<Vec<UsageLogEntry>> {
        let sql = format!(
            "SELECT {USAGE_COLUMNS} FROM billing_usage_log \
             WHERE synced_to_processor = FALSE ORDER BY created_at ASC LIMIT $1"
        );
        let rows = sqlx::query_as::<_, UsageLogRow>(&sql)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(UsageLogEntry::from).collect())
    }

    async fn mark_usage_synced(&self, ids: &[Uuid], now: DateTime<Utc>) -> BillingResult<u64> {
        let result = sqlx::query(
            "UPDATE billing_usage_log SET synced_to_processor = TRUE, updated_at = $2 \
             WHERE id = ANY($1) AND synced_to_processor = FALSE",
        )
        .bind(ids)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM billing_subscriptions \
             WHERE deleted_at IS NULL ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    async fn apply_subscription_event(
        &self,
        external_subscription_id: &str,
        patch: &SubscriptionEventPatch,
        event_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<Transition<Subscription>>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM billing_subscriptions \
             WHERE external_subscription_id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        let mut subscription = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(external_subscription_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(Subscription::from)
            .ok_or_else(|| {
                BillingError::not_found(format!("subscription {external_subscription_id}"))
            })?;
        let before = subscription.clone();
        if !apply::patch_subscription(&mut subscription, patch, event_at, now) {
            tx.rollback().await?;
            return Ok(Applied::Stale(Transition {
                before: Some(before.clone()),
                after: before,
            }));
        }
        write_subscription_row(&mut *tx, &subscription).await?;
        tx.commit().await?;
        Ok(Applied::Updated(Transition {
            before: Some(before),
            after: subscription,
        }))
    }
}

#[async_trait]
impl PaymentEventStore for PgStore {
    async fn record_event(&self, event: &PaymentEvent) -> BillingResult<RecordOutcome> {
        let sql = format!(
            "INSERT INTO billing_payment_events ({EVENT_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13) \
             ON CONFLICT (external_event_id) DO NOTHING \
             RETURNING {EVENT_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, PaymentEventRow>(&sql)
            .bind(event.id)
            .bind(&event.owner_id)
            .bind(event.subscription_id)
            .bind(&event.external_event_id)
            .bind(event.event_type.as_str())
            .bind(&event.processor_event_type)
            .bind(event.source.as_str())
            .bind(&event.payload)
            .bind(event.processed)
            .bind(&event.error)
            .bind(event.occurred_at)
            .bind(event.received_at)
            .bind(event.processed_at)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = inserted {
            return Ok(RecordOutcome::Inserted(PaymentEvent::from(row)));
        }

        let existing_sql =
            format!("SELECT {EVENT_COLUMNS} FROM billing_payment_events WHERE external_event_id = $1");
        let existing = sqlx::query_as::<_, PaymentEventRow>(&existing_sql)
            .bind(&event.external_event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(RecordOutcome::Duplicate(PaymentEvent::from(existing)))
    }

    async fn find_event(&self, id: Uuid) -> BillingResult<Option<PaymentEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM billing_payment_events WHERE id = $1");
        let row = sqlx::query_as::<_, PaymentEventRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(PaymentEvent::from))
    }

    async fn mark_event_processed(
        &self,
        id: Uuid,
        owner_id: Option<&str>,
        subscription_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE billing_payment_events SET processed = TRUE, error = NULL, processed_at = $2, \
                owner_id = COALESCE($3, owner_id), subscription_id = COALESCE($4, subscription_id) \
             WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .bind(owner_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::not_found("payment event"));
        }
        Ok(())
    }

    async fn mark_event_failed(&self, id: Uuid, error: &str) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE billing_payment_events SET processed = FALSE, error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::not_found("payment event"));
        }
        Ok(())
    }

    async fn clear_processed(&self, id: Uuid) -> BillingResult<PaymentEvent> {
        let sql = format!(
            "UPDATE billing_payment_events SET processed = FALSE, processed_at = NULL \
             WHERE id = $1 RETURNING {EVENT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PaymentEventRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::not_found("payment event"))?;
        Ok(PaymentEvent::from(row))
    }

    async fn unprocessed_events(&self, limit: i64) -> BillingResult<Vec<PaymentEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM billing_payment_events \
             WHERE processed = FALSE ORDER BY received_at ASC LIMIT $1"
        );
        let rows = sqlx::query_as::<_, PaymentEventRow>(&sql)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PaymentEvent::from).collect())
    }

    async fn list_events_for_owner(
        &self,
        owner_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<PaymentEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM billing_payment_events \
             WHERE owner_id = $1 ORDER BY received_at DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, PaymentEventRow>(&sql)
            .bind(owner_id)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PaymentEvent::from).collect())
    }
}

async fn write_account_row(conn: &mut PgConnection, a: &ConnectedAccount) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE connected_accounts SET
            email = $2,
            account_status = $3,
            charges_enabled = $4,
            payouts_enabled = $5,
            details_submitted = $6,
            onboarding_completed = $7,
            card_payments = $8,
            transfers = $9,
            disabled_reason = $10,
            default_currency = $11,
            onboarding_link_url = $12,
            onboarding_link_expires_at = $13,
            last_event_at = $14,
            last_synced_at = $15,
            updated_at = $16
        WHERE id = $1
        "#,
    )
    .bind(a.id)
    .bind(&a.email)
    .bind(a.account_status.as_str())
    .bind(a.charges_enabled)
    .bind(a.payouts_enabled)
    .bind(a.details_submitted)
    .bind(a.onboarding_completed)
    .bind(a.card_payments.as_str())
    .bind(a.transfers.as_str())
    .bind(&a.disabled_reason)
    .bind(&a.default_currency)
    .bind(a.onboarding_link.as_ref().map(|link| link.url.clone()))
    .bind(a.onboarding_link.as_ref().map(|link| link.expires_at))
    .bind(a.last_event_at)
    .bind(a.last_synced_at)
    .bind(a.updated_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl ConnectStore for PgStore {
    async fn find_account_by_owner(
        &self,
        owner_id: &str,
    ) -> BillingResult<Option<ConnectedAccount>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM connected_accounts WHERE owner_id = $1");
        let row = sqlx::query_as::<_, AccountRow>(&sql)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ConnectedAccount::from))
    }

    async fn find_account_by_external_id(
        &self,
        external_account_id: &str,
    ) -> BillingResult<Option<ConnectedAccount>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM connected_accounts WHERE external_account_id = $1"
        );
        let row = sqlx::query_as::<_, AccountRow>(&sql)
            .bind(external_account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ConnectedAccount::from))
    }

    async fn insert_account(&self, a: &ConnectedAccount) -> BillingResult<ConnectedAccount> {
        let sql = format!(
            "INSERT INTO connected_accounts ({ACCOUNT_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23) \
             ON CONFLICT (owner_id) DO NOTHING RETURNING {ACCOUNT_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, AccountRow>(&sql)
            .bind(a.id)
            .bind(&a.owner_id)
            .bind(&a.display_name)
            .bind(&a.email)
            .bind(&a.country)
            .bind(&a.external_account_id)
            .bind(a.account_type.as_str())
            .bind(a.account_status.as_str())
            .bind(a.charges_enabled)
            .bind(a.payouts_enabled)
            .bind(a.details_submitted)
            .bind(a.onboarding_completed)
            .bind(a.card_payments.as_str())
            .bind(a.transfers.as_str())
            .bind(&a.disabled_reason)
            .bind(&a.default_currency)
            .bind(a.onboarding_link.as_ref().map(|link| link.url.clone()))
            .bind(a.onboarding_link.as_ref().map(|link| link.expires_at))
            .bind(&a.metadata)
            .bind(a.last_event_at)
            .bind(a.last_synced_at)
            .bind(a.created_at)
            .bind(a.updated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| {
                unique_violation(err, "external account id is already linked to another owner")
            })?;
        match inserted {
            Some(row) => Ok(ConnectedAccount::from(row)),
            None => self
                .find_account_by_owner(&a.owner_id)
                .await?
                .ok_or_else(|| BillingError::not_found("connected account")),
        }
    }

    async fn apply_account_snapshot(
        &self,
        snapshot: &AccountSnapshot,
        event_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<(AccountStatus, ConnectedAccount)>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM connected_accounts \
             WHERE external_account_id = $1 FOR UPDATE"
        );
        let mut account = sqlx::query_as::<_, AccountRow>(&sql)
            .bind(&snapshot.external_account_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(ConnectedAccount::from)
            .ok_or_else(|| {
                BillingError::not_found(format!(
                    "connected account {}",
                    snapshot.external_account_id
                ))
            })?;
        let previous = account.account_status;
        if !apply::sync_account(&mut account, snapshot, event_at, now) {
            tx.rollback().await?;
            return Ok(Applied::Stale((previous, account)));
        }
        write_account_row(&mut *tx, &account).await?;
        tx.commit().await?;
        Ok(Applied::Updated((previous, account)))
    }

    async fn store_onboarding_link(
        &self,
        account_id: Uuid,
        link: &OnboardingLink,
        now: DateTime<Utc>,
    ) -> BillingResult<ConnectedAccount> {
        let sql = format!(
            "UPDATE connected_accounts SET onboarding_link_url = $2, \
                onboarding_link_expires_at = $3, updated_at = $4 \
             WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, AccountRow>(&sql)
            .bind(account_id)
            .bind(&link.url)
            .bind(link.expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::not_found("connected account"))?;
        Ok(ConnectedAccount::from(row))
    }

    async fn insert_product(&self, p: &ClientProduct) -> BillingResult<ClientProduct> {
        let sql = format!(
            "INSERT INTO client_products ({PRODUCT_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13) RETURNING {PRODUCT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ProductRow>(&sql)
            .bind(p.id)
            .bind(p.account_id)
            .bind(&p.external_product_id)
            .bind(&p.external_price_id)
            .bind(&p.name)
            .bind(&p.description)
            .bind(p.amount)
            .bind(&p.currency)
            .bind(p.interval.as_str())
            .bind(p.active)
            .bind(&p.metadata)
            .bind(p.created_at)
            .bind(p.updated_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(ClientProduct::from(row))
    }

    async fn find_product(&self, id: Uuid) -> BillingResult<Option<ClientProduct>> {
        let sql = format!("SELECT {PRODUCT_COLUMNS} FROM client_products WHERE id = $1");
        let row = sqlx::query_as::<_, ProductRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ClientProduct::from))
    }

    async fn list_products(
        &self,
        account_id: Uuid,
        active_only: bool,
    ) -> BillingResult<Vec<ClientProduct>> {
        let sql = format!(
            "SELECT {PRODUCT_COLUMNS} FROM client_products \
             WHERE account_id = $1 AND (active OR NOT $2) ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, ProductRow>(&sql)
            .bind(account_id)
            .bind(active_only)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ClientProduct::from).collect())
    }

    async fn set_product_active(
        &self,
        id: Uuid,
        active: bool,
        now: DateTime<Utc>,
    ) -> BillingResult<ClientProduct> {
        let sql = format!(
            "UPDATE client_products SET active = $2, updated_at = $3 WHERE id = $1 \
             RETURNING {PRODUCT_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ProductRow>(&sql)
            .bind(id)
            .bind(active)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::not_found("product"))?;
        Ok(ClientProduct::from(row))
    }

    async fn insert_payment(&self, p: &ClientPayment) -> BillingResult<ClientPayment> {
        let sql = format!(
            "INSERT INTO client_payments ({PAYMENT_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18) \
             ON CONFLICT (payment_intent_id) DO NOTHING RETURNING {PAYMENT_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(p.id)
            .bind(p.account_id)
            .bind(p.product_id)
            .bind(&p.payment_intent_id)
            .bind(&p.checkout_url)
            .bind(p.amount)
            .bind(&p.currency)
            .bind(p.status.as_str())
            .bind(p.application_fee_amount)
            .bind(&p.customer_email)
            .bind(&p.customer_name)
            .bind(p.refunded_amount)
            .bind(p.refunded_at)
            .bind(&p.failure_reason)
            .bind(&p.metadata)
            .bind(p.last_event_at)
            .bind(p.created_at)
            .bind(p.updated_at)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = inserted {
            return Ok(ClientPayment::from(row));
        }
        let existing_sql =
            format!("SELECT {PAYMENT_COLUMNS} FROM client_payments WHERE payment_intent_id = $1");
        let existing = sqlx::query_as::<_, PaymentRow>(&existing_sql)
            .bind(&p.payment_intent_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(ClientPayment::from(existing))
    }

    async fn apply_payment_event(
        &self,
        payment_intent_id: &str,
        patch: &PaymentEventPatch,
        event_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> BillingResult<Applied<Transition<ClientPayment>>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM client_payments WHERE payment_intent_id = $1 FOR UPDATE"
        );
        let mut payment = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(payment_intent_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(ClientPayment::from)
            .ok_or_else(|| BillingError::not_found(format!("payment {payment_intent_id}")))?;
        let before = payment.clone();
        if !apply::patch_payment(&mut payment, patch, event_at, now) {
            tx.rollback().await?;
            return Ok(Applied::Stale(Transition {
                before: Some(before.clone()),
                after: before,
            }));
        }
        sqlx::query(
            r#"
            UPDATE client_payments SET
                status = $2,
                amount = $3,
                application_fee_amount = $4,
                customer_email = $5,
                customer_name = $6,
                refunded_amount = $7,
                refunded_at = $8,
                failure_reason = $9,
                last_event_at = $10,
                updated_at = $11
            WHERE id = $1
            "#,
        )
        .bind(payment.id)
        .bind(payment.status.as_str())
        .bind(payment.amount)
        .bind(payment.application_fee_amount)
        .bind(&payment.customer_email)
        .bind(&payment.customer_name)
        .bind(payment.refunded_amount)
        .bind(payment.refunded_at)
        .bind(&payment.failure_reason)
        .bind(payment.last_event_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Applied::Updated(Transition {
            before: Some(before),
            after: payment,
        }))
    }

    async fn list_payments(
        &self,
        account_id: Option<Uuid>,
        window: TimeWindow,
    ) -> BillingResult<Vec<ClientPayment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM client_payments \
             WHERE ($1::uuid IS NULL OR account_id = $1) \
               AND ($2::timestamptz IS NULL OR created_at >= $2) \
               AND ($3::timestamptz IS NULL OR created_at < $3) \
             ORDER BY created_at DESC"
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(account_id)
            .bind(window.from)
            .bind(window.to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ClientPayment::from).collect())
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    id: Uuid,
    owner_id: String,
    provider: Option<String>,
    customer_id: Option<String>,
    external_subscription_id: Option<String>,
    plan_id: String,
    plan_type: String,
    status: String,
    features: Json<BTreeSet<String>>,
    limits: Json<BTreeMap<String, i64>>,
    usage: Json<BTreeMap<String, i64>>,
    last_reset_at: DateTime<Utc>,
    current_period_start: DateTime<Utc>,
    current_period_end: Option<DateTime<Utc>>,
    trial_end_date: Option<DateTime<Utc>>,
    cancel_at_period_end: bool,
    metadata: Value,
    last_event_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            provider: row.provider,
            customer_id: row.customer_id,
            external_subscription_id: row.external_subscription_id,
            plan_id: row.plan_id,
            plan_type: PlanType::from_str(&row.plan_type),
            // the status CHECK constraint keeps unknown values out
            status: SubscriptionStatus::from_str(&row.status).unwrap_or(SubscriptionStatus::Inactive),
            features: row.features.0,
            limits: row.limits.0,
            usage: UsageCounters {
                counters: row.usage.0,
                last_reset_at: row.last_reset_at,
            },
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            trial_end_date: row.trial_end_date,
            cancel_at_period_end: row.cancel_at_period_end,
            metadata: row.metadata,
            last_event_at: row.last_event_at,
            deleted_at: row.deleted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct UsageLogRow {
    id: Uuid,
    subscription_id: Uuid,
    owner_id: String,
    feature_key: String,
    quantity: i64,
    unit: Option<String>,
    context: Option<Value>,
    synced_to_processor: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UsageLogRow> for UsageLogEntry {
    fn from(row: UsageLogRow) -> Self {
        Self {
            id: row.id,
            subscription_id: row.subscription_id,
            owner_id: row.owner_id,
            feature_key: row.feature_key,
            quantity: row.quantity,
            unit: row.unit,
            context: row.context,
            synced_to_processor: row.synced_to_processor,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct PaymentEventRow {
    id: Uuid,
    owner_id: Option<String>,
    subscription_id: Option<Uuid>,
    external_event_id: Option<String>,
    event_type: String,
    processor_event_type: Option<String>,
    source: String,
    payload: Value,
    processed: bool,
    error: Option<String>,
    occurred_at: DateTime<Utc>,
    received_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<PaymentEventRow> for PaymentEvent {
    fn from(row: PaymentEventRow) -> Self {
        Self {
            id: row.id,
            owner_id: row.owner_id,
            subscription_id: row.subscription_id,
            external_event_id: row.external_event_id,
            event_type: PaymentEventType::from_str(&row.event_type),
            processor_event_type: row.processor_event_type,
            source: EventSource::from_str(&row.source),
            payload: row.payload,
            processed: row.processed,
            error: row.error,
            occurred_at: row.occurred_at,
            received_at: row.received_at,
            processed_at: row.processed_at,
        }
    }
}

#[derive(FromRow)]
struct AccountRow {
    id: Uuid,
    owner_id: String,
    display_name: Option<String>,
    email: Option<String>,
    country: Option<String>,
    external_account_id: String,
    account_type: String,
    account_status: String,
    charges_enabled: bool,
    payouts_enabled: bool,
    details_submitted: bool,
    onboarding_completed: bool,
    card_payments: String,
    transfers: String,
    disabled_reason: Option<String>,
    default_currency: String,
    onboarding_link_url: Option<String>,
    onboarding_link_expires_at: Option<DateTime<Utc>>,
    metadata: Value,
    last_event_at: Option<DateTime<Utc>>,
    last_synced_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for ConnectedAccount {
    fn from(row: AccountRow) -> Self {
        let onboarding_link = match (row.onboarding_link_url, row.onboarding_link_expires_at) {
            (Some(url), Some(expires_at)) => Some(OnboardingLink { url, expires_at }),
            _ => None,
        };
        Self {
            id: row.id,
            owner_id: row.owner_id,
            display_name: row.display_name,
            email: row.email,
            country: row.country,
            external_account_id: row.external_account_id,
            account_type: AccountType::from_str(&row.account_type),
            account_status: AccountStatus::from_str(&row.account_status),
            charges_enabled: row.charges_enabled,
            payouts_enabled: row.payouts_enabled,
            details_submitted: row.details_submitted,
            onboarding_completed: row.onboarding_completed,
            card_payments: CapabilityState::from_str(&row.card_payments),
            transfers: CapabilityState::from_str(&row.transfers),
            disabled_reason: row.disabled_reason,
            default_currency: row.default_currency,
            onboarding_link,
            metadata: row.metadata,
            last_event_at: row.last_event_at,
            last_synced_at: row.last_synced_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct ProductRow {
    id: Uuid,
    account_id: Uuid,
    external_product_id: String,
    external_price_id: String,
    name: String,
    description: Option<String>,
    amount: i64,
    currency: String,
    interval: String,
    active: bool,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ProductRow> for ClientProduct {
    fn from(row: ProductRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            external_product_id: row.external_product_id,
            external_price_id: row.external_price_id,
            name: row.name,
            description: row.description,
            amount: row.amount,
            currency: row.currency,
            interval: ProductInterval::from_str(&row.interval),
            active: row.active,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct PaymentRow {
    id: Uuid,
    account_id: Uuid,
    product_id: Option<Uuid>,
    payment_intent_id: String,
    checkout_url: Option<String>,
    amount: i64,
    currency: String,
    status: String,
    application_fee_amount: i64,
    customer_email: Option<String>,
    customer_name: Option<String>,
    refunded_amount: i64,
    refunded_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    metadata: Value,
    last_event_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PaymentRow> for ClientPayment {
    fn from(row: PaymentRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            product_id: row.product_id,
            payment_intent_id: row.payment_intent_id,
            checkout_url: row.checkout_url,
            amount: row.amount,
            currency: row.currency,
            status: PaymentStatus::from_str(&row.status),
            application_fee_amount: row.application_fee_amount,
            customer_email: row.customer_email,
            customer_name: row.customer_name,
            refunded_amount: row.refunded_amount,
            refunded_at: row.refunded_at,
            failure_reason: row.failure_reason,
            metadata: row.metadata,
            last_event_at: row.last_event_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
