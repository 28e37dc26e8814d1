//! Mutation rules shared by every store backend. Backends load the current row
//! inside their transaction, run one of these, and write the result back.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::billing::models::{
    Subscription, SubscriptionAttrs, SubscriptionEventPatch, UsageCounters,
};
use crate::connect::models::{
    AccountSnapshot, ClientPayment, ConnectedAccount, PaymentEventPatch, PaymentStatus,
};
use crate::connect::status::{derive_from_snapshot, onboarding_completed};

/// Fresh subscription for an owner with every counter at zero.
pub fn new_subscription(owner_id: &str, attrs: &SubscriptionAttrs, now: DateTime<Utc>) -> Subscription {
    Subscription {
        id: Uuid::new_v4(),
        owner_id: owner_id.to_string(),
        provider: attrs.provider.clone(),
        customer_id: attrs.customer_id.clone(),
        external_subscription_id: attrs.external_subscription_id.clone(),
        plan_id: attrs.plan_id.clone(),
        plan_type: attrs.plan_type,
        status: attrs.status,
        features: attrs.features.clone(),
        limits: attrs.limits.clone(),
        usage: UsageCounters::zeroed(now),
        current_period_start: attrs.current_period_start.unwrap_or(now),
        current_period_end: attrs.current_period_end,
        trial_end_date: attrs.trial_end_date,
        cancel_at_period_end: attrs.cancel_at_period_end,
        metadata: normalize_metadata(&attrs.metadata),
        last_event_at: None,
        deleted_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// Patch mutable fields from a sync. Usage is left untouched; absent external ids are kept.
pub fn sync_subscription(subscription: &mut Subscription, attrs: &SubscriptionAttrs, now: DateTime<Utc>) {
    subscription.plan_id = attrs.plan_id.clone();
    subscription.plan_type = attrs.plan_type;
    subscription.status = attrs.status;
    subscription.features = attrs.features.clone();
    subscription.limits = attrs.limits.clone();
    if let Some(start) = attrs.current_period_start {
        subscription.current_period_start = start;
    }
    subscription.current_period_end = attrs.current_period_end;
    subscription.trial_end_date = attrs.trial_end_date;
    subscription.cancel_at_period_end = attrs.cancel_at_period_end;
    if attrs.provider.is_some() {
        subscription.provider = attrs.provider.clone();
    }
    if attrs.customer_id.is_some() {
        subscription.customer_id = attrs.customer_id.clone();
    }
    if attrs.external_subscription_id.is_some() {
        subscription.external_subscription_id = attrs.external_subscription_id.clone();
    }
    if !attrs.metadata.is_null() {
        subscription.metadata = normalize_metadata(&attrs.metadata);
    }
    subscription.updated_at = now;
}

pub fn reset_counters(subscription: &mut Subscription, now: DateTime<Utc>) {
    subscription.usage = UsageCounters::zeroed(now);
    subscription.updated_at = now;
}

/// True when an event stamped `event_at` is older than what the entity already reflects.
/// Checkout-driven sync guarded by `last_event_at`. Returns false when stale.
pub fn sync_subscription_from_event(
    subscription: &mut Subscription,
    attrs: &SubscriptionAttrs,
    event_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    if is_stale(subscription.last_event_at, event_at) {
        return false;
    }
    sync_subscription(subscription, attrs, now);
    subscription.last_event_at = Some(event_at);
    true
}

pub fn is_stale(last_event_at: Option<DateTime<Utc>>, event_at: DateTime<Utc>) -> bool {
    last_event_at.map_or(false, |seen| event_at < seen)
}

/// Returns false without touching the subscription when the event is stale.
pub fn patch_subscription(
    subscription: &mut Subscription,
    patch: &SubscriptionEventPatch,
    event_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    if is_stale(subscription.last_event_at, event_at) {
        return false;
    }
    if let Some(status) = patch.status {
        subscription.status = status;
    }
    if let Some(plan_id) = &patch.plan_id {
        subscription.plan_id = plan_id.clone();
    }
    if let Some(plan_type) = patch.plan_type {
        subscription.plan_type = plan_type;
    }
    if let Some(features) = &patch.features {
        subscription.features = features.clone();
    }
    if let Some(limits) = &patch.limits {
        subscription.limits = limits.clone();
    }
    if let Some(customer_id) = &patch.customer_id {
        subscription.customer_id = Some(customer_id.clone());
    }
    if let Some(start) = patch.current_period_start {
        subscription.current_period_start = start;
    }
    if let Some(end) = patch.current_period_end {
        subscription.current_period_end = Some(end);
    }
    if let Some(trial_end) = patch.trial_end_date {
        subscription.trial_end_date = Some(trial_end);
    }
    if let Some(cancel) = patch.cancel_at_period_end {
        subscription.cancel_at_period_end = cancel;
    }
    subscription.last_event_at = Some(event_at);
    subscription.updated_at = now;
    true
}

/// Copies processor flags and recomputes the status. Returns false when stale.
pub fn sync_account(
    account: &mut ConnectedAccount,
    snapshot: &AccountSnapshot,
    event_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if let Some(event_at) = event_at {
        if is_stale(account.last_event_at, event_at) {
            return false;
        }
        account.last_event_at = Some(event_at);
    }
    account.charges_enabled = snapshot.charges_enabled;
    account.payouts_enabled = snapshot.payouts_enabled;
    account.details_submitted = snapshot.details_submitted;
    account.disabled_reason = snapshot
        .disabled_reason
        .clone()
        .filter(|reason| !reason.trim().is_empty());
    account.card_payments = snapshot.card_payments;
    account.transfers = snapshot.transfers;
    if let Some(currency) = &snapshot.default_currency {
        account.default_currency = currency.to_ascii_lowercase();
    }
    if snapshot.email.is_some() {
        account.email = snapshot.email.clone();
    }
    account.onboarding_completed = onboarding_completed(snapshot);
    account.account_status = derive_from_snapshot(snapshot);
    account.last_synced_at = Some(now);
    account.updated_at = now;
    true
}

/// Returns false when stale.
pub fn patch_payment(
    payment: &mut ClientPayment,
    patch: &PaymentEventPatch,
    event_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    if is_stale(payment.last_event_at, event_at) {
        return false;
    }
    if let Some(status) = patch.status {
        payment.status = status;
        if status == PaymentStatus::Refunded && payment.refunded_at.is_none() {
            payment.refunded_at = Some(event_at);
        }
    }
    if let Some(amount) = patch.amount {
        payment.amount = amount;
    }
    if let Some(fee) = patch.application_fee_amount {
        payment.application_fee_amount = fee;
    }
    if let Some(email) = &patch.customer_email {
        payment.customer_email = Some(email.clone());
    }
    if let Some(name) = &patch.customer_name {
        payment.customer_name = Some(name.clone());
    }
    if let Some(refunded) = patch.refunded_amount {
        payment.refunded_amount = refunded.clamp(0, payment.amount.max(0));
        if payment.refunded_at.is_none() && refunded > 0 {
            payment.refunded_at = Some(event_at);
        }
    }
    if let Some(reason) = &patch.failure_reason {
        payment.failure_reason = Some(reason.clone());
    }
    payment.last_event_at = Some(event_at);
    payment.updated_at = now;
    true
}

/// Metadata is opaque, but always stored as a JSON object.
pub fn normalize_metadata(metadata: &Value) -> Value {
    match metadata {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::{PlanType, SubscriptionStatus};
    use chrono::Duration;

    fn subscription() -> Subscription {
        let attrs = SubscriptionAttrs::new("pro", PlanType::Paid, SubscriptionStatus::Active)
            .with_feature("ai_requests", Some(10));
        new_subscription("owner", &attrs, Utc::now())
    }

    #[test]
    fn sync_leaves_usage_untouched() {
        let now = Utc::now();
        let mut sub = subscription();
        sub.usage.counters.insert("ai_requests".into(), 4);
        let attrs = SubscriptionAttrs::new("team", PlanType::Paid, SubscriptionStatus::PastDue);
        sync_subscription(&mut sub, &attrs, now);
        assert_eq!(sub.usage.get("ai_requests"), 4);
        assert_eq!(sub.plan_id, "team");
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
    }

    #[test]
    fn older_event_is_not_applied() {
        let now = Utc::now();
        let mut sub = subscription();
        let newer = SubscriptionEventPatch {
            status: Some(SubscriptionStatus::Cancelled),
            ..Default::default()
        };
        assert!(patch_subscription(&mut sub, &newer, now, now));

        let older = SubscriptionEventPatch {
            status: Some(SubscriptionStatus::Active),
            ..Default::default()
        };
        assert!(!patch_subscription(&mut sub, &older, now - Duration::seconds(30), now));
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
    }

    #[test]
    fn same_timestamp_reapplies_identically() {
        let now = Utc::now();
        let mut sub = subscription();
        let patch = SubscriptionEventPatch {
            status: Some(SubscriptionStatus::PastDue),
            ..Default::default()
        };
        assert!(patch_subscription(&mut sub, &patch, now, now));
        let once = sub.clone();
        assert!(patch_subscription(&mut sub, &patch, now, now));
        assert_eq!(sub, once);
    }

    #[test]
    fn refund_clamp_tolerates_negative_stored_amount() {
        let now = Utc::now();
        let mut payment = ClientPayment {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            product_id: None,
            payment_intent_id: "pi_1".into(),
            checkout_url: None,
            amount: -5,
            currency: "usd".into(),
            status: PaymentStatus::Succeeded,
            application_fee_amount: 0,
            customer_email: None,
            customer_name: None,
            refunded_amount: 0,
            refunded_at: None,
            failure_reason: None,
            metadata: serde_json::json!({}),
            last_event_at: None,
            created_at: now,
            updated_at: now,
        };
        let refund = PaymentEventPatch {
            refunded_amount: Some(1),
            ..Default::default()
        };
        assert!(patch_payment(&mut payment, &refund, now, now));
        assert_eq!(payment.refunded_amount, 0);
    }

    #[test]
    fn null_metadata_becomes_empty_object() {
        assert_eq!(normalize_metadata(&Value::Null), serde_json::json!({}));
        assert_eq!(
            normalize_metadata(&serde_json::json!({"a": 1})),
            serde_json::json!({"a": 1})
        );
    }
}
