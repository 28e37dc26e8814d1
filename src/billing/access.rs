use super::models::{AccessDecision, Subscription};

pub const REASON_NO_SUBSCRIPTION: &str = "no subscription";
pub const REASON_FEATURE_NOT_INCLUDED: &str = "feature not included";
pub const REASON_LIMIT_EXCEEDED: &str = "usage limit exceeded";

/// Pure: reads only the given snapshot. A soft-deleted subscription is treated
/// the same as a missing one.
pub fn check_access(subscription: Option<&Subscription>, feature_key: &str) -> AccessDecision {
    let Some(subscription) = subscription.filter(|s| s.deleted_at.is_none()) else {
        return denied(REASON_NO_SUBSCRIPTION.to_string(), 0, None, None);
    };

    let current_usage = subscription.usage_for(feature_key);
    let limit = subscription.limit_for(feature_key);

    if !subscription.status.is_entitled() {
        return denied(
            format!("subscription is {}", subscription.status.as_str()),
            current_usage,
            limit,
            None,
        );
    }

    if !subscription.features.contains(feature_key) {
        return denied(
            REASON_FEATURE_NOT_INCLUDED.to_string(),
            current_usage,
            limit,
            None,
        );
    }

    if let Some(limit) = limit {
        if current_usage >= limit {
            return denied(
                REASON_LIMIT_EXCEEDED.to_string(),
                current_usage,
                Some(limit),
                Some(0),
            );
        }
    }

    AccessDecision {
        has_access: true,
        reason: None,
        current_usage,
        limit,
        remaining: limit.map(|limit| limit - current_usage),
    }
}

fn denied(
    reason: String,
    current_usage: i64,
    limit: Option<i64>,
    remaining: Option<i64>,
) -> AccessDecision {
    AccessDecision {
        has_access: false,
        reason: Some(reason),
        current_usage,
        limit,
        remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::{PlanType, SubscriptionStatus, UsageCounters};
    use chrono::Utc;
    use serde_json::Value;
    use std::collections::{BTreeMap, BTreeSet};
    use uuid::Uuid;

    fn subscription(status: SubscriptionStatus, used: i64, limit: Option<i64>) -> Subscription {
        let now = Utc::now();
        let mut limits = BTreeMap::new();
        if let Some(limit) = limit {
            limits.insert("ai_requests".to_string(), limit);
        }
        let mut usage = UsageCounters::zeroed(now);
        usage.counters.insert("ai_requests".to_string(), used);
        Subscription {
            id: Uuid::new_v4(),
            owner_id: "owner-1".into(),
            provider: None,
            customer_id: None,
            external_subscription_id: None,
            plan_id: "pro".into(),
            plan_type: PlanType::Paid,
            status,
            features: BTreeSet::from(["ai_requests".to_string()]),
            limits,
            usage,
            current_period_start: now,
            current_period_end: None,
            trial_end_date: None,
            cancel_at_period_end: false,
            metadata: Value::Null,
            last_event_at: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn missing_subscription_is_denied() {
        let decision = check_access(None, "ai_requests");
        assert!(!decision.has_access);
        assert_eq!(decision.reason.as_deref(), Some("no subscription"));
        assert_eq!(decision.current_usage, 0);
    }

    #[test]
    fn inactive_status_reason_names_status() {
        let sub = subscription(SubscriptionStatus::PastDue, 0, Some(10));
        let decision = check_access(Some(&sub), "ai_requests");
        assert!(!decision.has_access);
        assert_eq!(decision.reason.as_deref(), Some("subscription is past_due"));
    }

    #[test]
    fn status_is_checked_before_feature_membership() {
        let sub = subscription(SubscriptionStatus::Cancelled, 0, None);
        let decision = check_access(Some(&sub), "not_in_plan");
        assert_eq!(decision.reason.as_deref(), Some("subscription is cancelled"));
    }

    #[test]
    fn feature_outside_plan_is_denied() {
        let sub = subscription(SubscriptionStatus::Active, 0, None);
        let decision = check_access(Some(&sub), "exports");
        assert_eq!(decision.reason.as_deref(), Some("feature not included"));
    }

    #[test]
    fn usage_at_limit_is_denied_with_zero_remaining() {
        let sub = subscription(SubscriptionStatus::Trialing, 10, Some(10));
        let decision = check_access(Some(&sub), "ai_requests");
        assert!(!decision.has_access);
        assert_eq!(decision.reason.as_deref(), Some("usage limit exceeded"));
        assert_eq!(decision.remaining, Some(0));
        assert_eq!(decision.limit, Some(10));
    }

    #[test]
    fn remaining_is_limit_minus_usage() {
        let sub = subscription(SubscriptionStatus::Active, 7, Some(10));
        let decision = check_access(Some(&sub), "ai_requests");
        assert!(decision.has_access);
        assert_eq!(decision.remaining, Some(3));
        assert_eq!(decision, check_access(Some(&sub), "ai_requests"));
    }

    #[test]
    fn unlimited_feature_has_no_remaining() {
        let sub = subscription(SubscriptionStatus::Active, 1_000, None);
        let decision = check_access(Some(&sub), "ai_requests");
        assert!(decision.has_access);
        assert_eq!(decision.remaining, None);
        assert_eq!(decision.limit, None);
    }

    #[test]
    fn soft_deleted_subscription_counts_as_missing() {
        let mut sub = subscription(SubscriptionStatus::Active, 0, None);
        sub.deleted_at = Some(Utc::now());
        let decision = check_access(Some(&sub), "ai_requests");
        assert_eq!(decision.reason.as_deref(), Some("no subscription"));
    }
}
