use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Cancelled,
    PastDue,
    Trialing,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Trialing => "trialing",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            "past_due" => Some(Self::PastDue),
            "trialing" => Some(Self::Trialing),
            _ => None,
        }
    }

    /// Statuses that grant feature access.
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Free,
    Paid,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Free => "free",
            PlanType::Paid => "paid",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "paid" => PlanType::Paid,
            _ => PlanType::Free,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageCounters {
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
    pub last_reset_at: DateTime<Utc>,
}

impl UsageCounters {
    pub fn zeroed(now: DateTime<Utc>) -> Self {
        Self {
            counters: BTreeMap::new(),
            last_reset_at: now,
        }
    }

    pub fn get(&self, feature_key: &str) -> i64 {
        self.counters.get(feature_key).copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: Uuid,
    pub owner_id: String,
    pub provider: Option<String>,
    pub customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
    pub plan_id: String,
    pub plan_type: PlanType,
    pub status: SubscriptionStatus,
    pub features: BTreeSet<String>,
    /// Absent key means unlimited.
    pub limits: BTreeMap<String, i64>,
    pub usage: UsageCounters,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub metadata: Value,
    pub last_event_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_entitled(&self) -> bool {
        self.deleted_at.is_none() && self.status.is_entitled()
    }

    pub fn limit_for(&self, feature_key: &str) -> Option<i64> {
        self.limits.get(feature_key).copied()
    }

    pub fn usage_for(&self, feature_key: &str) -> i64 {
        self.usage.get(feature_key)
    }

    /// Compact view stored as the before/after side of audit records.
    pub fn audit_summary(&self) -> Value {
        serde_json::json!({
            "plan_id": self.plan_id,
            "plan_type": self.plan_type.as_str(),
            "status": self.status.as_str(),
            "current_period_end": self.current_period_end,
            "features": self.features,
            "limits": self.limits,
        })
    }
}

/// Fields written by `create_or_sync_subscription`. Usage counters are never part of a sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionAttrs {
    pub plan_id: String,
    pub plan_type: PlanType,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub external_subscription_id: Option<String>,
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default)]
    pub limits: BTreeMap<String, i64>,
    #[serde(default)]
    pub current_period_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub metadata: Value,
}

impl SubscriptionAttrs {
    pub fn new(plan_id: impl Into<String>, plan_type: PlanType, status: SubscriptionStatus) -> Self {
        Self {
            plan_id: plan_id.into(),
            plan_type,
            status,
            provider: None,
            customer_id: None,
            external_subscription_id: None,
            features: BTreeSet::new(),
            limits: BTreeMap::new(),
            current_period_start: None,
            current_period_end: None,
            trial_end_date: None,
            cancel_at_period_end: false,
            metadata: Value::Null,
        }
    }

    pub fn with_feature(mut self, feature_key: impl Into<String>, limit: Option<i64>) -> Self {
        let key = feature_key.into();
        if let Some(limit) = limit {
            self.limits.insert(key.clone(), limit);
        }
        self.features.insert(key);
        self
    }
}

/// Partial update carried by a processor subscription event. Only present fields are written.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionEventPatch {
    pub status: Option<SubscriptionStatus>,
    pub plan_id: Option<String>,
    pub plan_type: Option<PlanType>,
    /// Present when the event moved the subscription onto a catalog plan.
    pub features: Option<BTreeSet<String>>,
    pub limits: Option<BTreeMap<String, i64>>,
    pub customer_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_end_date: Option<DateTime<Utc>>,
    pub cancel_at_period_end: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UsageLogEntry {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub owner_id: String,
    pub feature_key: String,
    pub quantity: i64,
    pub unit: Option<String>,
    pub context: Option<Value>,
    pub synced_to_processor: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UsageOptions {
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub context: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageTrackResult {
    pub usage_log_id: Uuid,
    pub current_usage: i64,
    pub limit: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessDecision {
    pub has_access: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub current_usage: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FeatureUsageStats {
    pub feature_key: String,
    pub current_usage: i64,
    pub limit: Option<i64>,
    pub remaining: Option<i64>,
    pub percent_used: Option<f64>,
    pub entries_since_reset: i64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct UsageStats {
    pub owner_id: String,
    pub plan_id: String,
    pub last_reset_at: DateTime<Utc>,
    pub features: Vec<FeatureUsageStats>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventType {
    Created,
    Updated,
    Cancelled,
    PaymentSucceeded,
    PaymentFailed,
    TrialStarted,
    TrialEnded,
    PlanChanged,
    UsageTracked,
    LimitExceeded,
    Other,
}

impl PaymentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentEventType::Created => "created",
            PaymentEventType::Updated => "updated",
            PaymentEventType::Cancelled => "cancelled",
            PaymentEventType::PaymentSucceeded => "payment_succeeded",
            PaymentEventType::PaymentFailed => "payment_failed",
            PaymentEventType::TrialStarted => "trial_started",
            PaymentEventType::TrialEnded => "trial_ended",
            PaymentEventType::PlanChanged => "plan_changed",
            PaymentEventType::UsageTracked => "usage_tracked",
            PaymentEventType::LimitExceeded => "limit_exceeded",
            PaymentEventType::Other => "other",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "cancelled" => Self::Cancelled,
            "payment_succeeded" => Self::PaymentSucceeded,
            "payment_failed" => Self::PaymentFailed,
            "trial_started" => Self::TrialStarted,
            "trial_ended" => Self::TrialEnded,
            "plan_changed" => Self::PlanChanged,
            "usage_tracked" => Self::UsageTracked,
            "limit_exceeded" => Self::LimitExceeded,
            _ => Self::Other,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Processor,
    Application,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Processor => "processor",
            EventSource::Application => "application",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "application" => EventSource::Application,
            _ => EventSource::Processor,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PaymentEvent {
    pub id: Uuid,
    pub owner_id: Option<String>,
    pub subscription_id: Option<Uuid>,
    /// Processor-assigned event id; the dedupe key for at-least-once delivery.
    pub external_event_id: Option<String>,
    pub event_type: PaymentEventType,
    pub processor_event_type: Option<String>,
    pub source: EventSource,
    pub payload: Value,
    pub processed: bool,
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl PaymentEvent {
    /// Event raised by the application itself; recorded as already processed.
    pub fn application(
        subscription: &Subscription,
        event_type: PaymentEventType,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: Some(subscription.owner_id.clone()),
            subscription_id: Some(subscription.id),
            external_event_id: None,
            event_type,
            processor_event_type: None,
            source: EventSource::Application,
            payload,
            processed: true,
            error: None,
            occurred_at: now,
            received_at: now,
            processed_at: Some(now),
        }
    }

    pub fn from_processor(
        external_event_id: impl Into<String>,
        processor_event_type: impl Into<String>,
        event_type: PaymentEventType,
        payload: Value,
        occurred_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: None,
            subscription_id: None,
            external_event_id: Some(external_event_id.into()),
            event_type,
            processor_event_type: Some(processor_event_type.into()),
            source: EventSource::Processor,
            payload,
            processed: false,
            error: None,
            occurred_at,
            received_at,
            processed_at: None,
        }
    }
}

/// Result of writing a processor event into an entity guarded by `last_event_at`.
#[derive(Clone, Debug, PartialEq)]
pub enum Applied<T> {
    Updated(T),
    /// The stored entity already reflects a newer event; nothing was written.
    Stale(T),
}

impl<T> Applied<T> {
    pub fn into_inner(self) -> T {
        match self {
            Applied::Updated(value) | Applied::Stale(value) => value,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Applied::Stale(_))
    }
}

/// Outcome of inserting a processor event keyed by its external id.
#[derive(Clone, Debug, PartialEq)]
pub enum RecordOutcome {
    Inserted(PaymentEvent),
    Duplicate(PaymentEvent),
}
