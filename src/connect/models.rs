use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Onboarding,
    Active,
    Restricted,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Pending => "pending",
            AccountStatus::Onboarding => "onboarding",
            AccountStatus::Active => "active",
            AccountStatus::Restricted => "restricted",
            AccountStatus::Disabled => "disabled",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "onboarding" => AccountStatus::Onboarding,
            "active" => AccountStatus::Active,
            "restricted" => AccountStatus::Restricted,
            "disabled" => AccountStatus::Disabled,
            _ => AccountStatus::Pending,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    #[default]
    Standard,
    Express,
    Custom,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Standard => "standard",
            AccountType::Express => "express",
            AccountType::Custom => "custom",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "express" => AccountType::Express,
            "custom" => AccountType::Custom,
            _ => AccountType::Standard,
        }
    }
}

/// Processor-reported state of a single account capability.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityState {
    Active,
    Pending,
    Inactive,
    #[default]
    Unrequested,
}

impl CapabilityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityState::Active => "active",
            CapabilityState::Pending => "pending",
            CapabilityState::Inactive => "inactive",
            CapabilityState::Unrequested => "unrequested",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "active" => CapabilityState::Active,
            "pending" => CapabilityState::Pending,
            "inactive" => CapabilityState::Inactive,
            _ => CapabilityState::Unrequested,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnboardingLink {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

impl OnboardingLink {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConnectedAccount {
    pub id: Uuid,
    pub owner_id: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub country: Option<String>,
    pub external_account_id: String,
    pub account_type: AccountType,
    pub account_status: AccountStatus,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub onboarding_completed: bool,
    pub card_payments: CapabilityState,
    pub transfers: CapabilityState,
    pub disabled_reason: Option<String>,
    pub default_currency: String,
    pub onboarding_link: Option<OnboardingLink>,
    pub metadata: Value,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConnectedAccount {
    pub fn can_accept_payments(&self) -> bool {
        self.account_status == AccountStatus::Active && self.charges_enabled
    }

    pub fn audit_summary(&self) -> Value {
        serde_json::json!({
            "account_status": self.account_status.as_str(),
            "charges_enabled": self.charges_enabled,
            "payouts_enabled": self.payouts_enabled,
            "details_submitted": self.details_submitted,
            "disabled_reason": self.disabled_reason,
        })
    }
}

/// Processor view of an account, the only input to status derivation on sync.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountSnapshot {
    pub external_account_id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
    #[serde(default)]
    pub disabled_reason: Option<String>,
    #[serde(default)]
    pub card_payments: CapabilityState,
    #[serde(default)]
    pub transfers: CapabilityState,
    #[serde(default)]
    pub default_currency: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProductInterval {
    OneTime,
    Day,
    Week,
    Month,
    Year,
}

impl ProductInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductInterval::OneTime => "one_time",
            ProductInterval::Day => "day",
            ProductInterval::Week => "week",
            ProductInterval::Month => "month",
            ProductInterval::Year => "year",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "day" => ProductInterval::Day,
            "week" => ProductInterval::Week,
            "month" => ProductInterval::Month,
            "year" => ProductInterval::Year,
            _ => ProductInterval::OneTime,
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, ProductInterval::OneTime)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClientProduct {
    pub id: Uuid,
    pub account_id: Uuid,
    pub external_product_id: String,
    pub external_price_id: String,
    pub name: String,
    pub description: Option<String>,
    /// Minor currency units.
    pub amount: i64,
    pub currency: String,
    pub interval: ProductInterval,
    pub active: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 6] = [
        PaymentStatus::Pending,
        PaymentStatus::Processing,
        PaymentStatus::Succeeded,
        PaymentStatus::Failed,
        PaymentStatus::Cancelled,
        PaymentStatus::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "processing" => PaymentStatus::Processing,
            "succeeded" => PaymentStatus::Succeeded,
            "failed" => PaymentStatus::Failed,
            "cancelled" | "canceled" => PaymentStatus::Cancelled,
            "refunded" => PaymentStatus::Refunded,
            _ => PaymentStatus::Pending,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClientPayment {
    pub id: Uuid,
    pub account_id: Uuid,
    pub product_id: Option<Uuid>,
    pub payment_intent_id: String,
    pub checkout_url: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub application_fee_amount: i64,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub refunded_amount: i64,
    pub refunded_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub metadata: Value,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields carried by a payment-intent or refund event.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PaymentEventPatch {
    pub status: Option<PaymentStatus>,
    pub amount: Option<i64>,
    pub application_fee_amount: Option<i64>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub refunded_amount: Option<i64>,
    pub failure_reason: Option<String>,
}
