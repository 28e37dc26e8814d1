use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use super::models::{PlanType, SubscriptionAttrs, SubscriptionStatus};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Day,
    Week,
    #[default]
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Day => "day",
            BillingInterval::Week => "week",
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            BillingInterval::Day => from
                .checked_add_signed(Duration::days(1))
                .unwrap_or(from),
            BillingInterval::Week => from
                .checked_add_signed(Duration::days(7))
                .unwrap_or(from),
            BillingInterval::Month => from.checked_add_months(Months::new(1)).unwrap_or(from),
            BillingInterval::Year => from.checked_add_months(Months::new(12)).unwrap_or(from),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlanDefinition {
    pub id: String,
    pub name: String,
    pub plan_type: PlanType,
    /// Processor price identifier used for checkout; free plans have none.
    #[serde(default)]
    pub price_id: Option<String>,
    #[serde(default)]
    pub interval: BillingInterval,
    #[serde(default)]
    pub features: BTreeSet<String>,
    #[serde(default)]
    pub limits: BTreeMap<String, i64>,
    #[serde(default)]
    pub trial_days: Option<u32>,
}

impl PlanDefinition {
    /// Attributes for a subscription that starts on this plan at `now`.
    pub fn subscription_attrs(&self, status: SubscriptionStatus, now: DateTime<Utc>) -> SubscriptionAttrs {
        let mut attrs = SubscriptionAttrs::new(self.id.clone(), self.plan_type, status);
        attrs.features = self.features.clone();
        attrs.limits = self.limits.clone();
        attrs.current_period_start = Some(now);
        attrs.current_period_end = Some(self.interval.advance(now));
        if status == SubscriptionStatus::Trialing {
            attrs.trial_end_date = self
                .trial_days
                .map(|days| now + Duration::days(i64::from(days)));
        }
        attrs
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PlanCatalog {
    plans: Vec<PlanDefinition>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<PlanDefinition>) -> Self {
        Self { plans }
    }

    /// Built-in catalog used when no `BILLING_PLAN_CATALOG` is configured.
    pub fn builtin() -> Self {
        Self::new(vec![PlanDefinition {
            id: "free".to_string(),
            name: "Free".to_string(),
            plan_type: PlanType::Free,
            price_id: None,
            interval: BillingInterval::Month,
            features: BTreeSet::new(),
            limits: BTreeMap::new(),
            trial_days: None,
        }])
    }

    pub fn find(&self, plan_id: &str) -> Option<&PlanDefinition> {
        self.plans.iter().find(|plan| plan.id == plan_id)
    }

    pub fn find_by_price(&self, price_id: &str) -> Option<&PlanDefinition> {
        self.plans
            .iter()
            .find(|plan| plan.price_id.as_deref() == Some(price_id))
    }

    pub fn plans(&self) -> &[PlanDefinition] {
        &self.plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pro() -> PlanDefinition {
        PlanDefinition {
            id: "pro".into(),
            name: "Pro".into(),
            plan_type: PlanType::Paid,
            price_id: Some("price_pro".into()),
            interval: BillingInterval::Month,
            features: BTreeSet::from(["ai_requests".to_string()]),
            limits: BTreeMap::from([("ai_requests".to_string(), 100)]),
            trial_days: Some(14),
        }
    }

    #[test]
    fn monthly_interval_advances_calendar_month() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let end = BillingInterval::Month.advance(start);
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
    }

    #[test]
    fn trialing_attrs_carry_trial_end() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let attrs = pro().subscription_attrs(SubscriptionStatus::Trialing, now);
        assert_eq!(attrs.trial_end_date, Some(now + Duration::days(14)));
        assert_eq!(attrs.limits.get("ai_requests"), Some(&100));

        let active = pro().subscription_attrs(SubscriptionStatus::Active, now);
        assert_eq!(active.trial_end_date, None);
    }

    #[test]
    fn catalog_lookup_by_price() {
        let catalog = PlanCatalog::new(vec![pro()]);
        assert_eq!(catalog.find_by_price("price_pro").map(|p| p.id.as_str()), Some("pro"));
        assert!(catalog.find("enterprise").is_none());
    }

    #[test]
    fn catalog_parses_from_json() {
        let raw = r#"[{"id":"team","name":"Team","plan_type":"paid","price_id":"price_team","interval":"year","features":["seats"],"limits":{"seats":5}}]"#;
        let plans: Vec<PlanDefinition> = serde_json::from_str(raw).unwrap();
        let catalog = PlanCatalog::new(plans);
        let team = catalog.find("team").unwrap();
        assert_eq!(team.interval, BillingInterval::Year);
        assert_eq!(team.limits.get("seats"), Some(&5));
    }
}
