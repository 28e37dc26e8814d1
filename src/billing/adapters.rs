use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::gateway::{gateway_for, CheckoutGateway, CheckoutRequest};
use super::models::{
    AccessDecision, Subscription, SubscriptionStatus, UsageOptions, UsageStats, UsageTrackResult,
};
use super::plans::PlanCatalog;
use super::service::BillingService;
use crate::error::{BillingError, BillingResult};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Stripe,
    #[serde(rename = "lemonsqueezy")]
    LemonSqueezy,
    Paddle,
}

impl ProviderKind {
    /// Fallback precedence when no override is configured.
    pub const PRECEDENCE: [ProviderKind; 3] = [
        ProviderKind::Stripe,
        ProviderKind::LemonSqueezy,
        ProviderKind::Paddle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Stripe => "stripe",
            ProviderKind::LemonSqueezy => "lemonsqueezy",
            ProviderKind::Paddle => "paddle",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stripe" => Some(ProviderKind::Stripe),
            "lemonsqueezy" | "lemon_squeezy" | "lemon-squeezy" => Some(ProviderKind::LemonSqueezy),
            "paddle" => Some(ProviderKind::Paddle),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        match self {
            ProviderKind::Stripe => ProviderCapabilities {
                checkout: true,
                portal: true,
                cancel: true,
                usage_tracking: true,
                queries: true,
            },
            ProviderKind::LemonSqueezy => ProviderCapabilities {
                checkout: true,
                portal: true,
                cancel: true,
                usage_tracking: false,
                queries: true,
            },
            ProviderKind::Paddle => ProviderCapabilities {
                checkout: true,
                portal: false,
                cancel: true,
                usage_tracking: false,
                queries: true,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub checkout: bool,
    pub portal: bool,
    pub cancel: bool,
    pub usage_tracking: bool,
    pub queries: bool,
}

/// Credentials for one backend. Lemon Squeezy additionally needs a store id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub store_id: Option<String>,
    pub api_base: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ProviderSettings {
    pub override_kind: Option<String>,
    pub stripe: Option<ProviderCredentials>,
    pub lemonsqueezy: Option<ProviderCredentials>,
    pub paddle: Option<ProviderCredentials>,
}

impl ProviderSettings {
    pub fn from_env() -> Self {
        crate::config::provider_settings_from_env()
    }

    pub fn credentials(&self, kind: ProviderKind) -> Option<&ProviderCredentials> {
        match kind {
            ProviderKind::Stripe => self.stripe.as_ref(),
            ProviderKind::LemonSqueezy => self.lemonsqueezy.as_ref(),
            ProviderKind::Paddle => self.paddle.as_ref(),
        }
    }

    /// Whether every piece of configuration the backend requires is present.
    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        match self.credentials(kind) {
            Some(creds) if !creds.api_key.trim().is_empty() => match kind {
                ProviderKind::LemonSqueezy => creds
                    .store_id
                    .as_deref()
                    .map_or(false, |id| !id.trim().is_empty()),
                _ => true,
            },
            _ => false,
        }
    }

    /// Explicit override first, else the first configured backend in precedence order.
    pub fn select(&self) -> BillingResult<Option<ProviderKind>> {
        if let Some(raw) = self.override_kind.as_deref().filter(|v| !v.trim().is_empty()) {
            return ProviderKind::from_str(raw).map(Some).ok_or_else(|| {
                BillingError::validation(format!("unknown billing provider override: {raw}"))
            });
        }
        Ok(ProviderKind::PRECEDENCE
            .into_iter()
            .find(|kind| self.is_configured(*kind)))
    }
}

/// Options accepted by `create_checkout`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CheckoutOptions {
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub price_id: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    #[serde(default)]
    pub trial_days: Option<u32>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

/// Checkout outcome. Expected business failures land in `error`, never in `Err`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckoutResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckoutResult {
    pub fn redirect(url: String) -> Self {
        Self {
            success: true,
            url: Some(url),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            url: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait BillingCommands: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn is_configured(&self) -> bool;

    async fn create_checkout(&self, owner_id: &str, options: &CheckoutOptions) -> CheckoutResult;

    async fn open_billing_portal(
        &self,
        owner_id: &str,
        return_url: Option<&str>,
    ) -> BillingResult<String>;

    async fn cancel_subscription(&self, owner_id: &str, immediate: bool)
        -> BillingResult<Subscription>;

    async fn track_usage(
        &self,
        owner_id: &str,
        feature_key: &str,
        quantity: i64,
        options: UsageOptions,
    ) -> BillingResult<UsageTrackResult>;
}

#[async_trait]
pub trait EntitlementQueries: Send + Sync {
    async fn check_access(&self, owner_id: &str, feature_key: &str)
        -> BillingResult<AccessDecision>;

    async fn get_subscription(&self, owner_id: &str) -> BillingResult<Option<Subscription>>;

    async fn get_usage_stats(
        &self,
        owner_id: &str,
        feature_key: Option<&str>,
    ) -> BillingResult<UsageStats>;
}

#[derive(Clone)]
pub struct ProcessorAdapter {
    kind: ProviderKind,
    configured: bool,
    gateway: Option<Arc<dyn CheckoutGateway>>,
    billing: BillingService,
    catalog: Arc<PlanCatalog>,
}

impl ProcessorAdapter {
    pub fn new(
        kind: ProviderKind,
        gateway: Option<Arc<dyn CheckoutGateway>>,
        billing: BillingService,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        Self {
            kind,
            configured: gateway.is_some(),
            gateway,
            billing,
            catalog,
        }
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.kind.capabilities()
    }

    fn gateway(&self) -> BillingResult<&Arc<dyn CheckoutGateway>> {
        self.gateway.as_ref().ok_or_else(|| {
            BillingError::conflict(format!("{} is not configured", self.kind.as_str()))
        })
    }

    fn unsupported(&self, operation: &str) -> BillingError {
        BillingError::conflict(format!(
            "{operation} is not supported by {}",
            self.kind.as_str()
        ))
    }

    fn resolve_price(&self, options: &CheckoutOptions) -> Result<String, String> {
        if let Some(price) = options.price_id.as_deref().filter(|p| !p.trim().is_empty()) {
            return Ok(price.to_string());
        }
        let plan_id = options
            .plan_id
            .as_deref()
            .ok_or_else(|| "plan or price is required".to_string())?;
        let plan = self
            .catalog
            .find(plan_id)
            .ok_or_else(|| format!("plan {plan_id} not found"))?;
        plan.price_id
            .clone()
            .ok_or_else(|| format!("plan {plan_id} has no processor price"))
    }

    /// Push ledger entries that the processor has not seen yet; returns how many were synced.
    pub async fn push_usage(&self, limit: i64) -> BillingResult<u64> {
        if !self.capabilities().usage_tracking {
            return Ok(0);
        }
        let gateway = self.gateway()?;
        let pending = self.billing.unsynced_usage(limit).await?;
        let mut synced = Vec::with_capacity(pending.len());
        for entry in pending {
            let Some(subscription) = self.billing.subscription(&entry.owner_id).await? else {
                continue;
            };
            let Some(customer_id) = subscription.customer_id.as_deref() else {
                continue;
            };
            match gateway
                .report_usage(customer_id, &entry.feature_key, entry.quantity)
                .await
            {
                Ok(()) => synced.push(entry.id),
                Err(err) => {
                    tracing::warn!(?err, usage_log = %entry.id, "failed to push usage to processor");
                }
            }
        }
        if synced.is_empty() {
            return Ok(0);
        }
        self.billing.mark_usage_synced(&synced).await
    }
}

#[async_trait]
impl BillingCommands for ProcessorAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn create_checkout(&self, owner_id: &str, options: &CheckoutOptions) -> CheckoutResult {
        let Ok(gateway) = self.gateway() else {
            return CheckoutResult::failed(format!("{} is not configured", self.kind.as_str()));
        };
        let price_id = match self.resolve_price(options) {
            Ok(price) => price,
            Err(reason) => return CheckoutResult::failed(reason),
        };
        let existing = match self.billing.subscription(owner_id).await {
            Ok(existing) => existing,
            Err(err) => {
                tracing::error!(?err, %owner_id, "failed to load subscription for checkout");
                return CheckoutResult::failed("unable to load subscription");
            }
        };
        let trial_days = options.trial_days.or_else(|| {
            options
                .plan_id
                .as_deref()
                .and_then(|id| self.catalog.find(id))
                .and_then(|plan| plan.trial_days)
        });

        let request = CheckoutRequest {
            owner_id: owner_id.to_string(),
            price_id,
            success_url: options.success_url.clone(),
            cancel_url: options.cancel_url.clone(),
            customer_id: existing.and_then(|s| s.customer_id),
            customer_email: options.customer_email.clone(),
            trial_days,
            metadata: options.metadata.clone(),
        };
        match gateway.create_checkout(&request).await {
            Ok(session) => {
                tracing::info!(
                    %owner_id,
                    provider = self.kind.as_str(),
                    session = %session.id,
                    "checkout session created"
                );
                CheckoutResult::redirect(session.url)
            }
            Err(err) => {
                tracing::warn!(?err, %owner_id, provider = self.kind.as_str(), "checkout failed");
                CheckoutResult::failed(err.to_string())
            }
        }
    }

    async fn open_billing_portal(
        &self,
        owner_id: &str,
        return_url: Option<&str>,
    ) -> BillingResult<String> {
        if !self.capabilities().portal {
            return Err(self.unsupported("billing portal"));
        }
        let gateway = self.gateway()?;
        let subscription = self.billing.require_subscription(owner_id).await?;
        let customer_id = subscription
            .customer_id
            .ok_or_else(|| BillingError::conflict("subscription has no processor customer"))?;
        gateway.create_portal_session(&customer_id, return_url).await
    }

    async fn cancel_subscription(
        &self,
        owner_id: &str,
        immediate: bool,
    ) -> BillingResult<Subscription> {
        let gateway = self.gateway()?;
        let subscription = self.billing.require_subscription(owner_id).await?;
        if let Some(external_id) = subscription.external_subscription_id.as_deref() {
            gateway.cancel_subscription(external_id, immediate).await?;
        }
        let actor = crate::audit::owner_actor(owner_id);
        if immediate || subscription.external_subscription_id.is_none() {
            return self
                .billing
                .update_status(
                    owner_id,
                    SubscriptionStatus::Cancelled,
                    Some(Utc::now()),
                    &actor,
                )
                .await;
        }
        // the processor's subscription.updated event carries cancel_at_period_end back
        tracing::info!(%owner_id, provider = self.kind.as_str(), "cancellation scheduled at period end");
        Ok(subscription)
    }

    async fn track_usage(
        &self,
        owner_id: &str,
        feature_key: &str,
        quantity: i64,
        options: UsageOptions,
    ) -> BillingResult<UsageTrackResult> {
        if !self.capabilities().usage_tracking {
            return Err(self.unsupported("usage tracking"));
        }
        self.gateway()?;
        let actor = crate::audit::owner_actor(owner_id);
        self.billing
            .track_usage(owner_id, feature_key, quantity, options, &actor)
            .await
    }
}

#[async_trait]
impl EntitlementQueries for ProcessorAdapter {
    async fn check_access(
        &self,
        owner_id: &str,
        feature_key: &str,
    ) -> BillingResult<AccessDecision> {
        self.billing.check_access_for(owner_id, feature_key).await
    }

    async fn get_subscription(&self, owner_id: &str) -> BillingResult<Option<Subscription>> {
        self.billing.subscription(owner_id).await
    }

    async fn get_usage_stats(
        &self,
        owner_id: &str,
        feature_key: Option<&str>,
    ) -> BillingResult<UsageStats> {
        self.billing.usage_stats(owner_id, feature_key).await
    }
}

#[derive(Clone)]
pub struct BillingProviderResolver {
    active: Option<Arc<ProcessorAdapter>>,
}

impl BillingProviderResolver {
    /// Only the selected backend is constructed; the others are never reachable.
    pub fn from_settings(
        settings: &ProviderSettings,
        billing: BillingService,
        catalog: Arc<PlanCatalog>,
    ) -> BillingResult<Self> {
        let Some(kind) = settings.select()? else {
            tracing::warn!("no billing provider configured");
            return Ok(Self { active: None });
        };
        let gateway = if settings.is_configured(kind) {
            match settings.credentials(kind) {
                Some(creds) => Some(gateway_for(kind, creds)?),
                None => None,
            }
        } else {
            tracing::warn!(provider = kind.as_str(), "billing provider selected but not configured");
            None
        };
        tracing::info!(provider = kind.as_str(), "billing provider selected");
        Ok(Self::with_adapter(ProcessorAdapter::new(
            kind, gateway, billing, catalog,
        )))
    }

    pub fn with_adapter(adapter: ProcessorAdapter) -> Self {
        Self {
            active: Some(Arc::new(adapter)),
        }
    }

    pub fn unconfigured() -> Self {
        Self { active: None }
    }

    pub fn active_kind(&self) -> Option<ProviderKind> {
        self.active.as_ref().map(|adapter| adapter.kind())
    }

    pub fn adapter(&self) -> BillingResult<&Arc<ProcessorAdapter>> {
        self.active
            .as_ref()
            .ok_or_else(|| BillingError::conflict("no billing provider configured"))
    }

    pub fn provider(&self) -> BillingResult<Arc<dyn BillingCommands>> {
        let commands: Arc<dyn BillingCommands> = self.adapter()?.clone();
        Ok(commands)
    }

    /// Fails fast when the active backend has no query capability.
    pub fn queries(&self) -> BillingResult<Arc<dyn EntitlementQueries>> {
        let adapter = self.adapter()?;
        if !adapter.capabilities().queries {
            return Err(BillingError::conflict(format!(
                "{} does not support entitlement queries",
                adapter.kind().as_str()
            )));
        }
        let queries: Arc<dyn EntitlementQueries> = adapter.clone();
        Ok(queries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(key: &str) -> Option<ProviderCredentials> {
        Some(ProviderCredentials {
            api_key: key.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn first_configured_backend_wins() {
        let settings = ProviderSettings {
            paddle: creds("pdl_key"),
            lemonsqueezy: creds("ls_key"),
            ..Default::default()
        };
        // lemonsqueezy lacks a store id, so paddle is the first complete configuration
        assert_eq!(settings.select().unwrap(), Some(ProviderKind::Paddle));

        let settings = ProviderSettings {
            stripe: creds("sk_test"),
            paddle: creds("pdl_key"),
            ..Default::default()
        };
        assert_eq!(settings.select().unwrap(), Some(ProviderKind::Stripe));
    }

    #[test]
    fn override_takes_precedence() {
        let settings = ProviderSettings {
            override_kind: Some("Paddle".to_string()),
            stripe: creds("sk_test"),
            ..Default::default()
        };
        assert_eq!(settings.select().unwrap(), Some(ProviderKind::Paddle));
        assert!(!settings.is_configured(ProviderKind::Paddle));
    }

    #[test]
    fn unknown_override_is_rejected() {
        let settings = ProviderSettings {
            override_kind: Some("braintree".to_string()),
            ..Default::default()
        };
        assert!(matches!(settings.select(), Err(BillingError::Validation(_))));
    }

    #[test]
    fn nothing_configured_selects_nothing() {
        assert_eq!(ProviderSettings::default().select().unwrap(), None);
    }

    #[test]
    fn capability_matrix() {
        assert!(ProviderKind::Stripe.capabilities().usage_tracking);
        assert!(!ProviderKind::LemonSqueezy.capabilities().usage_tracking);
        assert!(ProviderKind::LemonSqueezy.capabilities().portal);
        assert!(!ProviderKind::Paddle.capabilities().portal);
        assert!(ProviderKind::PRECEDENCE
            .iter()
            .all(|kind| kind.capabilities().queries));
    }
}
