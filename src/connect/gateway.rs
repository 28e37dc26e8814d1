use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::header::HeaderMap;
use serde_json::Value;

use super::fees::ApplicationFee;
use super::models::{AccountSnapshot, AccountType, CapabilityState, OnboardingLink, ProductInterval};
use crate::billing::gateway::{metadata_form, required_str, ApiClient, STRIPE_API_BASE};
use crate::billing::reconciliation::from_unix;
use crate::error::{BillingError, BillingResult};

/// Link lifetime assumed when the processor omits `expires_at`.
const FALLBACK_LINK_TTL_SECS: i64 = 300;

#[derive(Clone, Debug)]
pub struct NewConnectedAccount {
    pub account_type: AccountType,
    pub email: Option<String>,
    pub country: Option<String>,
    pub owner_id: String,
}

#[derive(Clone, Debug)]
pub struct NewPrice {
    pub external_product_id: String,
    pub amount: i64,
    pub currency: String,
    pub interval: ProductInterval,
}

/// Hosted checkout for one product on a connected account.
#[derive(Clone, Debug)]
pub struct PaymentCheckoutRequest {
    pub external_price_id: String,
    pub interval: ProductInterval,
    pub fee: ApplicationFee,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_email: Option<String>,
    pub metadata: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymentCheckoutSession {
    pub id: String,
    pub url: String,
    /// Present for one-time charges when the processor creates the intent eagerly.
    pub payment_intent_id: Option<String>,
}

#[async_trait]
pub trait ConnectGateway: Send + Sync {
    async fn create_account(&self, account: &NewConnectedAccount) -> BillingResult<AccountSnapshot>;

    async fn retrieve_account(&self, external_account_id: &str) -> BillingResult<AccountSnapshot>;

    async fn create_account_link(
        &self,
        external_account_id: &str,
        return_url: &str,
        refresh_url: &str,
    ) -> BillingResult<OnboardingLink>;

    async fn create_product(
        &self,
        external_account_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> BillingResult<String>;

    async fn create_price(&self, external_account_id: &str, price: &NewPrice)
        -> BillingResult<String>;

    async fn deactivate_product(
        &self,
        external_account_id: &str,
        external_product_id: &str,
    ) -> BillingResult<()>;

    async fn create_checkout(
        &self,
        external_account_id: &str,
        request: &PaymentCheckoutRequest,
    ) -> BillingResult<PaymentCheckoutSession>;
}

/// Read the account fields that drive status derivation.
pub(crate) fn account_snapshot(object: &Value) -> Result<AccountSnapshot, String> {
    let external_account_id = object["id"]
        .as_str()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| "account object is missing /id".to_string())?
        .to_string();
    let capability = |name: &str| {
        object["capabilities"][name]
            .as_str()
            .map(CapabilityState::from_str)
            .unwrap_or_default()
    };
    Ok(AccountSnapshot {
        external_account_id,
        charges_enabled: object["charges_enabled"].as_bool().unwrap_or(false),
        payouts_enabled: object["payouts_enabled"].as_bool().unwrap_or(false),
        details_submitted: object["details_submitted"].as_bool().unwrap_or(false),
        disabled_reason: object["requirements"]["disabled_reason"]
            .as_str()
            .filter(|reason| !reason.is_empty())
            .map(str::to_string),
        card_payments: capability("card_payments"),
        transfers: capability("transfers"),
        default_currency: object["default_currency"].as_str().map(str::to_string),
        email: object["email"].as_str().map(str::to_string),
    })
}

#[derive(Clone)]
pub struct StripeConnectGateway {
    api: ApiClient,
}

impl StripeConnectGateway {
    pub fn new(base_url: Option<&str>, secret_key: &str) -> BillingResult<Self> {
        Ok(Self {
            api: ApiClient::new(
                base_url.unwrap_or(STRIPE_API_BASE),
                secret_key,
                HeaderMap::new(),
            )?,
        })
    }
}

fn form(pairs: &[(&str, String)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[async_trait]
impl ConnectGateway for StripeConnectGateway {
    async fn create_account(&self, account: &NewConnectedAccount) -> BillingResult<AccountSnapshot> {
        let mut body = form(&[
            ("type", account.account_type.as_str().to_string()),
            ("metadata[owner_id]", account.owner_id.clone()),
        ]);
        if let Some(email) = &account.email {
            body.push(("email".into(), email.clone()));
        }
        if let Some(country) = &account.country {
            body.push(("country".into(), country.clone()));
        }
        let response = self.api.post_form("v1/accounts", &body, None).await?;
        account_snapshot(&response).map_err(BillingError::upstream)
    }

    async fn retrieve_account(&self, external_account_id: &str) -> BillingResult<AccountSnapshot> {
        let response = self
            .api
            .get(&format!("v1/accounts/{external_account_id}"), None)
            .await?;
        account_snapshot(&response).map_err(BillingError::upstream)
    }

    async fn create_account_link(
        &self,
        external_account_id: &str,
        return_url: &str,
        refresh_url: &str,
    ) -> BillingResult<OnboardingLink> {
        let body = form(&[
            ("account", external_account_id.to_string()),
            ("return_url", return_url.to_string()),
            ("refresh_url", refresh_url.to_string()),
            ("type", "account_onboarding".to_string()),
        ]);
        let response = self.api.post_form("v1/account_links", &body, None).await?;
        let url = required_str(&response, "/url", "account link url")?;
        let expires_at = response["expires_at"]
            .as_i64()
            .and_then(from_unix)
            .unwrap_or_else(|| Utc::now() + Duration::seconds(FALLBACK_LINK_TTL_SECS));
        Ok(OnboardingLink { url, expires_at })
    }

    async fn create_product(
        &self,
        external_account_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> BillingResult<String> {
        let mut body = form(&[("name", name.to_string())]);
        if let Some(description) = description.filter(|d| !d.trim().is_empty()) {
            body.push(("description".into(), description.to_string()));
        }
        let response = self
            .api
            .post_form("v1/products", &body, Some(external_account_id))
            .await?;
        required_str(&response, "/id", "product id")
    }

    async fn create_price(
        &self,
        external_account_id: &str,
        price: &NewPrice,
    ) -> BillingResult<String> {
        let mut body = form(&[
            ("product", price.external_product_id.clone()),
            ("unit_amount", price.amount.to_string()),
            ("currency", price.currency.clone()),
        ]);
        if price.interval.is_recurring() {
            body.push(("recurring[interval]".into(), price.interval.as_str().to_string()));
        }
        let response = self
            .api
            .post_form("v1/prices", &body, Some(external_account_id))
            .await?;
        required_str(&response, "/id", "price id")
    }

    async fn deactivate_product(
        &self,
        external_account_id: &str,
        external_product_id: &str,
    ) -> BillingResult<()> {
        let body = form(&[("active", "false".to_string())]);
        self.api
            .post_form(
                &format!("v1/products/{external_product_id}"),
                &body,
                Some(external_account_id),
            )
            .await?;
        Ok(())
    }

    async fn create_checkout(
        &self,
        external_account_id: &str,
        request: &PaymentCheckoutRequest,
    ) -> BillingResult<PaymentCheckoutSession> {
        let recurring = request.interval.is_recurring();
        let mut body = form(&[
            ("mode", if recurring { "subscription" } else { "payment" }.to_string()),
            ("line_items[0][price]", request.external_price_id.clone()),
            ("line_items[0][quantity]", "1".to_string()),
            ("success_url", request.success_url.clone()),
            ("cancel_url", request.cancel_url.clone()),
        ]);
        match request.fee {
            ApplicationFee::Fixed { amount } => body.push((
                "payment_intent_data[application_fee_amount]".into(),
                amount.to_string(),
            )),
            ApplicationFee::Percent { percent } => body.push((
                "subscription_data[application_fee_percent]".into(),
                format!("{percent}"),
            )),
        }
        if let Some(email) = &request.customer_email {
            body.push(("customer_email".into(), email.clone()));
        }
        body.extend(metadata_form("metadata", &request.metadata));

        let response = self
            .api
            .post_form("v1/checkout/sessions", &body, Some(external_account_id))
            .await?;
        Ok(PaymentCheckoutSession {
            id: required_str(&response, "/id", "checkout session id")?,
            url: required_str(&response, "/url", "checkout url")?,
            payment_intent_id: response["payment_intent"].as_str().map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_defaults_missing_flags() {
        let snapshot = account_snapshot(&json!({"id": "acct_1"})).unwrap();
        assert!(!snapshot.charges_enabled);
        assert_eq!(snapshot.disabled_reason, None);
        assert_eq!(snapshot.card_payments, CapabilityState::Unrequested);
    }

    #[test]
    fn snapshot_requires_account_id() {
        assert!(account_snapshot(&json!({"charges_enabled": true})).is_err());
    }
}
