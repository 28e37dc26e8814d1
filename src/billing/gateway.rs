use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::adapters::{ProviderCredentials, ProviderKind};
use crate::error::{BillingError, BillingResult};

pub const STRIPE_API_BASE: &str = "https://api.stripe.com";
pub const LEMONSQUEEZY_API_BASE: &str = "https://api.lemonsqueezy.com";
pub const PADDLE_API_BASE: &str = "https://api.paddle.com";

const REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_headers: HeaderMap,
    ) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .default_headers(default_headers)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        account: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, self.endpoint(path))
            .bearer_auth(&self.api_key);
        match account {
            Some(account) => request.header("Stripe-Account", account),
            None => request,
        }
    }

    pub async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
        account: Option<&str>,
    ) -> BillingResult<Value> {
        let response = self
            .request(reqwest::Method::POST, path, account)
            .form(form)
            .send()
            .await?;
        read_body(path, response).await
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> BillingResult<Value> {
        let response = self
            .request(reqwest::Method::POST, path, None)
            .json(body)
            .send()
            .await?;
        read_body(path, response).await
    }

    pub async fn get(&self, path: &str, account: Option<&str>) -> BillingResult<Value> {
        let response = self
            .request(reqwest::Method::GET, path, account)
            .send()
            .await?;
        read_body(path, response).await
    }

    pub async fn delete(&self, path: &str) -> BillingResult<Value> {
        let response = self
            .request(reqwest::Method::DELETE, path, None)
            .send()
            .await?;
        read_body(path, response).await
    }
}

async fn read_body(path: &str, response: reqwest::Response) -> BillingResult<Value> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        tracing::warn!(%status, %path, body = %body, "processor request failed");
        return Err(BillingError::upstream(format!(
            "processor returned {status} for {path}: {}",
            upstream_message(status, &body)
        )));
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body)
        .map_err(|err| BillingError::upstream(format!("invalid processor response for {path}: {err}")))
}

fn upstream_message(status: StatusCode, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|value| {
            value["error"]["message"]
                .as_str()
                .or_else(|| value["error"]["detail"].as_str())
                .or_else(|| value["errors"][0]["detail"].as_str())
        })
        .map(str::to_string)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string())
}

/// Pull a required string out of a processor response.
pub(crate) fn required_str(value: &Value, pointer: &str, what: &str) -> BillingResult<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BillingError::upstream(format!("processor response missing {what}")))
}

/// Flatten a JSON object into `prefix[key]=value` form pairs.
pub(crate) fn metadata_form(prefix: &str, metadata: &Value) -> Vec<(String, String)> {
    let Some(map) = metadata.as_object() else {
        return Vec::new();
    };
    map.iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (format!("{prefix}[{key}]"), value)
        })
        .collect()
}

/// Hosted checkout for a subscription price.
#[derive(Clone, Debug, Default)]
pub struct CheckoutRequest {
    pub owner_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
    pub trial_days: Option<u32>,
    pub metadata: Value,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait CheckoutGateway: Send + Sync {
    async fn create_checkout(&self, request: &CheckoutRequest) -> BillingResult<CheckoutSession>;

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: Option<&str>,
    ) -> BillingResult<String>;

    async fn cancel_subscription(
        &self,
        external_subscription_id: &str,
        immediate: bool,
    ) -> BillingResult<()>;

    async fn report_usage(
        &self,
        customer_id: &str,
        feature_key: &str,
        quantity: i64,
    ) -> BillingResult<()>;
}

/// Build the gateway for a configured backend.
pub fn gateway_for(
    kind: ProviderKind,
    credentials: &ProviderCredentials,
) -> BillingResult<Arc<dyn CheckoutGateway>> {
    let gateway: Arc<dyn CheckoutGateway> = match kind {
        ProviderKind::Stripe => Arc::new(StripeGateway::new(
            credentials.api_base.as_deref().unwrap_or(STRIPE_API_BASE),
            &credentials.api_key,
        )?),
        ProviderKind::LemonSqueezy => {
            let store_id = credentials.store_id.clone().ok_or_else(|| {
                BillingError::conflict("lemonsqueezy requires a store id")
            })?;
            Arc::new(LemonSqueezyGateway::new(
                credentials
                    .api_base
                    .as_deref()
                    .unwrap_or(LEMONSQUEEZY_API_BASE),
                &credentials.api_key,
                store_id,
            )?)
        }
        ProviderKind::Paddle => Arc::new(PaddleGateway::new(
            credentials.api_base.as_deref().unwrap_or(PADDLE_API_BASE),
            &credentials.api_key,
        )?),
    };
    Ok(gateway)
}

#[derive(Clone)]
pub struct StripeGateway {
    api: ApiClient,
}

impl StripeGateway {
    pub fn new(base_url: &str, secret_key: &str) -> BillingResult<Self> {
        Ok(Self {
            api: ApiClient::new(base_url, secret_key, HeaderMap::new())?,
        })
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }
}

#[async_trait]
impl CheckoutGateway for StripeGateway {
    async fn create_checkout(&self, request: &CheckoutRequest) -> BillingResult<CheckoutSession> {
        let mut form = vec![
            ("mode".to_string(), "subscription".to_string()),
            ("line_items[0][price]".to_string(), request.price_id.clone()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
            ("client_reference_id".to_string(), request.owner_id.clone()),
            ("metadata[owner_id]".to_string(), request.owner_id.clone()),
            (
                "subscription_data[metadata][owner_id]".to_string(),
                request.owner_id.clone(),
            ),
        ];
        if let Some(customer) = &request.customer_id {
            form.push(("customer".to_string(), customer.clone()));
        } else if let Some(email) = &request.customer_email {
            form.push(("customer_email".to_string(), email.clone()));
        }
        if let Some(days) = request.trial_days {
            form.push((
                "subscription_data[trial_period_days]".to_string(),
                days.to_string(),
            ));
        }
        form.extend(metadata_form("metadata", &request.metadata));

        let session = self.api.post_form("v1/checkout/sessions", &form, None).await?;
        Ok(CheckoutSession {
            id: required_str(&session, "/id", "checkout session id")?,
            url: required_str(&session, "/url", "checkout url")?,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: Option<&str>,
    ) -> BillingResult<String> {
        let mut form = vec![("customer".to_string(), customer_id.to_string())];
        if let Some(url) = return_url {
            form.push(("return_url".to_string(), url.to_string()));
        }
        let session = self
            .api
            .post_form("v1/billing_portal/sessions", &form, None)
            .await?;
        required_str(&session, "/url", "portal url")
    }

    async fn cancel_subscription(
        &self,
        external_subscription_id: &str,
        immediate: bool,
    ) -> BillingResult<()> {
        let path = format!("v1/subscriptions/{external_subscription_id}");
        if immediate {
            self.api.delete(&path).await?;
        } else {
            let form = vec![("cancel_at_period_end".to_string(), "true".to_string())];
            self.api.post_form(&path, &form, None).await?;
        }
        Ok(())
    }

    async fn report_usage(
        &self,
        customer_id: &str,
        feature_key: &str,
        quantity: i64,
    ) -> BillingResult<()> {
        let form = vec![
            ("event_name".to_string(), feature_key.to_string()),
            (
                "payload[stripe_customer_id]".to_string(),
                customer_id.to_string(),
            ),
            ("payload[value]".to_string(), quantity.to_string()),
        ];
        self.api
            .post_form("v1/billing/meter_events", &form, None)
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct LemonSqueezyGateway {
    api: ApiClient,
    store_id: String,
}

impl LemonSqueezyGateway {
    pub fn new(base_url: &str, api_key: &str, store_id: String) -> BillingResult<Self> {
        let mut headers = HeaderMap::new();
        let json_api = HeaderValue::from_static("application/vnd.api+json");
        headers.insert(ACCEPT, json_api.clone());
        headers.insert(CONTENT_TYPE, json_api);
        Ok(Self {
            api: ApiClient::new(base_url, api_key, headers)?,
            store_id,
        })
    }
}

#[async_trait]
impl CheckoutGateway for LemonSqueezyGateway {
    async fn create_checkout(&self, request: &CheckoutRequest) -> BillingResult<CheckoutSession> {
        let mut custom: BTreeMap<String, Value> = request
            .metadata
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        custom.insert("owner_id".to_string(), json!(request.owner_id));

        let body = json!({
            "data": {
                "type": "checkouts",
                "attributes": {
                    "checkout_data": {
                        "email": request.customer_email,
                        "custom": custom,
                    },
                    "product_options": {
                        "redirect_url": request.success_url,
                    },
                },
                "relationships": {
                    "store": { "data": { "type": "stores", "id": self.store_id } },
                    "variant": { "data": { "type": "variants", "id": request.price_id } },
                },
            }
        });
        let checkout = self.api.post_json("v1/checkouts", &body).await?;
        Ok(CheckoutSession {
            id: required_str(&checkout, "/data/id", "checkout id")?,
            url: required_str(&checkout, "/data/attributes/url", "checkout url")?,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        _return_url: Option<&str>,
    ) -> BillingResult<String> {
        let customer = self
            .api
            .get(&format!("v1/customers/{customer_id}"), None)
            .await?;
        required_str(
            &customer,
            "/data/attributes/urls/customer_portal",
            "customer portal url",
        )
    }

    async fn cancel_subscription(
        &self,
        external_subscription_id: &str,
        _immediate: bool,
    ) -> BillingResult<()> {
        // cancellation always takes effect at the end of the paid period
        self.api
            .delete(&format!("v1/subscriptions/{external_subscription_id}"))
            .await?;
        Ok(())
    }

    async fn report_usage(&self, _: &str, _: &str, _: i64) -> BillingResult<()> {
        Err(BillingError::conflict(
            "usage tracking is not supported by lemonsqueezy",
        ))
    }
}

#[derive(Clone)]
pub struct PaddleGateway {
    api: ApiClient,
}

impl PaddleGateway {
    pub fn new(base_url: &str, api_key: &str) -> BillingResult<Self> {
        Ok(Self {
            api: ApiClient::new(base_url, api_key, HeaderMap::new())?,
        })
    }
}

#[async_trait]
impl CheckoutGateway for PaddleGateway {
    async fn create_checkout(&self, request: &CheckoutRequest) -> BillingResult<CheckoutSession> {
        let mut custom_data = request.metadata.clone();
        if !custom_data.is_object() {
            custom_data = json!({});
        }
        custom_data["owner_id"] = json!(request.owner_id);

        let mut body = json!({
            "items": [{ "price_id": request.price_id, "quantity": 1 }],
            "custom_data": custom_data,
            "checkout": { "url": request.success_url },
        });
        if let Some(customer) = &request.customer_id {
            body["customer_id"] = json!(customer);
        }
        let transaction = self.api.post_json("transactions", &body).await?;
        Ok(CheckoutSession {
            id: required_str(&transaction, "/data/id", "transaction id")?,
            url: required_str(&transaction, "/data/checkout/url", "checkout url")?,
        })
    }

    async fn create_portal_session(&self, _: &str, _: Option<&str>) -> BillingResult<String> {
        Err(BillingError::conflict(
            "billing portal is not supported by paddle",
        ))
    }

    async fn cancel_subscription(
        &self,
        external_subscription_id: &str,
        immediate: bool,
    ) -> BillingResult<()> {
        let effective_from = if immediate {
            "immediately"
        } else {
            "next_billing_period"
        };
        self.api
            .post_json(
                &format!("subscriptions/{external_subscription_id}/cancel"),
                &json!({ "effective_from": effective_from }),
            )
            .await?;
        Ok(())
    }

    async fn report_usage(&self, _: &str, _: &str, _: i64) -> BillingResult<()> {
        Err(BillingError::conflict(
            "usage tracking is not supported by paddle",
        ))
    }
}
