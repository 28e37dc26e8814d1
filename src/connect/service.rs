use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::fees::{application_fee_for, clamp_percent, FeeSplit};
use super::gateway::{ConnectGateway, NewConnectedAccount, NewPrice, PaymentCheckoutRequest};
use super::models::{
    AccountStatus, AccountType, ClientPayment, ClientProduct, ConnectedAccount, OnboardingLink,
    PaymentStatus, ProductInterval,
};
use super::status::{derive_from_snapshot, onboarding_completed};
use crate::audit::{self, AuditRecord, AuditSink};
use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, TimeWindow};

#[derive(Clone, Debug)]
pub struct ConnectSettings {
    pub platform_fee_percent: f64,
    pub onboarding_link_ttl_secs: i64,
    pub default_currency: String,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            platform_fee_percent: 0.0,
            onboarding_link_ttl_secs: 300,
            default_currency: "usd".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CreateAccountRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub account_type: AccountType,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewProductRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    pub interval: ProductInterval,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PaymentCheckoutOptions {
    pub product_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct PaymentCheckout {
    pub url: String,
    pub payment: ClientPayment,
    pub fee: FeeSplit,
}

// key: connect-service -> connected accounts, products, payments
#[derive(Clone)]
pub struct ConnectService {
    store: Arc<dyn BillingStore>,
    gateway: Option<Arc<dyn ConnectGateway>>,
    audit: Arc<dyn AuditSink>,
    settings: ConnectSettings,
    // serializes check-then-create so one process never opens two processor accounts per owner
    creating: Arc<Mutex<()>>,
}

impl ConnectService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Option<Arc<dyn ConnectGateway>>,
        audit: Arc<dyn AuditSink>,
        settings: ConnectSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            audit,
            settings,
            creating: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &ConnectSettings {
        &self.settings
    }

    fn gateway(&self) -> BillingResult<&Arc<dyn ConnectGateway>> {
        self.gateway
            .as_ref()
            .ok_or_else(|| BillingError::conflict("connected accounts are not configured"))
    }

    pub async fn account(&self, owner_id: &str) -> BillingResult<Option<ConnectedAccount>> {
        self.store.find_account_by_owner(owner_id).await
    }

    pub async fn require_account(&self, owner_id: &str) -> BillingResult<ConnectedAccount> {
        self.account(owner_id)
            .await?
            .ok_or_else(|| BillingError::not_found("connected account"))
    }

    /// Returns the owner's existing account instead of creating a second one.
    pub async fn create_account(
        &self,
        owner_id: &str,
        request: &CreateAccountRequest,
        actor: &str,
    ) -> BillingResult<ConnectedAccount> {
        let _creating = self.creating.lock().await;
        if let Some(existing) = self.account(owner_id).await? {
            return Ok(existing);
        }
        let snapshot = self
            .gateway()?
            .create_account(&NewConnectedAccount {
                account_type: request.account_type,
                email: request.email.clone(),
                country: request.country.clone(),
                owner_id: owner_id.to_string(),
            })
            .await?;

        let now = Utc::now();
        let account = ConnectedAccount {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            display_name: request.display_name.clone(),
            email: snapshot.email.clone().or_else(|| request.email.clone()),
            country: request.country.clone(),
            external_account_id: snapshot.external_account_id.clone(),
            account_type: request.account_type,
            account_status: derive_from_snapshot(&snapshot),
            charges_enabled: snapshot.charges_enabled,
            payouts_enabled: snapshot.payouts_enabled,
            details_submitted: snapshot.details_submitted,
            onboarding_completed: onboarding_completed(&snapshot),
            card_payments: snapshot.card_payments,
            transfers: snapshot.transfers,
            disabled_reason: snapshot.disabled_reason.clone(),
            default_currency: snapshot
                .default_currency
                .clone()
                .unwrap_or_else(|| self.settings.default_currency.clone())
                .to_ascii_lowercase(),
            onboarding_link: None,
            metadata: json!({}),
            last_event_at: None,
            last_synced_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        let stored = self.store.insert_account(&account).await?;
        if stored.id == account.id {
            tracing::info!(
                %owner_id,
                account = %stored.id,
                external_account = %stored.external_account_id,
                status = stored.account_status.as_str(),
                "connected account created"
            );
            let record = AuditRecord::new(actor, "account.created", "connected_account", stored.id, now)
                .with_change(None, Some(stored.audit_summary()));
            audit::emit(self.audit.as_ref(), record).await;
        } else {
            // another instance linked an account first; ours is left unused at the processor
            tracing::warn!(
                %owner_id,
                account = %stored.id,
                discarded_external_account = %account.external_account_id,
                "connected account already existed; discarding newly created processor account"
            );
        }
        Ok(stored)
    }

    /// Pull the processor view and recompute the derived status.
    pub async fn sync_account(&self, owner_id: &str, actor: &str) -> BillingResult<ConnectedAccount> {
        let account = self.require_account(owner_id).await?;
        let snapshot = self
            .gateway()?
            .retrieve_account(&account.external_account_id)
            .await?;
        let now = Utc::now();
        let (previous, synced) = self
            .store
            .apply_account_snapshot(&snapshot, None, now)
            .await?
            .into_inner();

        tracing::info!(
            %owner_id,
            account = %synced.id,
            from = previous.as_str(),
            to = synced.account_status.as_str(),
            "connected account synced"
        );
        let record = AuditRecord::new(actor, "account.synced", "connected_account", synced.id, now)
            .with_change(Some(account.audit_summary()), Some(synced.audit_summary()));
        audit::emit(self.audit.as_ref(), record).await;
        if previous != AccountStatus::Active && synced.account_status == AccountStatus::Active {
            let record =
                AuditRecord::new(actor, "account.onboarded", "connected_account", synced.id, now)
                    .with_change(
                        Some(json!({ "account_status": previous.as_str() })),
                        Some(synced.audit_summary()),
                    );
            audit::emit(self.audit.as_ref(), record).await;
        }
        Ok(synced)
    }

    /// Cached per account until it expires.
    pub async fn onboarding_link(
        &self,
        owner_id: &str,
        return_url: &str,
        refresh_url: &str,
    ) -> BillingResult<OnboardingLink> {
        absolute_url("return_url", return_url)?;
        absolute_url("refresh_url", refresh_url)?;
        let account = self.require_account(owner_id).await?;
        let now = Utc::now();
        if let Some(link) = account.onboarding_link.as_ref().filter(|l| l.is_valid_at(now)) {
            return Ok(link.clone());
        }

        let mut link = self
            .gateway()?
            .create_account_link(&account.external_account_id, return_url, refresh_url)
            .await?;
        let local_expiry = now + Duration::seconds(self.settings.onboarding_link_ttl_secs);
        if link.expires_at > local_expiry {
            link.expires_at = local_expiry;
        }
        self.store
            .store_onboarding_link(account.id, &link, now)
            .await?;
        tracing::info!(%owner_id, account = %account.id, expires_at = %link.expires_at, "onboarding link issued");
        Ok(link)
    }

    /// External product and price are created first, then both ids land in one store write.
    pub async fn create_product(
        &self,
        owner_id: &str,
        request: &NewProductRequest,
        actor: &str,
    ) -> BillingResult<ClientProduct> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(BillingError::validation("product name must not be empty"));
        }
        if request.amount <= 0 {
            return Err(BillingError::validation("amount must be positive"));
        }
        let account = self.require_account(owner_id).await?;
        let currency = request
            .currency
            .as_deref()
            .unwrap_or(&account.default_currency)
            .to_ascii_lowercase();

        let gateway = self.gateway()?;
        let external_product_id = gateway
            .create_product(
                &account.external_account_id,
                name,
                request.description.as_deref(),
            )
            .await?;
        let external_price_id = gateway
            .create_price(
                &account.external_account_id,
                &NewPrice {
                    external_product_id: external_product_id.clone(),
                    amount: request.amount,
                    currency: currency.clone(),
                    interval: request.interval,
                },
            )
            .await?;

        let now = Utc::now();
        let product = ClientProduct {
            id: Uuid::new_v4(),
            account_id: account.id,
            external_product_id,
            external_price_id,
            name: name.to_string(),
            description: request.description.clone(),
            amount: request.amount,
            currency,
            interval: request.interval,
            active: true,
            metadata: crate::store::apply::normalize_metadata(&request.metadata),
            created_at: now,
            updated_at: now,
        };
        let product = self.store.insert_product(&product).await?;
        tracing::info!(%owner_id, product = %product.id, amount = product.amount, "client product created");
        let record = AuditRecord::new(actor, "product.created", "client_product", product.id, now)
            .with_change(
                None,
                Some(json!({
                    "name": product.name,
                    "amount": product.amount,
                    "currency": product.currency,
                    "interval": product.interval.as_str(),
                })),
            );
        audit::emit(self.audit.as_ref(), record).await;
        Ok(product)
    }

    pub async fn list_products(
        &self,
        owner_id: &str,
        active_only: bool,
    ) -> BillingResult<Vec<ClientProduct>> {
        let account = self.require_account(owner_id).await?;
        self.store.list_products(account.id, active_only).await
    }

    async fn owned_product(
        &self,
        account: &ConnectedAccount,
        product_id: Uuid,
    ) -> BillingResult<ClientProduct> {
        self.store
            .find_product(product_id)
            .await?
            .filter(|product| product.account_id == account.id)
            .ok_or_else(|| BillingError::not_found("product"))
    }

    pub async fn deactivate_product(
        &self,
        owner_id: &str,
        product_id: Uuid,
        actor: &str,
    ) -> BillingResult<ClientProduct> {
        let account = self.require_account(owner_id).await?;
        let product = self.owned_product(&account, product_id).await?;
        if !product.active {
            return Ok(product);
        }
        self.gateway()?
            .deactivate_product(&account.external_account_id, &product.external_product_id)
            .await?;
        let now = Utc::now();
        let updated = self.store.set_product_active(product.id, false, now).await?;
        tracing::info!(%owner_id, product = %updated.id, "client product deactivated");
        let record = AuditRecord::new(actor, "product.deactivated", "client_product", updated.id, now)
            .with_change(Some(json!({ "active": true })), Some(json!({ "active": false })));
        audit::emit(self.audit.as_ref(), record).await;
        Ok(updated)
    }

    /// Refuses unless the account is active with charges enabled.
    pub async fn create_payment_checkout(
        &self,
        owner_id: &str,
        options: &PaymentCheckoutOptions,
        actor: &str,
    ) -> BillingResult<PaymentCheckout> {
        absolute_url("success_url", &options.success_url)?;
        absolute_url("cancel_url", &options.cancel_url)?;
        let account = self.require_account(owner_id).await?;
        if !account.can_accept_payments() {
            return Err(BillingError::conflict("account cannot accept payments"));
        }
        let product = self.owned_product(&account, options.product_id).await?;
        if !product.active {
            return Err(BillingError::conflict("product is not active"));
        }

        let fee_percent = clamp_percent(self.settings.platform_fee_percent)?;
        let (fee, split) =
            application_fee_for(product.amount, fee_percent, product.interval.is_recurring())?;

        let payment_id = Uuid::new_v4();
        let mut metadata = crate::store::apply::normalize_metadata(&options.metadata);
        if let Some(map) = metadata.as_object_mut() {
            map.insert("client_payment_id".into(), json!(payment_id.to_string()));
            map.insert("product_id".into(), json!(product.id.to_string()));
        }

        let session = self
            .gateway()?
            .create_checkout(
                &account.external_account_id,
                &PaymentCheckoutRequest {
                    external_price_id: product.external_price_id.clone(),
                    interval: product.interval,
                    fee,
                    success_url: options.success_url.clone(),
                    cancel_url: options.cancel_url.clone(),
                    customer_email: options.customer_email.clone(),
                    metadata: metadata.clone(),
                },
            )
            .await?;

        let now = Utc::now();
        let payment = ClientPayment {
            id: payment_id,
            account_id: account.id,
            product_id: Some(product.id),
            payment_intent_id: session
                .payment_intent_id
                .clone()
                .unwrap_or_else(|| session.id.clone()),
            checkout_url: Some(session.url.clone()),
            amount: product.amount,
            currency: product.currency.clone(),
            status: PaymentStatus::Pending,
            application_fee_amount: split.application_fee_amount,
            customer_email: options.customer_email.clone(),
            customer_name: None,
            refunded_amount: 0,
            refunded_at: None,
            failure_reason: None,
            metadata,
            last_event_at: None,
            created_at: now,
            updated_at: now,
        };
        let payment = self.store.insert_payment(&payment).await?;
        tracing::info!(
            %owner_id,
            payment = %payment.id,
            payment_intent = %payment.payment_intent_id,
            amount = payment.amount,
            application_fee = payment.application_fee_amount,
            "client payment checkout created"
        );
        let record = AuditRecord::new(actor, "payment.created", "client_payment", payment.id, now)
            .with_change(
                None,
                Some(json!({
                    "status": payment.status.as_str(),
                    "amount": payment.amount,
                    "application_fee_amount": payment.application_fee_amount,
                })),
            );
        audit::emit(self.audit.as_ref(), record).await;

        Ok(PaymentCheckout {
            url: session.url,
            payment,
            fee: split,
        })
    }

    pub async fn list_payments(
        &self,
        owner_id: &str,
        window: TimeWindow,
    ) -> BillingResult<Vec<ClientPayment>> {
        let account = self.require_account(owner_id).await?;
        self.store.list_payments(Some(account.id), window).await
    }
}

/// Redirect targets handed to the processor must be absolute http(s) URLs.
fn absolute_url(field: &str, value: &str) -> BillingResult<()> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(BillingError::validation(format!(
            "{field} must be an absolute http(s) URL"
        ))),
    }
}
