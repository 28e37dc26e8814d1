use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::owner_actor;
use crate::error::AppResult;
use crate::extractor::AuthUser;

use super::adapters::{
    BillingCommands, BillingProviderResolver, CheckoutOptions, CheckoutResult, ProviderCapabilities,
    ProviderKind,
};
use super::models::{
    AccessDecision, Subscription, SubscriptionAttrs, SubscriptionStatus, UsageOptions,
    UsageStats, UsageTrackResult,
};
use super::service::BillingService;

pub async fn get_subscription(
    Extension(billing): Extension<BillingService>,
    user: AuthUser,
) -> AppResult<Json<Option<Subscription>>> {
    let subscription = billing.subscription(&user.owner_id).await?;
    Ok(Json(subscription))
}

pub async fn sync_subscription(
    Extension(billing): Extension<BillingService>,
    user: AuthUser,
    Json(attrs): Json<SubscriptionAttrs>,
) -> AppResult<Json<Subscription>> {
    let subscription = billing
        .create_or_sync_subscription(&user.owner_id, &attrs, &owner_actor(&user.owner_id))
        .await?;
    Ok(Json(subscription))
}

pub async fn update_status(
    Extension(billing): Extension<BillingService>,
    user: AuthUser,
    Json(payload): Json<UpdateStatusRequest>,
) -> AppResult<Json<Subscription>> {
    let subscription = billing
        .update_status(
            &user.owner_id,
            payload.status,
            payload.end_date,
            &owner_actor(&user.owner_id),
        )
        .await?;
    Ok(Json(subscription))
}

pub async fn reset_usage(
    Extension(billing): Extension<BillingService>,
    user: AuthUser,
) -> AppResult<Json<Subscription>> {
    let subscription = billing
        .reset_usage(&user.owner_id, &owner_actor(&user.owner_id))
        .await?;
    Ok(Json(subscription))
}

pub async fn check_access(
    Extension(billing): Extension<BillingService>,
    user: AuthUser,
    Json(payload): Json<AccessRequest>,
) -> AppResult<Json<AccessDecision>> {
    let decision = billing
        .check_access_for(&user.owner_id, &payload.feature_key)
        .await?;
    Ok(Json(decision))
}

/// Usage goes through the active backend when one is configured so metered backends
/// see it on the next sync; otherwise straight into the local ledger.
pub async fn track_usage(
    Extension(billing): Extension<BillingService>,
    Extension(resolver): Extension<Arc<BillingProviderResolver>>,
    user: AuthUser,
    Json(payload): Json<TrackUsageRequest>,
) -> AppResult<Json<UsageTrackResult>> {
    let options = UsageOptions {
        unit: payload.unit,
        context: payload.context,
    };
    let result = match resolver.active_kind() {
        Some(_) => {
            resolver
                .provider()?
                .track_usage(&user.owner_id, &payload.feature_key, payload.quantity, options)
                .await?
        }
        None => {
            billing
                .track_usage(
                    &user.owner_id,
                    &payload.feature_key,
                    payload.quantity,
                    options,
                    &owner_actor(&user.owner_id),
                )
                .await?
        }
    };
    Ok(Json(result))
}

pub async fn usage_stats(
    Extension(billing): Extension<BillingService>,
    user: AuthUser,
    Query(query): Query<UsageStatsQuery>,
) -> AppResult<Json<UsageStats>> {
    let stats = billing
        .usage_stats(&user.owner_id, query.feature_key.as_deref())
        .await?;
    Ok(Json(stats))
}

pub async fn create_checkout(
    Extension(resolver): Extension<Arc<BillingProviderResolver>>,
    user: AuthUser,
    Json(options): Json<CheckoutOptions>,
) -> AppResult<Json<CheckoutResult>> {
    let provider = match resolver.provider() {
        Ok(provider) => provider,
        Err(err) => return Ok(Json(CheckoutResult::failed(err.to_string()))),
    };
    Ok(Json(provider.create_checkout(&user.owner_id, &options).await))
}

pub async fn open_portal(
    Extension(resolver): Extension<Arc<BillingProviderResolver>>,
    user: AuthUser,
    Json(payload): Json<PortalRequest>,
) -> AppResult<Json<PortalResponse>> {
    let url = resolver
        .provider()?
        .open_billing_portal(&user.owner_id, payload.return_url.as_deref())
        .await?;
    Ok(Json(PortalResponse { url }))
}

pub async fn cancel_subscription(
    Extension(resolver): Extension<Arc<BillingProviderResolver>>,
    user: AuthUser,
    Json(payload): Json<CancelRequest>,
) -> AppResult<Json<Subscription>> {
    let subscription = resolver
        .provider()?
        .cancel_subscription(&user.owner_id, payload.immediate)
        .await?;
    Ok(Json(subscription))
}

pub async fn provider_info(
    Extension(resolver): Extension<Arc<BillingProviderResolver>>,
    _user: AuthUser,
) -> Json<ProviderInfo> {
    let kind = resolver.active_kind();
    Json(ProviderInfo {
        kind,
        configured: resolver.adapter().map_or(false, |adapter| adapter.is_configured()),
        capabilities: kind.map(|kind| kind.capabilities()),
    })
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct AccessRequest {
    pub feature_key: String,
}

#[derive(Debug, Deserialize)]
pub struct TrackUsageRequest {
    pub feature_key: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

fn default_quantity() -> i64 {
    1
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageStatsQuery {
    #[serde(default)]
    pub feature_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PortalRequest {
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Debug, Serialize)]
pub struct ProviderInfo {
    pub kind: Option<ProviderKind>,
    pub configured: bool,
    pub capabilities: Option<ProviderCapabilities>,
}
