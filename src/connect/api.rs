use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::audit::owner_actor;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::store::TimeWindow;

use super::models::{ClientPayment, ClientProduct, ConnectedAccount, OnboardingLink};
use super::service::{
    ConnectService, CreateAccountRequest, NewProductRequest, PaymentCheckout,
    PaymentCheckoutOptions,
};

pub async fn create_account(
    Extension(connect): Extension<ConnectService>,
    user: AuthUser,
    Json(payload): Json<CreateAccountRequest>,
) -> AppResult<Json<ConnectedAccount>> {
    let account = connect
        .create_account(&user.owner_id, &payload, &owner_actor(&user.owner_id))
        .await?;
    Ok(Json(account))
}

pub async fn get_account(
    Extension(connect): Extension<ConnectService>,
    user: AuthUser,
) -> AppResult<Json<ConnectedAccount>> {
    Ok(Json(connect.require_account(&user.owner_id).await?))
}

pub async fn sync_account(
    Extension(connect): Extension<ConnectService>,
    user: AuthUser,
) -> AppResult<Json<ConnectedAccount>> {
    let account = connect
        .sync_account(&user.owner_id, &owner_actor(&user.owner_id))
        .await?;
    Ok(Json(account))
}

pub async fn onboarding_link(
    Extension(connect): Extension<ConnectService>,
    user: AuthUser,
    Json(payload): Json<OnboardingLinkRequest>,
) -> AppResult<Json<OnboardingLink>> {
    let refresh_url = payload
        .refresh_url
        .as_deref()
        .unwrap_or(&payload.return_url);
    let link = connect
        .onboarding_link(&user.owner_id, &payload.return_url, refresh_url)
        .await?;
    Ok(Json(link))
}

pub async fn list_products(
    Extension(connect): Extension<ConnectService>,
    user: AuthUser,
    Query(query): Query<ListProductsQuery>,
) -> AppResult<Json<Vec<ClientProduct>>> {
    let products = connect
        .list_products(&user.owner_id, !query.include_inactive)
        .await?;
    Ok(Json(products))
}

pub async fn create_product(
    Extension(connect): Extension<ConnectService>,
    user: AuthUser,
    Json(payload): Json<NewProductRequest>,
) -> AppResult<Json<ClientProduct>> {
    let product = connect
        .create_product(&user.owner_id, &payload, &owner_actor(&user.owner_id))
        .await?;
    Ok(Json(product))
}

pub async fn deactivate_product(
    Extension(connect): Extension<ConnectService>,
    user: AuthUser,
    Path(product_id): Path<Uuid>,
) -> AppResult<Json<ClientProduct>> {
    let product = connect
        .deactivate_product(&user.owner_id, product_id, &owner_actor(&user.owner_id))
        .await?;
    Ok(Json(product))
}

pub async fn create_checkout(
    Extension(connect): Extension<ConnectService>,
    user: AuthUser,
    Json(payload): Json<PaymentCheckoutOptions>,
) -> AppResult<Json<PaymentCheckout>> {
    let checkout = connect
        .create_payment_checkout(&user.owner_id, &payload, &owner_actor(&user.owner_id))
        .await?;
    Ok(Json(checkout))
}

pub async fn list_payments(
    Extension(connect): Extension<ConnectService>,
    user: AuthUser,
    Query(query): Query<WindowQuery>,
) -> AppResult<Json<Vec<ClientPayment>>> {
    let payments = connect
        .list_payments(&user.owner_id, query.window()?)
        .await?;
    Ok(Json(payments))
}

#[derive(Debug, Deserialize)]
pub struct OnboardingLinkRequest {
    pub return_url: String,
    #[serde(default)]
    pub refresh_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListProductsQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

/// `[from, to)` over creation time; both bounds optional.
#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl WindowQuery {
    pub fn window(&self) -> AppResult<TimeWindow> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(AppError::BadRequest("window start is after its end".into()));
            }
        }
        Ok(TimeWindow {
            from: self.from,
            to: self.to,
        })
    }
}
