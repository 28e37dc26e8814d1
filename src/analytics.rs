//! Read-only revenue and subscription reporting.

use std::collections::BTreeMap;

use axum::{
    extract::{Extension, Query},
    Json,
};
use serde::Serialize;

use crate::billing::models::{PlanType, Subscription, SubscriptionStatus};
use crate::billing::BillingService;
use crate::connect::api::WindowQuery;
use crate::connect::models::{ClientPayment, PaymentStatus};
use crate::connect::ConnectService;
use crate::error::AppResult;
use crate::extractor::AuthUser;

#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct RevenueSummary {
    /// Gross of succeeded and refunded payments.
    pub total_revenue: i64,
    pub refunded: i64,
    pub net_revenue: i64,
    pub platform_fees: i64,
    pub payment_count: usize,
    pub counts_by_status: BTreeMap<&'static str, usize>,
    pub success_rate: f64,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct SubscriptionSummary {
    pub total: usize,
    pub counts_by_status: BTreeMap<&'static str, usize>,
    pub paid: usize,
    pub free: usize,
    pub active_paid: usize,
}

pub fn revenue_summary(payments: &[ClientPayment]) -> RevenueSummary {
    let mut summary = RevenueSummary {
        counts_by_status: PaymentStatus::ALL
            .iter()
            .map(|status| (status.as_str(), 0))
            .collect(),
        ..Default::default()
    };
    let mut succeeded = 0usize;

    for payment in payments {
        *summary
            .counts_by_status
            .entry(payment.status.as_str())
            .or_default() += 1;
        match payment.status {
            PaymentStatus::Succeeded | PaymentStatus::Refunded => {
                if payment.status == PaymentStatus::Succeeded {
                    succeeded += 1;
                }
                summary.total_revenue += payment.amount;
                summary.refunded += payment.refunded_amount;
                summary.platform_fees += payment.application_fee_amount;
            }
            _ => {}
        }
    }

    summary.payment_count = payments.len();
    summary.net_revenue = summary.total_revenue - summary.refunded;
    summary.success_rate = if payments.is_empty() {
        0.0
    } else {
        succeeded as f64 / payments.len() as f64
    };
    summary
}

pub fn subscription_summary(subscriptions: &[Subscription]) -> SubscriptionSummary {
    let mut summary = SubscriptionSummary {
        total: subscriptions.len(),
        counts_by_status: [
            SubscriptionStatus::Active,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Inactive,
        ]
        .iter()
        .map(|status| (status.as_str(), 0))
        .collect(),
        ..Default::default()
    };
    for subscription in subscriptions {
        *summary
            .counts_by_status
            .entry(subscription.status.as_str())
            .or_default() += 1;
        match subscription.plan_type {
            PlanType::Paid => {
                summary.paid += 1;
                if subscription.is_entitled() {
                    summary.active_paid += 1;
                }
            }
            PlanType::Free => summary.free += 1,
        }
    }
    summary
}

#[derive(Debug, Serialize)]
pub struct AnalyticsReport {
    pub revenue: RevenueSummary,
    /// Platform-wide; only returned to admins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriptions: Option<SubscriptionSummary>,
}

pub async fn revenue_report(
    Extension(connect): Extension<ConnectService>,
    Extension(billing): Extension<BillingService>,
    user: AuthUser,
    Query(query): Query<WindowQuery>,
) -> AppResult<Json<AnalyticsReport>> {
    let window = query.window()?;
    let payments = match connect.account(&user.owner_id).await? {
        Some(_) => connect.list_payments(&user.owner_id, window).await?,
        None => Vec::new(),
    };
    let subscriptions = if user.is_admin() {
        let all = billing.store().list_subscriptions().await?;
        Some(subscription_summary(&all))
    } else {
        None
    };
    Ok(Json(AnalyticsReport {
        revenue: revenue_summary(&payments),
        subscriptions,
    }))
}
