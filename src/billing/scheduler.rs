use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use crate::audit::{self, AuditRecord, ACTOR_SCHEDULER};
use crate::config;

use super::adapters::{BillingCommands, ProcessorAdapter};
use super::models::Subscription;
use super::plans::PlanCatalog;
use super::service::BillingService;

/// Upper bound on periods skipped in one roll when the scheduler was offline.
const MAX_PERIODS_PER_ROLL: usize = 512;
const USAGE_SYNC_BATCH: i64 = 500;

/// What a tick did, for logs and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub rolled: usize,
    pub skipped: usize,
    pub usage_synced: u64,
}

// key: billing-period-scheduler -> resets usage at period boundaries
pub fn spawn(
    billing: BillingService,
    catalog: Arc<PlanCatalog>,
    usage_sync: Option<Arc<ProcessorAdapter>>,
) {
    let interval = TokioDuration::from_secs(*config::BILLING_USAGE_RESET_SCAN_INTERVAL_SECS);

    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            match process_tick(&billing, &catalog, usage_sync.as_deref(), now).await {
                Ok(summary) if summary.rolled > 0 || summary.usage_synced > 0 => {
                    info!(?summary, "billing period tick finished")
                }
                Ok(_) => {}
                Err(err) => warn!(?err, "billing period tick failed"),
            }
        }
    });
}

pub async fn process_tick(
    billing: &BillingService,
    catalog: &PlanCatalog,
    usage_sync: Option<&ProcessorAdapter>,
    now: DateTime<Utc>,
) -> Result<TickSummary> {
    let mut summary = TickSummary::default();
    let subscriptions = billing.store().list_subscriptions().await?;

    for subscription in subscriptions {
        let Some(period_end) = due_period_end(&subscription, now) else {
            continue;
        };
        let interval = catalog
            .find(&subscription.plan_id)
            .map(|plan| plan.interval)
            .unwrap_or_default();

        let mut next_end = interval.advance(period_end);
        for _ in 0..MAX_PERIODS_PER_ROLL {
            if next_end > now {
                break;
            }
            next_end = interval.advance(next_end);
        }

        match billing
            .store()
            .roll_period(subscription.id, period_end, next_end, now)
            .await
        {
            Ok(Some(rolled)) => {
                summary.rolled += 1;
                info!(
                    owner_id = %rolled.owner_id,
                    subscription = %rolled.id,
                    period_end = %next_end,
                    "usage counters reset for new period"
                );
                let record = AuditRecord::new(
                    ACTOR_SCHEDULER,
                    "subscription.period_rolled",
                    "subscription",
                    rolled.id,
                    now,
                )
                .with_change(
                    Some(json!({
                        "current_period_end": period_end,
                        "usage": subscription.usage.counters,
                    })),
                    Some(json!({
                        "current_period_end": rolled.current_period_end,
                        "usage": rolled.usage.counters,
                    })),
                );
                audit::emit(billing.audit_sink().as_ref(), record).await;
            }
            Ok(None) => {
                summary.skipped += 1;
                debug!(subscription = %subscription.id, "period already rolled by another writer");
            }
            Err(err) => warn!(
                ?err,
                owner_id = %subscription.owner_id,
                subscription = %subscription.id,
                "failed to roll subscription period"
            ),
        }
    }

    if let Some(adapter) = usage_sync {
        match adapter.push_usage(USAGE_SYNC_BATCH).await {
            Ok(count) => summary.usage_synced = count,
            Err(err) => warn!(?err, provider = adapter.kind().as_str(), "usage sync failed"),
        }
    }

    Ok(summary)
}

/// Period end to roll from, when the subscription is entitled and its period has lapsed
/// without a reset at or after the boundary.
fn due_period_end(subscription: &Subscription, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !subscription.is_entitled() {
        return None;
    }
    let period_end = subscription.current_period_end?;
    if period_end >= now || subscription.usage.last_reset_at >= period_end {
        return None;
    }
    Some(period_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::billing::models::{PlanType, SubscriptionAttrs, SubscriptionStatus, UsageOptions};
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn service() -> (BillingService, MemoryAuditSink) {
        let sink = MemoryAuditSink::new();
        let service = BillingService::new(Arc::new(MemoryStore::new()), Arc::new(sink.clone()));
        (service, sink)
    }

    #[tokio::test]
    async fn lapsed_period_resets_usage_once() {
        let (billing, sink) = service();
        let start = Utc::now() - Duration::days(40);
        let mut attrs = SubscriptionAttrs::new("free", PlanType::Free, SubscriptionStatus::Active)
            .with_feature("api_calls", Some(100));
        attrs.current_period_start = Some(start);
        attrs.current_period_end = Some(start + Duration::days(30));
        billing
            .store()
            .upsert_subscription("owner-1", &attrs, start)
            .await
            .unwrap();
        billing
            .track_usage("owner-1", "api_calls", 7, UsageOptions::default(), "owner:owner-1")
            .await
            .unwrap();

        let now = Utc::now();
        let catalog = PlanCatalog::builtin();
        let summary = process_tick(&billing, &catalog, None, now).await.unwrap();
        assert_eq!(summary.rolled, 1);

        let subscription = billing.require_subscription("owner-1").await.unwrap();
        assert_eq!(subscription.usage_for("api_calls"), 0);
        assert!(subscription.current_period_end.unwrap() > now);

        let again = process_tick(&billing, &catalog, None, now).await.unwrap();
        assert_eq!(again.rolled, 0);
        assert!(sink
            .actions()
            .await
            .contains(&"subscription.period_rolled".to_string()));
    }

    #[tokio::test]
    async fn unentitled_subscriptions_keep_their_counters() {
        let (billing, _) = service();
        let start = Utc::now() - Duration::days(40);
        let mut attrs = SubscriptionAttrs::new("free", PlanType::Free, SubscriptionStatus::PastDue)
            .with_feature("api_calls", None);
        attrs.current_period_start = Some(start);
        attrs.current_period_end = Some(start + Duration::days(30));
        billing
            .store()
            .upsert_subscription("owner-2", &attrs, start)
            .await
            .unwrap();

        let summary = process_tick(&billing, &PlanCatalog::builtin(), None, Utc::now())
            .await
            .unwrap();
        assert_eq!(summary.rolled, 0);
    }
}
