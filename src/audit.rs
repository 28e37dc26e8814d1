use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;

pub const ACTOR_RECONCILER: &str = "system:reconciler";
pub const ACTOR_SCHEDULER: &str = "system:scheduler";

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl ToString,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.into(),
            action: action.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.to_string(),
            before: None,
            after: None,
            occurred_at,
        }
    }

    pub fn with_change(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.before = before;
        self.after = after;
        self
    }
}

/// Actor string for an authenticated owner.
pub fn owner_actor(owner_id: &str) -> String {
    format!("owner:{owner_id}")
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> BillingResult<()>;
}

/// Write a record; failures are logged and dropped so the mutation that
/// produced the record is never rolled back by its audit trail.
pub async fn emit(sink: &dyn AuditSink, record: AuditRecord) {
    if let Err(err) = sink.record(&record).await {
        tracing::warn!(
            ?err,
            action = %record.action,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            "failed to write audit record"
        );
    }
}

#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, record: &AuditRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_audit_log (
                id, actor, action, entity_type, entity_id, before_state, after_state, occurred_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(&record.actor)
        .bind(&record.action)
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(&record.before)
        .bind(&record.after)
        .bind(record.occurred_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Emits audit records as structured log lines only.
#[derive(Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: &AuditRecord) -> BillingResult<()> {
        tracing::info!(
            target: "billing_audit",
            actor = %record.actor,
            action = %record.action,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            before = ?record.before,
            after = ?record.after,
            "audit"
        );
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }

    pub async fn actions(&self) -> Vec<String> {
        self.records
            .lock()
            .await
            .iter()
            .map(|record| record.action.clone())
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: &AuditRecord) -> BillingResult<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
