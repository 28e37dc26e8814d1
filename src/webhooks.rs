use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::billing::models::RecordOutcome;
use crate::billing::{ProcessorEnvelope, Reconciler, ReconciliationHandle, ReconciliationJob};
use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-billing-signature";

#[derive(Clone, Debug)]
pub struct WebhookSettings {
    pub secret: Option<String>,
    pub tolerance_secs: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is malformed")]
    Malformed,
    #[error("signature timestamp is outside the tolerance window")]
    Expired,
    #[error("signature does not match payload")]
    Mismatch,
}

/// Sign `<t>.<payload>` the way ingress expects it; header value is `t=<t>,v1=<hex>`.
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    let skew = now
        .timestamp()
        .checked_sub(timestamp)
        .map(i64::unsigned_abs)
        .ok_or(SignatureError::Expired)?;
    if skew > tolerance_secs.max(0).unsigned_abs() {
        return Err(SignatureError::Expired);
    }

    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return Err(SignatureError::Mismatch);
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

/// key: webhooks-billing -> signed processor event ingress
///
/// Records the event before acknowledging it; reconciliation happens on the worker.
/// Redeliveries of processed events are acknowledged with 200 and no work.
pub async fn billing_webhook(
    Extension(settings): Extension<WebhookSettings>,
    Extension(reconciler): Extension<Reconciler>,
    Extension(reconciliation): Extension<ReconciliationHandle>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<StatusCode> {
    let Some(secret) = settings.secret.as_deref() else {
        error!("billing webhook received but no webhook secret is configured");
        return Err(AppError::Unauthorized);
    };
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("missing signature".into()))?;
    if let Err(err) = verify_signature(&body, header, secret, settings.tolerance_secs, Utc::now()) {
        warn!(%err, "rejected billing webhook");
        return Err(AppError::Unauthorized);
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("invalid event payload: {err}")))?;
    let envelope = ProcessorEnvelope::parse(payload, Utc::now())?;

    let event = match reconciler.ingest(envelope).await? {
        RecordOutcome::Inserted(event) => event,
        RecordOutcome::Duplicate(event) if event.processed => {
            debug!(event = %event.id, "processed event redelivered");
            return Ok(StatusCode::OK);
        }
        RecordOutcome::Duplicate(event) => event,
    };

    if let Err(err) = reconciliation
        .dispatch(ReconciliationJob::Reconcile { event_id: event.id })
        .await
    {
        // the event is durable; the replay job will pick it up
        error!(?err, event = %event.id, "failed to enqueue reconciliation");
    } else {
        info!(event = %event.id, "billing webhook accepted");
    }
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    #[test]
    fn signed_payload_verifies() {
        let now = Utc::now();
        let body = br#"{"id":"evt_1","type":"invoice.paid"}"#;
        let header = sign_payload(body, SECRET, now.timestamp());
        assert_eq!(verify_signature(body, &header, SECRET, 300, now), Ok(()));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let now = Utc::now();
        let header = sign_payload(b"{}", SECRET, now.timestamp());
        assert_eq!(
            verify_signature(b"{\"x\":1}", &header, SECRET, 300, now),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature(b"{}", &header, "other", 300, now),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let now = Utc::now();
        let header = sign_payload(b"{}", SECRET, now.timestamp() - 301);
        assert_eq!(
            verify_signature(b"{}", &header, SECRET, 300, now),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn extreme_timestamps_are_expired() {
        let now = Utc::now();
        let header = format!("t={},v1=00", i64::MIN);
        assert_eq!(
            verify_signature(b"{}", &header, SECRET, 300, now),
            Err(SignatureError::Expired)
        );
        let header = format!("t={},v1=00", i64::MAX);
        assert_eq!(
            verify_signature(b"{}", &header, SECRET, 300, now),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn any_matching_v1_is_accepted() {
        let now = Utc::now();
        let good = sign_payload(b"{}", SECRET, now.timestamp());
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1=deadbeef,v1={good_sig}", now.timestamp());
        assert_eq!(verify_signature(b"{}", &header, SECRET, 300, now), Ok(()));
    }

    #[test]
    fn malformed_headers() {
        let now = Utc::now();
        assert_eq!(
            verify_signature(b"{}", "v1=abc", SECRET, 300, now),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(b"{}", &format!("t={}", now.timestamp()), SECRET, 300, now),
            Err(SignatureError::Malformed)
        );
    }
}
