use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{routing::post, Extension, Router};
use chrono::Utc;
use serde_json::json;
use tower::ServiceExt; // for `oneshot`

use marketplace_billing::audit::MemoryAuditSink;
use marketplace_billing::billing::{
    start_reconciliation_worker, BillingService, PlanCatalog, ProcessorEnvelope, Reconciler,
};
use marketplace_billing::store::MemoryStore;
use marketplace_billing::webhooks::{
    billing_webhook, sign_payload, WebhookSettings, SIGNATURE_HEADER,
};

const SECRET: &str = "whsec_integration";

fn app(secret: Option<&str>) -> (Router, MemoryStore, Reconciler) {
    let store = MemoryStore::new();
    let billing = BillingService::new(Arc::new(store.clone()), Arc::new(MemoryAuditSink::new()));
    let reconciler = Reconciler::new(billing, Arc::new(PlanCatalog::builtin()), None);
    let handle = start_reconciliation_worker(reconciler.clone());
    let router = Router::new()
        .route("/api/webhooks/billing", post(billing_webhook))
        .layer(Extension(WebhookSettings {
            secret: secret.map(str::to_string),
            tolerance_secs: 300,
        }))
        .layer(Extension(reconciler.clone()))
        .layer(Extension(handle));
    (router, store, reconciler)
}

fn event_body(id: &str) -> String {
    json!({
        "id": id,
        "type": "customer.created",
        "created": Utc::now().timestamp(),
        "data": { "object": { "id": "cus_1" } },
    })
    .to_string()
}

fn request(body: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/webhooks/billing")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn signed_event_is_accepted_and_recorded() {
    let (app, store, _) = app(Some(SECRET));
    let body = event_body("evt_signed");
    let signature = sign_payload(body.as_bytes(), SECRET, Utc::now().timestamp());

    let response = app.oneshot(request(&body, Some(signature))).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(store.event_count().await, 1);
}

#[tokio::test]
async fn bad_signature_is_rejected_before_recording() {
    let (app, store, _) = app(Some(SECRET));
    let body = event_body("evt_forged");
    let signature = sign_payload(body.as_bytes(), "not-the-secret", Utc::now().timestamp());

    let response = app.oneshot(request(&body, Some(signature))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(store.event_count().await, 0);
}

#[tokio::test]
async fn missing_signature_header_is_bad_request() {
    let (app, store, _) = app(Some(SECRET));
    let response = app
        .oneshot(request(&event_body("evt_unsigned"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.event_count().await, 0);
}

#[tokio::test]
async fn unconfigured_secret_rejects_everything() {
    let (app, _, _) = app(None);
    let body = event_body("evt_any");
    let signature = sign_payload(body.as_bytes(), SECRET, Utc::now().timestamp());
    let response = app.oneshot(request(&body, Some(signature))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn processed_redelivery_is_acknowledged() {
    let (app, store, reconciler) = app(Some(SECRET));
    let body = event_body("evt_redelivered");
    let envelope =
        ProcessorEnvelope::parse(serde_json::from_str(&body).unwrap(), Utc::now()).unwrap();
    reconciler.ingest_and_reconcile(envelope).await.unwrap();

    let signature = sign_payload(body.as_bytes(), SECRET, Utc::now().timestamp());
    let response = app.oneshot(request(&body, Some(signature))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.event_count().await, 1);
}

#[tokio::test]
async fn event_without_id_is_bad_request() {
    let (app, _, _) = app(Some(SECRET));
    let body = json!({ "type": "invoice.paid" }).to_string();
    let signature = sign_payload(body.as_bytes(), SECRET, Utc::now().timestamp());
    let response = app.oneshot(request(&body, Some(signature))).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
