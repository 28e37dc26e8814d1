use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum_prometheus::PrometheusMetricLayer;
use tower::ServiceExt; // for `oneshot`

use marketplace_billing::routes::app_routes;

#[tokio::test]
async fn root_and_metrics_respond_ok() {
    let (layer, handle) = PrometheusMetricLayer::pair();
    let app = app_routes(move || handle.render()).layer(layer);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert_eq!(body, "Marketplace Billing API".as_bytes());

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
