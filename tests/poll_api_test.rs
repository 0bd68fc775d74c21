// Integration tests for the cacheable polling endpoints

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use prism::api::{create_router, AppState};
use prism::env::{EnvIdentifiers, EnvironmentParams, EnvironmentRegistry};
use prism::flags::{FeatureFlag, Segment};
use prism::store::{DataSet, ItemDescriptor, StoreItem};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const SDK_KEY: &str = "sdk-poll";

async fn test_app(ttl: Duration) -> Router {
    let registry = Arc::new(EnvironmentRegistry::new(Duration::from_secs(30), None));
    let env = registry
        .add_environment(EnvironmentParams {
            identifiers: EnvIdentifiers {
                name: "poll".to_string(),
                ..Default::default()
            },
            sdk_key: Some(SDK_KEY.to_string()),
            ttl,
            ..Default::default()
        })
        .await
        .unwrap();

    let mut data = DataSet::default();
    let flag: FeatureFlag =
        serde_json::from_value(json!({"key": "a", "version": 3, "on": true})).unwrap();
    data.flags
        .insert("a".to_string(), ItemDescriptor::new(3, StoreItem::Flag(flag)));
    let segment: Segment = serde_json::from_value(json!({"key": "seg", "version": 5})).unwrap();
    data.segments.insert(
        "seg".to_string(),
        ItemDescriptor::new(5, StoreItem::Segment(segment)),
    );
    env.sink().init(data);

    create_router(AppState { registry })
}

fn get(path: &str, extra: &[(header::HeaderName, &str)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("GET")
        .uri(path)
        .header(header::AUTHORIZATION, SDK_KEY);
    for (name, value) in extra {
        builder = builder.header(name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_poll_all_flags_returns_map_with_etag() {
    let app = test_app(Duration::ZERO).await;
    let response = app.oneshot(get("/sdk/flags", &[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );

    let etag = response
        .headers()
        .get(header::ETAG)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(etag.starts_with("relay-"));

    let body = body_json(response).await;
    assert_eq!(body["a"]["version"], 3);
    assert_eq!(body["a"]["on"], true);
}

#[tokio::test]
async fn test_etag_is_stable_and_honors_if_none_match() {
    let app = test_app(Duration::ZERO).await;

    let first = app.clone().oneshot(get("/sdk/flags", &[])).await.unwrap();
    let etag = first
        .headers()
        .get(header::ETAG)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    // Unchanged snapshot: same etag on the second read
    let second = app.clone().oneshot(get("/sdk/flags", &[])).await.unwrap();
    assert_eq!(
        second.headers().get(header::ETAG).unwrap().to_str().unwrap(),
        etag
    );

    // Conditional request returns 304 with no body
    let conditional = app
        .oneshot(get("/sdk/flags", &[(header::IF_NONE_MATCH, etag.as_str())]))
        .await
        .unwrap();
    assert_eq!(conditional.status(), StatusCode::NOT_MODIFIED);
    let bytes = axum::body::to_bytes(conditional.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(bytes.is_empty());
}

#[tokio::test]
async fn test_poll_single_flag_and_segment() {
    let app = test_app(Duration::ZERO).await;

    let response = app.clone().oneshot(get("/sdk/flags/a", &[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::ETAG).unwrap().to_str().unwrap(),
        "relay-3"
    );
    let body = body_json(response).await;
    assert_eq!(body["key"], "a");

    let response = app
        .clone()
        .oneshot(get("/sdk/segments/seg", &[]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::ETAG).unwrap().to_str().unwrap(),
        "relay-5"
    );

    let response = app.oneshot(get("/sdk/flags/missing", &[])).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ttl_adds_expires_and_vary_headers() {
    let app = test_app(Duration::from_secs(300)).await;
    let response = app.oneshot(get("/sdk/flags", &[])).await.unwrap();

    assert_eq!(response.headers().get(header::VARY).unwrap(), "Authorization");
    let expires = response
        .headers()
        .get(header::EXPIRES)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(expires.ends_with("GMT"));
}

#[tokio::test]
async fn test_zero_ttl_omits_caching_headers() {
    let app = test_app(Duration::ZERO).await;
    let response = app.oneshot(get("/sdk/flags", &[])).await.unwrap();
    assert!(response.headers().get(header::VARY).is_none());
    assert!(response.headers().get(header::EXPIRES).is_none());
}

#[tokio::test]
async fn test_poll_requires_known_sdk_key() {
    let app = test_app(Duration::ZERO).await;
    let request = Request::builder()
        .method("GET")
        .uri("/sdk/flags")
        .header(header::AUTHORIZATION, "sdk-undefined")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
