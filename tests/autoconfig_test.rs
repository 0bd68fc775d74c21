// End-to-end tests for auto-configuration driving the HTTP surface

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use prism::api::{create_router, AppState};
use prism::autoconfig::{MessageHandler, RegistryActions, StreamManager};
use prism::env::EnvironmentRegistry;
use prism::store::DataSet;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn setup() -> (Arc<EnvironmentRegistry>, Arc<StreamManager>, Router) {
    let registry = Arc::new(EnvironmentRegistry::new(Duration::from_secs(30), None));
    let actions = Arc::new(RegistryActions::new(Arc::clone(&registry)));
    let manager = Arc::new(StreamManager::new(
        "https://stream.example.com",
        "rel-autoconf",
        actions as Arc<dyn MessageHandler>,
    ));
    let app = create_router(AppState {
        registry: Arc::clone(&registry),
    });
    (registry, manager, app)
}

fn env_rep(env_id: &str, sdk_key: &str, version: u64) -> serde_json::Value {
    json!({
        "envID": env_id,
        "envKey": "production",
        "envName": "Production",
        "projKey": "demo",
        "projName": "Demo",
        "mobKey": format!("mob-{}", env_id),
        "sdkKey": {"value": sdk_key},
        "version": version
    })
}

async fn poll_flags(app: &Router, sdk_key: &str) -> StatusCode {
    let request = Request::builder()
        .method("GET")
        .uri("/sdk/flags")
        .header(header::AUTHORIZATION, sdk_key)
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(request).await.unwrap().status()
}

async fn initialize_env(registry: &EnvironmentRegistry, env_id: &str) {
    let env = registry.get(env_id).unwrap();
    env.sink().init(DataSet::default());
}

#[tokio::test]
async fn test_patch_makes_environment_reachable_over_http() {
    let (registry, manager, app) = setup();

    assert_eq!(poll_flags(&app, "sdk-env1").await, StatusCode::UNAUTHORIZED);

    manager
        .handle_event(
            "patch",
            &json!({"path": "/environments/env1", "data": env_rep("env1", "sdk-env1", 1)})
                .to_string(),
        )
        .await;
    initialize_env(&registry, "env1").await;

    assert_eq!(poll_flags(&app, "sdk-env1").await, StatusCode::OK);
}

#[tokio::test]
async fn test_delete_closes_environment_and_credentials() {
    let (registry, manager, app) = setup();
    manager
        .handle_event(
            "patch",
            &json!({"path": "/environments/env1", "data": env_rep("env1", "sdk-env1", 1)})
                .to_string(),
        )
        .await;
    initialize_env(&registry, "env1").await;
    assert_eq!(poll_flags(&app, "sdk-env1").await, StatusCode::OK);

    manager
        .handle_event(
            "delete",
            &json!({"path": "/environments/env1", "version": 2}).to_string(),
        )
        .await;

    assert!(registry.get("env1").is_none());
    assert_eq!(poll_flags(&app, "sdk-env1").await, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_expiring_key_grace_window_end_to_end() {
    let (registry, manager, app) = setup();

    // Introduce the environment with an expiring previous key
    let mut rep = env_rep("env1", "sdk-new", 1);
    rep["sdkKey"]["expiring"] = json!({
        "value": "sdk-old",
        "timestamp": (Utc::now() + chrono::Duration::milliseconds(300)).timestamp_millis()
    });
    manager
        .handle_event(
            "patch",
            &json!({"path": "/environments/env1", "data": rep}).to_string(),
        )
        .await;
    initialize_env(&registry, "env1").await;

    // During the grace window both keys authenticate
    assert_eq!(poll_flags(&app, "sdk-old").await, StatusCode::OK);
    assert_eq!(poll_flags(&app, "sdk-new").await, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(400)).await;

    // The old key is gone, the new one still works
    assert_eq!(poll_flags(&app, "sdk-old").await, StatusCode::UNAUTHORIZED);
    assert_eq!(poll_flags(&app, "sdk-new").await, StatusCode::OK);
}

#[tokio::test]
async fn test_full_put_replay_does_not_disturb_subscribers() {
    let (registry, manager, app) = setup();
    let put = json!({"path": "/", "data": {"environments": {
        "env1": env_rep("env1", "sdk-env1", 1)
    }}})
    .to_string();

    manager.handle_event("put", &put).await;
    initialize_env(&registry, "env1").await;

    // Attach a subscriber and drain its replay event
    let env = registry.get("env1").unwrap();
    let mut subscription = env.subscribe(prism::stream::Channel::Ping).unwrap();
    assert_eq!(subscription.try_recv().unwrap().name, "ping");

    // Replaying the same full state must not emit events or drop anyone
    manager.handle_event("put", &put).await;
    assert_eq!(subscription.try_recv(), None);
    assert_eq!(poll_flags(&app, "sdk-env1").await, StatusCode::OK);

    // The environment object is untouched (no restart)
    assert!(Arc::ptr_eq(&env, &registry.get("env1").unwrap()));
}

#[tokio::test]
async fn test_sdk_key_rotation_over_http() {
    let (registry, manager, app) = setup();
    manager
        .handle_event(
            "patch",
            &json!({"path": "/environments/env1", "data": env_rep("env1", "sdk-v1", 1)})
                .to_string(),
        )
        .await;
    initialize_env(&registry, "env1").await;
    assert_eq!(poll_flags(&app, "sdk-v1").await, StatusCode::OK);

    // Rotate without a grace period: the old key dies immediately
    manager
        .handle_event(
            "patch",
            &json!({"path": "/environments/env1", "data": env_rep("env1", "sdk-v2", 2)})
                .to_string(),
        )
        .await;
    assert_eq!(poll_flags(&app, "sdk-v1").await, StatusCode::UNAUTHORIZED);
    assert_eq!(poll_flags(&app, "sdk-v2").await, StatusCode::OK);
}
