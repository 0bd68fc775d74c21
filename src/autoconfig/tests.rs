use super::*;
use crate::env::{EnvironmentRegistry, EventForwarding};
use serde_json::json;

#[derive(Debug, PartialEq)]
enum Call {
    Add(String, u64),
    Update(String, u64),
    Delete(String),
}

#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<Call>>,
}

impl RecordingHandler {
    async fn drain(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().await)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn add_environment(&self, rep: EnvironmentRep) {
        self.calls
            .lock()
            .await
            .push(Call::Add(rep.env_id.clone(), rep.version));
    }

    async fn update_environment(&self, rep: EnvironmentRep) {
        self.calls
            .lock()
            .await
            .push(Call::Update(rep.env_id.clone(), rep.version));
    }

    async fn delete_environment(&self, env_id: &str) {
        self.calls.lock().await.push(Call::Delete(env_id.to_string()));
    }
}

fn manager() -> (Arc<StreamManager>, Arc<RecordingHandler>) {
    let handler = Arc::new(RecordingHandler::default());
    let manager = Arc::new(StreamManager::new(
        "https://stream.example.com",
        "rel-autoconf-key",
        Arc::clone(&handler) as Arc<dyn MessageHandler>,
    ));
    (manager, handler)
}

fn env_rep(env_id: &str, version: u64) -> serde_json::Value {
    json!({
        "envID": env_id,
        "envKey": "production",
        "envName": "Production",
        "projKey": "demo",
        "projName": "Demo",
        "mobKey": format!("mob-{}", env_id),
        "sdkKey": {"value": format!("sdk-{}", env_id)},
        "defaultTtl": 0,
        "secureMode": false,
        "version": version
    })
}

fn put_event(reps: &[serde_json::Value]) -> String {
    let mut environments = serde_json::Map::new();
    for rep in reps {
        environments.insert(rep["envID"].as_str().unwrap().to_string(), rep.clone());
    }
    json!({"path": "/", "data": {"environments": environments}}).to_string()
}

#[tokio::test]
async fn test_put_adds_all_environments() {
    let (manager, handler) = manager();
    manager
        .handle_event("put", &put_event(&[env_rep("env1", 1), env_rep("env2", 1)]))
        .await;

    let mut calls = handler.drain().await;
    calls.sort_by_key(|c| format!("{:?}", c));
    assert_eq!(
        calls,
        vec![
            Call::Add("env1".to_string(), 1),
            Call::Add("env2".to_string(), 1)
        ]
    );
}

#[tokio::test]
async fn test_replaying_identical_put_is_idempotent() {
    let (manager, handler) = manager();
    let event = put_event(&[env_rep("env1", 1)]);
    manager.handle_event("put", &event).await;
    handler.drain().await;

    // Reconnect replay: no adds, no deletes, no updates
    manager.handle_event("put", &event).await;
    assert_eq!(handler.drain().await, vec![]);
}

#[tokio::test]
async fn test_put_removes_environments_missing_from_full_set() {
    let (manager, handler) = manager();
    manager
        .handle_event("put", &put_event(&[env_rep("env1", 1), env_rep("env2", 1)]))
        .await;
    handler.drain().await;

    manager
        .handle_event("put", &put_event(&[env_rep("env1", 1)]))
        .await;
    assert_eq!(handler.drain().await, vec![Call::Delete("env2".to_string())]);
}

#[tokio::test]
async fn test_patch_adds_then_updates() {
    let (manager, handler) = manager();
    let patch = |version: u64| {
        json!({"path": "/environments/env1", "data": env_rep("env1", version)}).to_string()
    };

    manager.handle_event("patch", &patch(1)).await;
    assert_eq!(handler.drain().await, vec![Call::Add("env1".to_string(), 1)]);

    manager.handle_event("patch", &patch(2)).await;
    assert_eq!(
        handler.drain().await,
        vec![Call::Update("env1".to_string(), 2)]
    );
}

#[tokio::test]
async fn test_stale_patch_is_ignored() {
    let (manager, handler) = manager();
    let patch = |version: u64| {
        json!({"path": "/environments/env1", "data": env_rep("env1", version)}).to_string()
    };
    manager.handle_event("patch", &patch(5)).await;
    handler.drain().await;

    manager.handle_event("patch", &patch(5)).await;
    manager.handle_event("patch", &patch(4)).await;
    assert_eq!(handler.drain().await, vec![]);
}

#[tokio::test]
async fn test_delete_applies_at_equal_or_newer_version() {
    let (manager, handler) = manager();
    manager
        .handle_event("patch", &json!({"path": "/environments/env1", "data": env_rep("env1", 3)}).to_string())
        .await;
    handler.drain().await;

    // Older than stored: ignored
    manager
        .handle_event("delete", &json!({"path": "/environments/env1", "version": 2}).to_string())
        .await;
    assert_eq!(handler.drain().await, vec![]);

    // Equal version: applied
    manager
        .handle_event("delete", &json!({"path": "/environments/env1", "version": 3}).to_string())
        .await;
    assert_eq!(handler.drain().await, vec![Call::Delete("env1".to_string())]);

    // A patch older than the recorded delete stays dead
    manager
        .handle_event("patch", &json!({"path": "/environments/env1", "data": env_rep("env1", 2)}).to_string())
        .await;
    assert_eq!(handler.drain().await, vec![]);
}

#[tokio::test]
async fn test_malformed_and_unknown_events_are_skipped() {
    let (manager, handler) = manager();
    manager.handle_event("put", "{not json").await;
    manager.handle_event("patch", "{}").await;
    manager.handle_event("reconfigure", "{}").await;
    assert_eq!(handler.drain().await, vec![]);
}

fn registry_actions() -> (Arc<EnvironmentRegistry>, RegistryActions) {
    let registry = Arc::new(EnvironmentRegistry::new(
        Duration::from_secs(30),
        None::<EventForwarding>,
    ));
    let actions = RegistryActions::new(Arc::clone(&registry));
    (registry, actions)
}

fn rep_with_keys(env_id: &str, sdk_key: &str, mob_key: &str, version: u64) -> EnvironmentRep {
    serde_json::from_value(json!({
        "envID": env_id,
        "envKey": "production",
        "envName": "Production",
        "projKey": "demo",
        "projName": "Demo",
        "mobKey": mob_key,
        "sdkKey": {"value": sdk_key},
        "version": version
    }))
    .unwrap()
}

#[tokio::test]
async fn test_actions_add_and_delete_environment() {
    let (registry, actions) = registry_actions();
    actions
        .add_environment(rep_with_keys("env1", "sdk-1", "mob-1", 1))
        .await;

    let env = registry.get("env1").unwrap();
    assert_eq!(env.identifiers().display_name(), "Demo Production");
    assert!(registry
        .index()
        .lookup(&Credential::SdkKey("sdk-1".to_string()))
        .is_some());

    actions.delete_environment("env1").await;
    assert!(registry.get("env1").is_none());
    assert!(registry
        .index()
        .lookup(&Credential::SdkKey("sdk-1".to_string()))
        .is_none());
}

#[tokio::test]
async fn test_actions_sdk_key_rotation_without_expiry_removes_old_key() {
    let (registry, actions) = registry_actions();
    actions
        .add_environment(rep_with_keys("env1", "sdk-old", "mob-1", 1))
        .await;
    actions
        .update_environment(rep_with_keys("env1", "sdk-new", "mob-1", 2))
        .await;

    assert!(registry
        .index()
        .lookup(&Credential::SdkKey("sdk-new".to_string()))
        .is_some());
    assert!(registry
        .index()
        .lookup(&Credential::SdkKey("sdk-old".to_string()))
        .is_none());
}

#[tokio::test]
async fn test_actions_sdk_key_rotation_with_expiring_key_keeps_old_until_deadline() {
    let (registry, actions) = registry_actions();
    actions
        .add_environment(rep_with_keys("env1", "sdk-old", "mob-1", 1))
        .await;

    let mut rep = rep_with_keys("env1", "sdk-new", "mob-1", 2);
    rep.sdk_key.expiring = Some(messages::ExpiringKeyRep {
        value: "sdk-old".to_string(),
        timestamp: (chrono::Utc::now() + chrono::Duration::milliseconds(150)).timestamp_millis(),
    });
    actions.update_environment(rep).await;

    // Grace window: both keys resolve
    assert!(registry
        .index()
        .lookup(&Credential::SdkKey("sdk-new".to_string()))
        .is_some());
    assert!(registry
        .index()
        .lookup(&Credential::SdkKey("sdk-old".to_string()))
        .is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(registry
        .index()
        .lookup(&Credential::SdkKey("sdk-old".to_string()))
        .is_none());
    assert!(registry
        .index()
        .lookup(&Credential::SdkKey("sdk-new".to_string()))
        .is_some());
}

#[tokio::test]
async fn test_actions_mobile_key_rotation_swaps_immediately() {
    let (registry, actions) = registry_actions();
    actions
        .add_environment(rep_with_keys("env1", "sdk-1", "mob-old", 1))
        .await;
    actions
        .update_environment(rep_with_keys("env1", "sdk-1", "mob-new", 2))
        .await;

    assert!(registry
        .index()
        .lookup(&Credential::MobileKey("mob-new".to_string()))
        .is_some());
    assert!(registry
        .index()
        .lookup(&Credential::MobileKey("mob-old".to_string()))
        .is_none());
}

#[tokio::test]
async fn test_actions_update_applies_ttl_and_secure_mode() {
    let (registry, actions) = registry_actions();
    actions
        .add_environment(rep_with_keys("env1", "sdk-1", "mob-1", 1))
        .await;

    let mut rep = rep_with_keys("env1", "sdk-1", "mob-1", 2);
    rep.default_ttl = 5;
    rep.secure_mode = true;
    actions.update_environment(rep).await;

    let env = registry.get("env1").unwrap();
    assert_eq!(env.ttl(), Duration::from_secs(300));
    assert!(env.secure_mode());
}

#[tokio::test]
async fn test_identical_update_leaves_credentials_untouched() {
    let (registry, actions) = registry_actions();
    actions
        .add_environment(rep_with_keys("env1", "sdk-1", "mob-1", 1))
        .await;
    let env = registry.get("env1").unwrap();
    let before = {
        let mut creds = env.credentials();
        creds.sort_by_key(|c| c.value().to_string());
        creds
    };

    actions
        .update_environment(rep_with_keys("env1", "sdk-1", "mob-1", 1))
        .await;
    let after = {
        let mut creds = env.credentials();
        creds.sort_by_key(|c| c.value().to_string());
        creds
    };
    assert_eq!(before, after);
}
