use super::*;
use crate::env::{EnvIdentifiers, EnvironmentParams, EnvironmentRegistry};
use chrono::Duration as ChronoDuration;
use std::time::Duration;

fn params(name: &str, sdk_key: &str) -> EnvironmentParams {
    EnvironmentParams {
        identifiers: EnvIdentifiers {
            name: name.to_string(),
            ..Default::default()
        },
        sdk_key: Some(sdk_key.to_string()),
        ..Default::default()
    }
}

async fn registry_with_env(
    name: &str,
    sdk_key: &str,
) -> (EnvironmentRegistry, Arc<EnvironmentContext>) {
    let registry = EnvironmentRegistry::new(Duration::from_secs(30), None);
    let env = registry.add_environment(params(name, sdk_key)).await.unwrap();
    (registry, env)
}

#[test]
fn test_credential_kinds_and_values() {
    let sdk = Credential::SdkKey("sdk-abc".to_string());
    let mobile = Credential::MobileKey("mob-abc".to_string());
    let env_id = Credential::EnvironmentId("envid".to_string());

    assert_eq!(sdk.kind(), CredentialKind::SdkKey);
    assert_eq!(mobile.kind(), CredentialKind::MobileKey);
    assert_eq!(env_id.kind(), CredentialKind::EnvironmentId);

    assert_eq!(sdk.authorization_header(), Some("sdk-abc"));
    assert_eq!(env_id.authorization_header(), None);
}

#[test]
fn test_obscure_key_masks_hex_middle() {
    assert_eq!(obscure_key("sdk-12345678-abcde"), "sdk-********-abcde");
    // Non-hex characters in the middle stay visible
    assert_eq!(obscure_key("sdk-z2345678-abcde"), "sdk-z*******-abcde");
    // Short keys are left alone
    assert_eq!(obscure_key("short"), "short");
    assert_eq!(obscure_key("12345678"), "12345678");
}

#[tokio::test]
async fn test_lookup_resolves_added_credential() {
    let (registry, env) = registry_with_env("main", "sdk-key-1").await;
    let credential = Credential::SdkKey("sdk-key-1".to_string());

    let resolved = registry.index().lookup(&credential).unwrap();
    assert!(Arc::ptr_eq(&resolved, &env));
    assert!(registry
        .index()
        .lookup(&Credential::SdkKey("unknown".to_string()))
        .is_none());
}

#[tokio::test]
async fn test_add_replaces_existing_binding() {
    let registry = EnvironmentRegistry::new(Duration::from_secs(30), None);
    let first = registry.add_environment(params("a", "shared-key")).await.unwrap();
    let second = registry.add_environment(params("b", "other-key")).await.unwrap();

    let credential = Credential::SdkKey("shared-key".to_string());
    assert!(Arc::ptr_eq(
        &registry.index().lookup(&credential).unwrap(),
        &first
    ));

    // Rebinding the same credential to another environment replaces the old
    second.add_credential(credential.clone());
    assert!(Arc::ptr_eq(
        &registry.index().lookup(&credential).unwrap(),
        &second
    ));
}

#[tokio::test]
async fn test_deprecated_credential_resolves_until_expiry() {
    let (registry, _env) = registry_with_env("main", "old-key").await;
    let credential = Credential::SdkKey("old-key".to_string());

    let until = Utc::now() + ChronoDuration::milliseconds(100);
    registry.index().deprecate(&credential, until);

    assert!(registry.index().lookup(&credential).is_some());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(registry.index().lookup(&credential).is_none());
}

#[tokio::test]
async fn test_remove_drops_active_and_deprecated() {
    let (registry, _env) = registry_with_env("main", "key-1").await;
    let credential = Credential::SdkKey("key-1".to_string());

    registry.index().remove(&credential);
    assert!(registry.index().lookup(&credential).is_none());
}

#[tokio::test]
async fn test_index_holds_weak_references_only() {
    let (registry, env) = registry_with_env("main", "key-1").await;
    let credential = Credential::SdkKey("key-1".to_string());

    registry.remove_environment("main");
    drop(env);
    // Even if removal had left the entry behind, upgrade would fail
    assert!(registry.index().lookup(&credential).is_none());
}
