use crate::env::{EnvIdentifiers, EnvironmentParams, ExpiringSdkKey};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// One environment as described by the control plane.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentRep {
    #[serde(rename = "envID")]
    pub env_id: String,
    #[serde(default)]
    pub env_key: String,
    #[serde(default)]
    pub env_name: String,
    #[serde(default)]
    pub proj_key: String,
    #[serde(default)]
    pub proj_name: String,
    #[serde(default)]
    pub mob_key: String,
    #[serde(default)]
    pub sdk_key: SdkKeyRep,
    /// Minutes; zero disables caching headers
    #[serde(default)]
    pub default_ttl: u64,
    #[serde(default)]
    pub secure_mode: bool,
    #[serde(default)]
    pub version: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct SdkKeyRep {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub expiring: Option<ExpiringKeyRep>,
}

/// A previous SDK key that stays valid until its timestamp (unix millis).
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ExpiringKeyRep {
    pub value: String,
    pub timestamp: i64,
}

impl EnvironmentRep {
    pub fn to_params(&self) -> EnvironmentParams {
        let name = format!("{} {}", self.proj_name, self.env_name)
            .trim()
            .to_string();
        let expiring_sdk_key = self.sdk_key.expiring.as_ref().and_then(|rep| {
            let expiry = Utc.timestamp_millis_opt(rep.timestamp).single()?;
            Some(ExpiringSdkKey {
                key: rep.value.clone(),
                expiry,
            })
        });
        EnvironmentParams {
            identifiers: EnvIdentifiers {
                name,
                proj_key: some_if_nonempty(&self.proj_key),
                env_key: some_if_nonempty(&self.env_key),
            },
            sdk_key: some_if_nonempty(&self.sdk_key.value),
            mobile_key: some_if_nonempty(&self.mob_key),
            env_id: some_if_nonempty(&self.env_id),
            expiring_sdk_key,
            secure_mode: self.secure_mode,
            ttl: Duration::from_secs(self.default_ttl * 60),
        }
    }
}

fn some_if_nonempty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// `put` payload: the full set of environments.
#[derive(Clone, Debug, Deserialize)]
pub struct PutMessage {
    #[serde(default)]
    pub path: String,
    pub data: PutData,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PutData {
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentRep>,
}

/// `patch` payload: upsert of one environment.
#[derive(Clone, Debug, Deserialize)]
pub struct PatchMessage {
    #[serde(default)]
    pub path: String,
    pub data: EnvironmentRep,
}

/// `delete` payload: removal of one environment, version-guarded.
#[derive(Clone, Debug, Deserialize)]
pub struct DeleteMessage {
    pub path: String,
    pub version: u64,
}

impl DeleteMessage {
    pub fn env_id(&self) -> Option<&str> {
        self.path.strip_prefix("/environments/")
    }
}
