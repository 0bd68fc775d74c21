use crate::credential::Credential;
use crate::env::EnvironmentRegistry;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use rand::Rng;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub mod messages;
pub use messages::{DeleteMessage, EnvironmentRep, PatchMessage, PutMessage};

#[cfg(test)]
mod tests;

const STREAM_PATH: &str = "/relay_auto_config";
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Receives environment lifecycle decisions computed from the control-plane
/// stream. The stream manager owns diffing and version guarding; the handler
/// only applies changes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn add_environment(&self, rep: EnvironmentRep);
    async fn update_environment(&self, rep: EnvironmentRep);
    async fn delete_environment(&self, env_id: &str);
}

/// A single long-lived SSE subscription to the control plane's
/// auto-configuration stream.
///
/// Consumes `put`, `patch`, and `delete` events describing the full set of
/// environments and drives the handler accordingly. Transient failures
/// reconnect with jittered exponential backoff; a 401/403 response means the
/// auto-config key is bad and terminates the loop for good.
pub struct StreamManager {
    stream_uri: String,
    auto_config_key: String,
    handler: Arc<dyn MessageHandler>,
    /// Last seen version per environment ID; entries persist across deletes
    /// so stale patches and deletes can be ignored.
    versions: Mutex<HashMap<String, u64>>,
    /// Environment IDs currently considered present.
    present: Mutex<HashSet<String>>,
}

impl StreamManager {
    pub fn new(stream_uri: &str, auto_config_key: &str, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            stream_uri: stream_uri.trim_end_matches('/').to_string(),
            auto_config_key: auto_config_key.to_string(),
            handler,
            versions: Mutex::new(HashMap::new()),
            present: Mutex::new(HashSet::new()),
        }
    }

    /// Runs until the control plane rejects the auto-config key.
    pub async fn run(self: Arc<Self>) {
        let mut consecutive_failures: u32 = 0;
        loop {
            info!(uri = %self.stream_uri, "Connecting to auto-configuration stream");
            match self.connect_and_process().await {
                Ok(()) => {
                    debug!("Auto-configuration stream ended; reconnecting");
                    consecutive_failures = 0;
                }
                Err(e) => {
                    if let Some(Unauthorized(status)) = e.downcast_ref::<Unauthorized>() {
                        error!(
                            status = *status,
                            "Auto-configuration key was rejected; giving up on the stream"
                        );
                        return;
                    }
                    warn!(error = %e, "Auto-configuration stream failed");
                    consecutive_failures += 1;
                }
            }

            let delay = reconnect_delay(consecutive_failures);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_process(&self) -> Result<()> {
        let client = reqwest::Client::new();
        let response = client
            .get(format!("{}{}", self.stream_uri, STREAM_PATH))
            .header(AUTHORIZATION, &self.auto_config_key)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .context("Failed to connect to auto-configuration stream")?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(anyhow!(Unauthorized(status.as_u16())));
        }
        if !status.is_success() {
            bail!("unexpected HTTP status {} from auto-configuration stream", status);
        }

        info!("Auto-configuration stream established");
        let mut events = response.bytes_stream().eventsource();
        while let Some(event) = events.next().await {
            let event = event.context("Auto-configuration stream read failed")?;
            self.handle_event(&event.event, &event.data).await;
        }
        Ok(())
    }

    /// Applies one stream event. Unknown event names and malformed payloads
    /// are logged and skipped so one bad message cannot wedge the stream.
    pub async fn handle_event(&self, name: &str, data: &str) {
        match name {
            "put" => match serde_json::from_str::<PutMessage>(data) {
                Ok(message) => self.apply_put(message).await,
                Err(e) => warn!(error = %e, "Malformed auto-config put event"),
            },
            "patch" => match serde_json::from_str::<PatchMessage>(data) {
                Ok(message) => self.apply_patch(message.data).await,
                Err(e) => warn!(error = %e, "Malformed auto-config patch event"),
            },
            "delete" => match serde_json::from_str::<DeleteMessage>(data) {
                Ok(message) => self.apply_delete(message).await,
                Err(e) => warn!(error = %e, "Malformed auto-config delete event"),
            },
            other => debug!(event = %other, "Ignoring unknown auto-config event"),
        }
    }

    /// Full-state replacement: diff against what we believe exists and emit
    /// add/update/delete calls. Replaying the current state is a no-op apart
    /// from idempotent updates.
    async fn apply_put(&self, message: PutMessage) {
        let incoming = message.data.environments;

        let stale: Vec<String> = {
            let present = self.present.lock().await;
            present
                .iter()
                .filter(|id| !incoming.contains_key(*id))
                .cloned()
                .collect()
        };
        for env_id in stale {
            self.forget(&env_id).await;
            self.handler.delete_environment(&env_id).await;
        }

        for (env_id, rep) in incoming {
            let known = self.present.lock().await.contains(&env_id);
            if known {
                if self.advance_version(&env_id, rep.version).await {
                    self.handler.update_environment(rep).await;
                }
            } else {
                self.remember(&env_id, rep.version).await;
                self.handler.add_environment(rep).await;
            }
        }
    }

    async fn apply_patch(&self, rep: EnvironmentRep) {
        let env_id = rep.env_id.clone();
        let known = self.present.lock().await.contains(&env_id);
        if known {
            if self.advance_version(&env_id, rep.version).await {
                self.handler.update_environment(rep).await;
            } else {
                debug!(environment = %env_id, "Ignoring stale auto-config patch");
            }
        } else {
            // Re-adding after a delete still honors the version guard
            if self.version_newer(&env_id, rep.version).await {
                self.remember(&env_id, rep.version).await;
                self.handler.add_environment(rep).await;
            } else {
                debug!(environment = %env_id, "Ignoring stale auto-config patch");
            }
        }
    }

    async fn apply_delete(&self, message: DeleteMessage) {
        let env_id = match message.env_id() {
            Some(id) => id.to_string(),
            None => {
                warn!(path = %message.path, "Auto-config delete with unrecognized path");
                return;
            }
        };
        // Deletes apply when the version is at least the stored one
        if !self.version_at_least(&env_id, message.version).await {
            debug!(environment = %env_id, "Ignoring stale auto-config delete");
            return;
        }
        self.versions
            .lock()
            .await
            .insert(env_id.clone(), message.version);
        if self.present.lock().await.remove(&env_id) {
            self.handler.delete_environment(&env_id).await;
        }
    }

    async fn remember(&self, env_id: &str, version: u64) {
        self.versions
            .lock()
            .await
            .insert(env_id.to_string(), version);
        self.present.lock().await.insert(env_id.to_string());
    }

    async fn forget(&self, env_id: &str) {
        self.present.lock().await.remove(env_id);
    }

    /// True (and records the version) when `version` is newer than the last
    /// one seen for this environment.
    async fn advance_version(&self, env_id: &str, version: u64) -> bool {
        let mut versions = self.versions.lock().await;
        match versions.get(env_id) {
            Some(last) if *last >= version => false,
            _ => {
                versions.insert(env_id.to_string(), version);
                true
            }
        }
    }

    async fn version_newer(&self, env_id: &str, version: u64) -> bool {
        let versions = self.versions.lock().await;
        match versions.get(env_id) {
            Some(last) => *last < version,
            None => true,
        }
    }

    async fn version_at_least(&self, env_id: &str, version: u64) -> bool {
        let versions = self.versions.lock().await;
        match versions.get(env_id) {
            Some(last) => version >= *last,
            None => true,
        }
    }
}

fn reconnect_delay(consecutive_failures: u32) -> Duration {
    let factor = 2u64.saturating_pow(consecutive_failures.min(5));
    let capped = (RECONNECT_BASE_DELAY.as_millis() as u64 * factor)
        .min(RECONNECT_MAX_DELAY.as_millis() as u64);
    // Jitter the second half so reconnecting relays do not stampede
    let jittered = capped / 2 + rand::thread_rng().gen_range(0..=capped / 2);
    Duration::from_millis(jittered)
}

/// Marker error for a rejected auto-config key; `run` stops for good on this
/// instead of reconnecting.
#[derive(Debug)]
struct Unauthorized(u16);

impl std::fmt::Display for Unauthorized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "auto-configuration key rejected with HTTP status {}",
            self.0
        )
    }
}

impl std::error::Error for Unauthorized {}

/// Applies auto-configuration decisions to the environment registry,
/// including staged credential rotation.
pub struct RegistryActions {
    registry: Arc<EnvironmentRegistry>,
}

impl RegistryActions {
    pub fn new(registry: Arc<EnvironmentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl MessageHandler for RegistryActions {
    async fn add_environment(&self, rep: EnvironmentRep) {
        // Construction failures are logged by the registry; an environment
        // that failed to start is simply not registered.
        let _ = self.registry.add_environment(rep.to_params()).await;
    }

    async fn update_environment(&self, rep: EnvironmentRep) {
        let params = rep.to_params();
        let env = match self.registry.get(&params.stable_key()) {
            Some(env) => env,
            None => {
                error!(
                    environment = %params.stable_key(),
                    "Environment not found when applying auto-config update"
                );
                return;
            }
        };

        env.set_identifiers(params.identifiers.clone());
        env.set_ttl(params.ttl);
        env.set_secure_mode(params.secure_mode);

        let mut old_sdk_key = None;
        let mut old_mobile_key = None;
        for credential in env.credentials() {
            match credential {
                Credential::SdkKey(v) => old_sdk_key = Some(v),
                Credential::MobileKey(v) => old_mobile_key = Some(v),
                Credential::EnvironmentId(_) => {}
            }
        }

        if let Some(new_key) = &params.sdk_key {
            if old_sdk_key.as_deref() != Some(new_key) {
                env.add_credential(Credential::SdkKey(new_key.clone()));
                if let Some(old_key) = old_sdk_key {
                    let old = Credential::SdkKey(old_key.clone());
                    match &params.expiring_sdk_key {
                        // The announced expiring key is the one being rotated
                        // out: keep it resolving until its deadline
                        Some(expiring) if expiring.key == old_key => {
                            env.deprecate_credential(&old, expiring.expiry);
                        }
                        _ => env.remove_credential(&old),
                    }
                }
            }
        }

        if let Some(new_key) = &params.mobile_key {
            if old_mobile_key.as_deref() != Some(new_key) {
                env.add_credential(Credential::MobileKey(new_key.clone()));
                if let Some(old_key) = old_mobile_key {
                    env.remove_credential(&Credential::MobileKey(old_key));
                }
            }
        }
    }

    async fn delete_environment(&self, env_id: &str) {
        if !self.registry.remove_environment(env_id) {
            warn!(environment = %env_id, "Auto-config delete for unknown environment");
        }
    }
}
