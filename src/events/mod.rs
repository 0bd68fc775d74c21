use crate::credential::Credential;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};


/// The fixed set of analytics endpoints the relay can proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    ServerEvents,
    ServerDiagnostic,
    MobileEvents,
    MobileDiagnostic,
    JsEvents,
    JsDiagnostic,
}

impl Endpoint {
    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::ServerEvents => "server events",
            Endpoint::ServerDiagnostic => "server diagnostic",
            Endpoint::MobileEvents => "mobile events",
            Endpoint::MobileDiagnostic => "mobile diagnostic",
            Endpoint::JsEvents => "JS events",
            Endpoint::JsDiagnostic => "JS diagnostic",
        }
    }

    fn upstream_path(&self, env_id: &str) -> String {
        match self {
            Endpoint::ServerEvents => "/bulk".to_string(),
            Endpoint::ServerDiagnostic => "/diagnostic".to_string(),
            Endpoint::MobileEvents => "/mobile".to_string(),
            Endpoint::MobileDiagnostic => "/mobile/events/diagnostic".to_string(),
            Endpoint::JsEvents => format!("/events/bulk/{}", env_id),
            Endpoint::JsDiagnostic => format!("/events/diagnostic/{}", env_id),
        }
    }
}

/// Forwards analytics event payloads to the upstream events service for one
/// environment.
///
/// Forwarding is asynchronous: handlers respond 202 as soon as the body is
/// handed off, and upstream failures are logged and dropped. The only
/// payload rewriting performed is substituting the environment's own
/// credential into the Authorization header.
#[derive(Clone)]
pub struct EventDispatcher {
    client: Client,
    events_uri: String,
    sdk_key: Option<String>,
    mobile_key: Option<String>,
    env_id: Option<String>,
}

impl EventDispatcher {
    pub fn new(
        events_uri: &str,
        timeout: Duration,
        credentials: &[Credential],
    ) -> Self {
        let mut sdk_key = None;
        let mut mobile_key = None;
        let mut env_id = None;
        for credential in credentials {
            match credential {
                Credential::SdkKey(v) => sdk_key = Some(v.clone()),
                Credential::MobileKey(v) => mobile_key = Some(v.clone()),
                Credential::EnvironmentId(v) => env_id = Some(v.clone()),
            }
        }
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            events_uri: events_uri.trim_end_matches('/').to_string(),
            sdk_key,
            mobile_key,
            env_id,
        }
    }

    /// Whether the environment has the credential this endpoint forwards
    /// with. The HTTP layer only routes known endpoints here, so a miss
    /// means the environment is missing that credential kind.
    pub fn handles(&self, endpoint: Endpoint) -> bool {
        match endpoint {
            Endpoint::ServerEvents | Endpoint::ServerDiagnostic => self.sdk_key.is_some(),
            Endpoint::MobileEvents | Endpoint::MobileDiagnostic => self.mobile_key.is_some(),
            Endpoint::JsEvents | Endpoint::JsDiagnostic => self.env_id.is_some(),
        }
    }

    /// Hands the payload off for asynchronous delivery upstream.
    pub fn forward(&self, endpoint: Endpoint, body: Vec<u8>) {
        let env_id = self.env_id.clone().unwrap_or_default();
        let url = format!("{}{}", self.events_uri, endpoint.upstream_path(&env_id));
        let auth = match endpoint {
            Endpoint::ServerEvents | Endpoint::ServerDiagnostic => self.sdk_key.clone(),
            Endpoint::MobileEvents | Endpoint::MobileDiagnostic => self.mobile_key.clone(),
            Endpoint::JsEvents | Endpoint::JsDiagnostic => None,
        };
        let client = self.client.clone();
        tokio::spawn(async move {
            let mut request = client
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .body(body);
            if let Some(auth) = auth {
                request = request.header(AUTHORIZATION, auth);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %url, "Forwarded event payload");
                }
                Ok(response) => {
                    warn!(url = %url, status = %response.status(), "Event delivery rejected upstream");
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to deliver events upstream");
                }
            }
        });
    }
}
