use crate::api::{ApiError, AppState, SdkKind};
use crate::credential::Credential;
use crate::env::EnvironmentContext;
use crate::flags::User;
use axum::http::{header, HeaderMap, Method};
use serde::Deserialize;
use std::sync::Arc;


/// Query parameters shared by the client-side endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ClientSideQuery {
    /// Secure-mode hash
    #[serde(default)]
    pub h: Option<String>,
    /// `withReasons=true` asks for evaluation reasons
    #[serde(default, rename = "withReasons")]
    pub with_reasons: Option<String>,
}

impl ClientSideQuery {
    pub fn with_reasons(&self) -> bool {
        self.with_reasons.as_deref() == Some("true")
    }
}

/// Reads the credential value out of the Authorization header. Mobile SDKs
/// may send an `api_key` scheme prefix; either form is accepted.
fn authorization_value(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let value = raw.strip_prefix("api_key ").unwrap_or(raw).trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Resolves a server-side SDK request; unknown keys get 401.
pub fn server_env(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(Arc<EnvironmentContext>, Credential), ApiError> {
    let credential =
        Credential::SdkKey(authorization_value(headers).ok_or(ApiError::Unauthorized)?);
    let env = state
        .registry
        .lookup_credential(&credential)
        .ok_or(ApiError::Unauthorized)?;
    Ok((env, credential))
}

/// Resolves a mobile SDK request; unknown keys get 401.
pub fn mobile_env(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(Arc<EnvironmentContext>, Credential), ApiError> {
    let credential =
        Credential::MobileKey(authorization_value(headers).ok_or(ApiError::Unauthorized)?);
    let env = state
        .registry
        .lookup_credential(&credential)
        .ok_or(ApiError::Unauthorized)?;
    Ok((env, credential))
}

/// Resolves a browser request by URL-embedded environment ID; unknown IDs
/// get 404 rather than 401, since the ID is an address, not a secret.
pub fn js_env(state: &AppState, env_id: &str) -> Result<Arc<EnvironmentContext>, ApiError> {
    let credential = Credential::EnvironmentId(env_id.to_string());
    state
        .registry
        .lookup_credential(&credential)
        .ok_or(ApiError::UnknownEnvironment)
}

/// Where the user representation arrives from.
pub enum UserSource<'a> {
    /// Base64 in a URL path segment (GET endpoints)
    Path(&'a str),
    /// JSON request body (REPORT endpoints)
    Body(&'a [u8]),
}

/// Decodes and validates the user carried by a client-side request,
/// enforcing secure mode for browser clients.
pub fn client_side_user(
    env: &EnvironmentContext,
    sdk_kind: SdkKind,
    method: &Method,
    headers: &HeaderMap,
    source: UserSource<'_>,
    secure_mode_hash: Option<&str>,
) -> Result<User, ApiError> {
    let user = match source {
        UserSource::Body(body) => {
            if method.as_str() == "REPORT" && !is_json_content(headers) {
                return Err(ApiError::UnsupportedMediaType);
            }
            serde_json::from_slice::<User>(body)
                .map_err(|e| ApiError::BadRequest(e.to_string()))?
        }
        UserSource::Path(encoded) => {
            User::from_base64(encoded).map_err(|e| ApiError::BadRequest(e.to_string()))?
        }
    };

    if env.secure_mode() && sdk_kind == SdkKind::JsClient {
        let valid = match (secure_mode_hash, env.secure_mode_hash(&user)) {
            (Some(hash), Some(expected)) if !hash.is_empty() => hash == expected,
            _ => false,
        };
        if !valid {
            return Err(ApiError::BadRequest(
                "Environment is in secure mode, and user hash does not match.".to_string(),
            ));
        }
    }

    Ok(user)
}

/// The relay-specific user agent header wins over the standard one; SDKs
/// behind intermediaries set it so logs show the real caller.
pub fn user_agent(headers: &HeaderMap) -> &str {
    headers
        .get("X-Prism-User-Agent")
        .or_else(|| headers.get(header::USER_AGENT))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn is_json_content(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim() == "application/json")
        .unwrap_or(false)
}

/// Guards the REPORT-only routes registered with `any`: axum's method filter
/// has no REPORT variant, so the check happens here.
pub fn require_report(method: &Method) -> Result<(), ApiError> {
    if method.as_str() == "REPORT" {
        Ok(())
    } else {
        Err(ApiError::MethodNotAllowed)
    }
}
