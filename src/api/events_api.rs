use crate::api::auth;
use crate::api::{ApiError, AppState};
use crate::env::EnvironmentContext;
use crate::events::Endpoint;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::error;

/// POST /bulk - server-side analytics events
pub async fn server_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (env, _) = auth::server_env(&state, &headers)?;
    forward(&env, Endpoint::ServerEvents, body)
}

/// POST /diagnostic - server-side diagnostic events
pub async fn server_diagnostic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (env, _) = auth::server_env(&state, &headers)?;
    forward(&env, Endpoint::ServerDiagnostic, body)
}

/// POST /mobile, /mobile/events, /mobile/events/bulk - mobile events
pub async fn mobile_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (env, _) = auth::mobile_env(&state, &headers)?;
    forward(&env, Endpoint::MobileEvents, body)
}

/// POST /mobile/events/diagnostic - mobile diagnostic events
pub async fn mobile_diagnostic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (env, _) = auth::mobile_env(&state, &headers)?;
    forward(&env, Endpoint::MobileDiagnostic, body)
}

/// POST /events/bulk/{envId} - browser analytics events
pub async fn js_events(
    State(state): State<Arc<AppState>>,
    Path(env_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let env = auth::js_env(&state, &env_id)?;
    forward(&env, Endpoint::JsEvents, body)
}

/// POST /events/diagnostic/{envId} - browser diagnostic events
pub async fn js_diagnostic(
    State(state): State<Arc<AppState>>,
    Path(env_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let env = auth::js_env(&state, &env_id)?;
    forward(&env, Endpoint::JsDiagnostic, body)
}

/// Hands the body to the environment's dispatcher and acknowledges.
fn forward(env: &EnvironmentContext, endpoint: Endpoint, body: Bytes) -> Result<Response, ApiError> {
    let dispatcher = env.event_dispatcher().ok_or(ApiError::EventProxyDisabled)?;
    if !dispatcher.handles(endpoint) {
        // Only reachable if an environment is missing the credential kind a
        // routed endpoint implies
        error!(endpoint = endpoint.name(), "Tried to proxy events for unsupported endpoint");
        return Err(ApiError::EventProxyFailed);
    }
    dispatcher.forward(endpoint, body.to_vec());
    Ok(StatusCode::ACCEPTED.into_response())
}
