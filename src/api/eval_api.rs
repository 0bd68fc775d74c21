use crate::api::auth::{self, ClientSideQuery, UserSource};
use crate::api::{ApiError, AppState, SdkKind};
use crate::env::EnvironmentContext;
use crate::eval::{is_experiment, EvalXResult, Evaluator};
use crate::flags::User;
use crate::store::{DataKind, FeatureStore, StoreItem};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use std::sync::Arc;
use tracing::{debug, warn};

/// GET /sdk/evalx/users/{user} - new schema, server/mobile credential
pub async fn evalx_server_get(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    Query(query): Query<ClientSideQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (env, _) = auth::server_env(&state, &headers)?;
    let user = auth::client_side_user(
        &env,
        SdkKind::Server,
        &Method::GET,
        &headers,
        UserSource::Path(&user),
        None,
    )?;
    evaluate_all(&env, &user, SdkKind::Server, false, query.with_reasons())
}

/// REPORT /sdk/evalx/user - new schema, user in the body
pub async fn evalx_server_report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClientSideQuery>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::require_report(&method)?;
    let (env, _) = auth::server_env(&state, &headers)?;
    let user = auth::client_side_user(
        &env,
        SdkKind::Server,
        &method,
        &headers,
        UserSource::Body(&body),
        None,
    )?;
    evaluate_all(&env, &user, SdkKind::Server, false, query.with_reasons())
}

/// GET /sdk/eval/users/{user} - legacy value-only schema
pub async fn eval_server_get(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    Query(query): Query<ClientSideQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (env, _) = auth::server_env(&state, &headers)?;
    let user = auth::client_side_user(
        &env,
        SdkKind::Server,
        &Method::GET,
        &headers,
        UserSource::Path(&user),
        None,
    )?;
    evaluate_all(&env, &user, SdkKind::Server, true, query.with_reasons())
}

/// REPORT /sdk/eval/user - legacy schema, user in the body
pub async fn eval_server_report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ClientSideQuery>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::require_report(&method)?;
    let (env, _) = auth::server_env(&state, &headers)?;
    let user = auth::client_side_user(
        &env,
        SdkKind::Server,
        &method,
        &headers,
        UserSource::Body(&body),
        None,
    )?;
    evaluate_all(&env, &user, SdkKind::Server, true, query.with_reasons())
}

/// GET /sdk/evalx/{envId}/users/{user} - new schema for browser clients
pub async fn evalx_js_get(
    State(state): State<Arc<AppState>>,
    Path((env_id, user)): Path<(String, String)>,
    Query(query): Query<ClientSideQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let env = auth::js_env(&state, &env_id)?;
    let user = auth::client_side_user(
        &env,
        SdkKind::JsClient,
        &Method::GET,
        &headers,
        UserSource::Path(&user),
        query.h.as_deref(),
    )?;
    evaluate_all(&env, &user, SdkKind::JsClient, false, query.with_reasons())
}

/// REPORT /sdk/evalx/{envId}/user - new schema for browser clients
pub async fn evalx_js_report(
    State(state): State<Arc<AppState>>,
    Path(env_id): Path<String>,
    Query(query): Query<ClientSideQuery>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::require_report(&method)?;
    let env = auth::js_env(&state, &env_id)?;
    let user = auth::client_side_user(
        &env,
        SdkKind::JsClient,
        &method,
        &headers,
        UserSource::Body(&body),
        query.h.as_deref(),
    )?;
    evaluate_all(&env, &user, SdkKind::JsClient, false, query.with_reasons())
}

/// GET /sdk/eval/{envId}/users/{user} - legacy schema for browser clients
pub async fn eval_js_get(
    State(state): State<Arc<AppState>>,
    Path((env_id, user)): Path<(String, String)>,
    Query(query): Query<ClientSideQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let env = auth::js_env(&state, &env_id)?;
    let user = auth::client_side_user(
        &env,
        SdkKind::JsClient,
        &Method::GET,
        &headers,
        UserSource::Path(&user),
        query.h.as_deref(),
    )?;
    evaluate_all(&env, &user, SdkKind::JsClient, true, query.with_reasons())
}

/// REPORT /sdk/eval/{envId}/user - legacy schema for browser clients
pub async fn eval_js_report(
    State(state): State<Arc<AppState>>,
    Path(env_id): Path<String>,
    Query(query): Query<ClientSideQuery>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::require_report(&method)?;
    let env = auth::js_env(&state, &env_id)?;
    let user = auth::client_side_user(
        &env,
        SdkKind::JsClient,
        &method,
        &headers,
        UserSource::Body(&body),
        query.h.as_deref(),
    )?;
    evaluate_all(&env, &user, SdkKind::JsClient, true, query.with_reasons())
}

/// Evaluates every flag in the snapshot for one user.
///
/// Browser clients only see flags marked client-side. The legacy schema
/// emits bare values; the new schema carries evaluation metadata.
fn evaluate_all(
    env: &EnvironmentContext,
    user: &User,
    sdk_kind: SdkKind,
    value_only: bool,
    with_reasons: bool,
) -> Result<Response, ApiError> {
    if !env.client_initialized() {
        if env.store().is_initialized() {
            warn!("Called before client initialization; using last known values from feature store");
        } else {
            warn!("Called before client initialization; feature store not available");
            return Err(ApiError::NotInitialized);
        }
    }

    if user.key().is_empty() {
        return Err(ApiError::BadRequest(
            "User must have a 'key' attribute".to_string(),
        ));
    }

    debug!(user = %user.key(), "Application requested client-side flags");

    let items = env.store().get_all(DataKind::Flags).map_err(|e| {
        warn!(error = %e, "Unable to fetch flags from feature store");
        ApiError::StoreRead(format!("Error fetching flags from feature store: {}", e))
    })?;

    let store = env.store();
    let evaluator = Evaluator::new(store.as_ref());
    let mut response = serde_json::Map::new();
    for (key, descriptor) in items {
        let flag = match descriptor.item {
            Some(StoreItem::Flag(flag)) => flag,
            _ => continue,
        };
        if sdk_kind == SdkKind::JsClient && !flag.client_side {
            continue;
        }
        let detail = evaluator.evaluate(&flag, user);
        let entry = if value_only {
            detail.value
        } else {
            let experiment = is_experiment(&flag, &detail.reason);
            let result = EvalXResult {
                value: detail.value,
                variation: detail.variation_index,
                version: flag.version,
                track_events: flag.track_events || experiment,
                track_reason: experiment,
                reason: if with_reasons || experiment {
                    Some(detail.reason)
                } else {
                    None
                },
                debug_events_until_date: flag.debug_events_until_date.filter(|d| *d != 0),
            };
            serde_json::to_value(result).unwrap_or(serde_json::Value::Null)
        };
        response.insert(key, entry);
    }

    Ok((StatusCode::OK, Json(serde_json::Value::Object(response))).into_response())
}
