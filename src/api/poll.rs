use crate::api::auth;
use crate::api::{ApiError, AppState};
use crate::env::EnvironmentContext;
use crate::store::{DataKind, FeatureStore};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::error;

/// GET /sdk/flags - polling endpoint serving the full flag map
pub async fn poll_all_flags(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (env, _) = auth::server_env(&state, &headers)?;
    let mut items = env.store().get_all(DataKind::Flags).map_err(|e| {
        error!(error = %e, "Error reading feature store");
        ApiError::StoreRead(e.to_string())
    })?;

    // Sorted digest of key:version pairs keeps the ETag independent of map
    // iteration order
    items.sort_by(|a, b| a.0.cmp(&b.0));
    let mut digest = Sha256::new();
    for (key, descriptor) in &items {
        digest.update(format!("{}:{}", key, descriptor.version).as_bytes());
    }
    let etag = hex::encode(digest.finalize())[..15].to_string();

    let mut body = serde_json::Map::new();
    for (key, descriptor) in items {
        if let Some(item) = descriptor.item {
            body.insert(key, item.to_json());
        }
    }
    Ok(cacheable_json_response(
        &env,
        &headers,
        &serde_json::Value::Object(body),
        &etag,
    ))
}

/// GET /sdk/flags/{key} - polling endpoint for one flag
pub async fn poll_flag(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    poll_item(&state, &headers, DataKind::Flags, &key)
}

/// GET /sdk/segments/{key} - polling endpoint for one segment
pub async fn poll_segment(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    poll_item(&state, &headers, DataKind::Segments, &key)
}

fn poll_item(
    state: &AppState,
    headers: &HeaderMap,
    kind: DataKind,
    key: &str,
) -> Result<Response, ApiError> {
    let (env, _) = auth::server_env(state, headers)?;
    let descriptor = env.store().get(kind, key).map_err(|e| {
        error!(error = %e, "Error reading feature store");
        ApiError::StoreRead(e.to_string())
    })?;
    match descriptor.and_then(|d| d.item.map(|item| (d.version, item))) {
        None => Ok(StatusCode::NOT_FOUND.into_response()),
        Some((version, item)) => Ok(cacheable_json_response(
            &env,
            headers,
            &item.to_json(),
            &version.to_string(),
        )),
    }
}

/// Writes a JSON body with a relay ETag, honoring conditional requests, and
/// adds caching headers when the environment has a TTL.
fn cacheable_json_response(
    env: &EnvironmentContext,
    request_headers: &HeaderMap,
    entity: &serde_json::Value,
    etag_value: &str,
) -> Response {
    // Prefixed so these are recognizably relay-generated etags
    let etag = format!("relay-{}", etag_value);
    if let Some(cached) = request_headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if cached == etag {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }

    let mut response = (StatusCode::OK, entity.to_string()).into_response();
    let ttl = env.ttl();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, value);
    }
    if !ttl.is_zero() {
        // An absolute Expires (rather than max-age) lets a shared cache in
        // front of the relay serve one expiry time to all clients
        headers.insert(header::VARY, HeaderValue::from_static("Authorization"));
        let expires = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let formatted = expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(value) = HeaderValue::from_str(&formatted) {
            headers.insert(header::EXPIRES, value);
        }
    }
    response
}
