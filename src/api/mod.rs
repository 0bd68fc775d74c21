use crate::env::EnvironmentRegistry;
use crate::store::FeatureStore;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum::{middleware, Router};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

pub mod auth;
pub mod cors;
pub mod eval_api;
pub mod events_api;
pub mod poll;
pub mod streaming;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<EnvironmentRegistry>,
}

/// Which kind of SDK a request claims to come from; decides credential
/// handling, secure-mode enforcement, and client-side flag filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdkKind {
    Server,
    Mobile,
    JsClient,
}

/// Builds the full relay routing table.
pub fn create_router(state: AppState) -> Router {
    let js_routes = Router::new()
        .route("/ping/:env_id", get(streaming::js_ping_stream))
        .route("/eval/:env_id/:user", get(streaming::js_eval_stream_get))
        .route("/eval/:env_id", any(streaming::js_eval_stream_report))
        .route(
            "/sdk/evalx/:env_id/users/:user",
            get(eval_api::evalx_js_get),
        )
        .route("/sdk/evalx/:env_id/user", any(eval_api::evalx_js_report))
        .route("/sdk/eval/:env_id/users/:user", get(eval_api::eval_js_get))
        .route("/sdk/eval/:env_id/user", any(eval_api::eval_js_report))
        .route("/events/bulk/:env_id", post(events_api::js_events))
        .route("/events/diagnostic/:env_id", post(events_api::js_diagnostic))
        .layer(middleware::from_fn(cors::cors_middleware));

    Router::new()
        // Server-side SDK endpoints (Authorization: SDK key)
        .route("/all", get(streaming::all_stream))
        .route("/flags", get(streaming::flags_stream))
        .route("/sdk/flags", get(poll::poll_all_flags))
        .route("/sdk/flags/:key", get(poll::poll_flag))
        .route("/sdk/segments/:key", get(poll::poll_segment))
        .route("/sdk/evalx/users/:user", get(eval_api::evalx_server_get))
        .route("/sdk/evalx/user", any(eval_api::evalx_server_report))
        .route("/sdk/eval/users/:user", get(eval_api::eval_server_get))
        .route("/sdk/eval/user", any(eval_api::eval_server_report))
        .route("/bulk", post(events_api::server_events))
        .route("/diagnostic", post(events_api::server_diagnostic))
        // Mobile SDK endpoints (Authorization: mobile key)
        .route("/mping", get(streaming::mobile_ping_stream))
        .route("/meval/:user", get(streaming::mobile_eval_stream_get))
        .route("/meval", any(streaming::mobile_eval_stream_report))
        .route("/mobile", post(events_api::mobile_events))
        .route("/mobile/events", post(events_api::mobile_events))
        .route("/mobile/events/bulk", post(events_api::mobile_events))
        .route("/mobile/events/diagnostic", post(events_api::mobile_diagnostic))
        // Browser (JS client) endpoints, addressed by environment ID
        .merge(js_routes)
        .route("/status", get(status))
        .with_state(Arc::new(state))
}

/// Error response body: `{"message": …}`
#[derive(Serialize)]
struct ErrorResponse {
    message: String,
}

/// Handler-level errors mapped onto the HTTP surface
#[derive(Debug, PartialEq)]
pub enum ApiError {
    /// Unknown or missing server/mobile credential
    Unauthorized,
    /// Unknown environment ID in a URL
    UnknownEnvironment,
    BadRequest(String),
    /// REPORT body with the wrong content type
    UnsupportedMediaType,
    MethodNotAllowed,
    /// Neither the client nor the store has data yet
    NotInitialized,
    EventProxyDisabled,
    EventProxyFailed,
    StoreRead(String),
    StreamClosed,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Invalid authorization key".to_string()),
            ApiError::UnknownEnvironment => (
                StatusCode::NOT_FOUND,
                "Unknown environment ID".to_string(),
            ),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::UnsupportedMediaType => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Content-Type must be application/json.".to_string(),
            ),
            ApiError::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                "Method not allowed".to_string(),
            ),
            ApiError::NotInitialized => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service not initialized".to_string(),
            ),
            ApiError::EventProxyDisabled => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Event proxy is not enabled for this environment".to_string(),
            ),
            ApiError::EventProxyFailed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Internal error in event proxy".to_string(),
            ),
            ApiError::StoreRead(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
            ApiError::StreamClosed => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Environment is shutting down".to_string(),
            ),
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

/// GET /status - per-environment connection state
async fn status(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    let mut environments = serde_json::Map::new();
    for env in state.registry.all() {
        let identifiers = env.identifiers();
        environments.insert(
            identifiers.display_name(),
            json!({
                "dataSource": format!("{:?}", env.data_source_state()),
                "initialized": env.store().is_initialized(),
                "subscribers": {
                    "all": env.streams().subscriber_count(crate::stream::Channel::All),
                    "flags": env.streams().subscriber_count(crate::stream::Channel::Flags),
                    "ping": env.streams().subscriber_count(crate::stream::Channel::Ping),
                }
            }),
        );
    }
    Json(json!({"environments": environments}))
}
