use crate::api::auth::{self, ClientSideQuery, UserSource};
use crate::api::{ApiError, AppState, SdkKind};
use crate::env::{EnvironmentContext, EnvironmentError};
use crate::stream::{Channel, StreamEvent};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;

/// GET /all - server-side stream carrying both flags and segments
pub async fn all_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (env, _) = auth::server_env(&state, &headers)?;
    debug!(user_agent = auth::user_agent(&headers), "Application requested server-side /all stream");
    stream_response(&env, Channel::All)
}

/// GET /flags - older server-side stream carrying flags only
pub async fn flags_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (env, _) = auth::server_env(&state, &headers)?;
    debug!(user_agent = auth::user_agent(&headers), "Application requested server-side /flags stream");
    stream_response(&env, Channel::Flags)
}

/// GET /mping - mobile ping stream
pub async fn mobile_ping_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (env, _) = auth::mobile_env(&state, &headers)?;
    debug!("Application requested mobile ping stream");
    stream_response(&env, Channel::Ping)
}

/// GET /meval/{user} - mobile ping stream with user validation
pub async fn mobile_eval_stream_get(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (env, _) = auth::mobile_env(&state, &headers)?;
    auth::client_side_user(
        &env,
        SdkKind::Mobile,
        &Method::GET,
        &headers,
        UserSource::Path(&user),
        None,
    )?;
    debug!("Application requested mobile eval stream");
    stream_response(&env, Channel::Ping)
}

/// REPORT /meval - mobile ping stream, user in the body
pub async fn mobile_eval_stream_report(
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::require_report(&method)?;
    let (env, _) = auth::mobile_env(&state, &headers)?;
    auth::client_side_user(
        &env,
        SdkKind::Mobile,
        &method,
        &headers,
        UserSource::Body(&body),
        None,
    )?;
    debug!("Application requested mobile eval stream");
    stream_response(&env, Channel::Ping)
}

/// GET /ping/{envId} - browser ping stream
pub async fn js_ping_stream(
    State(state): State<Arc<AppState>>,
    Path(env_id): Path<String>,
) -> Result<Response, ApiError> {
    let env = auth::js_env(&state, &env_id)?;
    debug!("Application requested client-side ping stream");
    stream_response(&env, Channel::Ping)
}

/// GET /eval/{envId}/{user} - browser ping stream with user validation and
/// secure-mode enforcement
pub async fn js_eval_stream_get(
    State(state): State<Arc<AppState>>,
    Path((env_id, user)): Path<(String, String)>,
    Query(query): Query<ClientSideQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let env = auth::js_env(&state, &env_id)?;
    auth::client_side_user(
        &env,
        SdkKind::JsClient,
        &Method::GET,
        &headers,
        UserSource::Path(&user),
        query.h.as_deref(),
    )?;
    debug!("Application requested client-side eval stream");
    stream_response(&env, Channel::Ping)
}

/// REPORT /eval/{envId} - browser ping stream, user in the body
pub async fn js_eval_stream_report(
    State(state): State<Arc<AppState>>,
    Path(env_id): Path<String>,
    Query(query): Query<ClientSideQuery>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::require_report(&method)?;
    let env = auth::js_env(&state, &env_id)?;
    auth::client_side_user(
        &env,
        SdkKind::JsClient,
        &method,
        &headers,
        UserSource::Body(&body),
        query.h.as_deref(),
    )?;
    debug!("Application requested client-side eval stream");
    stream_response(&env, Channel::Ping)
}

/// Attaches the caller to a fan-out channel as an SSE response.
///
/// The subscription already carries the replay event; the keepalive comment
/// interval comes from the environment's heartbeat configuration.
fn stream_response(env: &EnvironmentContext, channel: Channel) -> Result<Response, ApiError> {
    let subscription = env.subscribe(channel).map_err(|e| match e {
        EnvironmentError::StoreRead(e) => ApiError::StoreRead(e.to_string()),
        _ => ApiError::StreamClosed,
    })?;
    let keepalive = env.streams().keepalive_interval();

    let stream = subscription.map(|event| Ok::<_, Infallible>(sse_event(event)));
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keepalive))
        .into_response();

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    Ok(response)
}

fn sse_event(event: StreamEvent) -> Event {
    let mut sse = Event::default().event(event.name).data(event.data);
    if let Some(id) = event.id {
        sse = sse.id(id);
    }
    sse
}
