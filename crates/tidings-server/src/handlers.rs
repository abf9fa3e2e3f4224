//! HTTP, SSE and WebSocket handlers.
//!
//! Publishing is `PUT`/`POST /<topic>` with the body as the message, or
//! `POST /` with a JSON object. Subscribing is `GET /<topic>/json`,
//! `/<topic>/sse` or `/<topic>/ws`; `poll=1` returns retained messages
//! and ends, `wait=30s` long-polls.

use crate::config::Config;
use crate::feed::event_feed;
use crate::metrics::{self, StreamMetricsGuard};
use anyhow::Result;
use axum::{
    body::Body,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use futures_util::{stream, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tidings_core::{
    Attachment, Broker, BrokerError, Cursor, FilterParams, Identity, Priority, PublishRequest,
    SubscribeRequest, Subscription,
};
use tidings_protocol::{codec, Event, ProtocolError};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub broker: Arc<Broker>,
    /// Server configuration.
    pub config: Config,
}

/// Errors returned to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Unknown access token")]
    Unauthorized,

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Broker(e) => {
                StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Broker(e) = &self {
            metrics::record_error(e);
        }
        let status = self.status();
        let body = serde_json::json!({
            "code": status.as_u16(),
            "error": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(publish_json_handler))
        .route("/health", get(health_handler))
        .route("/v1/stats", get(stats_handler))
        .route("/v1/visitor", get(visitor_handler))
        .route("/:topic", put(publish_handler).post(publish_handler))
        .route("/:topic/json", get(json_handler))
        .route("/:topic/sse", get(sse_handler))
        .route("/:topic/ws", get(ws_handler))
        .route(
            "/:topic/push",
            put(push_register_handler).delete(push_unregister_handler),
        )
        .with_state(state)
}

/// Run the HTTP server until interrupted.
///
/// # Errors
///
/// Returns an error if the broker or the listener fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let mut builder = Broker::builder(config.broker_config()).authorizer(config.authorizer()?);
    if let Some(persistence) = config.persistence() {
        builder = builder.persistence(persistence);
    }
    let broker = builder.build();
    broker.start().await?;

    if config.metrics.enabled {
        match config.metrics_addr() {
            Ok(addr) => {
                if let Err(e) = metrics::start_metrics_server(addr) {
                    error!("Failed to start metrics server: {}", e);
                }
            }
            Err(e) => error!("Failed to start metrics server: {}", e),
        }
    }
    tokio::spawn(refresh_stats(Arc::downgrade(&broker)));

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState {
        broker: Arc::clone(&broker),
        config,
    });
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Tidings server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Closing subscriptions ends open streams so connections can drain.
        broker.shutdown().await;
    })
    .await?;

    info!("Tidings server stopped");
    Ok(())
}

async fn refresh_stats(broker: std::sync::Weak<Broker>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        ticker.tick().await;
        let Some(broker) = broker.upgrade() else {
            break;
        };
        if broker.is_shutting_down() {
            break;
        }
        metrics::record_stats(&broker.stats());
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.broker.stats();
    metrics::record_stats(&stats);
    Json(stats)
}

/// Quota usage of the calling visitor.
async fn visitor_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let identity = identity(&state.config, &headers, peer)?;
    let stats = state
        .broker
        .visitor(&identity)
        .stats(state.broker.now_ms());
    Ok(Json(serde_json::json!({
        "visitor": identity.visitor_id().to_string(),
        "limits": stats,
    })))
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(topic): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Event>, ApiError> {
    let identity = identity(&state.config, &headers, peer)?;
    let request = publish_request(topic, body, &headers, &params)?;
    publish(&state, request, &identity).await
}

/// JSON publish body for `POST /`.
#[derive(Debug, Deserialize)]
struct PublishBody {
    topic: String,
    #[serde(default)]
    message: String,
    title: Option<String>,
    priority: Option<Priority>,
    #[serde(default)]
    tags: Vec<String>,
    click: Option<String>,
    attach: Option<String>,
    attach_size: Option<u64>,
    filename: Option<String>,
    cache: Option<bool>,
    push: Option<bool>,
    expires: Option<String>,
}

impl PublishBody {
    fn into_request(self) -> Result<PublishRequest, ApiError> {
        let mut request = PublishRequest::new(self.topic, self.message).with_tags(self.tags);
        if let Some(title) = self.title {
            request = request.with_title(title);
        }
        if let Some(priority) = self.priority {
            request = request.with_priority(priority);
        }
        if let Some(click) = self.click {
            request = request.with_click(click);
        }
        if let Some(url) = self.attach {
            request = request.with_attachment(attachment(url, self.filename, self.attach_size));
        }
        if self.cache == Some(false) {
            request = request.uncached();
        }
        if let Some(push) = self.push {
            request = request.with_push(push);
        }
        if let Some(expires) = self.expires {
            request = request.with_ttl(parse_duration("expires", &expires)?);
        }
        Ok(request)
    }
}

async fn publish_json_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<PublishBody>,
) -> Result<Json<Event>, ApiError> {
    let identity = identity(&state.config, &headers, peer)?;
    publish(&state, body.into_request()?, &identity).await
}

async fn publish(
    state: &AppState,
    request: PublishRequest,
    identity: &Identity,
) -> Result<Json<Event>, ApiError> {
    let start = Instant::now();
    let message = state.broker.publish(request, identity).await?;
    metrics::record_publish(message.body.len(), start.elapsed().as_secs_f64());
    Ok(Json(message.to_event()))
}

/// Subscribe query parameters.
#[derive(Debug, Default, Deserialize)]
struct SubscribeParams {
    since: Option<String>,
    poll: Option<String>,
    wait: Option<String>,
    format: Option<String>,
    id: Option<String>,
    message: Option<String>,
    title: Option<String>,
    priority: Option<String>,
    tags: Option<String>,
}

impl SubscribeParams {
    fn is_poll(&self) -> bool {
        self.poll.as_deref().is_some_and(is_truthy)
    }

    /// Without `since`, polls replay everything retained and streams start
    /// live.
    fn request(&self, topic: String, now_ms: u64) -> Result<SubscribeRequest, BrokerError> {
        let cursor = match self.since.as_deref() {
            Some(since) => Cursor::parse(since, now_ms)?,
            None if self.is_poll() => Cursor::All,
            None => Cursor::None,
        };
        let filter = FilterParams {
            id: self.id.clone(),
            message: self.message.clone(),
            title: self.title.clone(),
            priority: self.priority.clone(),
            tags: self.tags.clone(),
        };
        SubscribeRequest::from_params(topic, &filter, cursor)
    }
}

#[derive(Debug, Clone, Copy)]
enum LineFormat {
    Json,
    Sse,
}

impl LineFormat {
    fn content_type(self) -> &'static str {
        match self {
            LineFormat::Json => "application/x-ndjson; charset=utf-8",
            LineFormat::Sse => "text/event-stream",
        }
    }

    fn encode(self, event: &Event) -> Result<Bytes, ProtocolError> {
        match self {
            LineFormat::Json => codec::encode_json_line(event),
            LineFormat::Sse => codec::encode_sse(event).map(Bytes::from),
        }
    }
}

async fn json_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(topic): Path<String>,
    Query(params): Query<SubscribeParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    subscribe_lines(&state, peer, topic, &params, &headers, LineFormat::Json).await
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(topic): Path<String>,
    Query(params): Query<SubscribeParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    subscribe_lines(&state, peer, topic, &params, &headers, LineFormat::Sse).await
}

async fn subscribe_lines(
    state: &Arc<AppState>,
    peer: SocketAddr,
    topic: String,
    params: &SubscribeParams,
    headers: &HeaderMap,
    format: LineFormat,
) -> Result<Response, ApiError> {
    let identity = identity(&state.config, headers, peer)?;
    let now = state.broker.now_ms();

    if params.is_poll() {
        metrics::record_poll("poll");
        let messages = state.broker.poll(params.request(topic, now)?, &identity).await?;
        let events: Vec<Event> = messages.iter().map(|m| m.to_event()).collect();
        return Ok(line_response(stream::iter(events), format, None));
    }

    if let Some(wait) = params.wait.as_deref() {
        let wait = parse_duration("wait", wait)?.min(state.config.stream.long_poll_max);
        metrics::record_poll("long_poll");
        let messages = state
            .broker
            .long_poll(params.request(topic, now)?, &identity, wait)
            .await?;
        let events: Vec<Event> = messages.iter().map(|m| m.to_event()).collect();
        return Ok(line_response(stream::iter(events), format, None));
    }

    let subscription = state
        .broker
        .subscribe(params.request(topic, now)?, &identity)
        .await?;
    debug!(topic = subscription.topic(), visitor = %identity.visitor_id(), "Stream opened");
    let guard = StreamMetricsGuard::new(match format {
        LineFormat::Json => "json",
        LineFormat::Sse => "sse",
    });
    let events = event_feed(
        subscription,
        Arc::clone(&state.broker),
        state.config.stream.keepalive,
    );
    Ok(line_response(events, format, Some(guard)))
}

fn line_response<S>(events: S, format: LineFormat, guard: Option<StreamMetricsGuard>) -> Response
where
    S: Stream<Item = Event> + Send + 'static,
{
    let body = events.map(move |event| {
        let _open = &guard;
        format.encode(&event)
    });
    (
        [
            (header::CONTENT_TYPE, format.content_type()),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

/// WebSocket subscribe. The subscription is made before the upgrade so
/// refusals come back as plain HTTP errors.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(topic): Path<String>,
    Query(params): Query<SubscribeParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let identity = identity(&state.config, &headers, peer)?;
    let binary = match params.format.as_deref() {
        None | Some("json") => false,
        Some("msgpack") => true,
        Some(other) => return Err(ApiError::BadRequest(format!("Unknown format: {other}"))),
    };
    let subscription = state
        .broker
        .subscribe(params.request(topic, state.broker.now_ms())?, &identity)
        .await?;
    let broker = Arc::clone(&state.broker);
    let keepalive = state.config.stream.keepalive;
    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, subscription, broker, keepalive, binary)))
}

async fn handle_websocket(
    socket: WebSocket,
    subscription: Subscription,
    broker: Arc<Broker>,
    keepalive: Duration,
    binary: bool,
) {
    let _metrics_guard = StreamMetricsGuard::new("ws");
    let topic = subscription.topic().to_string();
    debug!(topic = %topic, "WebSocket subscriber connected");

    let (mut sender, mut receiver) = socket.split();
    let mut events = Box::pin(event_feed(subscription, broker, keepalive));

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    break;
                };
                let frame = match ws_frame(&event, binary) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sender.send(frame).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Ping(data))) => {
                    if sender.send(WsMessage::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(topic = %topic, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    }

    let _ = sender.close().await;
    debug!(topic = %topic, "WebSocket subscriber disconnected");
}

fn ws_frame(event: &Event, binary: bool) -> Result<WsMessage, ProtocolError> {
    if binary {
        Ok(WsMessage::Binary(codec::encode(event)?.to_vec()))
    } else {
        Ok(WsMessage::Text(serde_json::to_string(event)?))
    }
}

#[derive(Debug, Deserialize)]
struct PushEndpoint {
    endpoint: String,
}

async fn push_register_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PushEndpoint>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = identity(&state.config, &headers, peer)?;
    let added = state
        .broker
        .register_push(&topic, &body.endpoint, &identity)
        .await?;
    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(serde_json::json!({ "topic": topic, "endpoint": body.endpoint }))))
}

async fn push_unregister_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PushEndpoint>,
) -> Result<StatusCode, ApiError> {
    let identity = identity(&state.config, &headers, peer)?;
    let removed = state
        .broker
        .unregister_push(&topic, &body.endpoint, &identity)
        .await?;
    Ok(if removed {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    })
}

/// Resolve the caller: a bearer token names a user, otherwise the visitor
/// is anonymous and keyed by address.
fn identity(config: &Config, headers: &HeaderMap, peer: SocketAddr) -> Result<Identity, ApiError> {
    let addr = client_addr(headers, peer, config.behind_proxy);
    match bearer_token(headers) {
        None => Ok(Identity::anonymous(addr)),
        Some(token) => config
            .user_for_token(token)
            .map(|user| Identity::user(addr, user))
            .ok_or(ApiError::Unauthorized),
    }
}

fn client_addr(headers: &HeaderMap, peer: SocketAddr, behind_proxy: bool) -> IpAddr {
    if behind_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// First of `names` found as a header, then as a query parameter.
fn field(headers: &HeaderMap, params: &HashMap<String, String>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| headers.get(*n).and_then(|v| v.to_str().ok()).map(str::to_string))
        .or_else(|| names.iter().find_map(|n| params.get(*n).cloned()))
        .filter(|v| !v.trim().is_empty())
}

fn publish_request(
    topic: String,
    body: String,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<PublishRequest, ApiError> {
    let get = |names: &[&str]| field(headers, params, names);
    let mut request = PublishRequest::new(topic, body);

    if let Some(title) = get(&["x-title", "title", "t"]) {
        request = request.with_title(title);
    }
    if let Some(priority) = get(&["x-priority", "priority", "p"]) {
        let parsed = priority
            .parse::<Priority>()
            .map_err(|e| ApiError::BadRequest(format!("{e}: {priority}")))?;
        request = request.with_priority(parsed);
    }
    if let Some(tags) = get(&["x-tags", "tags", "ta"]) {
        request = request.with_tags(
            tags.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        );
    }
    if let Some(click) = get(&["x-click", "click"]) {
        request = request.with_click(click);
    }
    if let Some(url) = get(&["x-attach", "attach", "a"]) {
        let name = get(&["x-filename", "filename", "f"]);
        let size = get(&["x-attach-size", "attach-size"])
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| ApiError::BadRequest(format!("Invalid attachment size {raw:?}")))
            })
            .transpose()?;
        request = request.with_attachment(attachment(url, name, size));
    }
    if get(&["x-cache", "cache"]).is_some_and(|v| !is_truthy(&v)) {
        request = request.uncached();
    }
    if let Some(push) = get(&["x-push", "push"]) {
        request = request.with_push(is_truthy(&push));
    }
    if let Some(expires) = get(&["x-expires", "expires"]) {
        request = request.with_ttl(parse_duration("expires", &expires)?);
    }
    Ok(request)
}

/// Size stays unset when not declared; the broker rejects such attachments.
fn attachment(url: String, name: Option<String>, size: Option<u64>) -> Attachment {
    let mut attachment = Attachment::from_url(url);
    if let Some(name) = name {
        attachment.name = name;
    }
    attachment.size = size;
    attachment
}

fn parse_duration(what: &str, value: &str) -> Result<Duration, ApiError> {
    humantime::parse_duration(value.trim())
        .map_err(|e| ApiError::BadRequest(format!("Invalid {what} duration {value:?}: {e}")))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "yes" | "true" | "on"
    )
}
