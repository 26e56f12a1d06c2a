//! HTTP handlers for the postbus server.
//!
//! Routes, relative to the configured mount path:
//!
//! - `POST /:client_id/poll[?dlp=t]` - long-poll for messages
//! - `GET /_diagnostics` - registry and listener counters (admin)
//! - `POST /_publish` - publish from out-of-process code (admin)
//!
//! plus `GET /health` at the root.

use crate::config::{BackendKind, Config};
use crate::lookup::{HeaderLookup, IdentityLookup, LookupError};
use crate::metrics::{self, PollMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use postbus_core::{
    BacklogError, BacklogStore, MemoryBacklog, MessageBus, MessageId, PublishOptions,
    MAX_BACKLOG_AGE,
};
use postbus_protocol::Envelope;
use postbus_transport::{ClientId, LongPoll, PollRequest, Transport, TransportError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The message bus.
    pub bus: Arc<MessageBus>,
    /// The long-poll transport.
    pub transport: LongPoll,
    /// Identity resolution.
    pub lookup: Arc<dyn IdentityLookup>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(bus: Arc<MessageBus>, lookup: Arc<dyn IdentityLookup>) -> Self {
        Self {
            transport: LongPoll::new(bus.clone()),
            bus,
            lookup,
        }
    }
}

/// Handler errors.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request.
    BadRequest(String),
    /// Caller is not an admin.
    Forbidden,
    /// The substrate could not serve the request.
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response(),
            ApiError::Forbidden => StatusCode::FORBIDDEN.into_response(),
            ApiError::Unavailable(message) => {
                metrics::record_error("substrate");
                error!(error = %message, "Substrate unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({ "error": "message bus unavailable" })),
                )
                    .into_response()
            }
        }
    }
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        if e.is_client_error() {
            ApiError::BadRequest(e.to_string())
        } else {
            ApiError::Unavailable(e.to_string())
        }
    }
}

impl From<BacklogError> for ApiError {
    fn from(e: BacklogError) -> Self {
        if e.is_invalid_input() {
            ApiError::BadRequest(e.to_string())
        } else {
            ApiError::Unavailable(e.to_string())
        }
    }
}

impl From<LookupError> for ApiError {
    fn from(e: LookupError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>, config: &Config) -> Router {
    let bus_routes = Router::new()
        .route("/:client_id/poll", post(poll_handler))
        .route("/_diagnostics", get(diagnostics_handler))
        .route("/_publish", post(publish_handler));

    let app = Router::new().route("/health", get(health_handler));
    let app = match config.mount_path() {
        "" => app.merge(bus_routes),
        mount => app.nest(mount, bus_routes),
    };

    app.layer(DefaultBodyLimit::max(config.poll.max_body_size))
        .with_state(state)
}

async fn build_store(config: &Config) -> Result<Arc<dyn BacklogStore>> {
    let backlog = config.backlog_config();
    let store: Arc<dyn BacklogStore> = match config.backend.kind {
        BackendKind::Memory => Arc::new(MemoryBacklog::with_config(backlog)),
        BackendKind::Redis => Arc::new(
            postbus_core::RedisBacklog::new(
                &config.backend.redis_url,
                config.backend.key_prefix.as_deref(),
                backlog,
            )
            .await
            .with_context(|| format!("Failed to connect to {}", config.backend.redis_url))?,
        ),
    };
    Ok(store)
}

/// Run the HTTP server.
///
/// # Errors
///
/// Returns an error if the substrate is unreachable or the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let store = build_store(&config).await?;
    let bus = Arc::new(MessageBus::new(store, config.bus_config()));
    bus.start();

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        metrics::spawn_sampler(bus.clone(), Duration::from_secs(5));
    }

    let lookup = Arc::new(HeaderLookup::new(config.identity.clone()));
    let state = Arc::new(AppState::new(bus.clone(), lookup));
    let app = router(state, &config);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("postbus server listening on {}", addr);
    info!("Poll endpoint: http://{}{}/:client_id/poll", addr, config.mount_path());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    bus.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
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

/// Poll query flags.
#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    /// `t` disables long polling for this request.
    #[serde(default)]
    pub dlp: Option<String>,
}

impl PollQuery {
    fn long_poll(&self) -> bool {
        self.dlp.as_deref() != Some("t")
    }
}

/// Long-poll handler.
async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
    Query(query): Query<PollQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Vec<Envelope>>, ApiError> {
    // Record poll metrics
    let _metrics_guard = PollMetricsGuard::new();

    let client_id = ClientId::parse(client_id)?;
    let identity = state.lookup.identity(&headers)?;
    let request = PollRequest::new(client_id.clone(), identity, body).with_long_poll(query.long_poll());

    let outcome = match state.transport.poll(request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(client = %client_id, error = %e, "Poll failed");
            metrics::record_error(if e.is_client_error() { "bad_request" } else { "backlog" });
            return Err(e.into());
        }
    };

    debug!(
        client = %client_id,
        outcome = outcome.state.as_str(),
        messages = outcome.messages.len(),
        "Poll answered"
    );
    metrics::record_poll(outcome.state.as_str(), outcome.messages.len());

    Ok(Json(outcome.into_envelopes()))
}

/// Diagnostics counters.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Diagnostics {
    /// Substrate name.
    pub backend: String,
    /// Clients currently parked.
    pub parked_clients: usize,
    /// Channels with parked subscribers.
    pub channels: usize,
    /// Parked subscriptions per site.
    pub subscriptions_per_site: BTreeMap<String, usize>,
    /// Whether the listener is disconnected.
    pub listener_degraded: bool,
    /// Listener reconnect attempts.
    pub listener_reconnects: u64,
    /// Highest global id seen by the listener.
    pub last_global_id: MessageId,
    /// Server process id.
    pub pid: u32,
}

/// Diagnostics handler, admin only.
async fn diagnostics_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Diagnostics>, ApiError> {
    if !state.lookup.is_admin(&headers) {
        return Err(ApiError::Forbidden);
    }

    let stats = state.bus.connections().stats();
    let listener = state.bus.listener_status();

    Ok(Json(Diagnostics {
        backend: state.bus.store().name().to_string(),
        parked_clients: stats.parked_clients,
        channels: stats.channel_count,
        subscriptions_per_site: stats.subscriptions_per_site,
        listener_degraded: listener.is_degraded(),
        listener_reconnects: listener.reconnects(),
        last_global_id: listener.last_global_id(),
        pid: std::process::id(),
    }))
}

/// HTTP publish request.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Target channel.
    pub channel: String,
    /// Payload.
    pub data: serde_json::Value,
    /// Site scope.
    #[serde(default)]
    pub site_id: Option<String>,
    /// User targeting.
    #[serde(default)]
    pub user_ids: Vec<i64>,
    /// Group targeting.
    #[serde(default)]
    pub group_ids: Vec<i64>,
    /// Client targeting.
    #[serde(default)]
    pub client_ids: Vec<String>,
    /// Channel backlog bound for this append.
    #[serde(default)]
    pub max_backlog_size: Option<usize>,
    /// Backlog expiry for this append, in seconds.
    #[serde(default)]
    pub max_backlog_age: Option<u64>,
}

impl PublishRequest {
    fn options(&self) -> Result<PublishOptions, ApiError> {
        let mut options = PublishOptions::new()
            .with_user_ids(self.user_ids.clone())
            .with_group_ids(self.group_ids.clone())
            .with_client_ids(self.client_ids.clone());
        if let Some(site_id) = &self.site_id {
            options = options.with_site(site_id.clone());
        }
        if let Some(size) = self.max_backlog_size {
            options = options.with_max_backlog_size(size);
        }
        if let Some(age) = self.max_backlog_age {
            if age > MAX_BACKLOG_AGE.as_secs() {
                return Err(ApiError::BadRequest(format!(
                    "max_backlog_age must be at most {} seconds",
                    MAX_BACKLOG_AGE.as_secs()
                )));
            }
            options = options.with_max_backlog_age(Duration::from_secs(age));
        }
        Ok(options)
    }
}

/// HTTP publish response.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PublishResponse {
    /// Channel id assigned to the message.
    pub message_id: MessageId,
}

/// Publish handler, admin only.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PublishResponse>, ApiError> {
    if !state.lookup.is_admin(&headers) {
        return Err(ApiError::Forbidden);
    }

    let request: PublishRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid publish request: {e}")))?;

    let message_id = state
        .bus
        .publish(&request.channel, request.data.clone(), request.options()?)
        .await?;
    metrics::record_published();

    debug!(channel = %request.channel, message_id, "Published over HTTP");
    Ok(Json(PublishResponse { message_id }))
}
