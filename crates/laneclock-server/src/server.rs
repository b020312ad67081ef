use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use laneclock_core::{Clock, ConnectionId, Role, SystemClock};
use laneclock_telemetry::{LogQuery, LogRecord, SqliteLogSink};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ConnectionRegistry};
use crate::config::ServerConfig;
use crate::gateway::{Delivery, SessionGateway};
use crate::protocol::{self, ProtocolError, SessionSnapshot};

const GATEWAY_QUEUE: usize = 1024;

/// Everything the gateway task consumes, in arrival order.
#[derive(Debug)]
pub enum GatewayInput {
    Frame { from: ConnectionId, raw: String },
    Disconnected { connection: ConnectionId },
    Snapshot { reply: oneshot::Sender<SessionSnapshot> },
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid allowed origin: {0}")]
    InvalidOrigin(String),
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub inbound: mpsc::Sender<GatewayInput>,
    pub heartbeat_interval: Duration,
    pub started: Instant,
    /// Persisted WARN+ events, when telemetry was given a database.
    pub logs: Option<Arc<SqliteLogSink>>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/logs", get(logs_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// CORS policy: one configured origin, or any origin when unset.
pub fn cors_layer(allowed_origin: Option<&str>) -> Result<CorsLayer, ServerError> {
    match allowed_origin {
        None => Ok(CorsLayer::permissive()),
        Some(origin) => {
            let value = origin
                .parse::<HeaderValue>()
                .map_err(|_| ServerError::InvalidOrigin(origin.to_string()))?;
            Ok(CorsLayer::new()
                .allow_origin(value)
                .allow_methods([Method::GET, Method::POST]))
        }
    }
}

/// Start the server on the wall clock. `logs` backs `GET /logs`.
pub async fn start(config: ServerConfig, logs: Option<Arc<SqliteLogSink>>) -> Result<ServerHandle, ServerError> {
    start_with_clock(config, Arc::new(SystemClock), logs).await
}

/// Start the server with an explicit time source.
pub async fn start_with_clock(
    config: ServerConfig,
    clock: Arc<dyn Clock>,
    logs: Option<Arc<SqliteLogSink>>,
) -> Result<ServerHandle, ServerError> {
    let cors = cors_layer(config.allowed_origin.as_deref())?;
    let cancel = CancellationToken::new();
    let registry = Arc::new(ConnectionRegistry::new(config.max_send_queue));

    let cleanup = client::start_cleanup_task(
        Arc::clone(&registry),
        config.heartbeat_interval(),
        config.client_timeout(),
        cancel.clone(),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel::<GatewayInput>(GATEWAY_QUEUE);
    let gateway = tokio::spawn(run_gateway(
        SessionGateway::new(clock),
        inbound_rx,
        Arc::clone(&registry),
        cancel.clone(),
    ));

    let state = AppState {
        registry,
        inbound: inbound_tx,
        heartbeat_interval: config.heartbeat_interval(),
        started: Instant::now(),
        logs,
    };
    let router = build_router(state, cors);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(port = local_addr.port(), "Race timing server started");

    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "Server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        cancel,
        tasks: vec![server, gateway, cleanup],
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Signal every task to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait up to `timeout` for tasks to finish.
    pub async fn shutdown_and_wait(self, timeout: Duration) {
        self.shutdown();
        let drain = futures::future::join_all(self.tasks);
        if tokio::time::timeout(timeout, drain).await.is_err() {
            tracing::warn!("Shutdown timed out after {timeout:?}");
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.registry.register();
    tracing::info!(connection_id = %connection_id, "WebSocket client connected");

    client::handle_ws_connection(
        socket,
        connection_id,
        rx,
        state.registry,
        state.inbound,
        state.heartbeat_interval,
    )
    .await;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    pub race_active: bool,
    pub held_roles: Vec<Role>,
}

/// Health check HTTP endpoint. Reads session state through the gateway
/// queue so it never observes a half-applied event.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (reply, rx) = oneshot::channel();
    let snapshot = match state.inbound.send(GatewayInput::Snapshot { reply }).await {
        Ok(()) => rx.await.ok(),
        Err(_) => None,
    };

    let Some(snapshot) = snapshot else {
        let body = serde_json::json!({ "status": "unavailable" });
        return (StatusCode::SERVICE_UNAVAILABLE, Json(body));
    };

    let resp = HealthResponse {
        status: "ok",
        uptime_secs: state.started.elapsed().as_secs(),
        connections: state.registry.count(),
        race_active: snapshot.start_timestamp.is_some(),
        held_roles: snapshot.held_roles,
    };
    (StatusCode::OK, Json(serde_json::to_value(resp).unwrap_or_default()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsResponse {
    /// False when the server runs without a log database.
    pub enabled: bool,
    pub total_count: usize,
    pub logs: Vec<LogRecord>,
}

/// Persisted WARN+ events, newest first. Filters come from the query string
/// (`level`, `connectionId`, `role`, `event`, `lane`, `since`, `limit`).
async fn logs_handler(State(state): State<AppState>, Query(query): Query<LogQuery>) -> impl IntoResponse {
    let Some(sink) = state.logs else {
        let resp = LogsResponse {
            enabled: false,
            total_count: 0,
            logs: Vec::new(),
        };
        return (StatusCode::OK, Json(resp)).into_response();
    };

    match sink.query(&query) {
        Ok(logs) => {
            let resp = LogsResponse {
                enabled: true,
                total_count: logs.len(),
                logs,
            };
            (StatusCode::OK, Json(resp)).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Log query failed");
            let body = serde_json::json!({ "error": e.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

/// The single owner of session state. Processes inputs one at a time.
pub async fn run_gateway(
    mut gateway: SessionGateway,
    mut rx: mpsc::Receiver<GatewayInput>,
    registry: Arc<ConnectionRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let input = tokio::select! {
            _ = cancel.cancelled() => break,
            input = rx.recv() => match input {
                Some(input) => input,
                None => break,
            },
        };

        match input {
            GatewayInput::Frame { from, raw } => {
                let event = match protocol::parse_frame(&raw) {
                    Ok(event) => event,
                    Err(e @ ProtocolError::InvalidLane { .. }) => {
                        tracing::debug!(connection_id = %from, error = %e, "Dropped frame");
                        continue;
                    }
                    Err(e) => {
                        let role = gateway.roles().role_of(&from).map(|r| r.to_string());
                        tracing::warn!(connection_id = %from, role = role.as_deref(), error = %e, "Dropped frame");
                        continue;
                    }
                };
                for delivery in gateway.handle(&from, event) {
                    deliver(&registry, &from, delivery);
                }
            }
            GatewayInput::Disconnected { connection } => {
                gateway.disconnect(&connection);
            }
            GatewayInput::Snapshot { reply } => {
                let _ = reply.send(gateway.snapshot());
            }
        }
    }
    tracing::info!("Gateway stopped");
}

fn deliver(registry: &ConnectionRegistry, from: &ConnectionId, delivery: Delivery) {
    let (event, broadcast) = match delivery {
        Delivery::Broadcast(event) => (event, true),
        Delivery::Reply(event) => (event, false),
    };
    let json = match event.to_json() {
        Ok(json) => json,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize outbound event");
            return;
        }
    };
    if broadcast {
        registry.broadcast(&json);
    } else {
        registry.send_to(from, json);
    }
}
