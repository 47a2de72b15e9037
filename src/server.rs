//! HTTP control surface and notification push.
//!
//! This module provides an HTTP server that:
//! - Exposes the receiver's control operations under `/api/v1/trigger`
//! - Accepts message notifications via POST `/api/v1/notifications`
//! - Accepts training-service logs via POST `/api/v1/notifications/training_logs`
//! - Accepts pose detector and training service documents via POST `/api/v1/store/:collection`
//! - Pushes change feed notifications to WebSocket clients
//!
//! # Architecture
//!
//! ```text
//! operator UI ──→ /api/v1/trigger/* ──→ TriggerReceiver
//! pose detector ─→ /api/v1/store/* ───────────↓
//!                                      document store ──→ change feed ──→ /api/v1/notifications/ws
//! ```

use crate::core::detector::DetectorStatus;
use crate::core::labeling::{LabelOutcome, LabelingError};
use crate::notifier::next_push;
use crate::receiver::{ControlError, ReceiverInfo, SettingsUpdate, TriggerReceiver};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

type SharedReceiver = Arc<TriggerReceiver>;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Plain message response
#[derive(Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

fn control_error(e: ControlError) -> ApiError {
    match e {
        ControlError::InvalidStatus(_) => api_error(StatusCode::BAD_REQUEST, "INVALID_STATUS", e),
        ControlError::InvalidValue(_) => api_error(StatusCode::BAD_REQUEST, "INVALID_VALUE", e),
        ControlError::UnknownCollection(_) => api_error(StatusCode::NOT_FOUND, "UNKNOWN_COLLECTION", e),
        ControlError::Persistence(_) => {
            tracing::error!("Store write failed: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR", e)
        }
        ControlError::Client(_) | ControlError::Detector(_) => {
            tracing::error!("Control operation failed: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "RECEIVER_ERROR", e)
        }
    }
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /api/v1/trigger/get_info
async fn get_info(State(receiver): State<SharedReceiver>) -> Result<Json<ReceiverInfo>, ApiError> {
    receiver.info().await.map(Json).map_err(control_error)
}

/// POST /api/v1/trigger/update_info
async fn update_info(
    State(receiver): State<SharedReceiver>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<Value>, ApiError> {
    let info = receiver.update(update).await.map_err(control_error)?;
    Ok(Json(json!({
        "message": "Information updated successfully",
        "info": info,
    })))
}

#[derive(Deserialize)]
struct PoseStatusQuery {
    detected: Option<String>,
}

/// GET /api/v1/trigger/pose_status?detected=true|false
async fn pose_status(
    State(receiver): State<SharedReceiver>,
    Query(query): Query<PoseStatusQuery>,
) -> String {
    let detected = query
        .detected
        .is_some_and(|d| d.eq_ignore_ascii_case("true"));
    receiver.set_pose_available(detected);
    format!("Detect pose {detected}")
}

/// GET /api/v1/trigger/change_status/:status
async fn change_status(
    State(receiver): State<SharedReceiver>,
    Path(status): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let label: i32 = status
        .trim()
        .parse()
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "INVALID_STATUS", "Invalid status value"))?;
    let status = receiver.change_status(label).await.map_err(control_error)?;
    Ok(MessageResponse::new(format!("Change status to {status}")))
}

/// GET /api/v1/trigger/check_status
async fn check_status(State(receiver): State<SharedReceiver>) -> Result<Json<MessageResponse>, ApiError> {
    let status = receiver.check_status().await.map_err(control_error)?;
    Ok(MessageResponse::new(format!("Current status is {status}")))
}

/// GET /api/v1/trigger/start
async fn start(State(receiver): State<SharedReceiver>) -> Result<Json<MessageResponse>, ApiError> {
    let outcome = receiver.start().await.map_err(control_error)?;
    Ok(MessageResponse::new(outcome.to_string()))
}

/// GET /api/v1/trigger/stop
async fn stop(State(receiver): State<SharedReceiver>) -> Json<MessageResponse> {
    MessageResponse::new(receiver.stop().await.to_string())
}

/// POST /api/v1/trigger/start_auto_labeling
async fn start_auto_labeling(State(receiver): State<SharedReceiver>) -> Json<MessageResponse> {
    receiver.start_auto_labeling();
    MessageResponse::new("Labeling started successfully")
}

/// POST /api/v1/trigger/stop_auto_labeling
async fn stop_auto_labeling(State(receiver): State<SharedReceiver>) -> Json<MessageResponse> {
    receiver.stop_auto_labeling();
    MessageResponse::new("Labeling stopped successfully")
}

#[derive(Deserialize)]
struct LabelRequest {
    label: i32,
    /// Defaults to now
    timestamp: Option<i64>,
}

/// POST /api/v1/trigger/label
///
/// Label the window ending at `timestamp` right away, bypassing the scheduler.
async fn label(
    State(receiver): State<SharedReceiver>,
    Json(request): Json<LabelRequest>,
) -> Result<Json<LabelOutcome>, ApiError> {
    let status = DetectorStatus::from_label(request.label)
        .ok_or_else(|| control_error(ControlError::InvalidStatus(request.label)))?;
    let timestamp = request
        .timestamp
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    receiver
        .label_now(status, timestamp)
        .await
        .map(Json)
        .map_err(|e| match e {
            LabelingError::InsufficientData { .. } => {
                api_error(StatusCode::BAD_REQUEST, "INSUFFICIENT_DATA", e)
            }
            LabelingError::Malformed(_) => api_error(StatusCode::BAD_REQUEST, "MALFORMED_POSES", e),
            LabelingError::Persistence(_) => {
                api_error(StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR", e)
            }
        })
}

#[derive(Deserialize)]
struct NotifyRequest {
    message: Value,
}

/// POST /api/v1/notifications
async fn notify(
    State(receiver): State<SharedReceiver>,
    Json(request): Json<NotifyRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = receiver
        .notify(request.message)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR", e))?;
    Ok(Json(json!({ "id": id })))
}

#[derive(Deserialize)]
struct TrainingLogsRequest {
    logs: Value,
}

/// POST /api/v1/notifications/training_logs
async fn training_logs(
    State(receiver): State<SharedReceiver>,
    Json(request): Json<TrainingLogsRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = receiver
        .store_training_logs(request.logs)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR", e))?;
    Ok(Json(json!({ "id": id })))
}

/// POST /api/v1/store/:collection
///
/// Body is one document or an array of documents.
async fn ingest(
    State(receiver): State<SharedReceiver>,
    Path(collection): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let documents = match body {
        Value::Array(documents) => documents,
        document => vec![document],
    };
    let ids = receiver
        .ingest(&collection, documents)
        .await
        .map_err(control_error)?;
    Ok(Json(json!({ "ids": ids })))
}

/// GET /api/v1/notifications/ws
async fn notifications_ws(ws: WebSocketUpgrade, State(receiver): State<SharedReceiver>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_ws_client(socket, receiver))
}

async fn handle_ws_client(mut socket: WebSocket, receiver: SharedReceiver) {
    let mut rx = receiver.notifier().subscribe();
    tracing::info!("Notification client connected");

    loop {
        tokio::select! {
            push = next_push(&mut rx) => {
                let Some(notification) = push else {
                    break;
                };
                let Ok(text) = serde_json::to_string(&notification) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {} // ignore client messages
                }
            }
        }
    }

    tracing::info!("Notification client disconnected");
}

/// Build the router for a receiver.
pub fn router(receiver: SharedReceiver) -> Router {
    let trigger = Router::new()
        .route("/get_info", get(get_info))
        .route("/update_info", post(update_info))
        .route("/pose_status", get(pose_status))
        .route("/change_status/:status", get(change_status))
        .route("/check_status", get(check_status))
        .route("/start", get(start))
        .route("/stop", get(stop))
        .route("/start_auto_labeling", post(start_auto_labeling))
        .route("/stop_auto_labeling", post(stop_auto_labeling))
        .route("/label", post(label));

    let notifications = Router::new()
        .route("/", post(notify))
        .route("/training_logs", post(training_logs))
        .route("/ws", get(notifications_ws));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/trigger", trigger)
        .nest("/api/v1/notifications", notifications)
        .route("/api/v1/store/:collection", post(ingest))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(Any),
        )
        .with_state(receiver)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    receiver: SharedReceiver,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(receiver);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Trigger agent server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
