//! HTTP and WebSocket surface
//!
//! # Endpoints
//!
//! - GET /api/health - Liveness check
//! - GET /api/ws/:conversation_id - Subscribe to a conversation's messages
//! - POST /api/chat - Submit a user message; the turn runs in the background
//! - GET /api/conversations/:id/history - Durable history
//! - GET /api/conversations/:id/status - Whether the latest turn has answered

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use sdk::errors::{EngineError, EnvoyErrorExt};
use sdk::types::Role;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use crate::service::ChatService;
use crate::stream::{ChannelTransport, CHANNEL_BUFFER_SIZE};

const DEFAULT_HISTORY_LIMIT: u32 = 10;

/// Server state shared across handlers
#[derive(Clone)]
pub struct ServerState {
    service: Arc<ChatService>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    context: Option<ChatContext>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatContext {
    #[serde(default)]
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

/// Build the router
pub fn router(service: Arc<ChatService>) -> Router {
    let state = ServerState { service };

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/ws/:conversation_id", get(websocket_handler))
        .route("/api/chat", post(chat_handler))
        .route("/api/conversations/:id/history", get(history_handler))
        .route("/api/conversations/:id/status", get(status_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    addr: SocketAddr,
    service: Arc<ChatService>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), EngineError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| EngineError::Network(format!("Failed to bind to {}: {}", addr, e)))?;

    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("Server shutting down gracefully");
        })
        .await
        .map_err(|e| EngineError::Network(format!("Server error: {}", e)))
}

fn error_response(status: StatusCode, error: &EngineError) -> Response {
    (status, Json(json!({ "error": error.user_hint() }))).into_response()
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(conversation_id): Path<String>,
    State(state): State<ServerState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, conversation_id, state))
}

/// Forward the conversation's messages to one socket until either side closes
async fn handle_websocket(mut socket: WebSocket, conversation_id: String, state: ServerState) {
    let registry = Arc::clone(state.service.registry());
    let (tx, mut rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let subscriber = registry
        .subscribe(&conversation_id, Arc::new(ChannelTransport::new(tx)))
        .await;

    tracing::info!(conversation_id = %conversation_id, subscriber, "WebSocket connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.trim() == "ping"
                            && socket.send(Message::Text("pong".into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!(conversation_id = %conversation_id, "WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if socket.send(Message::Text(message.to_json())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    registry.unsubscribe(&conversation_id, subscriber).await;
    tracing::info!(conversation_id = %conversation_id, subscriber, "WebSocket disconnected");
}

async fn chat_handler(
    State(state): State<ServerState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<Value>, Response> {
    if request.message.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Missing 'message' field"})),
        )
            .into_response());
    }

    let requested = request.context.and_then(|c| c.conversation_id);
    let conversation_id = state
        .service
        .submit(requested, request.message)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e))?;

    Ok(Json(json!({
        "response_id": format!("resp_{}", uuid::Uuid::new_v4()),
        "message": "Your request is being processed",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "data": {
            "conversation_id": conversation_id,
            "status": "processing"
        }
    })))
}

async fn history_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, Response> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let messages = state
        .service
        .persistence()
        .get_history(&id, limit)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e))?;

    Ok(Json(json!({
        "conversation_id": id,
        "messages": messages
    })))
}

async fn status_handler(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Response> {
    let latest = state
        .service
        .persistence()
        .latest_message(&id)
        .await
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, &e))?;

    let status = match latest {
        None => "not_found",
        Some(turn) if turn.role == Role::System => "completed",
        Some(_) => "processing",
    };

    Ok(Json(json!({
        "conversation_id": id,
        "status": status
    })))
}
