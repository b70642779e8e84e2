use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::routes;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes — no auth required (health probes only)
    let public_routes = Router::new().route("/health", get(routes::health::health_check));

    // Protected routes — require VYOTIQ_AUTH_TOKEN when configured
    let protected_routes = Router::new()
        // Graceful shutdown (requires auth to prevent unauthorized termination)
        .route("/shutdown", post(routes::health::shutdown_handler))
        // Workspace management
        .route(
            "/api/workspaces",
            get(routes::workspace::list_workspaces).post(routes::workspace::create_workspace),
        )
        .route(
            "/api/workspaces/{workspace_hash}",
            get(routes::workspace::get_workspace).delete(routes::workspace::remove_workspace),
        )
        .route(
            "/api/workspaces/{workspace_hash}/activate",
            post(routes::workspace::activate_workspace),
        )
        // Indexing & search
        .route(
            "/api/workspaces/{workspace_hash}/index",
            post(routes::workspace::reindex_workspace),
        )
        .route(
            "/api/workspaces/{workspace_hash}/index/status",
            get(routes::workspace::index_status),
        )
        .route(
            "/api/workspaces/{workspace_hash}/search",
            post(routes::search::fulltext_search),
        )
        .route(
            "/api/workspaces/{workspace_hash}/search/grep",
            post(routes::search::grep_search),
        )
        .route("/api/search/semantic", post(routes::search::semantic_search))
        // Memory store
        .route("/api/memories", post(routes::memory::store_memory))
        .route("/api/memories/search", post(routes::memory::search_memories))
        .route(
            "/api/memories/{id}",
            get(routes::memory::get_memory).patch(routes::memory::update_memory),
        )
        .route("/api/memories/{id}/similar", post(routes::memory::similar_memories))
        .route("/api/facets/suggestions", post(routes::memory::facet_suggestions))
        // Backups
        .route("/api/backup/export", post(routes::backup::export_backup))
        .route("/api/backup/import", post(routes::backup::import_backup))
        // WebSocket for real-time events
        .route("/ws", get(ws_handler))
        .layer(axum::middleware::from_fn(auth_middleware));

    public_routes
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Middleware that validates `Authorization: Bearer <token>` against the
/// `VYOTIQ_AUTH_TOKEN` environment variable.  If the env var is not set or
/// empty, auth is skipped (development mode).
async fn auth_middleware(req: Request, next: Next) -> Result<Response, (StatusCode, axum::Json<serde_json::Value>)> {
    use std::sync::OnceLock;
    static AUTH_TOKEN: OnceLock<Option<String>> = OnceLock::new();
    let expected = AUTH_TOKEN.get_or_init(|| {
        std::env::var("VYOTIQ_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
    });

    let expected_token = match expected {
        Some(t) => t.as_str(),
        None => return Ok(next.run(req).await), // No token configured — skip auth
    };

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(header) if header.len() > 7 && header[..7].eq_ignore_ascii_case("bearer ") => {
            let token = &header[7..];
            if token == expected_token {
                Ok(next.run(req).await)
            } else {
                tracing::warn!("Auth token mismatch — rejecting request");
                Err((
                    StatusCode::UNAUTHORIZED,
                    axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
                ))
            }
        }
        _ => {
            tracing::warn!("Missing or malformed Authorization header — rejecting request");
            Err((
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
            ))
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bidirectional WebSocket handler.
/// Server → Client: broadcasts ServerEvents as JSON (filtered by subscribed workspaces).
/// Client → Server: accepts commands for real-time operations.
async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("WebSocket client connected");
    let mut rx = state.event_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    // Shared set of subscribed workspace hashes.
    let subscribed: Arc<parking_lot::Mutex<std::collections::HashSet<String>>> =
        Arc::new(parking_lot::Mutex::new(std::collections::HashSet::new()));
    let subscribed_for_send = subscribed.clone();

    // Server → Client: forward broadcast events, filtered by subscription.
    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    // Events with no workspace scope (memory writes) always go
                    // through; workspace-scoped events only reach subscribers
                    // that asked for that workspace. An empty subscription set
                    // means the client hasn't subscribed to anything yet, so
                    // everything passes (backward compat with clients that
                    // never send subscribe_workspace).
                    if let Some(hash) = event.workspace_hash() {
                        let subs = subscribed_for_send.lock();
                        if !subs.is_empty() && !subs.contains(hash) {
                            continue;
                        }
                    }
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("WebSocket client lagged, skipped {} events", n);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    });

    // Client → Server: handle incoming commands.
    let state_for_recv = state.clone();

    let mut recv_task = tokio::spawn(async move {
        let state = state_for_recv;
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                let text_str: &str = &text;
                if let Ok(cmd) = serde_json::from_str::<serde_json::Value>(text_str) {
                    let cmd_type = cmd.get("type").and_then(|v| v.as_str()).unwrap_or("");
                    tracing::debug!(command = cmd_type, "WebSocket command received");
                    match cmd_type {
                        "subscribe_workspace" => {
                            if let Some(hash) = cmd.get("workspace_hash").and_then(|v| v.as_str()) {
                                subscribed.lock().insert(hash.to_string());
                                tracing::debug!("Client subscribed to workspace: {}", hash);
                            }
                        }
                        "unsubscribe_workspace" => {
                            if let Some(hash) = cmd.get("workspace_hash").and_then(|v| v.as_str()) {
                                subscribed.lock().remove(hash);
                                tracing::debug!("Client unsubscribed from workspace: {}", hash);
                            }
                        }
                        "trigger_index" => {
                            if let Some(hash) = cmd.get("workspace_hash").and_then(|v| v.as_str()) {
                                if let Ok(workspace) = state.registry.get_by_hash(hash) {
                                    routes::workspace::trigger_reindex(&state, &workspace);
                                }
                            }
                        }
                        _ => {
                            tracing::debug!("Unknown WS command: {}", cmd_type);
                        }
                    }
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other to prevent leaks.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
        },
    }
    tracing::info!("WebSocket client disconnected");
}
