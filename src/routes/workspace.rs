//! Workspace lifecycle: register, list, activate (open index + start
//! watching + initial walk), and remove (§4.1, §4.2, §4.4, §4.5).

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use crate::error::AppResult;
use crate::registry::{Workspace, WorkspaceStatus};
use crate::state::{AppState, ServerEvent};

#[derive(Debug, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    /// Accepts both "path" and "root_path" from the client.
    #[serde(alias = "root_path")]
    pub path: String,
}

pub async fn list_workspaces(State(state): State<AppState>) -> AppResult<Json<Vec<Workspace>>> {
    Ok(Json(state.registry.all()))
}

pub async fn create_workspace(
    State(state): State<AppState>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> AppResult<Json<Workspace>> {
    let mut workspace = state.registry.register(&state.resolver, &req.path)?;
    if !req.name.trim().is_empty() {
        workspace.display_name = req.name;
    }

    let _ = state.event_tx.send(ServerEvent::WorkspaceCreated {
        workspace_hash: workspace.hash.clone(),
        path: workspace.original_path.clone(),
    });

    activate_indexing(&state, &workspace);

    Ok(Json(workspace))
}

pub async fn get_workspace(
    State(state): State<AppState>,
    Path(workspace_hash): Path<String>,
) -> AppResult<Json<Workspace>> {
    Ok(Json(state.registry.get_by_hash(&workspace_hash)?))
}

pub async fn remove_workspace(
    State(state): State<AppState>,
    Path(workspace_hash): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state.watcher.stop(&workspace_hash);
    state.index_store.remove(&workspace_hash);
    state.registry.unregister(&workspace_hash)?;

    let _ = state.event_tx.send(ServerEvent::WorkspaceRemoved { workspace_hash: workspace_hash.clone() });

    Ok(Json(serde_json::json!({ "success": true })))
}

pub async fn activate_workspace(
    State(state): State<AppState>,
    Path(workspace_hash): Path<String>,
) -> AppResult<Json<Workspace>> {
    let workspace = state.registry.get_by_hash(&workspace_hash)?;
    state.registry.update_last_accessed(&workspace_hash)?;
    activate_indexing(&state, &workspace);
    Ok(Json(workspace))
}

/// Public entry point for triggering a reindex from outside this module (the
/// WebSocket `trigger_index` command), without going through the HTTP layer.
pub fn trigger_reindex(state: &AppState, workspace: &Workspace) {
    activate_indexing(state, workspace);
}

/// Opens (or reuses) the workspace's tantivy index, starts its file watcher
/// if not already running, and spawns a background full walk-and-index pass
/// — the watcher only covers changes from this point forward, so a fresh or
/// reactivated workspace needs the one-time catch-up.
///
/// Flips the workspace to `Missing` if its root no longer exists on disk, or
/// to `Corrupted` if the index fails to open, rather than proceeding with a
/// dead workspace.
fn activate_indexing(state: &AppState, workspace: &Workspace) {
    if !std::path::Path::new(&workspace.original_path).exists() {
        tracing::warn!("workspace {} root no longer exists: {}", workspace.hash, workspace.original_path);
        let _ = state.registry.update_status(&workspace.hash, WorkspaceStatus::Missing);
        return;
    }
    if workspace.status == WorkspaceStatus::Missing || workspace.status == WorkspaceStatus::Corrupted {
        let _ = state.registry.update_status(&workspace.hash, WorkspaceStatus::Active);
    }

    let dir = state.resolver.index_dir(&workspace.hash, &workspace.directory_name);
    if let Err(e) = state.index_store.get_or_create(&workspace.hash, &dir, state.pipeline.schema().schema.clone()) {
        tracing::warn!("failed to open index for workspace {}: {e}", workspace.hash);
        let _ = state.registry.update_status(&workspace.hash, WorkspaceStatus::Corrupted);
        return;
    }

    let root = std::path::PathBuf::from(&workspace.original_path);
    if !state.watcher.is_watching(&workspace.hash) {
        if let Err(e) = state.watcher.start(&workspace.hash, &root) {
            tracing::warn!("failed to start watcher for workspace {}: {e}", workspace.hash);
        }
    }

    let state = state.clone();
    let hash = workspace.hash.clone();
    let index_dir = dir;
    tokio::spawn(async move {
        let _ = state.event_tx.send(ServerEvent::IndexingStarted { workspace_hash: hash.clone() });
        match state.pipeline.reindex_workspace(&hash, &root).await {
            Ok(count) => {
                let size_bytes = tokio::task::spawn_blocking(move || directory_size(&index_dir)).await.unwrap_or(0);
                let _ = state.registry.update_statistics(&hash, count, size_bytes);
                let _ = state.event_tx.send(ServerEvent::IndexingCompleted { workspace_hash: hash });
            }
            Err(e) => {
                let _ = state.event_tx.send(ServerEvent::IndexingError { workspace_hash: hash, error: e.to_string() });
            }
        }
    });
}

fn directory_size(dir: &std::path::Path) -> u64 {
    let mut total = 0u64;
    let Ok(entries) = std::fs::read_dir(dir) else { return 0 };
    for entry in entries.flatten() {
        if let Ok(meta) = entry.metadata() {
            if meta.is_dir() {
                total += directory_size(&entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}

pub async fn reindex_workspace(
    State(state): State<AppState>,
    Path(workspace_hash): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let workspace = state.registry.get_by_hash(&workspace_hash)?;
    activate_indexing(&state, &workspace);
    Ok(Json(serde_json::json!({ "status": "indexing_started", "workspace_hash": workspace_hash })))
}

#[derive(Debug, serde::Serialize)]
pub struct IndexStatus {
    pub indexed: bool,
    pub document_count: usize,
}

pub async fn index_status(
    State(state): State<AppState>,
    Path(workspace_hash): Path<String>,
) -> AppResult<Json<IndexStatus>> {
    let count = state
        .index_store
        .handle(&workspace_hash)
        .map(|h| h.searcher().num_docs() as usize)
        .unwrap_or(0);
    Ok(Json(IndexStatus { indexed: count > 0, document_count: count }))
}
