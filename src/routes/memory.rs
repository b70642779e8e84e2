//! Memory CRUD, structured search, similarity, and facet suggestions
//! (§4.6, §4.7, §4.8, §4.12).

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::{AppError, AppResult};
use crate::faceting::{FacetSnapshot, FacetSuggestion};
use crate::memory::{FieldValue, Memory, MemoryStore, MemoryUpdate, SearchRequest, SearchResult};
use crate::state::{AppState, ServerEvent};

#[derive(Debug, Deserialize)]
pub struct StoreMemoryRequest {
    #[serde(rename = "type")]
    pub memory_type: String,
    pub content: String,
    #[serde(default)]
    pub is_shared: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

pub async fn store_memory(
    State(state): State<AppState>,
    Json(req): Json<StoreMemoryRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let mut memory = Memory::new(req.memory_type, req.content, req.is_shared);
    memory.session_id = req.session_id;
    memory.files_involved = req.files.into_iter().collect();
    memory.fields = req.fields;

    let id = memory.id.clone();
    let is_shared = memory.is_shared;
    let stored = state.memory_store.store(memory.clone()).await;

    if stored {
        state.semantic.index(&memory).await;
        state.faceting.invalidate(MemoryStore::route_key(is_shared));
        let _ = state.event_tx.send(ServerEvent::MemoryWritten { id: id.clone(), is_shared });
    }

    Ok(Json(serde_json::json!({ "success": stored, "id": id })))
}

pub async fn get_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<Memory>> {
    state
        .memory_store
        .get_by_id(&id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::MemoryNotFound(id))
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemoryRequest {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub add_files: Vec<String>,
    #[serde(default)]
    pub remove_files: Vec<String>,
    #[serde(default)]
    pub field_updates: BTreeMap<String, Option<FieldValue>>,
}

pub async fn update_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateMemoryRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let patch = MemoryUpdate {
        content: req.content,
        add_files: req.add_files,
        remove_files: req.remove_files,
        field_updates: req.field_updates,
    };
    let updated = state.memory_store.update(&id, patch).await;
    if updated {
        if let Some(memory) = state.memory_store.get_by_id(&id).await {
            state.semantic.index(&memory).await;
            state.faceting.invalidate(MemoryStore::route_key(memory.is_shared));
            let _ =
                state.event_tx.send(ServerEvent::MemoryWritten { id: memory.id.clone(), is_shared: memory.is_shared });
        }
    }
    Ok(Json(serde_json::json!({ "success": updated })))
}

#[derive(Debug, Deserialize)]
pub struct SimilarQuery {
    pub k: Option<usize>,
}

pub async fn similar_memories(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(query): Json<SimilarQuery>,
) -> AppResult<Json<Vec<Memory>>> {
    let k = query.k.unwrap_or(5).clamp(1, 100);
    Ok(Json(state.memory_store.similar(&id, k).await))
}

pub async fn search_memories(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> AppResult<Json<SearchResult>> {
    Ok(Json(state.memory_store.search(request).await))
}

#[derive(Debug, Deserialize)]
pub struct FacetSuggestionsRequest {
    pub workspace: String,
    pub query: String,
    #[serde(default)]
    pub applied: BTreeMap<String, String>,
    pub max_results: Option<usize>,
    pub max_suggestions: Option<usize>,
}

/// Runs the search to get a fresh facet snapshot (through the TTL cache),
/// then derives suggestions from it (§4.7).
pub async fn facet_suggestions(
    State(state): State<AppState>,
    Json(req): Json<FacetSuggestionsRequest>,
) -> AppResult<Json<Vec<FacetSuggestion>>> {
    let max_results = req.max_results.unwrap_or(100).clamp(1, 10_000);

    let snapshot = match state.faceting.get_cached(&req.workspace, &req.query, max_results) {
        Some(s) => s,
        None => {
            let search = SearchRequest {
                query: req.query.clone(),
                max_results: Some(max_results),
                facets: req.applied.clone(),
                ..search_default(&req.query)
            };
            let result = state.memory_store.search(search).await;
            let snapshot = FacetSnapshot { counts: result.facets, total: result.total };
            state.faceting.put(&req.workspace, &req.query, max_results, snapshot.clone());
            snapshot
        }
    };

    let suggestions = state.faceting.suggestions(&snapshot, &req.query, &req.applied, req.max_suggestions);
    Ok(Json(suggestions))
}

fn search_default(query: &str) -> SearchRequest {
    SearchRequest {
        query: query.to_string(),
        types: Default::default(),
        facets: Default::default(),
        date_range: None,
        related_to_ids: Default::default(),
        include_archived: false,
        max_results: None,
        order_by: None,
        order_descending: false,
        boost_recent: false,
        boost_frequent: false,
    }
}
