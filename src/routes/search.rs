//! Code search surface: full-text search over a workspace's tantivy index,
//! plain regex grep over the files on disk, and semantic (embedding) search
//! over stored memories (§4.5, §4.8, §4.12).

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tantivy::collector::TopDocs;
use tantivy::query::{FuzzyTermQuery, QueryParser};
use tantivy::Term;

use crate::error::{AppError, AppResult};
use crate::pipeline::LineData;
use crate::registry::WorkspaceStatus;
use crate::semantic::SemanticHit;
use crate::state::AppState;

/// Corrupted workspaces are excluded from reads until reindexed (§7
/// IndexCorruption); missing ones have no root left to search.
fn ensure_readable(state: &AppState, workspace_hash: &str) -> AppResult<()> {
    let workspace = state.registry.get_by_hash(workspace_hash)?;
    match workspace.status {
        WorkspaceStatus::Corrupted => Err(AppError::IndexError(format!(
            "workspace {workspace_hash} index is corrupted; reindex before searching"
        ))),
        WorkspaceStatus::Missing => Err(AppError::WorkspaceNotFound(workspace_hash.to_string())),
        WorkspaceStatus::Active | WorkspaceStatus::Archived => Ok(()),
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CodeMatch {
    pub path: String,
    pub score: f32,
    pub line_number: Option<usize>,
    pub snippet: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub matches: Vec<CodeMatch>,
    pub total: usize,
}

fn validate_query(q: &str) -> AppResult<()> {
    if q.trim().is_empty() {
        return Err(AppError::BadRequest("search query must not be empty".to_string()));
    }
    if q.len() > crate::config::MAX_SEARCH_QUERY_LENGTH {
        return Err(AppError::BadRequest(format!(
            "search query too long ({} chars). Maximum allowed is {}.",
            q.len(),
            crate::config::MAX_SEARCH_QUERY_LENGTH,
        )));
    }
    Ok(())
}

/// Full-text search (tantivy BM25) over one workspace's code index. Code
/// documents have no single `_all` field the way memories do — the query
/// parses directly against `content`/`filename`/`path`, falling back to a
/// fuzzy term match on `content` when parsing fails, the same fallback idiom
/// `query_expansion::build_query` uses for the memory schema.
pub async fn fulltext_search(
    State(state): State<AppState>,
    Path(workspace_hash): Path<String>,
    Json(query): Json<SearchQuery>,
) -> AppResult<Json<SearchResponse>> {
    validate_query(&query.query)?;
    ensure_readable(&state, &workspace_hash)?;

    let handle = state.index_store.handle(&workspace_hash)?;
    let schema = state.pipeline.schema();
    let searcher = handle.searcher();

    let parser = QueryParser::for_index(&handle.index, vec![schema.content, schema.filename, schema.path]);
    let parsed: Box<dyn tantivy::query::Query> = match parser.parse_query(&query.query) {
        Ok(q) => q,
        Err(_) => {
            let term = Term::from_field_text(schema.content, &query.query.to_lowercase());
            Box::new(FuzzyTermQuery::new(term, 1, true))
        }
    };

    let limit = query.max_results.unwrap_or(50).clamp(1, 10_000);
    let hits = searcher
        .search(&*parsed, &TopDocs::with_limit(limit))
        .map_err(|e| AppError::SearchError(e.to_string()))?;

    let mut matches = Vec::with_capacity(hits.len());
    for (score, addr) in &hits {
        let doc = searcher
            .doc::<tantivy::TantivyDocument>(*addr)
            .map_err(|e| AppError::SearchError(e.to_string()))?;
        let path = doc_str(&doc, schema.path).unwrap_or_default();
        let line_data = doc_str(&doc, schema.line_data).and_then(|s| serde_json::from_str::<LineData>(&s).ok());
        let (line_number, snippet) = first_match_for_query(&query.query, line_data.as_ref());
        matches.push(CodeMatch { path, score: *score, line_number, snippet });
    }

    Ok(Json(SearchResponse { total: matches.len(), matches }))
}

fn doc_str(doc: &tantivy::TantivyDocument, field: tantivy::schema::Field) -> Option<String> {
    doc.get_first(field).and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// Picks the first query token with a recorded first-occurrence line in
/// `line_data`, so results carry a jump-to-line snippet instead of a bare
/// path. Falls back to the document's first line.
fn first_match_for_query(query: &str, line_data: Option<&LineData>) -> (Option<usize>, Option<String>) {
    let data = line_data?;
    for token in query.split_whitespace() {
        let term = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '_').to_lowercase();
        if term.is_empty() {
            continue;
        }
        if let Some(fm) = data.first_matches.get(&term) {
            return (Some(fm.line_number), Some(fm.line_text.clone()));
        }
    }
    (None, data.lines.first().cloned())
}

#[derive(Debug, Deserialize)]
pub struct GrepQuery {
    pub pattern: String,
    pub max_results: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct GrepMatch {
    pub path: String,
    pub line_number: usize,
    pub line_text: String,
}

#[derive(Debug, Serialize)]
pub struct GrepResponse {
    pub matches: Vec<GrepMatch>,
}

/// Regex search straight over the workspace's files on disk (not the index),
/// for exact pattern matches the tokenized full-text index can't express.
pub async fn grep_search(
    State(state): State<AppState>,
    Path(workspace_hash): Path<String>,
    Json(query): Json<GrepQuery>,
) -> AppResult<Json<GrepResponse>> {
    if query.pattern.trim().is_empty() {
        return Err(AppError::BadRequest("grep pattern must not be empty".to_string()));
    }
    if query.pattern.len() > crate::config::MAX_SEARCH_QUERY_LENGTH {
        return Err(AppError::BadRequest(format!(
            "grep pattern too long ({} chars). Maximum allowed is {}.",
            query.pattern.len(),
            crate::config::MAX_SEARCH_QUERY_LENGTH,
        )));
    }

    let workspace = state.registry.get_by_hash(&workspace_hash)?;
    let root = std::path::PathBuf::from(workspace.original_path);
    let pattern = query.pattern.clone();
    let max_results = query.max_results.unwrap_or(200).clamp(1, 10_000);

    let matches = tokio::task::spawn_blocking(move || grep_walk(&root, &pattern, max_results))
        .await
        .map_err(|e| AppError::SearchError(format!("grep task panicked: {e}")))??;

    Ok(Json(GrepResponse { matches }))
}

fn grep_walk(root: &std::path::Path, pattern: &str, max_results: usize) -> AppResult<Vec<GrepMatch>> {
    let re = regex::Regex::new(pattern).map_err(|e| AppError::BadRequest(format!("invalid pattern: {e}")))?;
    let mut out = Vec::new();

    let walker = ignore::WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .git_global(true)
        .git_exclude(true)
        .max_depth(Some(20))
        .build();

    'walk: for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        if path
            .components()
            .any(|c| c.as_os_str().to_str().map(crate::config::is_blocked_dir_name).unwrap_or(false))
        {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(path) else { continue };
        let relative = path.strip_prefix(root).unwrap_or(path).to_string_lossy().replace('\\', "/");
        for (idx, line) in content.lines().enumerate() {
            if re.is_match(line) {
                out.push(GrepMatch { path: relative.clone(), line_number: idx + 1, line_text: line.to_string() });
                if out.len() >= max_results {
                    break 'walk;
                }
            }
        }
    }

    Ok(out)
}

#[derive(Debug, Deserialize)]
pub struct SemanticSearchQuery {
    pub query: String,
    pub k: Option<usize>,
    pub threshold: Option<f32>,
}

/// Embedding-similarity search over stored memories, not code (§4.12).
pub async fn semantic_search(
    State(state): State<AppState>,
    Json(query): Json<SemanticSearchQuery>,
) -> AppResult<Json<Vec<SemanticHit>>> {
    validate_query(&query.query)?;
    let k = query.k.unwrap_or(10).clamp(1, 200);
    let threshold = query.threshold.unwrap_or(0.0);
    let hits = state.semantic.semantic_search(&query.query, k, threshold).await?;
    Ok(Json(hits))
}
