//! C6 — MemoryStore: validates, routes (project vs. local), searches and
//! retires `Memory` records on top of two IndexStore-backed indexes (§4.6).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::Term;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::config::MAX_SEARCH_QUERY_LENGTH;
use crate::error::{AppError, AppResult};
use crate::index_store::IndexStore;
use crate::query_expansion;

use super::model::{
    FieldValue, Memory, MemoryUpdate, SearchRequest, SearchResult, PENDING_RESOLUTION_TYPE,
    RESOLUTION_FEEDBACK_TYPE,
};
use super::schema::MemorySchema;

pub const PROJECT_KEY: &str = "project-memory";
pub const LOCAL_KEY: &str = "local-memory";

const ORDER_BY_ALLOWED: &[&str] = &["created", "modified", "type", "score"];
const ACCESS_COUNT_BATCH: usize = 10;

/// Core memory types (§3 Memory model, §4.C9 lifecycle confidence table).
/// The type field is "enumerated, extensible" — callers may still *store*
/// memories of other types — but a search request's `types` filter may only
/// name types from this set.
const ALLOWED_MEMORY_TYPES: &[&str] = &[
    "TechnicalDebt",
    "BugReport",
    "Question",
    "CodePattern",
    "ArchitecturalDecision",
    "SecurityRule",
    PENDING_RESOLUTION_TYPE,
    RESOLUTION_FEEDBACK_TYPE,
];

pub struct MemoryStore {
    index_store: Arc<IndexStore>,
    schema: MemorySchema,
    access_count_lock: AsyncMutex<()>,
    /// Registers whose `(id)` maps to which logical index, so `get_by_id`/
    /// `update` know where to route without scanning both.
    location: DashMap<String, &'static str>,
}

impl MemoryStore {
    pub fn new(index_store: Arc<IndexStore>, project_dir: &Path, local_dir: &Path) -> AppResult<Self> {
        let schema = MemorySchema::build();
        index_store.get_or_create(PROJECT_KEY, project_dir, schema.schema.clone())?;
        index_store.get_or_create(LOCAL_KEY, local_dir, schema.schema.clone())?;
        Ok(Self {
            index_store,
            schema,
            access_count_lock: AsyncMutex::new(()),
            location: DashMap::new(),
        })
    }

    fn key_for(is_shared: bool) -> &'static str {
        if is_shared {
            PROJECT_KEY
        } else {
            LOCAL_KEY
        }
    }

    fn validate_query(query: &str) -> AppResult<()> {
        if query.len() > MAX_SEARCH_QUERY_LENGTH {
            return Err(AppError::BadRequest(format!(
                "query exceeds {MAX_SEARCH_QUERY_LENGTH} characters"
            )));
        }
        Ok(())
    }

    pub async fn store(&self, mut memory: Memory) -> bool {
        if memory.memory_type.trim().is_empty() {
            return false;
        }
        if memory.id.trim().is_empty() {
            memory.id = uuid::Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        memory.modified = now;
        if memory.created == DateTime::<Utc>::default() {
            memory.created = now;
        }

        let key = Self::key_for(memory.is_shared);
        let doc = self.schema.build_document(&memory);
        let result = self.index_store.update(key, self.schema.id, &memory.id, doc).await;
        match result {
            Ok(()) => {
                let _ = self.index_store.commit(key).await;
                self.location.insert(memory.id.clone(), key);
                true
            }
            Err(e) => {
                warn!("memory store failed for {}: {e}", memory.id);
                false
            }
        }
    }

    pub async fn update(&self, id: &str, patch: MemoryUpdate) -> bool {
        let Some(mut memory) = self.get_by_id(id).await else {
            return false;
        };

        if let Some(content) = patch.content {
            memory.content = content;
        }
        for file in patch.add_files {
            memory.files_involved.insert(file);
        }
        for file in &patch.remove_files {
            memory.files_involved.remove(file);
        }
        for (field, value) in patch.field_updates {
            match value {
                Some(v) => {
                    memory.fields.insert(field, v);
                }
                None => {
                    memory.fields.remove(&field);
                }
            }
        }

        self.store(memory).await
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Memory> {
        for key in [PROJECT_KEY, LOCAL_KEY] {
            if let Ok(handle) = self.index_store.handle(key) {
                let searcher = handle.searcher();
                let term = Term::from_field_text(self.schema.id, id);
                let query = TermQuery::new(term, IndexRecordOption::Basic);
                if let Ok(hits) = searcher.search(&query, &TopDocs::with_limit(1)) {
                    if let Some((_, addr)) = hits.into_iter().next() {
                        if let Ok(doc) = searcher.doc::<tantivy::TantivyDocument>(addr) {
                            if let Some(memory) = self.schema.hydrate(&doc) {
                                self.location.insert(id.to_string(), key);
                                return Some(memory);
                            }
                        }
                    }
                }
            }
        }
        None
    }

    pub async fn archive(&self, memory_type: &str, older_than: DateTime<Utc>) -> usize {
        let mut count = 0;
        for key in [PROJECT_KEY, LOCAL_KEY] {
            let Ok(handle) = self.index_store.handle(key) else { continue };
            let searcher = handle.searcher();
            let term = Term::from_field_text(self.schema.memory_type, memory_type);
            let query = TermQuery::new(term, IndexRecordOption::Basic);
            let Ok(hits) = searcher.search(&query, &TopDocs::with_limit(10_000)) else { continue };
            for (_, addr) in hits {
                let Ok(doc) = searcher.doc::<tantivy::TantivyDocument>(addr) else { continue };
                let Some(mut memory) = self.schema.hydrate(&doc) else { continue };
                if memory.created >= older_than {
                    continue;
                }
                memory.fields.insert("archived".into(), FieldValue::Bool(true));
                memory.fields.insert("archivedDate".into(), FieldValue::Str(Utc::now().to_rfc3339()));
                if self.store_without_touching_access(memory).await {
                    count += 1;
                }
            }
        }
        count
    }

    async fn store_without_touching_access(&self, memory: Memory) -> bool {
        let key = Self::key_for(memory.is_shared);
        let doc = self.schema.build_document(&memory);
        match self.index_store.update(key, self.schema.id, &memory.id, doc).await {
            Ok(()) => {
                let _ = self.index_store.commit(key).await;
                true
            }
            Err(_) => false,
        }
    }

    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut count = 0;
        for key in [PROJECT_KEY, LOCAL_KEY] {
            let Ok(handle) = self.index_store.handle(key) else { continue };
            let searcher = handle.searcher();
            let Ok(hits) = searcher.search(&AllQuery, &TopDocs::with_limit(100_000)) else { continue };
            let mut touched = false;
            for (_, addr) in hits {
                let Ok(doc) = searcher.doc::<tantivy::TantivyDocument>(addr) else { continue };
                let Some(memory) = self.schema.hydrate(&doc) else { continue };
                if memory.is_working_memory() && memory.is_expired(now) {
                    if self.index_store.delete_by_term(key, self.schema.id, &memory.id).await.is_ok() {
                        touched = true;
                        count += 1;
                    }
                }
            }
            if touched {
                let _ = self.index_store.commit(key).await;
            }
        }
        count
    }

    /// Memories whose `files_involved` contains `path` exactly, across both
    /// indexes. Used by the lifecycle engine's file-change handler.
    pub async fn find_referencing_file(&self, path: &str) -> Vec<Memory> {
        let facet = tantivy::schema::Facet::from_path(path.split('/').filter(|s| !s.is_empty()));
        let mut out = Vec::new();
        for key in [PROJECT_KEY, LOCAL_KEY] {
            let Ok(handle) = self.index_store.handle(key) else { continue };
            let searcher = handle.searcher();
            let term = Term::from_facet(self.schema.facet_files, &facet);
            let query = TermQuery::new(term, IndexRecordOption::Basic);
            let Ok(hits) = searcher.search(&query, &TopDocs::with_limit(1000)) else { continue };
            for (_, addr) in hits {
                if let Ok(doc) = searcher.doc::<tantivy::TantivyDocument>(addr) {
                    if let Some(memory) = self.schema.hydrate(&doc) {
                        out.push(memory);
                    }
                }
            }
        }
        out
    }

    /// Enumerates every memory across both indexes. Used by backup export.
    pub async fn all(&self) -> Vec<Memory> {
        let mut out = Vec::new();
        for key in [PROJECT_KEY, LOCAL_KEY] {
            let Ok(handle) = self.index_store.handle(key) else { continue };
            let searcher = handle.searcher();
            let Ok(hits) = searcher.search(&AllQuery, &TopDocs::with_limit(1_000_000)) else { continue };
            for (_, addr) in hits {
                if let Ok(doc) = searcher.doc::<tantivy::TantivyDocument>(addr) {
                    if let Some(memory) = self.schema.hydrate(&doc) {
                        out.push(memory);
                    }
                }
            }
        }
        out
    }

    /// The logical index key ("project-memory"/"local-memory") a memory of
    /// this shared-ness routes to. Exposed for backup restore/rollback,
    /// which address a specific workspace index directly.
    pub fn route_key(is_shared: bool) -> &'static str {
        Self::key_for(is_shared)
    }

    /// Deletes any existing document for `memory.id` and adds the rebuilt
    /// one, without committing or touching `access_count`. Callers commit
    /// the relevant key(s) once after a batch (backup restore, §4.10).
    pub async fn replace_raw(&self, memory: &Memory) -> AppResult<()> {
        let key = Self::key_for(memory.is_shared);
        self.index_store.delete_by_term(key, self.schema.id, &memory.id).await?;
        let doc = self.schema.build_document(memory);
        self.index_store.update(key, self.schema.id, &memory.id, doc).await
    }

    /// Deletes the document for `id` from its routed index, without
    /// committing.
    pub async fn delete_raw(&self, id: &str, is_shared: bool) -> AppResult<()> {
        let key = Self::key_for(is_shared);
        self.index_store.delete_by_term(key, self.schema.id, id).await
    }

    /// Commits a logical index by key ("project-memory"/"local-memory").
    pub async fn commit_key(&self, key: &str) -> AppResult<()> {
        self.index_store.commit(key).await
    }

    pub async fn similar(&self, id: &str, k: usize) -> Vec<Memory> {
        let Some(source) = self.get_by_id(id).await else { return Vec::new() };
        let mut req = SearchRequest {
            query: source.content.clone(),
            max_results: Some(k + 1),
            ..Default::default()
        };
        req.query = if req.query.trim().is_empty() { "*".to_string() } else { req.query };
        let result = self.search(req).await;
        result.memories.into_iter().filter(|m| m.id != id).take(k).collect()
    }

    pub async fn search(&self, mut request: SearchRequest) -> SearchResult {
        if let Err(e) = Self::validate_query(&request.query) {
            return SearchResult { warnings: vec![e.to_string()], ..Default::default() };
        }
        let max_results = request.max_results.unwrap_or(100).min(10_000);
        if let Some(order_by) = &request.order_by {
            if !ORDER_BY_ALLOWED.contains(&order_by.as_str())
                && !order_by.chars().all(|c| c.is_alphanumeric() || c == '_')
            {
                return SearchResult {
                    warnings: vec!["invalid order_by".to_string()],
                    ..Default::default()
                };
            }
        }
        if let Some(range) = &request.date_range {
            if range.from > range.to {
                return SearchResult { warnings: vec!["date_range.from > date_range.to".into()], ..Default::default() };
            }
        }
        if request.facets.keys().any(|k| !k.chars().all(|c| c.is_alphanumeric() || c == '_')) {
            return SearchResult { warnings: vec!["invalid facet key".into()], ..Default::default() };
        }
        if request.types.iter().any(|t| !ALLOWED_MEMORY_TYPES.contains(&t.as_str())) {
            return SearchResult { warnings: vec!["unknown memory type in types filter".into()], ..Default::default() };
        }
        request.max_results = Some(max_results);

        let mut matched = Vec::new();
        for key in [PROJECT_KEY, LOCAL_KEY] {
            let Ok(handle) = self.index_store.handle(key) else { continue };
            let searcher = handle.searcher();
            let query = query_expansion::build_query(
                &handle.index,
                self.schema.all_text,
                &[self.schema.content, self.schema.memory_type],
                &request.query,
            );
            let query = self.apply_type_and_facet_filters(query, &request);
            let Ok(hits) = searcher.search(&query, &TopDocs::with_limit(max_results.max(1))) else { continue };
            for (score, addr) in hits {
                let Ok(doc) = searcher.doc::<tantivy::TantivyDocument>(addr) else { continue };
                if let Some(memory) = self.schema.hydrate(&doc) {
                    matched.push((score, memory));
                }
            }
        }

        let now = Utc::now();
        matched.retain(|(_, m)| {
            if m.is_working_memory() && m.is_expired(now) {
                return false;
            }
            if !request.related_to_ids.is_empty() {
                let related = m
                    .fields
                    .get("relatedTo")
                    .and_then(FieldValue::as_str_vec)
                    .map(|v| v.iter().any(|id| request.related_to_ids.contains(id)))
                    .unwrap_or(false);
                if !related {
                    return false;
                }
            }
            if !request.include_archived && m.is_archived() {
                return false;
            }
            for (dim, value) in &request.facets {
                let matches = match dim.as_str() {
                    "type" => &m.memory_type == value,
                    "is_shared" => m.is_shared.to_string() == *value,
                    "files" => m.files_involved.contains(value),
                    other => m.fields.get(other).and_then(FieldValue::as_str) == Some(value.as_str()),
                };
                if !matches {
                    return false;
                }
            }
            if let Some(range) = &request.date_range {
                if m.created < range.from || m.created > range.to {
                    return false;
                }
            }
            true
        });

        let boosting = request.boost_recent || request.boost_frequent;
        if boosting {
            matched.sort_by(|(s1, m1), (s2, m2)| {
                let k1 = boosted_score(*s1, m1, request.boost_recent, request.boost_frequent, now);
                let k2 = boosted_score(*s2, m2, request.boost_recent, request.boost_frequent, now);
                k2.partial_cmp(&k1).unwrap_or(std::cmp::Ordering::Equal)
            });
        } else {
            match request.order_by.as_deref() {
                Some("score") => matched.sort_by(|(s1, _), (s2, _)| s2.partial_cmp(s1).unwrap_or(std::cmp::Ordering::Equal)),
                Some("modified") => matched.sort_by(|(_, m1), (_, m2)| m2.modified.cmp(&m1.modified)),
                Some("type") => matched.sort_by(|(_, m1), (_, m2)| m1.memory_type.cmp(&m2.memory_type)),
                Some("created") | None => matched.sort_by(|(_, m1), (_, m2)| m2.created.cmp(&m1.created)),
                Some(_) => matched.sort_by(|(_, m1), (_, m2)| m2.created.cmp(&m1.created)),
            }
            if !request.order_descending && request.order_by.is_some() {
                matched.reverse();
            }
        }

        let total = matched.len();
        let matched_memories: Vec<Memory> = matched.into_iter().map(|(_, m)| m).collect();

        // Facets (step 6) are computed over the full filtered set, before
        // pagination (step 7) truncates it — only insights (step 8) run on
        // the paginated page.
        let facets = compute_facets(&matched_memories);
        let mut memories = matched_memories;
        memories.truncate(max_results);

        let insights = generate_insights(&memories);

        self.batch_touch_access(&mut memories).await;

        SearchResult { memories, total, facets, insights, warnings: Vec::new() }
    }

    fn apply_type_and_facet_filters(&self, base: Box<dyn Query>, request: &SearchRequest) -> Box<dyn Query> {
        if request.types.is_empty() && request.facets.is_empty() {
            return base;
        }
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(Occur::Must, base)];
        if !request.types.is_empty() {
            let type_clauses: Vec<(Occur, Box<dyn Query>)> = request
                .types
                .iter()
                .map(|t| {
                    let term = Term::from_field_text(self.schema.memory_type, t);
                    let q: Box<dyn Query> = Box::new(TermQuery::new(term, IndexRecordOption::Basic));
                    (Occur::Should, q)
                })
                .collect();
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(type_clauses))));
        }
        Box::new(BooleanQuery::new(clauses))
    }

    /// Batch-increments `access_count`/`last_accessed` under a single mutex,
    /// *after* the result set is materialized (§5 ordering guarantee).
    async fn batch_touch_access(&self, memories: &mut [Memory]) {
        let _guard = self.access_count_lock.lock().await;
        let mut touched_project = false;
        let mut touched_local = false;
        for chunk in memories.chunks_mut(ACCESS_COUNT_BATCH) {
            for memory in chunk.iter_mut() {
                memory.access_count += 1;
                memory.last_accessed = Utc::now();
                let key = Self::key_for(memory.is_shared);
                let doc = self.schema.build_document(memory);
                match self.index_store.update(key, self.schema.id, &memory.id, doc).await {
                    Ok(()) => {
                        if memory.is_shared {
                            touched_project = true;
                        } else {
                            touched_local = true;
                        }
                    }
                    Err(e) => warn!("access-count update failed for {}: {e}", memory.id),
                }
            }
        }
        if touched_project {
            let _ = self.index_store.commit(PROJECT_KEY).await;
        }
        if touched_local {
            let _ = self.index_store.commit(LOCAL_KEY).await;
        }
    }
}

fn boosted_score(base: f32, memory: &Memory, boost_recent: bool, boost_frequent: bool, now: DateTime<Utc>) -> f64 {
    let mut score = base as f64;
    if boost_recent {
        let age_days = (now - memory.created).num_days().max(0) as f64;
        let decay = (1.0 - (age_days / 365.0)).clamp(0.1, 1.0);
        score *= decay;
    }
    if boost_frequent {
        score *= (1.0 + memory.access_count as f64).ln();
    }
    score
}

fn compute_facets(memories: &[Memory]) -> BTreeMap<String, BTreeMap<String, usize>> {
    let mut facets: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    for memory in memories {
        *facets.entry("type".into()).or_default().entry(memory.memory_type.clone()).or_insert(0) += 1;
        for dim in ["status", "priority", "category"] {
            if let Some(v) = memory.fields.get(dim).and_then(FieldValue::as_str) {
                *facets.entry(dim.into()).or_default().entry(v.to_string()).or_insert(0) += 1;
            }
        }
    }
    facets
}

fn generate_insights(memories: &[Memory]) -> Vec<String> {
    let mut insights = Vec::new();
    if memories.is_empty() {
        return insights;
    }
    let total = memories.len();
    let pending = memories
        .iter()
        .filter(|m| m.fields.get("status").and_then(FieldValue::as_str) == Some("pending"))
        .count();
    if pending * 2 > total {
        insights.push(format!("majority pending ({pending}/{total})"));
    }
    let now = Utc::now();
    let old_pending = memories
        .iter()
        .filter(|m| {
            m.fields.get("status").and_then(FieldValue::as_str) == Some("pending")
                && (now - m.created) > ChronoDuration::days(30)
        })
        .count();
    if old_pending > 0 {
        insights.push(format!("{old_pending} pending item(s) open for over 30 days"));
    }
    if pending > 5 {
        insights.push("recommended action: review pending items".to_string());
    }
    let critical = memories
        .iter()
        .filter(|m| m.fields.get("priority").and_then(FieldValue::as_str) == Some("critical"))
        .count();
    if critical > 0 {
        insights.push(format!("recommended action: address {critical} critical item(s)"));
    }
    insights
}

impl Default for super::model::SearchRequest {
    fn default() -> Self {
        Self {
            query: "*".to_string(),
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
}

pub fn is_system_generated(memory_type: &str) -> bool {
    memory_type == PENDING_RESOLUTION_TYPE || memory_type == RESOLUTION_FEEDBACK_TYPE
}
