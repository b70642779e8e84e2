//! C9 — LifecycleEngine: watches file-change events, scores affected
//! memories' confidence, and auto-resolves or proposes pending resolutions
//! (§4.9).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::memory::model::{FieldValue, Memory, PENDING_RESOLUTION_TYPE, RESOLUTION_FEEDBACK_TYPE};
use crate::memory::MemoryStore;
use crate::path_resolver::PathResolver;
use crate::watcher::{ChangeKind, FileChangeEvent};

const PENDING_RESOLUTION_COOLDOWN_ENTRY_TTL_SECS: u64 = 300;

#[derive(Debug, Clone, Copy)]
pub struct ConfidenceSnapshot {
    pub score: f64,
    pub computed_at: DateTime<Utc>,
}

pub struct LifecycleEngine {
    memory_store: Arc<MemoryStore>,
    resolver: Arc<PathResolver>,
    config: AppConfig,
    confidence_cache: DashMap<String, ConfidenceSnapshot>,
    recent_pending_resolutions: DashMap<String, DateTime<Utc>>,
}

impl LifecycleEngine {
    pub fn new(memory_store: Arc<MemoryStore>, resolver: Arc<PathResolver>, config: AppConfig) -> Self {
        Self {
            memory_store,
            resolver,
            config,
            confidence_cache: DashMap::new(),
            recent_pending_resolutions: DashMap::new(),
        }
    }

    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<FileChangeEvent>) {
        tokio::time::sleep(Duration::from_secs(self.config.lifecycle_startup_delay_secs)).await;

        let sweep_handle = {
            let engine = self.clone();
            tokio::spawn(async move { engine.stale_sweep_loop().await })
        };
        let prune_handle = {
            let engine = self.clone();
            tokio::spawn(async move { engine.prune_loop().await })
        };

        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_file_change(event).await {
                warn!("lifecycle file-change handling failed: {e}");
            }
        }

        sweep_handle.abort();
        prune_handle.abort();
    }

    async fn stale_sweep_loop(&self) {
        let interval = Duration::from_secs(self.config.lifecycle_stale_sweep_interval_hours * 3600);
        loop {
            self.run_stale_sweep().await;
            tokio::time::sleep(interval).await;
        }
    }

    async fn prune_loop(&self) {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let cutoff = Utc::now() - ChronoDuration::seconds(PENDING_RESOLUTION_COOLDOWN_ENTRY_TTL_SECS as i64);
            self.recent_pending_resolutions.retain(|_, ts| *ts > cutoff);
        }
    }

    pub async fn run_stale_sweep(&self) {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.lifecycle_stale_after_days);
        let mut request = crate::memory::model::SearchRequest {
            query: "*".to_string(),
            max_results: Some(10_000),
            ..Default::default()
        };
        request.facets.insert("status".to_string(), "pending".to_string());
        let result = self.memory_store.search(request).await;
        let mut marked = 0;
        for mut memory in result.memories {
            if memory.created >= cutoff {
                continue;
            }
            memory.fields.insert("isStale".into(), FieldValue::Bool(true));
            memory.fields.insert("markedStaleAt".into(), FieldValue::Str(Utc::now().to_rfc3339()));
            if self.memory_store.store(memory).await {
                marked += 1;
            }
        }
        if marked > 0 {
            info!("stale sweep marked {marked} memories");
        }
    }

    async fn handle_file_change(&self, event: FileChangeEvent) -> Result<(), anyhow::Error> {
        if self.resolver.is_under_base_dir(&event.path) {
            return Ok(());
        }

        let path_str = event.path.to_string_lossy().replace('\\', "/");
        let matches = self.memory_store.find_referencing_file(&path_str).await;

        for memory in matches {
            if memory.memory_type == PENDING_RESOLUTION_TYPE || memory.memory_type == RESOLUTION_FEEDBACK_TYPE {
                continue;
            }

            let score = compute_confidence(&memory, &event, &path_str);
            self.confidence_cache
                .insert(memory.id.clone(), ConfidenceSnapshot { score, computed_at: Utc::now() });

            if score >= self.config.lifecycle_auto_resolve_threshold {
                self.auto_resolve(memory, score).await;
            } else if score >= self.config.lifecycle_pending_threshold {
                self.maybe_create_pending_resolution(memory, score).await;
            }
        }

        Ok(())
    }

    async fn auto_resolve(&self, mut memory: Memory, score: f64) {
        let id = memory.id.clone();
        memory.fields.insert("status".into(), FieldValue::Str("resolved".into()));
        memory.fields.insert("resolvedAt".into(), FieldValue::Str(Utc::now().to_rfc3339()));
        memory.fields.insert("resolvedBy".into(), FieldValue::Str("LifecycleEngine".into()));
        memory.fields.insert("resolutionConfidence".into(), FieldValue::Num(score));
        memory
            .fields
            .insert("resolutionReason".into(), FieldValue::Str("file change matched confidence threshold".into()));
        if self.memory_store.store(memory).await {
            info!("auto-resolved memory {id} (confidence {score:.2})");
        }
    }

    async fn maybe_create_pending_resolution(&self, memory: Memory, score: f64) {
        let cooldown = Duration::from_secs(self.config.lifecycle_pending_cooldown_secs);
        if let Some(last) = self.recent_pending_resolutions.get(&memory.id) {
            if Utc::now().signed_duration_since(*last).num_milliseconds() < cooldown.as_millis() as i64 {
                return;
            }
        }

        let mut pending = Memory::new(
            PENDING_RESOLUTION_TYPE,
            format!("possible resolution for {}", memory.id),
            memory.is_shared,
        );
        pending.fields.insert("originalMemoryId".into(), FieldValue::Str(memory.id.clone()));
        pending.fields.insert("confidence".into(), FieldValue::Num(score));
        pending.files_involved = memory.files_involved.clone();

        if self.memory_store.store(pending).await {
            self.recent_pending_resolutions.insert(memory.id.clone(), Utc::now());
        }
    }

    pub async fn record_feedback(&self, memory_id: &str, was_correct: bool, note: Option<String>) -> bool {
        let Some(snapshot) = self.confidence_cache.get(memory_id).map(|e| *e) else {
            return false;
        };
        let mut feedback = Memory::new(RESOLUTION_FEEDBACK_TYPE, note.unwrap_or_default(), false);
        feedback.fields.insert("originalMemoryId".into(), FieldValue::Str(memory_id.to_string()));
        feedback.fields.insert("wasCorrect".into(), FieldValue::Bool(was_correct));
        feedback.fields.insert("confidenceAtResolution".into(), FieldValue::Num(snapshot.score));
        self.memory_store.store(feedback).await
    }

    pub fn cached_confidence(&self, memory_id: &str) -> Option<ConfidenceSnapshot> {
        self.confidence_cache.get(memory_id).map(|e| *e)
    }
}

fn memory_type_score(memory_type: &str) -> f64 {
    match memory_type {
        "TechnicalDebt" => 0.9,
        "BugReport" => 0.85,
        "Question" => 0.7,
        "CodePattern" => 0.5,
        "ArchitecturalDecision" => 0.3,
        "SecurityRule" => 0.2,
        _ => 0.5,
    }
}

fn file_relevance_score(memory: &Memory, changed_path: &str) -> f64 {
    if memory.files_involved.is_empty() {
        return 0.1;
    }
    if memory.files_involved.iter().any(|f| f.eq_ignore_ascii_case(changed_path)) {
        return 1.0;
    }
    let changed_dir = std::path::Path::new(changed_path).parent();
    if memory.files_involved.iter().any(|f| std::path::Path::new(f).parent() == changed_dir) {
        return 0.7;
    }
    let best_prefix = memory
        .files_involved
        .iter()
        .map(|f| common_prefix_len(f, changed_path))
        .max()
        .unwrap_or(0);
    (best_prefix as f64 / changed_path.len().max(1) as f64).min(0.6)
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count()
}

fn change_kind_score(kind: ChangeKind) -> f64 {
    match kind {
        ChangeKind::Deleted => 0.9,
        ChangeKind::Modified => 0.7,
        ChangeKind::Created => 0.5,
        ChangeKind::Renamed => 0.4,
    }
}

fn age_score(memory: &Memory) -> f64 {
    let age_days = (Utc::now() - memory.created).num_days();
    if age_days < 7 {
        0.3
    } else if age_days < 30 {
        0.5
    } else if age_days < 90 {
        0.7
    } else {
        0.9
    }
}

fn status_score(memory: &Memory) -> f64 {
    match memory.fields.get("status").and_then(FieldValue::as_str) {
        Some("pending") => 0.8,
        Some("in_progress") => 0.6,
        Some("blocked") => 0.4,
        Some("resolved") => 0.1,
        _ => 0.5,
    }
}

const KEYWORD_SET: &[&str] = &["todo", "fixme", "bug", "issue", "problem", "error", "broken"];

fn content_keywords_score(memory: &Memory, changed_path: &str, kind: ChangeKind) -> f64 {
    let content_lower = memory.content.to_lowercase();
    let keyword_hits = KEYWORD_SET.iter().filter(|k| content_lower.contains(*k)).count();
    let mut score = 0.15 * keyword_hits as f64;

    let filename_stem = std::path::Path::new(changed_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !filename_stem.is_empty() && content_lower.contains(&filename_stem) {
        score += 0.3;
    }
    if kind == ChangeKind::Modified && (content_lower.contains("method") || content_lower.contains("class")) {
        score += 0.2;
    }
    score.min(1.0)
}

pub fn compute_confidence(memory: &Memory, event: &FileChangeEvent, changed_path: &str) -> f64 {
    let type_w = 0.25 * memory_type_score(&memory.memory_type);
    let file_w = 0.20 * file_relevance_score(memory, changed_path);
    let kind_w = 0.15 * change_kind_score(event.kind);
    let age_w = 0.15 * age_score(memory);
    let status_w = 0.15 * status_score(memory);
    let keywords_w = 0.10 * content_keywords_score(memory, changed_path, event.kind);
    type_w + file_w + kind_w + age_w + status_w + keywords_w
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn memory_with(memory_type: &str, content: &str, files: &[&str]) -> Memory {
        let mut m = Memory::new(memory_type, content, false);
        m.files_involved = files.iter().map(|s| s.to_string()).collect();
        m
    }

    #[test]
    fn confidence_is_idempotent_for_same_inputs() {
        let memory = memory_with("TechnicalDebt", "todo fix foo", &["/tmp/ws1/a.txt"]);
        let event = FileChangeEvent {
            workspace_hash: "ws".into(),
            path: PathBuf::from("/tmp/ws1/a.txt"),
            kind: ChangeKind::Modified,
        };
        let s1 = compute_confidence(&memory, &event, "/tmp/ws1/a.txt");
        let s2 = compute_confidence(&memory, &event, "/tmp/ws1/a.txt");
        assert!((s1 - s2).abs() < f64::EPSILON);
    }

    #[test]
    fn exact_file_match_and_technical_debt_crosses_auto_resolve_threshold() {
        let mut memory = memory_with("TechnicalDebt", "todo fixme bug issue in a.txt", &["/tmp/ws1/a.txt"]);
        memory.created = Utc::now() - ChronoDuration::days(40);
        memory.fields.insert("status".into(), FieldValue::Str("pending".into()));
        let event = FileChangeEvent {
            workspace_hash: "ws".into(),
            path: PathBuf::from("/tmp/ws1/a.txt"),
            kind: ChangeKind::Modified,
        };
        let score = compute_confidence(&memory, &event, "/tmp/ws1/a.txt");
        assert!(score >= 0.8, "expected score >= 0.8, got {score}");
    }

    #[test]
    fn no_files_on_memory_yields_low_file_relevance() {
        let memory = memory_with("Question", "", &[]);
        assert_eq!(file_relevance_score(&memory, "/tmp/ws1/a.txt"), 0.1);
    }
}
