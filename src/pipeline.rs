//! C5 — IndexingPipeline: debounce-and-batch loop that turns FileWatcher
//! events into tantivy documents through IndexStore (§4.5).

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tantivy::schema::{Field, Schema, FAST, INDEXED, STORED, STRING, TEXT};
use tantivy::TantivyDocument;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{is_blocked_dir_name, is_supported_extension};
use crate::error::{AppError, AppResult};
use crate::index_store::IndexStore;
use crate::path_resolver::PathResolver;
use crate::watcher::{ChangeKind, FileChangeEvent};

const LINE_DATA_VERSION: u64 = 1;
const CONTEXT_RADIUS: usize = 3;
const MIN_TERM_LEN: usize = 2;
const BATCH_SIZE: usize = 50;
const DEBOUNCE_WINDOW_MS: u64 = 500;

const STOPWORDS: &[&str] = &[
    "the", "and", "or", "a", "an", "of", "to", "in", "is", "it", "for", "on", "as", "by", "at",
];

/// Line-indexed postings for one document, serialized into the index as an
/// opaque JSON blob plus a version indicator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LineData {
    pub lines: Vec<String>,
    pub term_line_map: HashMap<String, Vec<usize>>,
    pub first_matches: HashMap<String, FirstMatch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirstMatch {
    pub line_number: usize,
    pub line_text: String,
    pub surrounding_context_lines: Vec<String>,
    pub start_line: usize,
    pub end_line: usize,
}

/// Single pass over file content: lowercases tokens, excludes stop-words and
/// terms of length `<= MIN_TERM_LEN`, and records the first occurrence of
/// each term with a fixed-radius surrounding context.
pub fn extract_line_data(content: &str) -> LineData {
    let lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
    let mut term_line_map: HashMap<String, Vec<usize>> = HashMap::new();

    for (idx, line) in lines.iter().enumerate() {
        let line_number = idx + 1;
        for raw_token in tokenize(line) {
            let term = raw_token.to_lowercase();
            if term.len() <= MIN_TERM_LEN || STOPWORDS.contains(&term.as_str()) {
                continue;
            }
            let entry = term_line_map.entry(term).or_default();
            if entry.last() != Some(&line_number) {
                entry.push(line_number);
            }
        }
    }

    let mut first_matches = HashMap::new();
    for (term, line_numbers) in &term_line_map {
        let first_line = *line_numbers.iter().min().unwrap();
        let start_line = first_line.saturating_sub(CONTEXT_RADIUS).max(1);
        let end_line = (first_line + CONTEXT_RADIUS).min(lines.len().max(1));
        let surrounding_context_lines = lines
            .get(start_line.saturating_sub(1)..end_line.min(lines.len()))
            .map(|s| s.to_vec())
            .unwrap_or_default();
        first_matches.insert(
            term.clone(),
            FirstMatch {
                line_number: first_line,
                line_text: lines.get(first_line - 1).cloned().unwrap_or_default(),
                surrounding_context_lines,
                start_line,
                end_line,
            },
        );
    }

    LineData { lines, term_line_map, first_matches }
}

fn tokenize(line: &str) -> Vec<String> {
    line.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Tantivy schema for code documents: one index per workspace, all
/// workspaces share this field layout.
#[derive(Clone)]
pub struct CodeSchema {
    pub schema: Schema,
    pub path: Field,
    pub filename: Field,
    pub directory: Field,
    pub extension: Field,
    pub size: Field,
    pub content: Field,
    pub content_raw: Field,
    pub line_data: Field,
    pub line_data_version: Field,
    pub timestamp_ticks: Field,
}

impl CodeSchema {
    pub fn build() -> Self {
        let mut builder = Schema::builder();
        let path = builder.add_text_field("path", STRING | STORED);
        let filename = builder.add_text_field("filename", TEXT | STORED);
        let directory = builder.add_text_field("directory", TEXT | STORED);
        let extension = builder.add_text_field("extension", STRING | STORED);
        let size = builder.add_u64_field("size", INDEXED | STORED | FAST);
        let content = builder.add_text_field("content", TEXT | STORED);
        let content_raw = builder.add_text_field("content_raw", STRING | STORED);
        let line_data = builder.add_text_field("line_data", STORED);
        let line_data_version = builder.add_u64_field("line_data_version", STORED);
        let timestamp_ticks = builder.add_u64_field("timestamp_ticks", INDEXED | STORED | FAST);
        Self {
            schema: builder.build(),
            path,
            filename,
            directory,
            extension,
            size,
            content,
            content_raw,
            line_data,
            line_data_version,
            timestamp_ticks,
        }
    }

    pub fn build_document(&self, relative_path: &str, content: &str) -> AppResultDoc {
        let p = Path::new(relative_path);
        let filename = p.file_name().map(|f| f.to_string_lossy().to_string()).unwrap_or_default();
        let directory = p.parent().map(|d| d.to_string_lossy().to_string()).unwrap_or_default();
        let extension = p.extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default();
        let line_data = extract_line_data(content);
        let line_data_json = serde_json::to_string(&line_data).unwrap_or_default();

        let mut doc = TantivyDocument::default();
        doc.add_text(self.path, relative_path);
        doc.add_text(self.filename, &filename);
        doc.add_text(self.directory, &directory);
        doc.add_text(self.extension, &extension);
        doc.add_u64(self.size, content.len() as u64);
        doc.add_text(self.content, content);
        doc.add_text(self.content_raw, content);
        doc.add_text(self.line_data, &line_data_json);
        doc.add_u64(self.line_data_version, LINE_DATA_VERSION);
        doc.add_u64(self.timestamp_ticks, now_ticks());
        doc
    }
}

type AppResultDoc = TantivyDocument;

fn now_ticks() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Debounce-batch-dedup loop: coalesces events by path (`Deleted` dominates),
/// groups by workspace, processes deletes before adds/updates, and commits
/// once per workspace per batch.
pub struct IndexingPipeline {
    store: Arc<IndexStore>,
    resolver: Arc<PathResolver>,
    schema: CodeSchema,
}

impl IndexingPipeline {
    pub fn new(store: Arc<IndexStore>, resolver: Arc<PathResolver>) -> Self {
        Self { store, resolver, schema: CodeSchema::build() }
    }

    pub fn schema(&self) -> &CodeSchema {
        &self.schema
    }

    /// Walks `root` and indexes every supported file under it, ignoring
    /// gitignored and blocked directories. Used to build the initial index
    /// for a newly registered or re-activated workspace (the FileWatcher
    /// only covers changes *after* it starts watching).
    pub async fn reindex_workspace(&self, workspace_hash: &str, root: &Path) -> AppResult<usize> {
        let root = root.to_path_buf();
        let files: Vec<PathBuf> = tokio::task::spawn_blocking({
            let root = root.clone();
            move || {
                WalkBuilder::new(&root)
                    .hidden(false)
                    .git_ignore(true)
                    .git_global(true)
                    .git_exclude(true)
                    .max_depth(Some(20))
                    .build()
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
                    .filter(|e| !is_under_blocked_dir(e.path()))
                    .filter(|e| is_indexable(e.path()))
                    .map(|e| e.into_path())
                    .collect()
            }
        })
        .await
        .map_err(|e| AppError::IndexError(format!("workspace walk panicked: {e}")))?;

        info!("reindexing {} file(s) for workspace {workspace_hash}", files.len());

        let mut touched = false;
        for path in &files {
            let relative = path.strip_prefix(&root).unwrap_or(path).to_string_lossy().replace('\\', "/");
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let doc = self.schema.build_document(&relative, &content);
                    match self.store.update(workspace_hash, self.schema.path, &relative, doc).await {
                        Ok(()) => touched = true,
                        Err(e) => warn!("index failed for {relative}: {e}"),
                    }
                }
                Err(e) => debug!("skip unreadable file {relative}: {e}"),
            }
        }

        if touched {
            self.store.commit(workspace_hash).await?;
        }
        Ok(files.len())
    }

    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<FileChangeEvent>) {
        let mut pending: HashMap<(String, std::path::PathBuf), (ChangeKind, Instant)> = HashMap::new();

        loop {
            let first = match rx.recv().await {
                Some(e) => e,
                None => break,
            };
            coalesce(&mut pending, first);

            let deadline = Duration::from_millis(DEBOUNCE_WINDOW_MS);
            while pending.len() < BATCH_SIZE {
                match timeout(deadline, rx.recv()).await {
                    Ok(Some(ev)) => coalesce(&mut pending, ev),
                    _ => break,
                }
            }

            let batch: Vec<((String, std::path::PathBuf), ChangeKind)> =
                pending.drain().map(|(k, (kind, _))| (k, kind)).collect();

            let mut by_workspace: HashMap<String, Vec<(std::path::PathBuf, ChangeKind)>> = HashMap::new();
            for ((ws, path), kind) in batch {
                by_workspace.entry(ws).or_default().push((path, kind));
            }

            for (ws, mut events) in by_workspace {
                events.sort_by_key(|(_, kind)| if *kind == ChangeKind::Deleted { 0 } else { 1 });
                self.process_workspace_batch(&ws, events).await;
            }
        }
    }

    async fn process_workspace_batch(
        &self,
        workspace_hash: &str,
        events: Vec<(std::path::PathBuf, ChangeKind)>,
    ) {
        let mut touched = false;
        for (path, kind) in events {
            let relative = path.to_string_lossy().replace('\\', "/");
            match kind {
                ChangeKind::Deleted => {
                    if let Err(e) = self.store.delete_by_term(workspace_hash, self.schema.path, &relative).await {
                        warn!("delete failed for {}: {e}", relative);
                    } else {
                        touched = true;
                    }
                }
                ChangeKind::Created | ChangeKind::Modified | ChangeKind::Renamed => {
                    match tokio::fs::read_to_string(&path).await {
                        Ok(content) => {
                            if !is_indexable(&path) {
                                continue;
                            }
                            let doc = self.schema.build_document(&relative, &content);
                            if let Err(e) =
                                self.store.update(workspace_hash, self.schema.path, &relative, doc).await
                            {
                                warn!("update failed for {}: {e}", relative);
                            } else {
                                touched = true;
                            }
                        }
                        Err(e) => debug!("skip unreadable file {}: {e}", relative),
                    }
                }
            }
        }

        if touched {
            if let Err(e) = self.store.commit(workspace_hash).await {
                warn!("commit failed for workspace {}: {e}", workspace_hash);
            }
        }
    }
}

fn key(event: &FileChangeEvent) -> (String, std::path::PathBuf) {
    (event.workspace_hash.clone(), event.path.clone())
}

/// Coalesces an incoming event into the pending batch, keeping the latest
/// kind except that once a path is marked `Deleted` it stays `Deleted` for
/// the rest of the debounce window — a later `Modified`/`Created` for the
/// same path within the window can't un-delete it.
fn coalesce(
    pending: &mut HashMap<(String, std::path::PathBuf), (ChangeKind, Instant)>,
    event: FileChangeEvent,
) {
    let k = key(&event);
    match pending.get_mut(&k) {
        Some((ChangeKind::Deleted, seen_at)) => *seen_at = Instant::now(),
        Some(entry) => *entry = (event.kind, Instant::now()),
        None => {
            pending.insert(k, (event.kind, Instant::now()));
        }
    }
}

fn is_indexable(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => is_supported_extension(&ext.to_lowercase()),
        None => matches!(
            path.file_name().and_then(|f| f.to_str()).map(|f| f.to_lowercase()),
            Some(ref n) if n == "dockerfile" || n == "makefile"
        ),
    }
}

fn is_under_blocked_dir(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map(is_blocked_dir_name)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_line_data_excludes_stopwords_and_short_terms() {
        let data = extract_line_data("the fn go to of\nfoo bar baz");
        assert!(!data.term_line_map.contains_key("the"));
        assert!(!data.term_line_map.contains_key("to"));
        assert!(!data.term_line_map.contains_key("go"));
        assert!(data.term_line_map.contains_key("foo"));
    }

    #[test]
    fn first_match_line_number_matches_min_of_term_line_map() {
        let data = extract_line_data("foo\nbar\nfoo again\nbar");
        let fm = &data.first_matches["foo"];
        assert_eq!(fm.line_number, *data.term_line_map["foo"].iter().min().unwrap());
        assert_eq!(fm.line_number, 1);
    }

    #[test]
    fn term_line_map_does_not_duplicate_consecutive_same_line_hits() {
        let data = extract_line_data("foo foo foo");
        assert_eq!(data.term_line_map["foo"], vec![1]);
    }

    #[test]
    fn context_window_is_clamped_to_document_bounds() {
        let data = extract_line_data("one");
        let fm = &data.first_matches["one"];
        assert_eq!(fm.start_line, 1);
        assert!(fm.end_line >= fm.line_number);
    }
}
