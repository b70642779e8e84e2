//! C3 — IndexStore: per-key (workspace or memory-index) single-writer,
//! multi-reader inverted index with on-disk persistence and lock recovery
//! (§4.3). Shared by the code IndexingPipeline (C5) and the MemoryStore (C6) —
//! both open their own `Schema` against their own key, but go through the
//! same writer-serialization and commit discipline.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tantivy::schema::Schema;
use tantivy::{Index, IndexReader, IndexWriter, TantivyDocument, Term};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::error::{AppError, AppResult};

const WRITER_BUFFER_BYTES: usize = 50_000_000;

pub struct IndexHandle {
    pub index: Index,
    pub schema: Schema,
    reader: IndexReader,
    writer: AsyncMutex<Option<IndexWriter>>,
}

impl IndexHandle {
    pub fn searcher(&self) -> tantivy::Searcher {
        self.reader.searcher()
    }

    pub fn reader(&self) -> &IndexReader {
        &self.reader
    }
}

/// Owns the set of open indexes, one per logical key (a workspace hash, or
/// the fixed keys `"project-memory"` / `"local-memory"`).
pub struct IndexStore {
    handles: DashMap<String, Arc<IndexHandle>>,
}

impl IndexStore {
    pub fn new() -> Self {
        Self { handles: DashMap::new() }
    }

    /// Open an existing index at `dir`, or create one with `schema`. Attempts
    /// stale-lock recovery once: if opening fails because of a leftover lock
    /// file from a process that is no longer running, the lock file is
    /// removed and the open is retried.
    pub fn get_or_create(&self, key: &str, dir: &Path, schema: Schema) -> AppResult<Arc<IndexHandle>> {
        if let Some(handle) = self.handles.get(key) {
            return Ok(handle.value().clone());
        }

        std::fs::create_dir_all(dir)?;
        let index = Self::open_with_lock_recovery(dir, &schema)?;
        let reader = index
            .reader()
            .map_err(|e| AppError::IndexError(format!("failed to create reader for {key}: {e}")))?;

        let handle = Arc::new(IndexHandle {
            index,
            schema,
            reader,
            writer: AsyncMutex::new(None),
        });
        self.handles.insert(key.to_string(), handle.clone());
        Ok(handle)
    }

    fn open_with_lock_recovery(dir: &Path, schema: &Schema) -> AppResult<Index> {
        let meta_exists = dir.join("meta.json").exists();
        let attempt = || -> tantivy::Result<Index> {
            if meta_exists {
                Index::open_in_dir(dir)
            } else {
                Index::create_in_dir(dir, schema.clone())
            }
        };

        match attempt() {
            Ok(index) => Ok(index),
            Err(e) => {
                let lock_path = dir.join(".tantivy-writer.lock");
                if lock_path.exists() {
                    warn!("removing stale index lock at {}: {e}", lock_path.display());
                    let _ = std::fs::remove_file(&lock_path);
                    attempt().map_err(|e2| {
                        AppError::IndexError(format!("failed to open index at {}: {e2}", dir.display()))
                    })
                } else {
                    Err(AppError::IndexError(format!("failed to open index at {}: {e}", dir.display())))
                }
            }
        }
    }

    pub fn handle(&self, key: &str) -> AppResult<Arc<IndexHandle>> {
        self.handles
            .get(key)
            .map(|h| h.value().clone())
            .ok_or_else(|| AppError::IndexError(format!("no index open for {key}")))
    }

    pub fn remove(&self, key: &str) {
        self.handles.remove(key);
    }

    /// Acquire the per-index writer, creating it lazily. Serializes all
    /// writer access for a key — Tantivy allows exactly one writer at a time.
    pub async fn add(&self, key: &str, doc: TantivyDocument) -> AppResult<()> {
        let handle = self.handle(key)?;
        let mut slot = handle.writer.lock().await;
        let writer = Self::writer_mut(&handle, &mut slot)?;
        writer
            .add_document(doc)
            .map_err(|e| AppError::IndexError(format!("add_document failed: {e}")))?;
        Ok(())
    }

    pub async fn delete_by_term(&self, key: &str, field: tantivy::schema::Field, value: &str) -> AppResult<()> {
        let handle = self.handle(key)?;
        let mut slot = handle.writer.lock().await;
        let writer = Self::writer_mut(&handle, &mut slot)?;
        writer.delete_term(Term::from_field_text(field, value));
        Ok(())
    }

    /// Atomic delete+add: delete any existing document matching `(field, value)`,
    /// then add `doc` under the same writer lock.
    pub async fn update(
        &self,
        key: &str,
        field: tantivy::schema::Field,
        value: &str,
        doc: TantivyDocument,
    ) -> AppResult<()> {
        let handle = self.handle(key)?;
        let mut slot = handle.writer.lock().await;
        let writer = Self::writer_mut(&handle, &mut slot)?;
        writer.delete_term(Term::from_field_text(field, value));
        writer
            .add_document(doc)
            .map_err(|e| AppError::IndexError(format!("add_document failed: {e}")))?;
        Ok(())
    }

    /// Flush pending writes and reload the reader so subsequent searchers
    /// observe them. No auto-commit on add — callers commit explicitly.
    pub async fn commit(&self, key: &str) -> AppResult<()> {
        let handle = self.handle(key)?;
        let mut slot = handle.writer.lock().await;
        if let Some(writer) = slot.as_mut() {
            writer
                .commit()
                .map_err(|e| AppError::IndexError(format!("commit failed: {e}")))?;
        }
        handle
            .reader
            .reload()
            .map_err(|e| AppError::IndexError(format!("reader reload failed: {e}")))?;
        Ok(())
    }

    fn writer_mut<'a>(
        handle: &Arc<IndexHandle>,
        slot: &'a mut Option<IndexWriter>,
    ) -> AppResult<&'a mut IndexWriter> {
        if slot.is_none() {
            let writer = handle
                .index
                .writer(WRITER_BUFFER_BYTES)
                .map_err(|e| AppError::IndexError(format!("failed to create writer: {e}")))?;
            *slot = Some(writer);
        }
        Ok(slot.as_mut().unwrap())
    }

    pub fn index_dir_exists(dir: &PathBuf) -> bool {
        dir.join("meta.json").exists()
    }
}

impl Default for IndexStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tantivy::doc;
    use tantivy::schema::{STORED, STRING, TEXT};

    fn test_schema() -> (Schema, tantivy::schema::Field, tantivy::schema::Field) {
        let mut builder = Schema::builder();
        let path = builder.add_text_field("path", STRING | STORED);
        let content = builder.add_text_field("content", TEXT | STORED);
        (builder.build(), path, content)
    }

    #[tokio::test]
    async fn add_then_commit_makes_document_searchable() {
        let tmp = tempfile::tempdir().unwrap();
        let (schema, path_field, content_field) = test_schema();
        let store = IndexStore::new();
        let handle = store.get_or_create("ws1", tmp.path(), schema).unwrap();

        store
            .add("ws1", doc!(path_field => "a.txt", content_field => "hello world"))
            .await
            .unwrap();
        store.commit("ws1").await.unwrap();

        let searcher = handle.searcher();
        assert_eq!(searcher.num_docs(), 1);
    }

    #[tokio::test]
    async fn update_replaces_existing_document_for_same_path() {
        let tmp = tempfile::tempdir().unwrap();
        let (schema, path_field, content_field) = test_schema();
        let store = IndexStore::new();
        let handle = store.get_or_create("ws1", tmp.path(), schema).unwrap();

        store.add("ws1", doc!(path_field => "a.txt", content_field => "v1")).await.unwrap();
        store.commit("ws1").await.unwrap();

        store
            .update("ws1", path_field, "a.txt", doc!(path_field => "a.txt", content_field => "v2"))
            .await
            .unwrap();
        store.commit("ws1").await.unwrap();

        assert_eq!(handle.searcher().num_docs(), 1);
    }

    #[tokio::test]
    async fn delete_by_term_then_commit_removes_document() {
        let tmp = tempfile::tempdir().unwrap();
        let (schema, path_field, content_field) = test_schema();
        let store = IndexStore::new();
        let handle = store.get_or_create("ws1", tmp.path(), schema).unwrap();

        store.add("ws1", doc!(path_field => "a.txt", content_field => "v1")).await.unwrap();
        store.commit("ws1").await.unwrap();
        assert_eq!(handle.searcher().num_docs(), 1);

        store.delete_by_term("ws1", path_field, "a.txt").await.unwrap();
        store.commit("ws1").await.unwrap();
        assert_eq!(handle.searcher().num_docs(), 0);
    }
}
