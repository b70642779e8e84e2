//! C12 — SemanticIndex: external-interface-only component. Wraps an
//! `EmbeddingBackend` + `VectorIndex` pair behind a single orchestrator so
//! MemoryStore writes can fire-and-forget an embedding update (§4.12, §9
//! redesign note on explicit traits replacing an ambient circular graph).

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

use crate::error::{AppError, AppResult};
use crate::memory::Memory;

pub const EMBEDDING_DIM: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticHit {
    pub id: String,
    pub score: f32,
    pub distance: f32,
    pub metadata: serde_json::Value,
}

/// Turns text into a fixed-size embedding vector. The production backend is
/// Qwen3-Embedding-0.6B via fastembed's candle backend (`Qwen3Backend`).
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>>;
    fn dimension(&self) -> usize;
}

/// Upserts and queries vectors by id. The production backend is an HNSW
/// index via `usearch` (`UsearchVectorIndex`).
pub trait VectorIndex: Send + Sync {
    fn upsert(&self, id: &str, embedding: Vec<f32>, metadata: serde_json::Value) -> AppResult<()>;
    fn remove(&self, id: &str) -> AppResult<()>;
    fn search(&self, query: &[f32], k: usize, threshold: f32) -> AppResult<Vec<SemanticHit>>;
    fn save(&self) -> AppResult<()>;
}

/// Composition root tying an embedding backend to a vector index for one
/// logical memory space (project or local).
pub struct SemanticIndex {
    backend: Arc<dyn EmbeddingBackend>,
    vector_index: Arc<dyn VectorIndex>,
}

impl SemanticIndex {
    pub fn new(backend: Arc<dyn EmbeddingBackend>, vector_index: Arc<dyn VectorIndex>) -> Self {
        Self { backend, vector_index }
    }

    /// Called after every successful store/update in MemoryStore. Failures
    /// are logged and swallowed — they must never fail the primary write.
    pub async fn index(&self, memory: &Memory) {
        let text = embeddable_text(memory);
        match self.backend.embed(&text).await {
            Ok(embedding) => {
                let metadata = serde_json::json!({
                    "type": memory.memory_type,
                    "isShared": memory.is_shared,
                    "files": memory.files_involved,
                });
                if let Err(e) = self.vector_index.upsert(&memory.id, embedding, metadata) {
                    warn!("semantic index upsert failed for {}: {e}", memory.id);
                }
            }
            Err(e) => warn!("embedding failed for {}: {e}", memory.id),
        }
    }

    pub fn remove(&self, id: &str) {
        if let Err(e) = self.vector_index.remove(id) {
            warn!("semantic index remove failed for {id}: {e}");
        }
    }

    pub async fn semantic_search(&self, query: &str, k: usize, threshold: f32) -> AppResult<Vec<SemanticHit>> {
        let embedding = self.backend.embed(query).await?;
        self.vector_index.search(&embedding, k, threshold)
    }

    pub async fn find_similar(&self, memory: &Memory, k: usize, threshold: f32) -> AppResult<Vec<SemanticHit>> {
        let text = embeddable_text(memory);
        let embedding = self.backend.embed(&text).await?;
        let mut hits = self.vector_index.search(&embedding, k + 1, threshold)?;
        hits.retain(|h| h.id != memory.id);
        hits.truncate(k);
        Ok(hits)
    }
}

fn embeddable_text(memory: &Memory) -> String {
    let mut parts = vec![memory.content.clone(), memory.memory_type.clone()];
    parts.extend(memory.files_involved.iter().cloned());
    for (k, v) in &memory.fields {
        if let Some(s) = v.as_str() {
            parts.push(format!("{k}: {s}"));
        }
    }
    parts.join("\n")
}

// ---------------------------------------------------------------------------
// Production backends
// ---------------------------------------------------------------------------

const QWEN3_REPO_ID: &str = "Qwen/Qwen3-Embedding-0.6B";
const QWEN3_MAX_LENGTH: usize = 8192;

/// `EmbeddingBackend` over fastembed's Qwen3-Embedding-0.6B (candle, CPU).
/// Lazily initialized on first use, same as the teacher's `EmbeddingManager`.
pub struct Qwen3Backend {
    model: Arc<std::sync::Mutex<Option<fastembed::Qwen3TextEmbedding>>>,
}

impl Qwen3Backend {
    pub fn new() -> Self {
        Self { model: Arc::new(std::sync::Mutex::new(None)) }
    }

    fn ensure_model(&self) -> AppResult<()> {
        let mut guard = self.model.lock().map_err(|e| AppError::Internal(anyhow::anyhow!("model lock poisoned: {e}")))?;
        if guard.is_some() {
            return Ok(());
        }
        let model = fastembed::Qwen3TextEmbedding::from_hf(
            QWEN3_REPO_ID,
            &candle_core::Device::Cpu,
            candle_core::DType::F32,
            QWEN3_MAX_LENGTH,
        )
        .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to init Qwen3 embedding model: {e}")))?;
        *guard = Some(model);
        Ok(())
    }
}

impl Default for Qwen3Backend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingBackend for Qwen3Backend {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        self.ensure_model()?;
        let text = text.to_string();
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || {
            let guard = model.lock().map_err(|e| AppError::Internal(anyhow::anyhow!("model lock poisoned: {e}")))?;
            let model = guard.as_ref().ok_or_else(|| AppError::Internal(anyhow::anyhow!("embedding model not initialized")))?;
            model
                .embed(&[text])
                .map_err(|e| AppError::Internal(anyhow::anyhow!("embedding inference failed: {e}")))
                .map(|mut v| v.pop().unwrap_or_default())
        })
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("embedding task panicked: {e}")))?
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }
}

#[derive(Serialize, Deserialize, Default)]
struct VectorMetaFile {
    entries: Vec<(u64, String, serde_json::Value)>,
    next_key: u64,
}

/// `VectorIndex` over a single-workspace HNSW index via `usearch`.
pub struct UsearchVectorIndex {
    index: usearch::Index,
    key_by_id: DashMap<String, u64>,
    metadata_by_key: DashMap<u64, serde_json::Value>,
    next_key: AtomicU64,
    index_path: PathBuf,
    meta_path: PathBuf,
}

impl UsearchVectorIndex {
    pub fn open_or_create(dir: &Path, dimension: usize) -> AppResult<Self> {
        std::fs::create_dir_all(dir)?;
        let index_path = dir.join("vectors.usearch");
        let meta_path = dir.join("vectors.meta.json");

        let options = IndexOptions {
            dimensions: dimension,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F16,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let index = usearch::Index::new(&options)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to create vector index: {e}")))?;
        if index_path.exists() {
            index
                .load(index_path.to_string_lossy().as_ref())
                .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to load vector index: {e}")))?;
        } else {
            index
                .reserve(1024)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to reserve vector index capacity: {e}")))?;
        }

        let key_by_id = DashMap::new();
        let metadata_by_key = DashMap::new();
        let mut next_key = 0u64;
        if let Ok(bytes) = std::fs::read(&meta_path) {
            if let Ok(meta) = serde_json::from_slice::<VectorMetaFile>(&bytes) {
                next_key = meta.next_key;
                for (key, id, metadata) in meta.entries {
                    key_by_id.insert(id, key);
                    metadata_by_key.insert(key, metadata);
                }
            }
        }

        Ok(Self {
            index,
            key_by_id,
            metadata_by_key,
            next_key: AtomicU64::new(next_key),
            index_path,
            meta_path,
        })
    }

    fn persist_metadata(&self) -> AppResult<()> {
        let entries = self
            .key_by_id
            .iter()
            .map(|kv| {
                let id = kv.key().clone();
                let key = *kv.value();
                let metadata = self.metadata_by_key.get(&key).map(|m| m.clone()).unwrap_or_default();
                (key, id, metadata)
            })
            .collect();
        let meta = VectorMetaFile { entries, next_key: self.next_key.load(Ordering::Relaxed) };
        let json = serde_json::to_vec(&meta)?;
        let tmp = self.meta_path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.meta_path)?;
        Ok(())
    }
}

impl VectorIndex for UsearchVectorIndex {
    fn upsert(&self, id: &str, embedding: Vec<f32>, metadata: serde_json::Value) -> AppResult<()> {
        if let Some(existing) = self.key_by_id.get(id) {
            let _ = self.index.remove(*existing);
        }
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        if self.index.size() + 1 > self.index.capacity() {
            self.index
                .reserve(self.index.capacity() * 2 + 64)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("vector index reserve failed: {e}")))?;
        }
        self.index
            .add(key, &embedding)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("vector index add failed: {e}")))?;
        self.key_by_id.insert(id.to_string(), key);
        self.metadata_by_key.insert(key, metadata);
        Ok(())
    }

    fn remove(&self, id: &str) -> AppResult<()> {
        if let Some((_, key)) = self.key_by_id.remove(id) {
            let _ = self.index.remove(key);
            self.metadata_by_key.remove(&key);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize, threshold: f32) -> AppResult<Vec<SemanticHit>> {
        let matches = self
            .index
            .search(query, k)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("vector search failed: {e}")))?;

        let mut out = Vec::new();
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let score = 1.0 - distance;
            if score < threshold {
                continue;
            }
            let Some(id) = self.key_by_id.iter().find(|kv| *kv.value() == *key).map(|kv| kv.key().clone()) else {
                continue;
            };
            let metadata = self.metadata_by_key.get(key).map(|m| m.clone()).unwrap_or_default();
            out.push(SemanticHit { id, score, distance: *distance, metadata });
        }
        Ok(out)
    }

    fn save(&self) -> AppResult<()> {
        self.index
            .save(self.index_path.to_string_lossy().as_ref())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("vector index save failed: {e}")))?;
        self.persist_metadata()
    }
}
