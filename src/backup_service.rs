//! C10 — BackupService: JSON export/import across both memory indexes with
//! write-temp-then-rename atomicity, integrity verification, and
//! per-workspace snapshot rollback on failure (§4.10).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{AppError, AppResult};
use crate::memory::{FieldValue, Memory, MemoryStore};
use crate::path_resolver::PathResolver;

const BACKUP_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct BackupFile {
    version: String,
    #[serde(rename = "backupTime")]
    backup_time: String,
    #[serde(rename = "totalMemories")]
    total_memories: usize,
    memories: Vec<BackupMemory>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupMemory {
    id: String,
    #[serde(rename = "type")]
    memory_type: String,
    content: String,
    created: chrono::DateTime<Utc>,
    modified: chrono::DateTime<Utc>,
    #[serde(rename = "isShared")]
    is_shared: bool,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(rename = "accessCount")]
    access_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    files: Vec<String>,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty", default)]
    fields: std::collections::BTreeMap<String, FieldValue>,
}

impl From<&Memory> for BackupMemory {
    fn from(m: &Memory) -> Self {
        Self {
            id: m.id.clone(),
            memory_type: m.memory_type.clone(),
            content: m.content.clone(),
            created: m.created,
            modified: m.modified,
            is_shared: m.is_shared,
            session_id: m.session_id.clone(),
            access_count: m.access_count,
            files: m.files_involved.iter().cloned().collect(),
            fields: m.fields.clone(),
        }
    }
}

impl From<BackupMemory> for Memory {
    fn from(b: BackupMemory) -> Self {
        Memory {
            id: b.id,
            memory_type: b.memory_type,
            content: b.content,
            created: b.created,
            modified: b.modified,
            last_accessed: b.modified,
            access_count: b.access_count,
            is_shared: b.is_shared,
            session_id: b.session_id,
            files_involved: b.files.into_iter().collect(),
            fields: b.fields,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExportResult {
    pub success: bool,
    pub count: usize,
    pub path: PathBuf,
    pub time: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ImportResult {
    pub success: bool,
    pub count: usize,
    pub time: chrono::DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One exclusive global backup mutex (§5 shared-resource policy), as opposed
/// to per-workspace locking: export/import touch both memory indexes at
/// once, so two overlapping backups would race on the same files.
pub struct BackupService {
    memory_store: Arc<MemoryStore>,
    resolver: Arc<PathResolver>,
    breaker: Arc<CircuitBreaker>,
    lock: AsyncMutex<()>,
}

impl BackupService {
    pub fn new(memory_store: Arc<MemoryStore>, resolver: Arc<PathResolver>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { memory_store, resolver, breaker, lock: AsyncMutex::new(()) }
    }

    pub async fn export(&self) -> AppResult<ExportResult> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let memories = self.memory_store.all().await;
        let file = BackupFile {
            version: BACKUP_FORMAT_VERSION.to_string(),
            backup_time: now.to_rfc3339(),
            total_memories: memories.len(),
            memories: memories.iter().map(BackupMemory::from).collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let dir = self.resolver.backups_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let final_name = format!("memories_{}.json", now.format("%Y%m%d_%H%M%S"));
        let final_path = dir.join(&final_name);
        let tmp_path = final_path.with_extension("json.tmp");

        let write_json = json.clone();
        let write_path = tmp_path.clone();
        self.breaker
            .execute("backup_export_write", || async move {
                tokio::fs::write(&write_path, &write_json)
                    .await
                    .map_err(|e| AppError::BackupError(format!("failed to write backup: {e}")))
            })
            .await?;

        verify_integrity(&tmp_path, file.total_memories).await?;

        let rename_from = tmp_path.clone();
        let rename_to = final_path.clone();
        self.breaker
            .execute("backup_export_rename", || async move {
                tokio::fs::rename(&rename_from, &rename_to)
                    .await
                    .map_err(|e| AppError::BackupError(format!("failed to finalize backup: {e}")))
            })
            .await?;

        Ok(ExportResult { success: true, count: file.total_memories, path: final_path, time: now })
    }

    pub async fn import(
        &self,
        path: Option<&Path>,
        types: Option<&[String]>,
        include_local: bool,
    ) -> AppResult<ImportResult> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();

        let chosen = match path {
            Some(p) => p.to_path_buf(),
            None => most_recent_backup(&self.resolver.backups_dir()).await?,
        };
        let file = read_and_verify(&chosen).await?;

        let restore_set: Vec<Memory> = file
            .memories
            .into_iter()
            .map(Memory::from)
            .filter(|m| match types {
                Some(types) => types.iter().any(|t| t == &m.memory_type),
                None => include_local || m.is_shared,
            })
            .collect();

        let mut snapshots: Vec<Memory> = Vec::new();
        for candidate in &restore_set {
            if let Some(existing) = self.memory_store.get_by_id(&candidate.id).await {
                snapshots.push(existing);
            }
        }

        match self.restore_all(&restore_set).await {
            Ok(()) => Ok(ImportResult { success: true, count: restore_set.len(), time: now, error: None }),
            Err(e) => {
                warn!("backup import failed, rolling back {} snapshot(s): {e}", snapshots.len());
                if let Err(rollback_err) = self.rollback(&restore_set, &snapshots).await {
                    warn!("backup import rollback also failed: {rollback_err}");
                }
                Ok(ImportResult { success: false, count: 0, time: now, error: Some(e.to_string()) })
            }
        }
    }

    async fn restore_all(&self, memories: &[Memory]) -> AppResult<()> {
        let mut touched_project = false;
        let mut touched_local = false;
        for memory in memories {
            self.memory_store.replace_raw(memory).await?;
            if memory.is_shared {
                touched_project = true;
            } else {
                touched_local = true;
            }
        }
        if touched_project {
            self.memory_store.commit_key(MemoryStore::route_key(true)).await?;
        }
        if touched_local {
            self.memory_store.commit_key(MemoryStore::route_key(false)).await?;
        }
        Ok(())
    }

    /// Deletes every restored id, re-adds the pre-existing snapshot for ids
    /// that had one, then commits both touched indexes.
    async fn rollback(&self, restored: &[Memory], snapshots: &[Memory]) -> AppResult<()> {
        let mut touched_project = false;
        let mut touched_local = false;
        for memory in restored {
            let _ = self.memory_store.delete_raw(&memory.id, memory.is_shared).await;
            if memory.is_shared {
                touched_project = true;
            } else {
                touched_local = true;
            }
        }
        for original in snapshots {
            self.memory_store.replace_raw(original).await?;
            if original.is_shared {
                touched_project = true;
            } else {
                touched_local = true;
            }
        }
        if touched_project {
            self.memory_store.commit_key(MemoryStore::route_key(true)).await?;
        }
        if touched_local {
            self.memory_store.commit_key(MemoryStore::route_key(false)).await?;
        }
        Ok(())
    }
}

async fn verify_integrity(path: &Path, expected_count: usize) -> AppResult<()> {
    let file = read_and_verify(path).await?;
    if file.memories.len() != expected_count {
        return Err(AppError::BackupError(format!(
            "backup integrity check failed: expected {expected_count} memories, found {}",
            file.memories.len()
        )));
    }
    Ok(())
}

async fn read_and_verify(path: &Path) -> AppResult<BackupFile> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| AppError::BackupError(format!("failed to read backup {}: {e}", path.display())))?;
    let file: BackupFile = serde_json::from_slice(&bytes)
        .map_err(|e| AppError::BackupError(format!("backup file is not valid JSON: {e}")))?;
    if file.version.is_empty() || file.memories.len() != file.total_memories {
        return Err(AppError::BackupError("backup file failed integrity check".to_string()));
    }
    for memory in &file.memories {
        if memory.id.is_empty() || memory.memory_type.is_empty() {
            return Err(AppError::BackupError("backup entry missing required field".to_string()));
        }
    }
    Ok(file)
}

async fn most_recent_backup(dir: &Path) -> AppResult<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| AppError::BackupError(format!("failed to list backups dir: {e}")))?;
    let mut candidates: Vec<(String, PathBuf)> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AppError::BackupError(format!("failed to read backups dir entry: {e}")))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("memories_") && name.ends_with(".json") && !name.ends_with(".json.tmp") {
            candidates.push((name, entry.path()));
        }
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0));
    candidates
        .pop()
        .map(|(_, p)| p)
        .ok_or_else(|| AppError::BackupError("no backup files found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_store::IndexStore;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_memory(id: &str, is_shared: bool) -> Memory {
        let mut m = Memory::new("Note".to_string(), "hello world".to_string(), is_shared);
        m.id = id.to_string();
        m
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<PathResolver>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let resolver = Arc::new(PathResolver::new(dir.path().to_path_buf()));
        resolver.ensure_layout().await.unwrap();
        let index_store = Arc::new(IndexStore::new());
        let memory_store = Arc::new(
            MemoryStore::new(index_store, &resolver.project_memory_dir(), &resolver.local_memory_dir()).unwrap(),
        );
        (memory_store, resolver, dir)
    }

    #[tokio::test]
    async fn export_then_import_round_trips_all_memories() {
        let (memory_store, resolver, _dir) = setup().await;
        memory_store.store(sample_memory("a", true)).await;
        memory_store.store(sample_memory("b", false)).await;

        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(60)));
        let service = BackupService::new(memory_store.clone(), resolver.clone(), breaker);

        let export = service.export().await.unwrap();
        assert!(export.success);
        assert_eq!(export.count, 2);
        assert!(export.path.exists());

        let import = service.import(Some(&export.path), None, true).await.unwrap();
        assert!(import.success);
        assert_eq!(import.count, 2);
    }

    #[tokio::test]
    async fn import_excludes_local_memories_when_include_local_is_false() {
        let (memory_store, resolver, _dir) = setup().await;
        memory_store.store(sample_memory("shared-1", true)).await;
        memory_store.store(sample_memory("local-1", false)).await;

        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(60)));
        let service = BackupService::new(memory_store.clone(), resolver.clone(), breaker);
        let export = service.export().await.unwrap();

        let import = service.import(Some(&export.path), None, false).await.unwrap();
        assert!(import.success);
        assert_eq!(import.count, 1);
    }

    #[tokio::test]
    async fn import_missing_file_fails_gracefully() {
        let (memory_store, resolver, _dir) = setup().await;
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(60)));
        let service = BackupService::new(memory_store, resolver, breaker);

        let result = service.import(Some(Path::new("/nonexistent/memories_x.json")), None, true).await;
        assert!(result.is_err());
    }
}
