//! C2 — WorkspaceRegistry: durable JSON catalog of indexed workspaces plus
//! orphaned-index tracking (§3, §4.2, §6).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::{AppError, AppResult};
use crate::path_resolver::PathResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkspaceStatus {
    Active,
    Missing,
    Corrupted,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub hash: String,
    #[serde(rename = "originalPath")]
    pub original_path: String,
    #[serde(rename = "directoryName")]
    pub directory_name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub status: WorkspaceStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastAccessed")]
    pub last_accessed: DateTime<Utc>,
    #[serde(rename = "documentCount")]
    pub document_count: usize,
    #[serde(rename = "indexSizeBytes")]
    pub index_size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrphanReason {
    NoMetadata,
    CorruptedMetadata,
    WorkspaceMoved,
    WorkspaceDeleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrphanedIndex {
    #[serde(rename = "directoryName")]
    pub directory_name: String,
    #[serde(rename = "discoveredAt")]
    pub discovered_at: DateTime<Utc>,
    #[serde(rename = "lastModified")]
    pub last_modified: DateTime<Utc>,
    pub reason: OrphanReason,
    #[serde(rename = "scheduledForDeletion")]
    pub scheduled_for_deletion: DateTime<Utc>,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
    #[serde(rename = "attemptedPath")]
    pub attempted_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStatistics {
    #[serde(rename = "totalWorkspaces")]
    pub total_workspaces: usize,
    #[serde(rename = "totalOrphans")]
    pub total_orphans: usize,
    #[serde(rename = "totalIndexSizeBytes")]
    pub total_index_size_bytes: u64,
    #[serde(rename = "totalDocuments")]
    pub total_documents: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryFile {
    workspaces: std::collections::HashMap<String, Workspace>,
    #[serde(rename = "orphanedIndexes")]
    orphaned_indexes: std::collections::HashMap<String, OrphanedIndex>,
    #[serde(rename = "lastUpdated")]
    last_updated: DateTime<Utc>,
    statistics: RegistryStatistics,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            workspaces: Default::default(),
            orphaned_indexes: Default::default(),
            last_updated: Utc::now(),
            statistics: RegistryStatistics::default(),
        }
    }
}

/// Single-entry sliding-TTL cache: avoids re-reading/re-cloning the registry
/// file contents on every read within the TTL window (§4.2).
struct ReadCache {
    snapshot: Option<(Instant, Vec<Workspace>)>,
    ttl: std::time::Duration,
}

pub struct WorkspaceRegistry {
    workspaces: DashMap<String, Workspace>,
    orphans: DashMap<String, OrphanedIndex>,
    data_dir: PathBuf,
    save_lock: Mutex<()>,
    read_cache: Mutex<ReadCache>,
    orphan_grace_period_days: i64,
}

impl WorkspaceRegistry {
    pub fn new(data_dir: PathBuf, cache_ttl_secs: u64, orphan_grace_period_days: i64) -> Self {
        let registry = Self {
            workspaces: DashMap::new(),
            orphans: DashMap::new(),
            data_dir,
            save_lock: Mutex::new(()),
            read_cache: Mutex::new(ReadCache {
                snapshot: None,
                ttl: std::time::Duration::from_secs(cache_ttl_secs),
            }),
            orphan_grace_period_days,
        };
        registry.load();
        registry
    }

    fn registry_file(&self) -> PathBuf {
        self.data_dir.join("workspace_registry.json")
    }

    fn backup_file(&self) -> PathBuf {
        self.data_dir.join("workspace_registry.json.backup")
    }

    /// Load the primary registry file; fall back to the backup copy if the
    /// primary is missing or corrupt; otherwise start from an empty registry.
    fn load(&self) {
        let loaded = std::fs::read_to_string(self.registry_file())
            .ok()
            .and_then(|s| serde_json::from_str::<RegistryFile>(&s).ok())
            .or_else(|| {
                std::fs::read_to_string(self.backup_file())
                    .ok()
                    .and_then(|s| serde_json::from_str::<RegistryFile>(&s).ok())
            })
            .unwrap_or_default();

        for (hash, ws) in loaded.workspaces {
            self.workspaces.insert(hash, ws);
        }
        for (dir, orphan) in loaded.orphaned_indexes {
            self.orphans.insert(dir, orphan);
        }
    }

    fn snapshot(&self) -> RegistryFile {
        let workspaces: std::collections::HashMap<String, Workspace> = self
            .workspaces
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let orphaned_indexes: std::collections::HashMap<String, OrphanedIndex> = self
            .orphans
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let statistics = RegistryStatistics {
            total_workspaces: workspaces.len(),
            total_orphans: orphaned_indexes.len(),
            total_index_size_bytes: workspaces.values().map(|w| w.index_size_bytes).sum(),
            total_documents: workspaces.values().map(|w| w.document_count).sum(),
        };
        RegistryFile {
            workspaces,
            orphaned_indexes,
            last_updated: Utc::now(),
            statistics,
        }
    }

    /// Write-temp-then-rename the primary file, then copy it over the backup.
    /// Guarded by a mutex — one exclusive writer across all registry mutations.
    fn persist(&self) -> AppResult<()> {
        let _guard = self.save_lock.lock();
        std::fs::create_dir_all(&self.data_dir)?;
        let json = serde_json::to_string_pretty(&self.snapshot())?;

        let target = self.registry_file();
        let tmp = target.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &target)?;
        std::fs::copy(&target, self.backup_file())?;

        self.read_cache.lock().snapshot = None;
        Ok(())
    }

    /// Idempotent registration: creates a new entry, or refreshes
    /// `last_accessed` on an existing one. Promotes a matching orphan record.
    pub fn register(&self, resolver: &PathResolver, original_path: &str) -> AppResult<Workspace> {
        let canonical = resolver.canonicalize(original_path)?;
        let hash = resolver.workspace_hash(&canonical);

        if let Some(mut existing) = self.workspaces.get_mut(&hash) {
            existing.last_accessed = Utc::now();
            existing.status = WorkspaceStatus::Active;
            let result = existing.clone();
            drop(existing);
            self.persist()?;
            return Ok(result);
        }

        let directory_name = canonical
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| hash.clone());

        let workspace = Workspace {
            hash: hash.clone(),
            original_path: canonical.to_string_lossy().to_string(),
            directory_name: directory_name.clone(),
            display_name: directory_name,
            status: WorkspaceStatus::Active,
            created_at: Utc::now(),
            last_accessed: Utc::now(),
            document_count: 0,
            index_size_bytes: 0,
        };

        self.workspaces.insert(hash.clone(), workspace.clone());
        // Promote a matching orphan, if any — its index directory is reused.
        let orphan_dir = format!("{}_{}", workspace.directory_name, hash);
        self.orphans.remove(&orphan_dir);
        self.persist()?;
        Ok(workspace)
    }

    pub fn unregister(&self, hash: &str) -> AppResult<()> {
        self.workspaces
            .remove(hash)
            .ok_or_else(|| AppError::WorkspaceNotFound(hash.to_string()))?;
        self.persist()?;
        Ok(())
    }

    pub fn get_by_hash(&self, hash: &str) -> AppResult<Workspace> {
        self.workspaces
            .get(hash)
            .map(|e| e.value().clone())
            .ok_or_else(|| AppError::WorkspaceNotFound(hash.to_string()))
    }

    pub fn get_by_path(&self, resolver: &PathResolver, path: &str) -> AppResult<Workspace> {
        let canonical = resolver.canonicalize(path)?;
        let hash = resolver.workspace_hash(&canonical);
        self.get_by_hash(&hash)
    }

    pub fn get_by_directory_name(&self, directory_name: &str) -> AppResult<Workspace> {
        self.workspaces
            .iter()
            .find(|e| e.value().directory_name == directory_name)
            .map(|e| e.value().clone())
            .ok_or_else(|| AppError::WorkspaceNotFound(directory_name.to_string()))
    }

    pub fn is_registered(&self, hash: &str) -> bool {
        self.workspaces.contains_key(hash)
    }

    /// All registered workspaces, most-recently-accessed first. Served from
    /// the sliding-TTL cache when fresh.
    pub fn all(&self) -> Vec<Workspace> {
        let mut cache = self.read_cache.lock();
        if let Some((fetched_at, snapshot)) = &cache.snapshot {
            if fetched_at.elapsed() < cache.ttl {
                return snapshot.clone();
            }
        }
        let mut workspaces: Vec<Workspace> =
            self.workspaces.iter().map(|e| e.value().clone()).collect();
        workspaces.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        cache.snapshot = Some((Instant::now(), workspaces.clone()));
        workspaces
    }

    pub fn update_status(&self, hash: &str, status: WorkspaceStatus) -> AppResult<()> {
        let mut ws = self
            .workspaces
            .get_mut(hash)
            .ok_or_else(|| AppError::WorkspaceNotFound(hash.to_string()))?;
        ws.status = status;
        drop(ws);
        self.persist()
    }

    pub fn update_last_accessed(&self, hash: &str) -> AppResult<()> {
        let mut ws = self
            .workspaces
            .get_mut(hash)
            .ok_or_else(|| AppError::WorkspaceNotFound(hash.to_string()))?;
        ws.last_accessed = Utc::now();
        drop(ws);
        self.persist()
    }

    pub fn update_statistics(&self, hash: &str, documents: usize, size_bytes: u64) -> AppResult<()> {
        let mut ws = self
            .workspaces
            .get_mut(hash)
            .ok_or_else(|| AppError::WorkspaceNotFound(hash.to_string()))?;
        ws.document_count = documents;
        ws.index_size_bytes = size_bytes;
        drop(ws);
        self.persist()
    }

    pub fn mark_orphaned(
        &self,
        directory_name: &str,
        reason: OrphanReason,
        attempted_path: Option<String>,
    ) -> AppResult<()> {
        let now = Utc::now();
        self.orphans.insert(
            directory_name.to_string(),
            OrphanedIndex {
                directory_name: directory_name.to_string(),
                discovered_at: now,
                last_modified: now,
                reason,
                scheduled_for_deletion: now + chrono::Duration::days(self.orphan_grace_period_days),
                size_bytes: 0,
                attempted_path,
            },
        );
        self.persist()
    }

    pub fn remove_orphaned(&self, directory_name: &str) -> AppResult<()> {
        self.orphans.remove(directory_name);
        self.persist()
    }

    pub fn orphans_ready_for_cleanup(&self) -> Vec<OrphanedIndex> {
        let now = Utc::now();
        self.orphans
            .iter()
            .filter(|e| e.value().scheduled_for_deletion <= now)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Scan on-disk index directories once at startup; directories with no
    /// matching registry entry and no legacy metadata file are marked
    /// orphaned with reason `NoMetadata`.
    pub fn migrate_orphans(&self, indexes_dir: &Path) -> AppResult<()> {
        if !indexes_dir.exists() {
            return Ok(());
        }
        let known_dirs: std::collections::HashSet<String> = self
            .workspaces
            .iter()
            .map(|e| format!("{}_{}", e.value().directory_name, e.value().hash))
            .collect();

        for entry in std::fs::read_dir(indexes_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if known_dirs.contains(&name) || self.orphans.contains_key(&name) {
                continue;
            }
            self.mark_orphaned(&name, OrphanReason::NoMetadata, None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_resolver::PathResolver;

    fn test_registry() -> (tempfile::TempDir, WorkspaceRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = WorkspaceRegistry::new(tmp.path().to_path_buf(), 0, 7);
        (tmp, registry)
    }

    #[test]
    fn register_is_idempotent_and_updates_last_accessed() {
        let (tmp, registry) = test_registry();
        let ws_dir = tmp.path().join("proj");
        std::fs::create_dir_all(&ws_dir).unwrap();
        let resolver = PathResolver::new(tmp.path().join(".codesearch"));

        let first = registry.register(&resolver, ws_dir.to_str().unwrap()).unwrap();
        let second = registry.register(&resolver, ws_dir.to_str().unwrap()).unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn persist_survives_reload_via_backup_fallback() {
        let (tmp, registry) = test_registry();
        let ws_dir = tmp.path().join("proj");
        std::fs::create_dir_all(&ws_dir).unwrap();
        let resolver = PathResolver::new(tmp.path().join(".codesearch"));
        let ws = registry.register(&resolver, ws_dir.to_str().unwrap()).unwrap();

        // Corrupt the primary file; reload should fall back to the backup copy.
        std::fs::write(tmp.path().join("workspace_registry.json"), b"not json").unwrap();
        let reloaded = WorkspaceRegistry::new(tmp.path().to_path_buf(), 0, 7);
        assert!(reloaded.is_registered(&ws.hash));
    }

    #[test]
    fn orphans_ready_for_cleanup_respects_grace_period() {
        let (_tmp, registry) = test_registry();
        registry.mark_orphaned("stale_dir", OrphanReason::NoMetadata, None).unwrap();
        assert!(registry.orphans_ready_for_cleanup().is_empty());
    }
}
