use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::info;

use crate::backup_service::BackupService;
use crate::circuit_breaker::CircuitBreaker;
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::faceting::FacetingService;
use crate::index_store::IndexStore;
use crate::lifecycle::LifecycleEngine;
use crate::memory::MemoryStore;
use crate::path_resolver::PathResolver;
use crate::pipeline::IndexingPipeline;
use crate::registry::WorkspaceRegistry;
use crate::semantic::{Qwen3Backend, SemanticIndex, UsearchVectorIndex};
use crate::watcher::FileWatcher;

/// Events broadcast to all connected WebSocket clients.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "workspace_created")]
    WorkspaceCreated { workspace_hash: String, path: String },
    #[serde(rename = "workspace_removed")]
    WorkspaceRemoved { workspace_hash: String },
    #[serde(rename = "index_started")]
    IndexingStarted { workspace_hash: String },
    #[serde(rename = "index_complete")]
    IndexingCompleted { workspace_hash: String },
    #[serde(rename = "index_error")]
    IndexingError { workspace_hash: String, error: String },
    #[serde(rename = "file_changed")]
    FileChanged { workspace_hash: String, path: String, change_type: String },
    #[serde(rename = "memory_written")]
    MemoryWritten { id: String, is_shared: bool },
}

impl ServerEvent {
    /// The workspace a WebSocket subscriber would filter this event by, if
    /// any. `MemoryWritten` has no workspace scope and is broadcast to every
    /// subscriber regardless of subscription set.
    pub fn workspace_hash(&self) -> Option<&str> {
        match self {
            ServerEvent::WorkspaceCreated { workspace_hash, .. }
            | ServerEvent::WorkspaceRemoved { workspace_hash }
            | ServerEvent::IndexingStarted { workspace_hash }
            | ServerEvent::IndexingCompleted { workspace_hash }
            | ServerEvent::IndexingError { workspace_hash, .. }
            | ServerEvent::FileChanged { workspace_hash, .. } => Some(workspace_hash),
            ServerEvent::MemoryWritten { .. } => None,
        }
    }
}

/// Composition root. Wires C1-C12 together and owns the broadcast channel
/// feeding the WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub resolver: Arc<PathResolver>,
    pub registry: Arc<WorkspaceRegistry>,
    pub index_store: Arc<IndexStore>,
    pub watcher: Arc<FileWatcher>,
    pub pipeline: Arc<IndexingPipeline>,
    pub memory_store: Arc<MemoryStore>,
    pub faceting: Arc<FacetingService>,
    pub lifecycle: Arc<LifecycleEngine>,
    pub backup: Arc<BackupService>,
    pub semantic: Arc<SemanticIndex>,
    pub event_tx: broadcast::Sender<ServerEvent>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let (event_tx, _) = broadcast::channel(1024);

        let base_dir = std::path::PathBuf::from(&config.data_dir);
        let resolver = Arc::new(PathResolver::new(base_dir.clone()));
        resolver.ensure_layout().await?;

        let registry = Arc::new(WorkspaceRegistry::new(
            base_dir.clone(),
            config.registry_cache_ttl_secs,
            config.orphan_grace_period_days,
        ));
        registry.migrate_orphans(&base_dir.join("indexes"))?;

        let index_store = Arc::new(IndexStore::new());

        let memory_store = Arc::new(MemoryStore::new(
            index_store.clone(),
            &resolver.project_memory_dir(),
            &resolver.local_memory_dir(),
        )?);

        let faceting = Arc::new(FacetingService::new(Duration::from_secs(config.facet_cache_ttl_secs)));

        let (watcher, watcher_rx) = FileWatcher::new(config.watcher_debounce_ms, 4096);
        let watcher = Arc::new(watcher);

        // The watcher emits one event stream, but two independent consumers
        // (the indexing pipeline and the lifecycle engine) need their own
        // copy of every event. Fan the single channel out into two.
        let (pipeline_tx, pipeline_rx) = tokio::sync::mpsc::channel(4096);
        let (lifecycle_tx, lifecycle_rx) = tokio::sync::mpsc::channel(4096);
        tokio::spawn(fan_out_events(watcher_rx, pipeline_tx, lifecycle_tx));

        let pipeline = Arc::new(IndexingPipeline::new(index_store.clone(), resolver.clone()));
        tokio::spawn(pipeline.clone().run(pipeline_rx));

        let lifecycle = Arc::new(LifecycleEngine::new(memory_store.clone(), resolver.clone(), config.clone()));
        tokio::spawn(lifecycle.clone().run(lifecycle_rx));

        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_failure_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
        ));
        let backup = Arc::new(BackupService::new(memory_store.clone(), resolver.clone(), breaker));

        let embedding_backend = Arc::new(Qwen3Backend::new());
        let vector_dir = base_dir.join("vectors");
        let vector_index = Arc::new(UsearchVectorIndex::open_or_create(
            &vector_dir,
            crate::semantic::EMBEDDING_DIM,
        )?);
        let semantic = Arc::new(SemanticIndex::new(embedding_backend, vector_index));

        info!("engine state initialized at {}", base_dir.display());

        Ok(Self {
            config,
            resolver,
            registry,
            index_store,
            watcher,
            pipeline,
            memory_store,
            faceting,
            lifecycle,
            backup,
            semantic,
            event_tx,
        })
    }
}

async fn fan_out_events(
    mut rx: tokio::sync::mpsc::Receiver<crate::watcher::FileChangeEvent>,
    pipeline_tx: tokio::sync::mpsc::Sender<crate::watcher::FileChangeEvent>,
    lifecycle_tx: tokio::sync::mpsc::Sender<crate::watcher::FileChangeEvent>,
) {
    while let Some(event) = rx.recv().await {
        let _ = pipeline_tx.send(event.clone()).await;
        let _ = lifecycle_tx.send(event).await;
    }
}
