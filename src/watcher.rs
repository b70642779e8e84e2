//! C4 — FileWatcher: recursive, debounced filesystem watching per active
//! workspace (§4.4). Filters by extension allow-list / directory block-list
//! and pushes normalized events into a bounded, lossy-if-full channel.

use dashmap::DashMap;
use notify::RecursiveMode;
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{is_blocked_dir_name, is_supported_extension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    /// Never constructed by this backend: renames are always split into
    /// `(old -> Deleted, new -> Created)`. Kept so downstream consumers
    /// (the lifecycle confidence table) have a stable match arm.
    Renamed,
}

#[derive(Debug, Clone)]
pub struct FileChangeEvent {
    pub workspace_hash: String,
    pub path: PathBuf,
    pub kind: ChangeKind,
}

struct WatcherHandle {
    _debouncer: notify_debouncer_full::Debouncer<notify::RecommendedWatcher, notify_debouncer_full::FileIdMap>,
}

/// Owns one debounced watcher per active workspace and fans all of their
/// filtered events into a single bounded channel.
pub struct FileWatcher {
    watchers: DashMap<String, WatcherHandle>,
    debounce_ms: u64,
    tx: mpsc::Sender<FileChangeEvent>,
}

impl FileWatcher {
    pub fn new(debounce_ms: u64, channel_capacity: usize) -> (Self, mpsc::Receiver<FileChangeEvent>) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        (
            Self {
                watchers: DashMap::new(),
                debounce_ms,
                tx,
            },
            rx,
        )
    }

    pub fn is_watching(&self, workspace_hash: &str) -> bool {
        self.watchers.contains_key(workspace_hash)
    }

    pub fn start(&self, workspace_hash: &str, root: &Path) -> Result<(), notify::Error> {
        if self.watchers.contains_key(workspace_hash) {
            return Ok(());
        }

        let ws_hash = workspace_hash.to_string();
        let ws_root = root.to_path_buf();
        let tx = self.tx.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(self.debounce_ms),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => dispatch_events(&ws_hash, &ws_root, &tx, events),
                Err(errors) => {
                    for e in errors {
                        warn!("file watcher error for workspace {}: {:?}", ws_hash, e);
                    }
                }
            },
        )?;

        debouncer.watch(root, RecursiveMode::Recursive).map_err(|e| {
            notify::Error::generic(&format!("watch failed for {}: {e}", root.display()))
        })?;

        self.watchers.insert(workspace_hash.to_string(), WatcherHandle { _debouncer: debouncer });
        info!("watching workspace {} at {} (debounce {}ms)", workspace_hash, root.display(), self.debounce_ms);
        Ok(())
    }

    pub fn stop(&self, workspace_hash: &str) {
        if self.watchers.remove(workspace_hash).is_some() {
            info!("stopped watching workspace {}", workspace_hash);
        }
    }
}

fn dispatch_events(
    workspace_hash: &str,
    root: &Path,
    tx: &mpsc::Sender<FileChangeEvent>,
    events: Vec<DebouncedEvent>,
) {
    for event in &events {
        for (path, kind) in classify(event) {
            if !passes_filters(root, &path) {
                continue;
            }
            send(workspace_hash, tx, path, kind);
        }
    }
}

fn send(workspace_hash: &str, tx: &mpsc::Sender<FileChangeEvent>, path: PathBuf, kind: ChangeKind) {
    let change = FileChangeEvent { workspace_hash: workspace_hash.to_string(), path, kind };
    if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(change) {
        warn!(
            "file watcher channel full, dropping event for workspace {}: {}",
            workspace_hash,
            dropped.path.display()
        );
    }
}

/// Maps one debounced event to zero or more `(path, kind)` pairs. A rename
/// surfaces as two paths on the same event; we split it into its delete and
/// create halves rather than emitting `ChangeKind::Renamed`.
fn classify(event: &DebouncedEvent) -> Vec<(PathBuf, ChangeKind)> {
    use notify::event::{ModifyKind, RenameMode};
    use notify::EventKind;

    match event.kind {
        EventKind::Create(_) => event.paths.iter().cloned().map(|p| (p, ChangeKind::Created)).collect(),
        EventKind::Remove(_) => event.paths.iter().cloned().map(|p| (p, ChangeKind::Deleted)).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().cloned().map(|p| (p, ChangeKind::Deleted)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().cloned().map(|p| (p, ChangeKind::Created)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [old, new] => vec![(old.clone(), ChangeKind::Deleted), (new.clone(), ChangeKind::Created)],
            other => other.iter().cloned().map(|p| (p, ChangeKind::Modified)).collect(),
        },
        EventKind::Modify(_) => event.paths.iter().cloned().map(|p| (p, ChangeKind::Modified)).collect(),
        _ => Vec::new(),
    }
}

fn passes_filters(root: &Path, path: &Path) -> bool {
    if path
        .strip_prefix(root)
        .unwrap_or(path)
        .components()
        .any(|c| is_blocked_dir_name(&c.as_os_str().to_string_lossy()))
    {
        return false;
    }

    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => is_supported_extension(&ext.to_lowercase()),
        // extension-less files (Dockerfile, Makefile) pass through here and
        // are filtered later by the indexing pipeline's filename allow-list.
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_filters_rejects_blocked_directories() {
        let root = Path::new("/ws");
        assert!(!passes_filters(root, Path::new("/ws/node_modules/pkg/index.js")));
        assert!(!passes_filters(root, Path::new("/ws/target/debug/build.rs")));
        assert!(passes_filters(root, Path::new("/ws/src/main.rs")));
    }

    #[test]
    fn passes_filters_rejects_unsupported_extensions() {
        let root = Path::new("/ws");
        assert!(!passes_filters(root, Path::new("/ws/photo.png")));
        assert!(passes_filters(root, Path::new("/ws/src/lib.rs")));
    }

    #[test]
    fn passes_filters_allows_extensionless_special_files() {
        let root = Path::new("/ws");
        assert!(passes_filters(root, Path::new("/ws/Dockerfile")));
    }
}
