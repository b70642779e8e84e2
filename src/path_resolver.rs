//! C1 — PathResolver: canonicalization, stable workspace hashing, and the
//! on-disk layout rooted at the engine's base directory (§4.1, §6).

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::BASE_DIR_NAME;
use crate::error::{AppError, AppResult};

/// Length, in hex characters, of a workspace hash.
const HASH_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct PathResolver {
    base_dir: PathBuf,
}

impl PathResolver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a path to its canonical, symlink-resolved, platform-normalized form.
    pub fn canonicalize(&self, path: impl AsRef<Path>) -> AppResult<PathBuf> {
        dunce::canonicalize(path.as_ref())
            .map_err(|e| AppError::BadRequest(format!("cannot canonicalize path: {e}")))
    }

    /// Deterministic, collision-resistant, fixed-width fingerprint of a
    /// canonicalized path. Same path across runs always yields the same hash.
    pub fn workspace_hash(&self, canonical_path: impl AsRef<Path>) -> String {
        let normalized = canonical_path.as_ref().to_string_lossy().to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        let digest = hasher.finalize();
        hex::encode(digest)[..HASH_LEN].to_string()
    }

    pub fn index_dir(&self, workspace_hash: &str, directory_name: &str) -> PathBuf {
        self.base_dir
            .join("indexes")
            .join(format!("{directory_name}_{workspace_hash}"))
    }

    pub fn project_memory_dir(&self) -> PathBuf {
        self.base_dir.join("project-memory")
    }

    pub fn local_memory_dir(&self) -> PathBuf {
        self.base_dir.join("local-memory")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Reserved mount point for the external TypeScript language-server
    /// collaborator (out of scope for this engine to populate or run).
    pub fn typescript_install_dir(&self) -> PathBuf {
        self.base_dir.join("typescript")
    }

    /// `true` if `path` lies anywhere under the engine's own base directory —
    /// used by the lifecycle engine to avoid reacting to its own writes.
    pub fn is_under_base_dir(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref()
            .to_string_lossy()
            .contains(&*self.base_dir.to_string_lossy())
            || path.as_ref().components().any(|c| c.as_os_str() == BASE_DIR_NAME)
    }

    pub async fn ensure_layout(&self) -> AppResult<()> {
        for dir in [
            self.base_dir.join("indexes"),
            self.project_memory_dir(),
            self.local_memory_dir(),
            self.backups_dir(),
            self.logs_dir(),
            self.typescript_install_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }
}

// sha2 gives us raw bytes; encode them via a tiny local hex helper so we
// don't pull in a whole extra crate just for hex::encode.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_hash_is_deterministic() {
        let resolver = PathResolver::new("/tmp/.codesearch");
        let a = resolver.workspace_hash("/home/user/project");
        let b = resolver.workspace_hash("/home/user/project");
        assert_eq!(a, b);
        assert_eq!(a.len(), HASH_LEN);
    }

    #[test]
    fn workspace_hash_is_case_insensitive() {
        let resolver = PathResolver::new("/tmp/.codesearch");
        assert_eq!(
            resolver.workspace_hash("/Home/User/Project"),
            resolver.workspace_hash("/home/user/project")
        );
    }

    #[test]
    fn workspace_hash_differs_across_paths() {
        let resolver = PathResolver::new("/tmp/.codesearch");
        assert_ne!(
            resolver.workspace_hash("/a"),
            resolver.workspace_hash("/b")
        );
    }

    #[test]
    fn is_under_base_dir_matches_substring() {
        let resolver = PathResolver::new("/home/user/.codesearch");
        assert!(resolver.is_under_base_dir("/home/user/.codesearch/indexes/foo"));
        assert!(!resolver.is_under_base_dir("/home/user/project/src/main.rs"));
    }

    #[test]
    fn subpaths_are_rooted_under_base_dir() {
        let resolver = PathResolver::new("/base");
        assert_eq!(resolver.project_memory_dir(), PathBuf::from("/base/project-memory"));
        assert_eq!(resolver.local_memory_dir(), PathBuf::from("/base/local-memory"));
        assert_eq!(resolver.backups_dir(), PathBuf::from("/base/backups"));
        assert_eq!(resolver.logs_dir(), PathBuf::from("/base/logs"));
        assert_eq!(resolver.typescript_install_dir(), PathBuf::from("/base/typescript"));
    }
}
