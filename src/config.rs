use serde::{Deserialize, Serialize};

/// Maximum allowed length for search queries and grep/lifecycle patterns (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

/// Name of the single per-user/per-repo base directory everything is rooted under.
/// Used by `PathResolver` and by `LifecycleEngine`'s self-change loop guard.
pub const BASE_DIR_NAME: &str = ".codesearch";

/// Canonical list of file extensions considered indexable and embeddable.
/// Both the full-text indexer and the vector embedding pipeline use this
/// single list so they never diverge.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    // JavaScript / TypeScript
    "ts", "tsx", "js", "jsx", "mjs", "cjs",
    // Systems / compiled
    "rs", "py", "go", "java", "c", "cpp", "h", "hpp",
    "cs", "rb", "php", "swift", "kt", "scala",
    // Web
    "html", "css", "scss", "less", "sass",
    // Data / config
    "json", "yaml", "yml", "toml", "xml",
    // Documentation
    "md", "mdx", "txt", "rst",
    // Query / schema
    "sql", "graphql", "gql",
    // Shell
    "sh", "bash", "zsh", "fish", "ps1", "bat", "cmd",
    // Build / container
    "dockerfile", "makefile",
    // Frontend frameworks
    "vue", "svelte", "astro",
    // Misc languages
    "lua", "zig", "nim", "dart", "elixir", "ex", "exs",
    "r", "jl", "clj", "cljs", "cljc", "erl", "hrl",
    // Infra / IPC
    "tf", "hcl", "proto",
    // Dotfiles / config
    "env", "ini", "cfg", "conf",
];

/// Directory names that short-circuit both the watcher and the workspace walk,
/// regardless of what's inside them (§4.4).
pub const BLOCKED_DIR_NAMES: &[&str] = &[
    "bin", "obj", "node_modules", ".git", ".vs", "packages", "TestResults",
    "target", "dist", "build", ".next", ".venv", "__pycache__",
];

/// Check whether a file extension (without leading dot, lowercase) is in the
/// shared supported-extensions list.
pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&ext)
}

/// Check whether a directory name should block the watcher/indexer from
/// descending into it. Also matches the engine's own base directory so the
/// engine never watches or indexes itself.
pub fn is_blocked_dir_name(name: &str) -> bool {
    BLOCKED_DIR_NAMES.contains(&name) || name == BASE_DIR_NAME
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub max_index_size_mb: usize,
    pub max_file_size_bytes: usize,
    pub watcher_debounce_ms: u64,
    pub index_batch_size: usize,
    pub data_dir: String,

    /// Maximum number of active workspaces held in memory before the
    /// least-recently-used one is evicted (§5).
    pub max_concurrent_workspaces: usize,
    /// Hard ceiling on `max_results` for any memory search (§4.6, §8).
    pub max_search_results: usize,
    /// Facet cache TTL, seconds (§4.7).
    pub facet_cache_ttl_secs: u64,
    /// Registry in-memory cache TTL, seconds (§4.2).
    pub registry_cache_ttl_secs: u64,
    /// Grace period before an orphaned index directory is eligible for deletion, days (§3).
    pub orphan_grace_period_days: i64,

    /// LifecycleEngine tuning (§4.9).
    pub lifecycle_auto_resolve_threshold: f64,
    pub lifecycle_pending_threshold: f64,
    pub lifecycle_pending_cooldown_secs: u64,
    pub lifecycle_startup_delay_secs: u64,
    pub lifecycle_stale_sweep_interval_hours: u64,
    pub lifecycle_stale_after_days: i64,

    /// CircuitBreaker tuning (§4.11), used by BackupService.
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("VYOTIQ_PORT").unwrap_or_else(|_| "9721".to_string());

        let data_dir = std::env::var("VYOTIQ_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join(BASE_DIR_NAME).to_string_lossy().to_string())
                .unwrap_or_else(|| BASE_DIR_NAME.to_string())
        });

        fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            max_index_size_mb: env_or("VYOTIQ_MAX_INDEX_MB", 512),
            max_file_size_bytes: env_or("VYOTIQ_MAX_FILE_SIZE", 10 * 1024 * 1024),
            watcher_debounce_ms: env_or("VYOTIQ_WATCHER_DEBOUNCE_MS", 500),
            index_batch_size: env_or("VYOTIQ_INDEX_BATCH_SIZE", 50),
            data_dir,

            max_concurrent_workspaces: env_or("VYOTIQ_MAX_WORKSPACES", 5),
            max_search_results: env_or("VYOTIQ_MAX_SEARCH_RESULTS", 10_000),
            facet_cache_ttl_secs: env_or("VYOTIQ_FACET_CACHE_TTL_SECS", 300),
            registry_cache_ttl_secs: env_or("VYOTIQ_REGISTRY_CACHE_TTL_SECS", 5),
            orphan_grace_period_days: env_or("VYOTIQ_ORPHAN_GRACE_DAYS", 7),

            lifecycle_auto_resolve_threshold: env_or("VYOTIQ_LIFECYCLE_AUTO_RESOLVE", 0.8),
            lifecycle_pending_threshold: env_or("VYOTIQ_LIFECYCLE_PENDING", 0.5),
            lifecycle_pending_cooldown_secs: env_or("VYOTIQ_LIFECYCLE_PENDING_COOLDOWN_SECS", 60),
            lifecycle_startup_delay_secs: env_or("VYOTIQ_LIFECYCLE_STARTUP_DELAY_SECS", 10),
            lifecycle_stale_sweep_interval_hours: env_or("VYOTIQ_LIFECYCLE_STALE_SWEEP_HOURS", 24),
            lifecycle_stale_after_days: env_or("VYOTIQ_LIFECYCLE_STALE_AFTER_DAYS", 30),

            breaker_failure_threshold: env_or("VYOTIQ_BREAKER_FAILURE_THRESHOLD", 3),
            breaker_cooldown_secs: env_or("VYOTIQ_BREAKER_COOLDOWN_SECS", 30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_extension_is_case_sensitive_lowercase_only() {
        assert!(is_supported_extension("rs"));
        assert!(!is_supported_extension("RS"));
    }

    #[test]
    fn blocked_dir_names_include_base_dir() {
        assert!(is_blocked_dir_name(BASE_DIR_NAME));
        assert!(is_blocked_dir_name("node_modules"));
        assert!(!is_blocked_dir_name("src"));
    }
}
