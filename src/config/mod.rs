// src/config/mod.rs
// Runtime configuration: typed knobs with serde defaults, JSON file loading,
// environment overrides, and the platform data directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// API keys loaded from environment variables
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    /// Chat + extractor model key (BA_LLM_API_KEY)
    pub llm: Option<String>,
    /// Embeddings key (BA_EMBEDDING_API_KEY, falls back to BA_LLM_API_KEY)
    pub embedding: Option<String>,
}

impl ApiKeys {
    /// Load from environment. `BA_DISABLE_LLM=1` suppresses both keys and
    /// forces the heuristic fallbacks everywhere.
    pub fn from_env() -> Self {
        if read_bool_env("BA_DISABLE_LLM") {
            return Self::default();
        }
        let llm = read_key("BA_LLM_API_KEY");
        let embedding = read_key("BA_EMBEDDING_API_KEY").or_else(|| llm.clone());
        let keys = Self { llm, embedding };
        if keys.llm.is_none() {
            warn!("No LLM API key configured - extraction and chat use fallbacks");
        }
        keys
    }

    pub fn has_llm(&self) -> bool {
        self.llm.is_some()
    }

    pub fn has_embeddings(&self) -> bool {
        self.embedding.is_some()
    }
}

fn read_key(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|k| !k.trim().is_empty())
}

fn read_bool_env(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// Memory flush (compaction) knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub enabled: bool,
    pub soft_threshold_tokens: u64,
    pub reserve_tokens_floor: u64,
    pub min_memory_count: usize,
    pub max_memory_age_hours: f64,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            soft_threshold_tokens: 4000,
            reserve_tokens_floor: 2000,
            min_memory_count: 3,
            max_memory_age_hours: 24.0,
            llm_model: "glm-4-flash".to_string(),
            llm_timeout_secs: 30,
        }
    }
}

impl FlushConfig {
    /// Hard threshold = soft threshold + reserve
    pub fn hard_threshold(&self) -> u64 {
        self.soft_threshold_tokens + self.reserve_tokens_floor
    }
}

/// Memory search knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub provider: String,
    pub model: String,
    pub chunk_lines: usize,
    pub chunk_overlap: usize,
    pub max_results: usize,
    pub min_score: f64,
    pub vector_weight: f64,
    pub text_weight: f64,
    pub hybrid_enabled: bool,
    pub context_lines: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            chunk_lines: 400,
            chunk_overlap: 80,
            max_results: 6,
            min_score: 0.35,
            vector_weight: 0.7,
            text_weight: 0.3,
            hybrid_enabled: true,
            context_lines: 2,
        }
    }
}

/// Memory watcher knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub enabled: bool,
    pub watch_paths: Vec<String>,
    pub debounce_seconds: f64,
    pub check_interval_seconds: f64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_paths: vec!["memory".to_string()],
            debounce_seconds: 1.5,
            check_interval_seconds: 5.0,
        }
    }
}

/// Index rotation knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexRotationConfig {
    pub max_size_mb: f64,
    pub index_prefix: String,
    pub index_dir: String,
}

impl Default for IndexRotationConfig {
    fn default() -> Self {
        Self {
            max_size_mb: 50.0,
            index_prefix: "memory".to_string(),
            index_dir: "memory/.index".to_string(),
        }
    }
}

/// Memory subsystem configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub flush: FlushConfig,
    pub search: SearchConfig,
    pub watcher: WatcherConfig,
    pub index_rotation: IndexRotationConfig,
}

/// Sandbox container knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub image: String,
    /// Memory cap for command containers
    pub command_memory_limit: String,
    /// Memory cap for code containers
    pub code_memory_limit: String,
    pub cpu_limit: f64,
    pub timeout_secs: u64,
    pub network_disabled: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            command_memory_limit: "128m".to_string(),
            code_memory_limit: "512m".to_string(),
            cpu_limit: 0.5,
            timeout_secs: 30,
            network_disabled: true,
        }
    }
}

/// Security knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub command_whitelist: Vec<String>,
    /// Access token lifetime in minutes
    pub access_token_minutes: i64,
    /// Refresh token lifetime in days
    pub refresh_token_days: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            command_whitelist: vec![
                "ls", "cat", "head", "tail", "wc", "echo", "grep", "sort", "uniq", "date",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            access_token_minutes: 30,
            refresh_token_days: 7,
        }
    }
}

/// Per-category file-store policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CategoryPolicy {
    /// Maximum single-item size in MiB; 0 means unlimited
    pub max_size_mb: u64,
    /// TTL in hours; 0 means never expires
    pub ttl_hours: u64,
}

impl Default for CategoryPolicy {
    fn default() -> Self {
        Self {
            max_size_mb: 100,
            ttl_hours: 24,
        }
    }
}

/// File store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreConfig {
    pub base_dir: Option<PathBuf>,
    pub max_total_size_gb: f64,
    pub cleanup_interval_hours: f64,
    pub cleanup_threshold_percent: f64,
    /// Per-category policy overrides keyed by category name
    pub categories: std::collections::HashMap<String, CategoryPolicy>,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            max_total_size_gb: 10.0,
            cleanup_interval_hours: 1.0,
            cleanup_threshold_percent: 90.0,
            categories: std::collections::HashMap::new(),
        }
    }
}

/// Chat LLM knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub context_window_tokens: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Cap on tool rounds within one turn
    pub max_tool_rounds: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            context_window_tokens: 128_000,
            max_tokens: 4096,
            temperature: 0.3,
            timeout_secs: 120,
            max_tool_rounds: 8,
        }
    }
}

/// Server knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8300,
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub docker: DockerConfig,
    pub security: SecurityConfig,
    pub filestore: FileStoreConfig,
}

impl AppConfig {
    /// Load configuration from `<base>/storage_config.json`, falling back to
    /// defaults when the file is absent or unreadable (a broken config file
    /// must not take the service down).
    pub fn load(base_dir: &Path) -> Self {
        let path = base_dir.join("storage_config.json");
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<AppConfig>(&raw) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!("Ignoring malformed config {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Write the current configuration as `storage_config.json` if absent.
    pub fn write_if_missing(&self, base_dir: &Path) -> std::io::Result<()> {
        let path = base_dir.join("storage_config.json");
        if path.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(base_dir)?;
        let raw = serde_json::to_string_pretty(self).expect("config serializes");
        std::fs::write(path, raw)
    }
}

/// Resolve the storage base directory.
///
/// Priority: `BA_STORAGE_DIR` env var, then the explicit config value, then
/// the platform data dir (`~/Library/Application Support`, `%APPDATA%`, or
/// `$XDG_DATA_HOME`/`~/.local/share`) suffixed with `ba-agent`.
pub fn resolve_base_dir(configured: Option<&Path>) -> PathBuf {
    if let Ok(dir) = std::env::var("BA_STORAGE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    dirs::data_dir()
        .map(|d| d.join("ba-agent"))
        .unwrap_or_else(|| PathBuf::from(".ba-agent"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.memory.search.chunk_lines, 400);
        assert_eq!(cfg.memory.search.chunk_overlap, 80);
        assert_eq!(cfg.memory.flush.soft_threshold_tokens, 4000);
        assert_eq!(cfg.memory.flush.hard_threshold(), 6000);
        assert!(cfg.docker.network_disabled);
        assert!(cfg.security.command_whitelist.contains(&"echo".to_string()));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load(dir.path());
        assert_eq!(cfg.server.port, 8300);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("storage_config.json"),
            r#"{"memory": {"flush": {"soft_threshold_tokens": 100, "reserve_tokens_floor": 50}}}"#,
        )
        .unwrap();
        let cfg = AppConfig::load(dir.path());
        assert_eq!(cfg.memory.flush.soft_threshold_tokens, 100);
        assert_eq!(cfg.memory.flush.hard_threshold(), 150);
        // Untouched sections keep their defaults
        assert_eq!(cfg.memory.search.max_results, 6);
    }

    #[test]
    fn test_load_malformed_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("storage_config.json"), "{not json").unwrap();
        let cfg = AppConfig::load(dir.path());
        assert_eq!(cfg.memory.flush.soft_threshold_tokens, 4000);
    }

    #[test]
    fn test_write_if_missing_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.server.port = 9999;
        cfg.write_if_missing(dir.path()).unwrap();
        let loaded = AppConfig::load(dir.path());
        assert_eq!(loaded.server.port, 9999);

        // A second write must not clobber the existing file
        let other = AppConfig::default();
        other.write_if_missing(dir.path()).unwrap();
        assert_eq!(AppConfig::load(dir.path()).server.port, 9999);
    }
}
