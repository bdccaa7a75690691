//! Configuration management with environment variable support.
//!
//! Centralized configuration for the explorer, supporting:
//! - Environment variables for all configurable values
//! - Built-in defaults for every value
//! - Builder-style overrides from the command line
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `BOARD_EXPLORER_LLM_ENDPOINT` | Chat completions endpoint URL | `http://127.0.0.1:8080/v1/chat/completions` |
//! | `BOARD_EXPLORER_LLM_MODEL` | Model name | `qwen3` |
//! | `BOARD_EXPLORER_LLM_MAX_TOKENS` | Maximum tokens in a response | `2048` |
//! | `BOARD_EXPLORER_LLM_TIMEOUT` | Activity timeout in seconds | `60` |
//! | `BOARD_EXPLORER_LLM_CONNECT_TIMEOUT` | Connection timeout in seconds | `10` |
//! | `BOARD_EXPLORER_ARTIFACT_DIR` | Base directory for run artifacts | `/tmp/board-explorer` |
//! | `BOARD_EXPLORER_MEMORY_PATH` | Memory index file | `<artifact dir>/memory/index.json` |
//! | `BOARD_EXPLORER_RANK_LIMIT` | Objectives selected per cycle | `10` |
//! | `BOARD_EXPLORER_MEMORY_K` | Memory records fed to the planner | `5` |
//! | `BOARD_EXPLORER_ENVIRONMENTS` | Environment profiles (`Name:WxH,...`) | `Desktop:1920x1080,Mobile:375x812` |
//! | `BOARD_EXPLORER_GUIDANCE_FILE` | Operator guidance file | unset |
//! | `BOARD_EXPLORER_SETTLE_MS` | Delay after each click (ms) | `500` |
//!
//! # Example
//!
//! ```bash
//! export BOARD_EXPLORER_LLM_ENDPOINT="http://localhost:11434/v1/chat/completions"
//! export BOARD_EXPLORER_ENVIRONMENTS="Desktop:1920x1080,Tablet:820x1180"
//! ```

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::driver::EnvironmentProfile;

// ============================================================================
// Default Values
// ============================================================================

/// Default chat completions endpoint
pub const DEFAULT_LLM_ENDPOINT: &str = "http://127.0.0.1:8080/v1/chat/completions";

/// Default model name
pub const DEFAULT_LLM_MODEL: &str = "qwen3";

/// Default max tokens for responses
pub const DEFAULT_LLM_MAX_TOKENS: u32 = 2048;

/// Default connection timeout (seconds)
pub const DEFAULT_LLM_CONNECT_TIMEOUT: u64 = 10;

/// Default activity timeout (seconds)
pub const DEFAULT_LLM_ACTIVITY_TIMEOUT: u64 = 60;

/// Default ceiling on one whole collaborator request (seconds)
pub const DEFAULT_LLM_REQUEST_TIMEOUT: u64 = 300;

/// Default artifact base directory
pub const DEFAULT_ARTIFACT_DIR: &str = "/tmp/board-explorer";

/// Default number of objectives selected per cycle
pub const DEFAULT_RANK_LIMIT: usize = 10;

/// Default number of memory records used as planning context
pub const DEFAULT_MEMORY_K: usize = 5;

/// Default environment profiles
pub const DEFAULT_ENVIRONMENTS: &str = "Desktop:1920x1080,Mobile:375x812";

/// Default delay after each click (milliseconds)
pub const DEFAULT_SETTLE_MS: u64 = 500;

// ============================================================================
// Environment Variable Names
// ============================================================================

pub const ENV_LLM_ENDPOINT: &str = "BOARD_EXPLORER_LLM_ENDPOINT";
pub const ENV_LLM_MODEL: &str = "BOARD_EXPLORER_LLM_MODEL";
pub const ENV_LLM_MAX_TOKENS: &str = "BOARD_EXPLORER_LLM_MAX_TOKENS";
pub const ENV_LLM_CONNECT_TIMEOUT: &str = "BOARD_EXPLORER_LLM_CONNECT_TIMEOUT";
pub const ENV_LLM_ACTIVITY_TIMEOUT: &str = "BOARD_EXPLORER_LLM_TIMEOUT";
pub const ENV_LLM_REQUEST_TIMEOUT: &str = "BOARD_EXPLORER_LLM_REQUEST_TIMEOUT";
pub const ENV_ARTIFACT_DIR: &str = "BOARD_EXPLORER_ARTIFACT_DIR";
pub const ENV_MEMORY_PATH: &str = "BOARD_EXPLORER_MEMORY_PATH";
pub const ENV_RANK_LIMIT: &str = "BOARD_EXPLORER_RANK_LIMIT";
pub const ENV_MEMORY_K: &str = "BOARD_EXPLORER_MEMORY_K";
pub const ENV_ENVIRONMENTS: &str = "BOARD_EXPLORER_ENVIRONMENTS";
pub const ENV_GUIDANCE_FILE: &str = "BOARD_EXPLORER_GUIDANCE_FILE";
pub const ENV_SETTLE_MS: &str = "BOARD_EXPLORER_SETTLE_MS";

// ============================================================================
// Configuration Getters (with caching)
// ============================================================================

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration (initialized from environment on first access)
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Centralized configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Text-generation collaborator settings
    pub llm: LlmSettings,
    /// Artifact and memory storage settings
    pub storage: StorageSettings,
    /// Cycle settings
    pub cycle: CycleSettings,
}

/// Text-generation collaborator settings
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// API endpoint URL
    pub endpoint: String,
    /// Model name
    pub model: String,
    /// Maximum tokens in response
    pub max_tokens: u32,
    /// Connection timeout (seconds)
    pub connect_timeout: u64,
    /// Activity timeout during streaming (seconds)
    pub activity_timeout: u64,
    /// Ceiling on one whole request, streaming or not (seconds)
    pub request_timeout: u64,
}

/// Storage settings
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Base directory for run artifacts
    pub artifact_dir: PathBuf,
    /// Memory index file
    pub memory_path: PathBuf,
}

/// Per-cycle settings
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub rank_limit: usize,
    pub memory_k: usize,
    pub environments: Vec<EnvironmentProfile>,
    pub guidance_file: Option<PathBuf>,
    pub settle_ms: u64,
}

impl Config {
    /// Create configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            llm: LlmSettings::from_env(),
            storage: StorageSettings::from_env(),
            cycle: CycleSettings::from_env(),
        }
    }

    /// Create configuration with all defaults (ignoring environment)
    pub fn defaults() -> Self {
        Self {
            llm: LlmSettings::defaults(),
            storage: StorageSettings::defaults(),
            cycle: CycleSettings::defaults(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl LlmSettings {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var(ENV_LLM_ENDPOINT).unwrap_or_else(|_| DEFAULT_LLM_ENDPOINT.to_string()),
            model: env::var(ENV_LLM_MODEL).unwrap_or_else(|_| DEFAULT_LLM_MODEL.to_string()),
            max_tokens: parse_env(ENV_LLM_MAX_TOKENS).unwrap_or(DEFAULT_LLM_MAX_TOKENS),
            connect_timeout: parse_env(ENV_LLM_CONNECT_TIMEOUT).unwrap_or(DEFAULT_LLM_CONNECT_TIMEOUT),
            activity_timeout: parse_env(ENV_LLM_ACTIVITY_TIMEOUT).unwrap_or(DEFAULT_LLM_ACTIVITY_TIMEOUT),
            request_timeout: parse_env(ENV_LLM_REQUEST_TIMEOUT).unwrap_or(DEFAULT_LLM_REQUEST_TIMEOUT),
        }
    }

    pub fn defaults() -> Self {
        Self {
            endpoint: DEFAULT_LLM_ENDPOINT.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            max_tokens: DEFAULT_LLM_MAX_TOKENS,
            connect_timeout: DEFAULT_LLM_CONNECT_TIMEOUT,
            activity_timeout: DEFAULT_LLM_ACTIVITY_TIMEOUT,
            request_timeout: DEFAULT_LLM_REQUEST_TIMEOUT,
        }
    }
}

impl StorageSettings {
    pub fn from_env() -> Self {
        let artifact_dir = env::var(ENV_ARTIFACT_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_ARTIFACT_DIR));
        let memory_path = env::var(ENV_MEMORY_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_memory_path(&artifact_dir));
        Self {
            artifact_dir,
            memory_path,
        }
    }

    pub fn defaults() -> Self {
        let artifact_dir = PathBuf::from(DEFAULT_ARTIFACT_DIR);
        Self {
            memory_path: default_memory_path(&artifact_dir),
            artifact_dir,
        }
    }
}

impl CycleSettings {
    pub fn from_env() -> Self {
        let environments = env::var(ENV_ENVIRONMENTS)
            .ok()
            .and_then(|s| EnvironmentProfile::parse_list(&s))
            .unwrap_or_else(default_environments);

        Self {
            rank_limit: parse_env(ENV_RANK_LIMIT).unwrap_or(DEFAULT_RANK_LIMIT),
            memory_k: parse_env(ENV_MEMORY_K).unwrap_or(DEFAULT_MEMORY_K),
            environments,
            guidance_file: env::var(ENV_GUIDANCE_FILE).ok().map(PathBuf::from),
            settle_ms: parse_env(ENV_SETTLE_MS).unwrap_or(DEFAULT_SETTLE_MS),
        }
    }

    pub fn defaults() -> Self {
        Self {
            rank_limit: DEFAULT_RANK_LIMIT,
            memory_k: DEFAULT_MEMORY_K,
            environments: default_environments(),
            guidance_file: None,
            settle_ms: DEFAULT_SETTLE_MS,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn default_memory_path(artifact_dir: &std::path::Path) -> PathBuf {
    artifact_dir.join("memory").join("index.json")
}

/// The built-in Desktop + Mobile profile pair
pub fn default_environments() -> Vec<EnvironmentProfile> {
    EnvironmentProfile::parse_list(DEFAULT_ENVIRONMENTS).unwrap_or_default()
}

/// Get the artifact base directory (convenience function)
pub fn artifact_dir() -> PathBuf {
    get().storage.artifact_dir.clone()
}

/// Get the memory index path (convenience function)
pub fn memory_path() -> PathBuf {
    get().storage.memory_path.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::defaults();
        assert_eq!(config.llm.endpoint, DEFAULT_LLM_ENDPOINT);
        assert_eq!(config.llm.model, DEFAULT_LLM_MODEL);
        assert_eq!(config.cycle.rank_limit, 10);
        assert_eq!(
            config.storage.memory_path,
            PathBuf::from("/tmp/board-explorer/memory/index.json")
        );
    }

    #[test]
    fn test_default_environments() {
        let envs = default_environments();
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[0].name, "Desktop");
        assert_eq!((envs[0].width, envs[0].height), (1920, 1080));
        assert_eq!(envs[1].name, "Mobile");
        assert_eq!((envs[1].width, envs[1].height), (375, 812));
    }
}
