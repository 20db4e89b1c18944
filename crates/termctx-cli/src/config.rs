//! Daemon configuration with sensible defaults.
//!
//! [`DaemonConfig`] is read from `config.json` in the termctx directory.
//! Every field is optional; a missing or corrupt file yields the defaults.
//! Command-line flags are applied on top by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use termctx::api::RetryConfig;
use termctx::backend::BackendSettings;
use termctx::context::ContextBudget;
use termctx::context::orchestrator::DEFAULT_EXTRACT_EVERY;
use termctx::context::store::load_or_default;
use termctx::daemon::DEFAULT_IDLE_TIMEOUT;
use termctx::paths::Paths;
use termctx::{DEFAULT_MAX_TOKENS, DEFAULT_MODEL};

/// Settings for one daemon process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Model identifier. Default: `"anthropic/claude-sonnet-4"`.
    pub model: String,
    /// Maximum tokens per response. Default: `4096`.
    pub max_tokens: u32,
    /// Sampling temperature. Default: `0.3`.
    pub temperature: f32,
    /// Context budget and its split across layers.
    pub budget: ContextBudget,
    /// Run fact extraction every this many completed turns; `0` disables it.
    /// Default: `5`.
    pub extract_every: u64,
    /// Seconds a query may go without a backend event. Default: `120`.
    pub idle_timeout_secs: u64,
    /// Retries for transient backend failures. Default: `2`.
    pub retries: u32,
    /// Socket path override.
    pub socket_path: Option<PathBuf>,
    /// Chat-completions endpoint override.
    pub endpoint: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: 0.3,
            budget: ContextBudget::default(),
            extract_every: DEFAULT_EXTRACT_EVERY,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT.as_secs(),
            retries: 2,
            socket_path: None,
            endpoint: None,
        }
    }
}

impl DaemonConfig {
    /// Read `path`, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        load_or_default(path)
    }

    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            retry: RetryConfig::with_retries(self.retries),
        }
    }

    /// Zero is treated as "use the default".
    pub fn idle_timeout(&self) -> Duration {
        match self.idle_timeout_secs {
            0 => DEFAULT_IDLE_TIMEOUT,
            secs => Duration::from_secs(secs),
        }
    }

    /// The configured socket, or the default one under `paths`.
    pub fn socket(&self, paths: &Paths) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| paths.socket())
    }
}
