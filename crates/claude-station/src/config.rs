//! Application configuration: data-directory layout, context-economy
//! tunables, and per-project settings.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::pricing::CacheTtl;

pub const APP_NAME: &str = "ClaudeStation";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tokens reserved for the model response when fitting the context budget.
pub const RESPONSE_TOKEN_RESERVE: usize = 8192;

/// Uncompressed turns beyond which the background worker kicks in.
pub const COMPRESS_AFTER_TURNS: u32 = 10;
/// Oldest complete turns folded into each compression call.
pub const COMPRESS_BATCH_SIZE: u32 = 5;
/// Output cap handed to the summariser model.
pub const MAX_SUMMARY_TOKENS: usize = 500;
/// Rolling summary size at which the summary itself gets recompressed.
pub const SUMMARY_RECOMPRESS_THRESHOLD: usize = 3000;

/// Minimum block size the provider accepts as a cached prefix. Marking a
/// smaller block is a silent no-op billed at full input price.
pub const CACHE_BREAKPOINT_THRESHOLD: usize = 1024;

/// Server-side compaction trigger: 80% of the 200k context window.
pub const COMPACTION_TRIGGER_TOKENS: u64 = 160_000;

/// Process-wide configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct StationConfig {
    pub data_dir: PathBuf,
    pub api_base_url: String,
    pub proxy_url: Option<String>,
    pub max_output_tokens: u32,
}

impl StationConfig {
    /// Resolve configuration from the environment.
    ///
    /// `CLAUDE_STATION_DIR` overrides the data directory; the default is
    /// `$HOME/ClaudeStation` (`%USERPROFILE%` on Windows).
    pub fn from_env() -> Result<Self> {
        let data_dir = match env::var("CLAUDE_STATION_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => Self::default_data_dir()?,
        };

        let api_base_url = env::var("ANTHROPIC_BASE_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com".into());

        let proxy_url = env::var("CLAUDE_STATION_PROXY").ok().filter(|p| !p.is_empty());
        if proxy_url.is_some() {
            info!("Proxy configured for API traffic");
        }

        let max_output_tokens = env::var("CLAUDE_STATION_MAX_OUTPUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8192);

        let config = Self {
            data_dir,
            api_base_url,
            proxy_url,
            max_output_tokens,
        };
        config.ensure_directories()?;
        info!("Data directory: {}", config.data_dir.display());
        Ok(config)
    }

    /// Configuration rooted at an explicit directory (tests, portable mode).
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let config = Self {
            data_dir: data_dir.into(),
            api_base_url: "https://api.anthropic.com".into(),
            proxy_url: None,
            max_output_tokens: 8192,
        };
        config.ensure_directories()?;
        Ok(config)
    }

    fn default_data_dir() -> Result<PathBuf> {
        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .context("Neither HOME nor USERPROFILE is set; set CLAUDE_STATION_DIR explicitly")?;
        Ok(PathBuf::from(home).join(APP_NAME))
    }

    fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create data dir {}", self.data_dir.display()))?;
        std::fs::create_dir_all(self.documents_dir())?;
        std::fs::create_dir_all(self.attachments_dir())?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("claude_station.db")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("claude_station.log")
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.join("documents")
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }

    /// Storage path for one uploaded document.
    pub fn document_path(&self, project_id: &str, document_id: &str, filename: &str) -> PathBuf {
        self.documents_dir()
            .join(project_id)
            .join(format!("{document_id}_{filename}"))
    }

    /// Storage path for one message attachment.
    pub fn attachment_path(&self, conversation_id: &str, uuid: &str, ext: &str) -> PathBuf {
        self.attachments_dir()
            .join(conversation_id)
            .join(format!("{uuid}.{ext}"))
    }
}

/// Per-project settings persisted as JSON in the `projects.settings_json`
/// column. Unknown keys round-trip untouched through serde's defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectSettings {
    #[serde(default)]
    pub cache_ttl: CacheTtl,
    #[serde(default = "default_compress_after_turns")]
    pub compress_after_turns: u32,
    #[serde(default = "default_compress_batch_size")]
    pub compress_batch_size: u32,
    #[serde(default)]
    pub thinking_enabled: bool,
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget: u32,
}

fn default_compress_after_turns() -> u32 {
    COMPRESS_AFTER_TURNS
}

fn default_compress_batch_size() -> u32 {
    COMPRESS_BATCH_SIZE
}

fn default_thinking_budget() -> u32 {
    1024
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            cache_ttl: CacheTtl::default(),
            compress_after_turns: COMPRESS_AFTER_TURNS,
            compress_batch_size: COMPRESS_BATCH_SIZE,
            thinking_enabled: false,
            thinking_budget: default_thinking_budget(),
        }
    }
}

impl ProjectSettings {
    /// Clamp tunables into their documented ranges, warning when a stored
    /// value had drifted out of bounds.
    pub fn normalized(mut self) -> Self {
        let turns = self.compress_after_turns.clamp(5, 30);
        if turns != self.compress_after_turns {
            warn!(
                "compress_after_turns {} out of range, clamped to {}",
                self.compress_after_turns, turns
            );
        }
        self.compress_after_turns = turns;

        let batch = self.compress_batch_size.clamp(3, 10);
        if batch != self.compress_batch_size {
            warn!(
                "compress_batch_size {} out of range, clamped to {}",
                self.compress_batch_size, batch
            );
        }
        self.compress_batch_size = batch;
        self
    }

    /// Parse from a settings_json column value, falling back to defaults
    /// on malformed JSON.
    pub fn from_json(json: &str) -> Self {
        match serde_json::from_str::<ProjectSettings>(json) {
            Ok(settings) => settings.normalized(),
            Err(e) => {
                warn!("Malformed project settings ({}), using defaults", e);
                Self::default()
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }
}

/// Derive a file-type label from a filename extension.
pub fn file_type_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}
