use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::analysis::AnalysisMode;
use crate::dispatch::registry::{ProviderDescriptor, TransportKind};
use crate::error::DrommageError;
use crate::prompts::PromptTemplate;

/// Repository-relative config location.
pub const CONFIG_RELATIVE_PATH: &str = ".drommage/config.toml";

/// Env var that overrides the config file location.
pub const CONFIG_ENV: &str = "DROMMAGE_CONFIG";

const DEFAULT_DB_PATH: &str = ".drommage/cache.duckdb";
const DEFAULT_MAX_WORKERS: usize = 4;
const DEFAULT_KEEP_VERSIONS: usize = 3;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Replaces the built-in provider list entirely when present.
    pub providers: Vec<ProviderDescriptor>,
    pub templates: Vec<PromptTemplate>,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Versions kept per key by the `cleanup` cache action when no count is given.
    pub keep_versions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            templates: Vec::new(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keep_versions: DEFAULT_KEEP_VERSIONS,
        }
    }
}

/// A local Ollama daemon, plus an OpenAI entry that stays off until enabled.
pub fn default_providers() -> Vec<ProviderDescriptor> {
    let ollama = ProviderDescriptor::new(
        "ollama",
        TransportKind::LocalDaemon,
        "http://localhost:11434",
        "mistral:latest",
        1,
    );

    let mut openai = ProviderDescriptor::new(
        "openai",
        TransportKind::CloudApi,
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        2,
    );
    openai.enabled = false;
    openai.credential_env = Some("OPENAI_API_KEY".to_string());
    openai.modes = vec![AnalysisMode::Brief, AnalysisMode::Deep];

    vec![ollama, openai]
}

impl Config {
    /// Load `<repo_root>/.drommage/config.toml`, or the file named by
    /// `DROMMAGE_CONFIG`. A missing file yields the defaults.
    pub fn load(repo_root: &Path) -> Result<Self, DrommageError> {
        let path = match env::var(CONFIG_ENV) {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => repo_root.join(CONFIG_RELATIVE_PATH),
        };

        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| DrommageError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml(&raw)
            .map_err(|e| DrommageError::Config(format!("{}: {e}", path.display())))?;

        tracing::info!(
            path = %path.display(),
            providers = config.providers.len(),
            templates = config.templates.len(),
            "config loaded"
        );
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, String> {
        let mut config: Config = toml::from_str(raw).map_err(|e| e.to_string())?;
        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.scheduler.max_workers == 0 {
            tracing::warn!("scheduler.max_workers = 0 is not usable, using 1");
            self.scheduler.max_workers = 1;
        }
        if self.providers.iter().all(|p| !p.enabled) {
            tracing::warn!("no enabled providers configured, brief/deep analysis unavailable");
        }
    }

    /// Cache file path, resolved against `repo_root` when relative.
    pub fn db_path(&self, repo_root: &Path) -> PathBuf {
        if self.store.db_path.is_absolute() {
            self.store.db_path.clone()
        } else {
            repo_root.join(&self.store.db_path)
        }
    }
}
