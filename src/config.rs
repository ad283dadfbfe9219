// ABOUTME: Runtime configuration loaded from an optional TOML file
// ABOUTME: Source, target and sync settings with defaults, CLI/env overrides and validation

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::source::planner::MAX_PAGE_SIZE;
use crate::sync::cycle::CycleSettings;
use crate::sync::state::SyncState;
use crate::utils::validate_connection_string;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub sync: SyncConfig,
}

/// `[source]` - the subgraph endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Environment variable holding the API key, read when `api_key` is unset
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            api_key_env: None,
            timeout_secs: 30,
        }
    }
}

/// `[target]` - the PostgreSQL database holding event and entity tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    pub url: Option<String>,
    /// Environment variable holding the URL, read when `url` is unset
    pub url_env: Option<String>,
    pub connect_timeout_secs: u64,
    pub statement_timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            url: None,
            url_env: None,
            connect_timeout_secs: 10,
            statement_timeout_secs: 60,
        }
    }
}

/// `[sync]` - cycle tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub page_size: usize,
    pub max_pages_per_cycle: usize,
    pub concurrency: usize,
    pub interval_secs: u64,
    pub state_path: Option<PathBuf>,
    /// Registry TOML; the embedded registry is used when unset
    pub registry: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let cycle = CycleSettings::default();
        Self {
            page_size: cycle.page_size,
            max_pages_per_cycle: cycle.max_pages_per_cycle,
            concurrency: cycle.concurrency,
            interval_secs: 300,
            state_path: None,
            registry: None,
        }
    }
}

/// Values given on the command line (or their environment fallbacks). Set fields win.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub target_url: Option<String>,
    pub registry: Option<PathBuf>,
    pub state_path: Option<PathBuf>,
    pub page_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub interval_secs: Option<u64>,
}

impl Config {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse configuration")
    }

    /// Load a config file. Relative paths inside it resolve against its directory.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let mut config = Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load config from {:?}", path))?;

        if let Some(base) = path.parent() {
            for p in [&mut config.sync.registry, &mut config.sync.state_path]
                .into_iter()
                .flatten()
            {
                if p.is_relative() {
                    *p = base.join(&*p);
                }
            }
        }
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(endpoint) = overrides.endpoint {
            self.source.endpoint = Some(endpoint);
        }
        if let Some(key) = overrides.api_key {
            self.source.api_key = Some(key);
        }
        if let Some(url) = overrides.target_url {
            self.target.url = Some(url);
        }
        if let Some(registry) = overrides.registry {
            self.sync.registry = Some(registry);
        }
        if let Some(state_path) = overrides.state_path {
            self.sync.state_path = Some(state_path);
        }
        if let Some(page_size) = overrides.page_size {
            self.sync.page_size = page_size;
        }
        if let Some(concurrency) = overrides.concurrency {
            self.sync.concurrency = concurrency;
        }
        if let Some(interval) = overrides.interval_secs {
            self.sync.interval_secs = interval;
        }
    }

    /// Check the values that are set. Presence of endpoint and target is checked by
    /// the commands that need them.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.sync.page_size) {
            bail!(
                "sync.page_size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE,
                self.sync.page_size
            );
        }
        for (name, value) in [
            ("sync.max_pages_per_cycle", self.sync.max_pages_per_cycle as u64),
            ("sync.concurrency", self.sync.concurrency as u64),
            ("sync.interval_secs", self.sync.interval_secs),
            ("source.timeout_secs", self.source.timeout_secs),
            ("target.connect_timeout_secs", self.target.connect_timeout_secs),
            ("target.statement_timeout_secs", self.target.statement_timeout_secs),
        ] {
            if value == 0 {
                bail!("{} must be greater than 0", name);
            }
        }

        if let Some(endpoint) = &self.source.endpoint {
            let parsed = url::Url::parse(endpoint)
                .with_context(|| format!("source.endpoint '{}' is not a valid URL", endpoint))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                bail!("source.endpoint must use http or https");
            }
        }
        if let Some(url) = self.target_url() {
            validate_connection_string(&url).context("Invalid target URL")?;
        }
        Ok(())
    }

    /// `source.api_key`, else the variable named by `source.api_key_env`.
    pub fn api_key(&self) -> Option<String> {
        self.source.api_key.clone().or_else(|| {
            self.source
                .api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|v| !v.is_empty())
        })
    }

    /// `target.url`, else the variable named by `target.url_env`.
    pub fn target_url(&self) -> Option<String> {
        self.target.url.clone().or_else(|| {
            self.target
                .url_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|v| !v.is_empty())
        })
    }

    pub fn require_endpoint(&self) -> Result<&str> {
        self.source.endpoint.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "Subgraph endpoint not provided. Use `--endpoint`, SUBGRAPH_ENDPOINT or [source].endpoint"
            )
        })
    }

    pub fn require_target_url(&self) -> Result<String> {
        self.target_url().ok_or_else(|| {
            anyhow::anyhow!(
                "Target database URL not provided. Use `--target`, TARGET_URL or [target].url"
            )
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.sync
            .state_path
            .clone()
            .unwrap_or_else(SyncState::default_path)
    }

    pub fn cycle_settings(&self) -> CycleSettings {
        CycleSettings {
            page_size: self.sync.page_size,
            max_pages_per_cycle: self.sync.max_pages_per_cycle,
            concurrency: self.sync.concurrency,
        }
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.target.connect_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.target.statement_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }
}
