use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikimirror/0.2";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_CONTENT_CACHE_CAPACITY: usize = 128;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MirrorConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub link_cache: LinkCacheSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    #[default]
    Latest,
    All,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SyncSection {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub with_content: bool,
    #[serde(default)]
    pub content_mode: ContentMode,
    #[serde(default = "default_true")]
    pub update_link_cache: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            with_content: false,
            content_mode: ContentMode::Latest,
            update_link_cache: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LinkCacheSection {
    #[serde(default = "default_content_cache_capacity")]
    pub content_cache_capacity: usize,
}

impl Default for LinkCacheSection {
    fn default() -> Self {
        Self {
            content_cache_capacity: DEFAULT_CONTENT_CACHE_CAPACITY,
        }
    }
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_content_cache_capacity() -> usize {
    DEFAULT_CONTENT_CACHE_CAPACITY
}

fn default_true() -> bool {
    true
}

impl MirrorConfig {
    /// Resolve the wiki API URL: env WIKI_API_URL > config > None.
    pub fn api_url(&self) -> Option<String> {
        self.api_url_with_lookup(|key| env::var(key).ok())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        self.user_agent_with_lookup(|key| env::var(key).ok())
    }

    /// Resolve the write batch size: env WIKIMIRROR_BATCH_SIZE > config.
    pub fn batch_size(&self) -> usize {
        self.batch_size_with_lookup(|key| env::var(key).ok())
    }

    fn api_url_with_lookup<F>(&self, lookup_env: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        non_empty(lookup_env("WIKI_API_URL")).or_else(|| self.wiki.api_url.clone())
    }

    fn user_agent_with_lookup<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        non_empty(lookup_env("WIKI_USER_AGENT"))
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    fn batch_size_with_lookup<F>(&self, lookup_env: F) -> usize
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup_env("WIKIMIRROR_BATCH_SIZE")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(self.sync.batch_size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync.batch_size == 0 {
            bail!("[sync] batch_size must be positive");
        }
        if self.link_cache.content_cache_capacity == 0 {
            bail!("[link_cache] content_cache_capacity must be positive");
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Load and parse a MirrorConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MirrorConfig> {
    if !config_path.exists() {
        return Ok(MirrorConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MirrorConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    parsed
        .validate()
        .with_context(|| format!("invalid configuration in {}", config_path.display()))?;
    Ok(parsed)
}
