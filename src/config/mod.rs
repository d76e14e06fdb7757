use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Model used when an app asks for "the current model"
    #[serde(default)]
    pub current_model: Option<String>,

    /// Configured LLM models, keyed by user-chosen name.
    /// This table is the credential store served to sandboxed apps.
    #[serde(default)]
    pub models: BTreeMap<String, ModelEntry>,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Provider id: "anthropic", "openai", "google", "openrouter", ...
    pub provider: String,

    /// Provider-side model name
    pub model: String,

    /// Secret API key. `${VAR}` and `$VAR` are expanded from the environment.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub base_url: Option<String>,
}

/// Which isolation engine to wrap sandboxed apps with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineChoice {
    /// Use the platform's native engine when the kernel supports it
    #[default]
    Auto,
    /// Require the native engine (still degrades with a warning if unsupported)
    Native,
    /// Run unconfined (always warns)
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub engine: EngineChoice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load `config.toml` from the resolved config directory.
    ///
    /// An absent file yields the defaults; kly never writes this file itself.
    pub fn load(paths: &Paths) -> Result<Self> {
        Self::load_with_env(paths, |key| std::env::var(key))
    }

    /// Load with a custom env var lookup for `$VAR` api keys (for testing).
    pub fn load_with_env<F>(paths: &Paths, env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        Self::load_from_with_env(&paths.config_file(), env_fn)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        Self::load_from_with_env(path, |key| std::env::var(key))
    }

    pub fn load_from_with_env<F>(path: &Path, env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;

        config.expand_env_vars(&env_fn);
        Ok(config)
    }

    fn expand_env_vars<F>(&mut self, env_fn: &F)
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        for entry in self.models.values_mut() {
            if let Some(ref mut key) = entry.api_key {
                *key = expand_env(key, env_fn);
            }
        }
    }
}

fn expand_env<F>(s: &str, env_fn: &F) -> String
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    let var_name = s
        .strip_prefix("${")
        .and_then(|s| s.strip_suffix('}'))
        .or_else(|| s.strip_prefix('$'));
    match var_name {
        Some(name) => env_fn(name).unwrap_or_else(|_| s.to_string()),
        None => s.to_string(),
    }
}
