use anyhow::{Result, anyhow};

use crate::config::Config;
use crate::ipc::protocol::{ModelConfig, ModelSummary};

/// Source of the user's configured models and their secrets.
#[cfg_attr(test, mockall::automock)]
pub trait CredentialStore: Send + Sync {
    /// Every configured model, without secrets.
    fn list(&self) -> Vec<ModelSummary>;

    /// Full configuration of `name`, or of the current model when `None`.
    fn resolve(&self, name: Option<String>) -> Result<ModelConfig>;
}

/// Serves the `[models]` table of `config.toml`.
pub struct ConfigModelStore {
    config: Config,
}

impl ConfigModelStore {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn current_name(&self) -> Option<&str> {
        self.config
            .current_model
            .as_deref()
            .or_else(|| self.config.models.keys().next().map(String::as_str))
    }
}

impl CredentialStore for ConfigModelStore {
    fn list(&self) -> Vec<ModelSummary> {
        let current = self.current_name();
        self.config
            .models
            .iter()
            .map(|(name, entry)| ModelSummary {
                name: name.clone(),
                provider: entry.provider.clone(),
                model: entry.model.clone(),
                current: Some(name.as_str()) == current,
            })
            .collect()
    }

    fn resolve(&self, name: Option<String>) -> Result<ModelConfig> {
        let name = match name {
            Some(name) => name,
            None => self
                .current_name()
                .map(String::from)
                .ok_or_else(|| anyhow!("No models configured"))?,
        };

        let entry = self
            .config
            .models
            .get(&name)
            .ok_or_else(|| anyhow!("Unknown model: {}", name))?;

        Ok(ModelConfig {
            name,
            provider: entry.provider.clone(),
            model: entry.model.clone(),
            api_key: entry.api_key.clone(),
            base_url: entry.base_url.clone(),
        })
    }
}
