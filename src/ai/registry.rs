// registry.rs: Provider lookup built from `providers.toml`.
//
//   [providers.openai]
//   base_url = "https://api.openai.com/v1"
//   api_key = "sk-..."
//
//   [providers.azure]
//   base_url = "https://my-resource.openai.azure.com/openai/v1"
//   api_key = "..."
//   auth = "api-key"

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::openai_vision::{AuthScheme, OpenAiVisionClient};
use super::{ProviderRegistry, VisionProvider};
use crate::settings::SettingsError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub auth: AuthScheme,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEntry>,
}

impl ProvidersConfig {
    pub fn load_or_default(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// A fixed set of providers keyed by id.
#[derive(Default)]
pub struct StaticRegistry {
    providers: HashMap<String, Arc<dyn VisionProvider>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut registry = Self::new();
        for (id, entry) in &config.providers {
            let client = OpenAiVisionClient::new(id.clone(), &entry.base_url, &entry.api_key)
                .with_auth(entry.auth);
            registry.insert(id.clone(), Arc::new(client));
        }
        log::info!("Provider registry loaded ({} providers)", registry.providers.len());
        registry
    }

    pub fn insert(&mut self, id: impl Into<String>, provider: Arc<dyn VisionProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl ProviderRegistry for StaticRegistry {
    fn resolve(&self, provider_id: &str) -> Option<Arc<dyn VisionProvider>> {
        self.providers.get(provider_id).cloned()
    }
}
