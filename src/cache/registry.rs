//! Known model configs.

use std::collections::BTreeMap;

use crate::inference::config::{ModelConfig, RelayConfig};

/// An immutable snapshot of the models the cache may load, keyed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelConfig>,
}

impl ModelRegistry {
    /// Build from configs. On duplicate names the first entry wins.
    pub fn new(configs: impl IntoIterator<Item = ModelConfig>) -> Self {
        let mut models = BTreeMap::new();
        for config in configs {
            if models.contains_key(&config.name) {
                tracing::warn!(model = %config.name, "duplicate model name ignored");
                continue;
            }
            models.insert(config.name.clone(), config);
        }
        Self { models }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.models.values().cloned())
    }

    /// A new snapshot with runtime-discovered models added. Configured
    /// entries win over discovered ones with the same name.
    pub fn merge_discovered(&self, discovered: impl IntoIterator<Item = ModelConfig>) -> Self {
        let mut models = self.models.clone();
        let mut added = 0usize;
        for config in discovered {
            if !models.contains_key(&config.name) {
                models.insert(config.name.clone(), config);
                added += 1;
            }
        }
        tracing::info!(added, total = models.len(), "merged discovered models");
        Self { models }
    }

    pub fn get(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Model names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::config::Provider;

    #[test]
    fn test_first_duplicate_wins() {
        let mut second = ModelConfig::discovered("m1", Provider::Vllm, "other-path");
        second.max_tokens = 1;
        let registry = ModelRegistry::new(vec![
            ModelConfig::discovered("m1", Provider::Ollama, "m1:latest"),
            second,
        ]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("m1").unwrap().path, "m1:latest");
    }

    #[test]
    fn test_merge_discovered_keeps_configured() {
        let mut configured = ModelConfig::discovered("llama3", Provider::Ollama, "llama3:8b");
        configured.context_length = 8192;
        let registry = ModelRegistry::new(vec![configured]);

        let merged = registry.merge_discovered(vec![
            ModelConfig::discovered("llama3", Provider::Ollama, "llama3"),
            ModelConfig::discovered("qwen2", Provider::Ollama, "qwen2"),
        ]);
        assert_eq!(merged.names().collect::<Vec<_>>(), vec!["llama3", "qwen2"]);
        assert_eq!(merged.get("llama3").unwrap().context_length, 8192);
        assert_eq!(registry.len(), 1, "original snapshot unchanged");
    }
}
