//! Model Registry
//! Mission: Validate model identifiers against the configured allow-list

use std::collections::HashSet;

const DEFAULT_MODELS: &[&str] = &[
    "x-ai/grok-4.1-thinking",
    "google/gemini-3.0-high-think",
    "openai/gpt-5.2-extra-high-thinking",
    "anthropic/opus-4.5-thinking",
    "deepseek/deepseek-v4-thinking",
];

/// Allow-list of model identifiers users may select for a session.
pub struct ModelRegistry {
    ordered: Vec<String>,
    ids: HashSet<String>,
}

impl ModelRegistry {
    pub fn new(models: Vec<String>) -> Self {
        let ids = models.iter().cloned().collect();
        Self {
            ordered: models,
            ids,
        }
    }

    /// Build from FORESIGHT_MODELS (comma-separated) or the built-in defaults.
    pub fn from_env() -> Self {
        let models = std::env::var("FORESIGHT_MODELS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_MODELS.iter().map(|s| s.to_string()).collect());

        Self::new(models)
    }

    pub fn is_valid_model_id(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Models offered to the dashboard, in configured order.
    pub fn available(&self) -> &[String] {
        &self.ordered
    }
}
