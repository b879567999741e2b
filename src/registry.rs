//! Known chat-completion providers and the user-editable custom slot.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{KEY_CUSTOM_PROVIDER, KeyValueStore};

/// Placeholder substituted with the model id in endpoint URLs.
pub const MODEL_PLACEHOLDER: &str = "{model}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    #[default]
    SiliconFlow,
    DeepSeek,
    OpenAi,
    OpenRouter,
    Gemini,
    Custom,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::SiliconFlow => "siliconflow",
            ProviderId::DeepSeek => "deepseek",
            ProviderId::OpenAi => "openai",
            ProviderId::OpenRouter => "openrouter",
            ProviderId::Gemini => "gemini",
            ProviderId::Custom => "custom",
        }
    }

    /// Registry-definition order.
    pub fn all() -> &'static [ProviderId] {
        &[
            ProviderId::SiliconFlow,
            ProviderId::DeepSeek,
            ProviderId::OpenAi,
            ProviderId::OpenRouter,
            ProviderId::Gemini,
            ProviderId::Custom,
        ]
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ProviderId::all()
            .iter()
            .copied()
            .find(|id| id.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::UnknownProvider(s.to_string()))
    }
}

/// Wire protocol spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// `/chat/completions` with `stream: true` and SSE frames
    #[default]
    OpenAiCompatible,
    /// `generateContent`, single JSON response, key in the query string
    Gemini,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub display_name: String,
    pub chat_completions_url: String,
    /// Empty when the provider has no model list endpoint
    #[serde(default)]
    pub model_list_url: String,
    #[serde(default)]
    pub default_model: String,
    #[serde(default)]
    pub family: ProviderFamily,
    /// Offered when the model list cannot be fetched
    #[serde(default)]
    pub fallback_models: Vec<String>,
}

impl ProviderConfig {
    fn builtin(
        display_name: &str,
        chat_completions_url: &str,
        model_list_url: &str,
        family: ProviderFamily,
        fallback_models: &[&str],
    ) -> Self {
        Self {
            display_name: display_name.to_string(),
            chat_completions_url: chat_completions_url.to_string(),
            model_list_url: model_list_url.to_string(),
            default_model: fallback_models.first().copied().unwrap_or_default().to_string(),
            family,
            fallback_models: fallback_models.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn empty_custom() -> Self {
        Self {
            display_name: "Custom".to_string(),
            chat_completions_url: String::new(),
            model_list_url: String::new(),
            default_model: String::new(),
            family: ProviderFamily::OpenAiCompatible,
            fallback_models: Vec::new(),
        }
    }

    pub fn has_model_list(&self) -> bool {
        !self.model_list_url.trim().is_empty()
    }

    /// Fallback list, never empty when a default model is known.
    pub fn fallback_list(&self) -> Vec<String> {
        let mut models = self.fallback_models.clone();
        if !self.default_model.is_empty() && !models.contains(&self.default_model) {
            models.insert(0, self.default_model.clone());
        }
        models
    }
}

pub fn builtin_config(id: ProviderId) -> ProviderConfig {
    match id {
        ProviderId::SiliconFlow => ProviderConfig::builtin(
            "SiliconFlow",
            "https://api.siliconflow.cn/v1/chat/completions",
            "https://api.siliconflow.cn/v1/models",
            ProviderFamily::OpenAiCompatible,
            &[
                "Qwen/QwQ-32B",
                "deepseek-ai/DeepSeek-R1",
                "deepseek-ai/DeepSeek-V3",
                "Qwen/Qwen2.5-72B-Instruct",
            ],
        ),
        ProviderId::DeepSeek => ProviderConfig::builtin(
            "DeepSeek",
            "https://api.deepseek.com/chat/completions",
            "https://api.deepseek.com/models",
            ProviderFamily::OpenAiCompatible,
            &["deepseek-chat", "deepseek-reasoner"],
        ),
        ProviderId::OpenAi => ProviderConfig::builtin(
            "OpenAI",
            "https://api.openai.com/v1/chat/completions",
            "https://api.openai.com/v1/models",
            ProviderFamily::OpenAiCompatible,
            &["gpt-4o-mini", "gpt-4o", "o3-mini"],
        ),
        ProviderId::OpenRouter => ProviderConfig::builtin(
            "OpenRouter",
            "https://openrouter.ai/api/v1/chat/completions",
            "https://openrouter.ai/api/v1/models",
            ProviderFamily::OpenAiCompatible,
            &[
                "deepseek/deepseek-r1",
                "openai/gpt-4o-mini",
                "google/gemini-2.0-flash-001",
            ],
        ),
        ProviderId::Gemini => ProviderConfig::builtin(
            "Google Gemini",
            "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent",
            "https://generativelanguage.googleapis.com/v1beta/models",
            ProviderFamily::Gemini,
            &["gemini-2.0-flash", "gemini-1.5-pro", "gemini-1.5-flash"],
        ),
        ProviderId::Custom => ProviderConfig::empty_custom(),
    }
}

/// Fields to merge into the custom slot; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomProviderPatch {
    pub display_name: Option<String>,
    pub chat_completions_url: Option<String>,
    pub model_list_url: Option<String>,
    pub default_model: Option<String>,
    pub family: Option<ProviderFamily>,
    pub fallback_models: Option<Vec<String>>,
}

impl CustomProviderPatch {
    fn apply(self, config: &mut ProviderConfig) {
        if let Some(v) = self.display_name {
            config.display_name = v;
        }
        if let Some(v) = self.chat_completions_url {
            config.chat_completions_url = v;
        }
        if let Some(v) = self.model_list_url {
            config.model_list_url = v;
        }
        if let Some(v) = self.default_model {
            config.default_model = v;
        }
        if let Some(v) = self.family {
            config.family = v;
        }
        if let Some(v) = self.fallback_models {
            config.fallback_models = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEntry {
    pub id: ProviderId,
    pub label: String,
}

pub struct Registry {
    custom: RwLock<ProviderConfig>,
    store: Arc<dyn KeyValueStore>,
}

impl Registry {
    /// Build the registry, restoring the custom slot from `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let custom = match store.get(KEY_CUSTOM_PROVIDER) {
            Some(raw) => match serde_json::from_str::<ProviderConfig>(&raw) {
                Ok(config) => {
                    debug!(url = %config.chat_completions_url, "Restored custom provider");
                    config
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring corrupted custom provider config");
                    ProviderConfig::empty_custom()
                }
            },
            None => ProviderConfig::empty_custom(),
        };

        Self {
            custom: RwLock::new(custom),
            store,
        }
    }

    /// Look up a provider by its string identifier.
    pub fn get(&self, provider_id: &str) -> Result<ProviderConfig> {
        let id: ProviderId = provider_id.parse()?;
        Ok(self.config(id))
    }

    pub fn config(&self, id: ProviderId) -> ProviderConfig {
        match id {
            ProviderId::Custom => self.custom.read().clone(),
            other => builtin_config(other),
        }
    }

    /// Merge `patch` into the custom slot and persist it.
    pub fn set_custom(&self, patch: CustomProviderPatch) -> Result<()> {
        let mut custom = self.custom.write();
        let mut updated = custom.clone();
        patch.apply(&mut updated);

        let raw = serde_json::to_string(&updated)?;
        self.store.set(KEY_CUSTOM_PROVIDER, &raw)?;
        *custom = updated;
        Ok(())
    }

    pub fn list(&self) -> Vec<ProviderEntry> {
        ProviderId::all()
            .iter()
            .map(|&id| {
                let label = match id {
                    ProviderId::Custom => {
                        let name = self.custom.read().display_name.clone();
                        if name.trim().is_empty() {
                            "Custom".to_string()
                        } else {
                            name
                        }
                    }
                    other => builtin_config(other).display_name,
                };
                ProviderEntry { id, label }
            })
            .collect()
    }
}
