//! Model list retrieval with per-provider fallback.

use tracing::{debug, warn};

use crate::error::Result;
use crate::http::HttpClient;
use crate::registry::{ProviderConfig, ProviderId};

/// Models offered for the active provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCatalog {
    pub provider: ProviderId,
    pub models: Vec<String>,
    /// `false` when `models` is the built-in fallback list
    pub available: bool,
}

impl ModelCatalog {
    pub fn fallback(provider: ProviderId, config: &ProviderConfig) -> Self {
        Self {
            provider,
            models: config.fallback_list(),
            available: false,
        }
    }

    /// Free-text model entry should be offered when the list is not authoritative.
    pub fn allows_custom_entry(&self) -> bool {
        !self.available
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

/// Fetch the provider's model list, falling back to its built-in list on any
/// failure or an empty result.
pub async fn fetch_catalog(
    http: &HttpClient,
    provider: ProviderId,
    config: &ProviderConfig,
    token: &str,
) -> ModelCatalog {
    match fetch_models(http, config, token).await {
        Ok(Some(models)) if !models.is_empty() => {
            debug!(provider = %provider, count = models.len(), "Fetched model list");
            ModelCatalog {
                provider,
                models,
                available: true,
            }
        }
        Ok(Some(_)) => {
            debug!(provider = %provider, "Model list is empty, using fallback");
            ModelCatalog::fallback(provider, config)
        }
        Ok(None) => {
            debug!(provider = %provider, "No model list endpoint, using fallback");
            ModelCatalog::fallback(provider, config)
        }
        Err(e) => {
            warn!(
                provider = %provider,
                error = %e,
                suggestion = e.suggestion(),
                "Failed to fetch model list, using fallback"
            );
            ModelCatalog::fallback(provider, config)
        }
    }
}

async fn fetch_models(
    http: &HttpClient,
    config: &ProviderConfig,
    token: &str,
) -> Result<Option<Vec<String>>> {
    let adapter = config.family.adapter();
    let Some(url) = adapter.model_list_endpoint(config, token) else {
        return Ok(None);
    };

    let auth = adapter.auth_header(token);
    let mut headers = vec![("Accept", "application/json")];
    if let Some(auth) = auth.as_deref() {
        headers.push(("Authorization", auth));
    }

    let body = http.get(&url, &headers).await?;
    let mut models = adapter.parse_model_list(&body)?;

    let mut seen = std::collections::HashSet::new();
    models.retain(|m| !m.trim().is_empty() && seen.insert(m.clone()));
    Ok(Some(models))
}
