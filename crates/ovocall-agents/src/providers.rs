use std::sync::Arc;

use async_trait::async_trait;
use ovocall_common::{Error, Result};
use ovocall_config::{ProviderConfig, ProviderKind};
use serde::{Deserialize, Serialize};

use crate::gemini::GeminiProvider;
use crate::openai::OpenAiProvider;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Trait for completion provider integrations (OpenAI-compatible, Gemini).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier (e.g. "openai", "gemini").
    fn provider_id(&self) -> &str;

    /// Send a completion request and return the response.
    ///
    /// Implementations must be cancel-safe: dropping the future aborts the request.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Check if the provider is reachable and the credentials are accepted.
    async fn health_check(&self) -> Result<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Raw completion text. Empty when the provider returned no candidate.
    pub content: String,
    pub model: String,
    pub usage: Option<Usage>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Model used when the configuration does not name one.
pub fn default_model(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::OpenAi => DEFAULT_OPENAI_MODEL,
        ProviderKind::Gemini => DEFAULT_GEMINI_MODEL,
    }
}

/// Construct the provider named by `config`. An API key is required.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    let api_key = config
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            Error::Config("provider.api_key is not set (or OVOCALL_API_KEY)".to_string())
        })?;

    let provider: Arc<dyn LlmProvider> = match config.kind {
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(api_key, config.base_url.clone())),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(api_key, config.base_url.clone())),
    };
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_api_key() {
        let config = ProviderConfig::default();
        let err = build_provider(&config).err().unwrap();
        assert!(matches!(err, Error::Config(_)));

        let config = ProviderConfig {
            api_key: Some("  ".into()),
            ..Default::default()
        };
        assert!(build_provider(&config).is_err());
    }

    #[test]
    fn build_selects_by_kind() {
        let config = ProviderConfig {
            kind: ProviderKind::Gemini,
            api_key: Some("k".into()),
            ..Default::default()
        };
        assert_eq!(build_provider(&config).unwrap().provider_id(), "gemini");

        let config = ProviderConfig {
            api_key: Some("k".into()),
            ..Default::default()
        };
        assert_eq!(build_provider(&config).unwrap().provider_id(), "openai");
    }

    #[test]
    fn default_models_per_kind() {
        assert_eq!(default_model(ProviderKind::OpenAi), DEFAULT_OPENAI_MODEL);
        assert_eq!(default_model(ProviderKind::Gemini), DEFAULT_GEMINI_MODEL);
    }
}
