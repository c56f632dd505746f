use async_trait::async_trait;
use ovocall_common::{Error, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::providers::{ChatRole, LlmProvider, LlmRequest, LlmResponse, Usage};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini only knows `user` and `model` turns. System text goes in as a user turn;
/// the first few are followed by this acknowledgement so turns keep alternating.
const SYSTEM_ACK: &str = "明白。";
const SYSTEM_ACK_LIMIT: usize = 5;

#[derive(Clone)]
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let base_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            client: Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn convert_request(&self, request: &LlmRequest) -> GeminiRequest {
        let system = request.system.iter().map(|s| (ChatRole::System, s.as_str()));
        let rest = request
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()));

        let mut contents = Vec::new();
        for (index, (role, text)) in system.chain(rest).enumerate() {
            match role {
                ChatRole::System => {
                    contents.push(GeminiContent::new("user", text));
                    if index < SYSTEM_ACK_LIMIT {
                        contents.push(GeminiContent::new("model", SYSTEM_ACK));
                    }
                }
                ChatRole::User => contents.push(GeminiContent::new("user", text)),
                ChatRole::Assistant => contents.push(GeminiContent::new("model", text)),
            }
        }

        GeminiRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn provider_id(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.model
        );
        let body = self.convert_request(request);

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Gemini request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: "gemini".to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| Error::Agent(format!("failed to parse Gemini response: {e}")))?;

        let candidate = parsed.candidates.into_iter().next();
        let content = candidate
            .as_ref()
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.first())
            .and_then(|p| p.text.clone())
            .unwrap_or_default();

        Ok(LlmResponse {
            content,
            model: request.model.clone(),
            usage: parsed.usage_metadata.map(|u| Usage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
            }),
            stop_reason: candidate.and_then(|c| c.finish_reason),
        })
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/v1beta/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await;

        match response {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

impl GeminiContent {
    fn new(role: &'static str, text: &str) -> Self {
        Self {
            role,
            parts: vec![GeminiPart {
                text: text.to_string(),
            }],
        }
    }
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}
