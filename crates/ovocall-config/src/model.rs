use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Output budget used when the configured value is missing or not positive.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 65535;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Gemini,
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(format!("unknown provider kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Signed so that a hand-edited `-1` or `0` falls back instead of failing to load.
    pub max_output_tokens: Option<i64>,
}

impl ProviderConfig {
    pub fn resolved_max_output_tokens(&self) -> u32 {
        match self.max_output_tokens {
            Some(n) if n > 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Chance per turn that the model is invited to inject an interference message.
    #[serde(default = "default_random_sms_probability")]
    pub random_sms_probability: f64,
    /// Skip the provider and answer with canned replies after a short delay.
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "default_call_test_delay_ms")]
    pub call_test_delay_ms: u64,
    #[serde(default = "default_sms_test_delay_ms")]
    pub sms_test_delay_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            random_sms_probability: default_random_sms_probability(),
            test_mode: false,
            call_test_delay_ms: default_call_test_delay_ms(),
            sms_test_delay_ms: default_sms_test_delay_ms(),
        }
    }
}

fn default_temperature() -> f64 {
    0.9
}

fn default_random_sms_probability() -> f64 {
    0.60
}

fn default_call_test_delay_ms() -> u64 {
    500
}

fn default_sms_test_delay_ms() -> u64 {
    800
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite file for contacts, notes and message logs. In-memory when unset.
    pub database_path: Option<PathBuf>,
}
