use serde::{Deserialize, Serialize};

use super::base::ProviderKind;

pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const ANTHROPIC_HOST: &str = "https://api.anthropic.com";
pub const GOOGLE_HOST: &str = "https://generativelanguage.googleapis.com";
pub const OLLAMA_HOST: &str = "http://localhost:11434";

/// Anthropic requires max_tokens on every request
pub const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 4096;

// Unified enum to wrap different provider configurations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    #[serde(rename = "openai")]
    OpenAi(OpenAiProviderConfig),
    Anthropic(AnthropicProviderConfig),
    Google(GoogleProviderConfig),
    Ollama(OllamaProviderConfig),
    #[serde(rename = "openai_responses")]
    OpenAiResponses(OpenAiProviderConfig),
}

impl ProviderConfig {
    /// Config for a backend at its public default host
    pub fn new<M: Into<String>>(kind: ProviderKind, model: M, api_key: Option<String>) -> Self {
        let model = model.into();
        let api_key = api_key.unwrap_or_default();
        match kind {
            ProviderKind::OpenAi => ProviderConfig::OpenAi(OpenAiProviderConfig {
                host: OPENAI_HOST.to_string(),
                api_key,
                model,
                temperature: None,
                max_tokens: None,
            }),
            ProviderKind::OpenAiResponses => ProviderConfig::OpenAiResponses(OpenAiProviderConfig {
                host: OPENAI_HOST.to_string(),
                api_key,
                model,
                temperature: None,
                max_tokens: None,
            }),
            ProviderKind::Anthropic => ProviderConfig::Anthropic(AnthropicProviderConfig {
                host: ANTHROPIC_HOST.to_string(),
                api_key,
                model,
                temperature: None,
                max_tokens: None,
            }),
            ProviderKind::Google => ProviderConfig::Google(GoogleProviderConfig {
                host: GOOGLE_HOST.to_string(),
                api_key,
                model,
                temperature: None,
                max_tokens: None,
            }),
            ProviderKind::Ollama => ProviderConfig::Ollama(OllamaProviderConfig {
                host: OLLAMA_HOST.to_string(),
                model,
                temperature: None,
                max_tokens: None,
            }),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::OpenAi(_) => ProviderKind::OpenAi,
            ProviderConfig::Anthropic(_) => ProviderKind::Anthropic,
            ProviderConfig::Google(_) => ProviderKind::Google,
            ProviderConfig::Ollama(_) => ProviderKind::Ollama,
            ProviderConfig::OpenAiResponses(_) => ProviderKind::OpenAiResponses,
        }
    }
}

// Define specific config structs for each provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiProviderConfig {
    #[serde(default = "default_openai_host")]
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicProviderConfig {
    #[serde(default = "default_anthropic_host")]
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleProviderConfig {
    #[serde(default = "default_google_host")]
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OllamaProviderConfig {
    #[serde(default = "default_ollama_host")]
    pub host: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

fn default_openai_host() -> String {
    OPENAI_HOST.to_string()
}

fn default_anthropic_host() -> String {
    ANTHROPIC_HOST.to_string()
}

fn default_google_host() -> String {
    GOOGLE_HOST.to_string()
}

fn default_ollama_host() -> String {
    OLLAMA_HOST.to_string()
}
