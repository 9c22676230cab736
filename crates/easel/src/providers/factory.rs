use super::{
    anthropic::AnthropicProvider, base::Provider, configs::ProviderConfig, google::GoogleProvider,
    ollama::OllamaProvider, openai::OpenAiProvider, responses::ResponsesProvider,
};
use anyhow::Result;

pub use super::base::ProviderKind;

/// Build the adapter for a backend. Selection happens once per run; the
/// orchestrator only ever sees the trait object.
pub fn get_provider(config: ProviderConfig) -> Result<Box<dyn Provider>> {
    match config {
        ProviderConfig::OpenAi(openai_config) => Ok(Box::new(OpenAiProvider::new(openai_config)?)),
        ProviderConfig::Anthropic(anthropic_config) => {
            Ok(Box::new(AnthropicProvider::new(anthropic_config)?))
        }
        ProviderConfig::Google(google_config) => Ok(Box::new(GoogleProvider::new(google_config)?)),
        ProviderConfig::Ollama(ollama_config) => Ok(Box::new(OllamaProvider::new(ollama_config)?)),
        ProviderConfig::OpenAiResponses(responses_config) => {
            Ok(Box::new(ResponsesProvider::new(responses_config)?))
        }
    }
}
