use easel::agent::{Agent, AgentConfig};
use easel::providers::configs::ProviderConfig;
use easel::providers::factory;
use easel::tool::ToolRegistry;
use std::sync::Arc;

/// Shared application state. The registry is built once at startup and
/// only read afterwards.
#[derive(Clone)]
pub struct AppState {
    pub provider_config: ProviderConfig,
    pub agent_config: AgentConfig,
    pub system_prompt: String,
    pub registry: Arc<ToolRegistry>,
}

impl AppState {
    /// A fresh agent for one request
    pub fn agent(&self) -> anyhow::Result<Agent> {
        let provider = factory::get_provider(self.provider_config.clone())?;
        Ok(Agent::new(provider, self.registry.clone()).with_config(self.agent_config.clone()))
    }
}
