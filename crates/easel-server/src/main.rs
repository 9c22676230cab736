mod board;
mod configuration;
mod error;
mod routes;
mod state;

use board::Board;
use configuration::Settings;
use easel::tool::ToolRegistry;
use state::AppState;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::new()?;
    let addr = settings.server.socket_addr()?;
    let provider_kind = settings.provider.kind();

    let mut registry = ToolRegistry::new();
    Board::new("Untitled board").register(&mut registry);

    let state = AppState {
        agent_config: settings.agent.agent_config(),
        system_prompt: settings.agent.system_prompt.clone(),
        provider_config: settings.provider.into_config(),
        registry: Arc::new(registry),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(provider = %provider_kind, "listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
