use std::sync::Arc;

use authz_gateway::{config::AppConfig, store::ConfigStore, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,authz_gateway=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;

    let store = match &config.ingestion.config_path {
        Some(path) => Arc::new(ConfigStore::load(path.clone()).await?),
        None => {
            tracing::info!("No ingestion configuration file; context enrichment disabled");
            Arc::new(ConfigStore::empty())
        }
    };

    let state = AppState::build(config, store)?;
    authz_gateway::serve(state).await
}
