use std::sync::Arc;

use anyhow::{Context, Result};
use mindly::auth::Authenticator;
use mindly::config::AppConfig;
use mindly::llm_client::LlmClient;
use mindly::server::serve;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mindly=debug")),
        )
        .init();

    let config = AppConfig::load();
    config
        .ensure_dirs()
        .context("failed to create data directories")?;

    let credentials_path = config.credentials_path();
    let auth = Authenticator::open(&credentials_path).with_context(|| {
        format!("failed to load credential store {:?}", credentials_path)
    })?;

    let api_key = config.llm_api_key.clone().unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!(
            "No completion API key configured (set OPENROUTER_API_KEY); replies will use the fallback line if the endpoint requires one"
        );
    }
    let llm = LlmClient::new(config.llm_api_url.clone(), api_key, config.llm_model.clone())
        .context("failed to build completion client")?;
    tracing::info!("Completion model: {}", llm.model());

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve(config, Arc::new(auth), Arc::new(llm)))
}
