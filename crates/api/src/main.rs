use anyhow::Context;

use teamcloud_api::app::{build_app, AppServices};
use teamcloud_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ApiConfig::from_env().context("invalid configuration")?;
    teamcloud_observability::init_with(config.log_format);

    let services = AppServices::in_memory(&config, |builder| builder)
        .context("failed to wire services")?;
    // Storage is in-process here, so recovery only finds commands once a
    // durable table backend is passed to `AppServices::build`.
    let resumed = services.engine.recover().await.context("journal recovery failed")?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed unfinished commands");
    }

    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        public_url = %config.public_url,
        providers = config.providers.len(),
        "listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
