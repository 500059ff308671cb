use anyhow::Context;
use backend::config::Config;
use backend::{app, AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = Config::from_env().context("reading configuration")?;
    let bind_addr = config.bind_addr;
    if let Some(path) = &config.persist_path {
        info!(path = %path.display(), "persisting groups");
    }

    let state = AppState::from_config(config)
        .await
        .context("opening group store")?;
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(%bind_addr, "starting server");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
