use std::sync::Arc;

use anyhow::Context;
use guvnor_daemon::{Config, Supervisor, TimeoutPolicy, api};
use guvnor_deploy::{DeploymentEngine, GitCli};
use guvnor_rpc::{ChannelOptions, WsChannelFactory};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("load configuration")?;

    let engine = DeploymentEngine::open(&config.app_dir, Arc::new(GitCli::new(&config.git)))
        .await
        .with_context(|| format!("open application dir {}", config.app_dir.display()))?;

    let factory = WsChannelFactory::new(ChannelOptions {
        handshake_timeout: config.rpc_timeout(),
        token: config.process_token.clone(),
    });
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(factory),
        TimeoutPolicy::new(config.timeout()),
        Arc::new(engine),
    ));

    if config.remote_token.is_none() && !config.listen.ip().is_loopback() {
        tracing::warn!(addr = %config.listen, "GUVNOR_REMOTE_TOKEN is unset; the API is open to the network");
    }
    let app = api::router(api::AppState::new(supervisor.clone(), config.remote_token.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    tracing::info!(addr = %config.listen, timeout = ?config.timeout(), "guvnor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.shutdown().await;
    Ok(())
}
