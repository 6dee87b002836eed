use anyhow::Context;

use supplyline_api::app::{build_dispatch_app, services::DispatchServices};
use supplyline_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("reading configuration")?;
    supplyline_observability::init(&config.log);

    tracing::info!(
        stock_service_url = %config.dispatch.stock_service_url,
        lock_call_timeout = ?config.dispatch.lock_call_timeout,
        orphan_ttl = ?config.dispatch.orphan_ttl,
        "starting dispatch service"
    );
    let services = DispatchServices::from_config(&config.dispatch).await?;
    let app = build_dispatch_app(services.orchestrator.clone());

    let listener = tokio::net::TcpListener::bind(config.dispatch.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.dispatch.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "dispatch service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("dispatch service stopped with an error")?;

    // In-flight attempts left by the shutdown are settled by the next
    // reconciler run.
    services.shutdown().await;
    tracing::info!("dispatch service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
