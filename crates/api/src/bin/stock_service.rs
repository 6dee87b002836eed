use anyhow::Context;

use supplyline_api::app::{build_stock_app, services::StockServices};
use supplyline_infra::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("reading configuration")?;
    supplyline_observability::init(&config.log);

    let services = StockServices::from_config(&config.stock).await?;
    let app = build_stock_app(services.ledger.clone());

    let listener = tokio::net::TcpListener::bind(config.stock.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.stock.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "stock service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("stock service stopped with an error")?;

    services.shutdown().await;
    tracing::info!("stock service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
