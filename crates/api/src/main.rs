use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use instapay_api::app::{AppServices, build_app};
use instapay_api::config::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("invalid configuration")?;
    instapay_observability::init(settings.log_format);

    let services = Arc::new(
        AppServices::from_settings(&settings)
            .await
            .context("failed to initialize backends")?,
    );
    services
        .rebuild_projection()
        .await
        .context("failed to rebuild the transaction projection")?;

    let cancel = CancellationToken::new();
    let workers = services.spawn_workers(&cancel);

    let app = build_app(services, &settings.jwt_secret);
    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    cancel.cancel();
    for worker in workers {
        worker.shutdown().await;
    }
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
