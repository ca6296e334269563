//! Bank agent: confirms incoming transactions and completes confirmed ones.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use instapay_api::config::AgentSettings;
use instapay_api::peer::{AcceptAll, BankAgent};
use instapay_transactions::EventKind;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = AgentSettings::from_env().context("invalid configuration")?;
    instapay_observability::init(settings.log_format);

    let cancel = CancellationToken::new();
    let workers: Vec<_> = EventKind::ALL
        .into_iter()
        .map(|kind| {
            Arc::new(BankAgent::new(
                settings.server_url.clone(),
                settings.token.clone(),
                kind,
                Arc::new(AcceptAll),
            ))
            .spawn(cancel.clone(), settings.reconnect)
        })
        .collect();
    tracing::info!(server = %settings.server_url, "agent running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    cancel.cancel();
    for worker in workers {
        worker.shutdown().await;
    }
    Ok(())
}
