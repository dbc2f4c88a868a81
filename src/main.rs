use std::sync::Arc;

use anyhow::Context;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use webhook_delivery::{cancel_on_signal, init_tracing, PostgresStore, Settings, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = Settings::load().context("failed to load configuration")?;

    let (client, connection) = tokio_postgres::connect(&settings.database_url, NoTls)
        .await
        .context("failed to connect to postgres")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(error = %err, "postgres connection closed");
        }
    });

    let store = Arc::new(
        PostgresStore::new(client)
            .await
            .context("failed to prepare webhook tables")?,
    );

    let worker = Arc::new(
        Worker::with_reqwest(
            store.clone(),
            store,
            settings.retry_policy(),
            settings.worker_config(),
        )
        .context("failed to build http client")?,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    info!("webhook worker starting");
    worker.spawn(shutdown).await.context("worker task panicked")?;
    info!("webhook worker exited");

    Ok(())
}
