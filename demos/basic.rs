use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use webhook_delivery::{
    init_tracing, DeliveryStore, Dispatcher, DispatcherConfig, InMemoryStore, OwnerId, Page,
    RetryPolicy, WebhookAdmin, Worker, WorkerConfig,
};

/// Register an endpoint, dispatch one event and let the worker deliver it.
///
/// Point `WEBHOOK_URL` at a receiver (for example `verify_receiver`'s
/// output) to see a successful delivery; otherwise the attempt fails and a
/// retry is scheduled.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let url = std::env::var("WEBHOOK_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8080/webhook".to_string());

    let store = Arc::new(InMemoryStore::new());
    let admin = WebhookAdmin::new(store.clone());

    let owner = OwnerId("seller_123".to_string());
    let created = admin
        .create_endpoint(&owner, &url, ["license.sold", "payout.completed"])
        .await?;
    println!("endpoint {} secret {}", created.endpoint.id, created.secret);

    let dispatcher = Dispatcher::spawn(store.clone(), store.clone(), DispatcherConfig::default());
    dispatcher.dispatch(
        &owner,
        "license.sold",
        &json!({"license_id": 42, "buyer_email": "buyer@example.com"}),
    );
    dispatcher.shutdown().await;

    let worker = Arc::new(Worker::with_reqwest(
        store.clone(),
        store.clone(),
        RetryPolicy::default(),
        WorkerConfig {
            poll_interval: Duration::from_millis(500),
            ..WorkerConfig::default()
        },
    )?);

    let shutdown = CancellationToken::new();
    let handle = worker.spawn(shutdown.clone());
    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown.cancel();
    handle.await?;

    for delivery in store
        .list_deliveries_for_endpoint(&created.endpoint.id, Page::default())
        .await?
    {
        println!(
            "delivery {} status={} attempts={} response={:?}",
            delivery.id, delivery.status, delivery.attempts, delivery.response_status
        );
    }

    Ok(())
}
