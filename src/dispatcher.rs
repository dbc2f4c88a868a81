use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::storage::{DeliveryStore, EndpointRegistry};
use crate::telemetry::{metric_inc, metric_inc_endpoint};
use crate::types::{DeliveryId, Envelope, NewDelivery, OwnerId, DEFAULT_MAX_ATTEMPTS};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Events buffered between producers and the fan-out task.
    pub queue_capacity: usize,
    /// Budget stamped on each new delivery.
    pub max_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// A domain event waiting to be fanned out.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub owner_id: OwnerId,
    pub event_type: String,
    pub data: serde_json::Value,
    /// Becomes the envelope timestamp.
    pub occurred_at: DateTime<Utc>,
}

impl DispatchRequest {
    pub fn new(owner_id: OwnerId, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            owner_id,
            event_type: event_type.into(),
            data,
            occurred_at: Utc::now(),
        }
    }
}

/// What one fan-out pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub matched: usize,
    pub created: Vec<DeliveryId>,
    pub failed: usize,
}

/// Turns domain events into persisted deliveries.
///
/// Producers hold a cheap clone and call [`Dispatcher::dispatch`], which
/// never blocks and never fails. Events go through a bounded queue to a
/// single fan-out task that talks to the store; no network I/O happens here.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<DispatchRequest>,
    shutdown: CancellationToken,
    fan_out_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Dispatcher {
    /// Start the fan-out task and return a handle for producers.
    pub fn spawn(
        registry: Arc<dyn EndpointRegistry>,
        store: Arc<dyn DeliveryStore>,
        config: DispatcherConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(fan_out_loop(
            rx,
            registry,
            store,
            config.max_attempts,
            shutdown.clone(),
        ));

        Self {
            tx,
            shutdown,
            fan_out_handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Fire-and-forget dispatch.
    ///
    /// Anything that goes wrong is logged and swallowed; the caller's request
    /// path is never affected.
    pub fn dispatch<T>(&self, owner_id: &OwnerId, event_type: &str, data: &T)
    where
        T: Serialize + ?Sized,
    {
        if let Err(err) = self.try_dispatch(owner_id, event_type, data) {
            metric_inc("webhook.dispatch.dropped");
            warn!(
                owner_id = %owner_id,
                event_type = %event_type,
                error = %err,
                "webhook event dropped before enqueue"
            );
        }
    }

    /// Like [`Dispatcher::dispatch`], but reports why an event was not queued.
    pub fn try_dispatch<T>(
        &self,
        owner_id: &OwnerId,
        event_type: &str,
        data: &T,
    ) -> Result<(), DispatchError>
    where
        T: Serialize + ?Sized,
    {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::Shutdown);
        }

        let data =
            serde_json::to_value(data).map_err(|e| DispatchError::Serialization(e.to_string()))?;
        let request = DispatchRequest::new(owner_id.clone(), event_type, data);

        match self.tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DispatchError::Backpressure),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Shutdown),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop accepting events, fan out what is already queued, then return.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.fan_out_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn fan_out_loop(
    mut rx: mpsc::Receiver<DispatchRequest>,
    registry: Arc<dyn EndpointRegistry>,
    store: Arc<dyn DeliveryStore>,
    max_attempts: u32,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            request = rx.recv() => match request {
                Some(request) => {
                    fan_out(registry.as_ref(), store.as_ref(), &request, max_attempts).await;
                }
                None => return,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    // Drain whatever producers queued before the cancel.
    rx.close();
    while let Some(request) = rx.recv().await {
        fan_out(registry.as_ref(), store.as_ref(), &request, max_attempts).await;
    }
    info!("webhook dispatcher stopped");
}

/// Create one pending delivery per matching endpoint.
///
/// Store failures are logged per endpoint and do not stop the others.
pub async fn fan_out(
    registry: &dyn EndpointRegistry,
    store: &dyn DeliveryStore,
    request: &DispatchRequest,
    max_attempts: u32,
) -> FanOutReport {
    let mut report = FanOutReport::default();

    let endpoints = match registry
        .find_active_endpoints(&request.owner_id, &request.event_type)
        .await
    {
        Ok(endpoints) => endpoints,
        Err(err) => {
            warn!(
                owner_id = %request.owner_id,
                event_type = %request.event_type,
                error = %err,
                "endpoint lookup failed, event not fanned out"
            );
            return report;
        }
    };

    report.matched = endpoints.len();
    if endpoints.is_empty() {
        debug!(
            owner_id = %request.owner_id,
            event_type = %request.event_type,
            "no subscribed endpoints"
        );
        return report;
    }

    let envelope = Envelope::new(&request.event_type, request.occurred_at, request.data.clone());
    let payload = match envelope.to_bytes() {
        Ok(payload) => payload,
        Err(err) => {
            warn!(event_type = %request.event_type, error = %err, "failed to encode envelope");
            report.failed = endpoints.len();
            return report;
        }
    };

    for endpoint in endpoints {
        let mut delivery = NewDelivery::new(endpoint.id.clone(), &request.event_type, payload.clone());
        delivery.max_attempts = max_attempts.max(1);

        match store.create_delivery(delivery).await {
            Ok(created) => {
                metric_inc("webhook.dispatch.enqueued");
                debug!(
                    delivery_id = %created.id,
                    endpoint_id = %endpoint.id,
                    event_type = %request.event_type,
                    "delivery enqueued"
                );
                report.created.push(created.id);
            }
            Err(err) => {
                metric_inc_endpoint("webhook.dispatch.store_error", &endpoint.id);
                warn!(
                    endpoint_id = %endpoint.id,
                    event_type = %request.event_type,
                    error = %err,
                    "failed to enqueue delivery"
                );
                report.failed += 1;
            }
        }
    }

    report
}
