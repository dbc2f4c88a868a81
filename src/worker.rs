use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{ReqwestClient, WebhookClient, WebhookRequest};
use crate::error::StoreError;
use crate::retry::{after_success, dead_without_attempt, RetryPolicy};
use crate::storage::{DeliveryStore, EndpointRegistry};
use crate::telemetry::{metric_inc, metric_inc_endpoint};
use crate::types::{Delivery, DeliveryStatus, DeliveryUpdate};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Time between polls of the store.
    pub poll_interval: Duration,
    /// Maximum deliveries fetched per poll.
    pub batch_size: usize,
    /// Upper bound on one HTTP attempt.
    pub request_timeout: Duration,
    /// Deliveries of one batch in flight at once. 1 means strictly
    /// sequential.
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            request_timeout: Duration::from_secs(10),
            concurrency: 1,
        }
    }
}

/// Counts for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub fetched: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead: usize,
    /// Deliveries left untouched because the store failed.
    pub errors: usize,
}

/// Polling delivery loop.
///
/// Each poll:
/// - Fetches due pending deliveries, oldest first
/// - Resolves the endpoint; a missing or inactive one kills the delivery
/// - Signs and POSTs the stored payload
/// - Writes back success, a scheduled retry, or dead
///
/// Deactivating an endpoint therefore ends every delivery still pending for
/// it. Reactivate the endpoint and call
/// [`WebhookAdmin::retry_delivery`](crate::WebhookAdmin::retry_delivery) to
/// send them again; their attempt counts are kept.
///
/// All coordination goes through the store, so a restarted worker simply
/// picks up where the rows say it left off. Only one worker per store is
/// supported: rows are not claimed before processing.
pub struct Worker {
    registry: Arc<dyn EndpointRegistry>,
    store: Arc<dyn DeliveryStore>,
    client: Arc<dyn WebhookClient>,
    policy: RetryPolicy,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        registry: Arc<dyn EndpointRegistry>,
        store: Arc<dyn DeliveryStore>,
        client: Arc<dyn WebhookClient>,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            client,
            policy,
            config,
        }
    }

    /// Worker delivering over a [`ReqwestClient`] bounded by
    /// `config.request_timeout`.
    pub fn with_reqwest(
        registry: Arc<dyn EndpointRegistry>,
        store: Arc<dyn DeliveryStore>,
        policy: RetryPolicy,
        config: WorkerConfig,
    ) -> Result<Self, reqwest::Error> {
        let client = ReqwestClient::new(config.request_timeout)?;
        Ok(Self::new(registry, store, Arc::new(client), policy, config))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the loop on a background task until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Poll on a fixed interval until `shutdown` fires.
    ///
    /// A poll in progress is finished before the loop exits; each HTTP call
    /// inside it is bounded by the request timeout.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "webhook worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(summary) if summary.fetched > 0 => {
                            debug!(
                                fetched = summary.fetched,
                                succeeded = summary.succeeded,
                                retried = summary.retried,
                                dead = summary.dead,
                                errors = summary.errors,
                                "poll complete"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            metric_inc("webhook.worker.poll_error");
                            error!(error = %err, "failed to fetch pending deliveries");
                        }
                    }
                }
            }
        }

        info!("webhook worker stopped");
    }

    pub async fn poll_once(&self) -> Result<PollSummary, StoreError> {
        self.poll_at(Utc::now()).await
    }

    /// Process the deliveries due at `now`.
    ///
    /// Transitions are stamped no earlier than `now`.
    pub async fn poll_at(&self, now: DateTime<Utc>) -> Result<PollSummary, StoreError> {
        let batch = self
            .store
            .list_pending_deliveries(self.config.batch_size, now)
            .await?;

        let mut summary = PollSummary {
            fetched: batch.len(),
            ..PollSummary::default()
        };

        let results: Vec<Result<DeliveryStatus, StoreError>> = futures::stream::iter(batch)
            .map(|delivery| async move { self.process(&delivery, now).await })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        for result in results {
            match result {
                Ok(DeliveryStatus::Success) => summary.succeeded += 1,
                Ok(DeliveryStatus::Pending) => summary.retried += 1,
                Ok(DeliveryStatus::Dead) => summary.dead += 1,
                Err(_) => summary.errors += 1,
            }
        }

        Ok(summary)
    }

    /// Drive one delivery through a single attempt and persist the result.
    async fn process(
        &self,
        delivery: &Delivery,
        now: DateTime<Utc>,
    ) -> Result<DeliveryStatus, StoreError> {
        let endpoint = match self.registry.find_endpoint_by_id(&delivery.endpoint_id).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(
                    delivery_id = %delivery.id,
                    endpoint_id = %delivery.endpoint_id,
                    error = %err,
                    "endpoint lookup failed, delivery left pending"
                );
                return Err(err);
            }
        };

        let update = match endpoint {
            None => dead_without_attempt(delivery, "endpoint no longer exists"),
            Some(endpoint) if !endpoint.active => {
                dead_without_attempt(delivery, "endpoint is inactive")
            }
            Some(endpoint) => {
                let request = WebhookRequest::signed(delivery, &endpoint);
                debug!(
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    event_type = %delivery.event_type,
                    attempts = delivery.attempts,
                    "delivering webhook"
                );

                let result = self.client.send(&request).await;
                let at = Utc::now().max(now);
                match result {
                    Ok(response) => after_success(delivery, response.status, response.body, at),
                    Err(failure) => {
                        warn!(
                            delivery_id = %delivery.id,
                            endpoint_id = %endpoint.id,
                            attempt = delivery.attempts + 1,
                            max_attempts = delivery.max_attempts,
                            error = %failure,
                            "webhook delivery attempt failed"
                        );
                        self.policy.after_failure(delivery, &failure, at)
                    }
                }
            }
        };

        if let Err(err) = self.store.record_delivery_outcome(delivery.id, &update).await {
            error!(
                delivery_id = %delivery.id,
                error = %err,
                "failed to record delivery outcome"
            );
            return Err(err);
        }

        log_transition(delivery, &update);
        Ok(update.status)
    }
}

fn log_transition(delivery: &Delivery, update: &DeliveryUpdate) {
    match update.status {
        DeliveryStatus::Success => {
            metric_inc("webhook.delivery.success");
            info!(
                delivery_id = %delivery.id,
                endpoint_id = %delivery.endpoint_id,
                status_code = ?update.response_status,
                "webhook delivered"
            );
        }
        DeliveryStatus::Pending => {
            metric_inc("webhook.delivery.retry_scheduled");
            debug!(
                delivery_id = %delivery.id,
                attempts = update.attempts,
                next_retry_at = ?update.next_retry_at,
                "retry scheduled"
            );
        }
        DeliveryStatus::Dead => {
            metric_inc("webhook.delivery.dead");
            metric_inc_endpoint("webhook.delivery.dead.endpoint", &delivery.endpoint_id);
            error!(
                delivery_id = %delivery.id,
                endpoint_id = %delivery.endpoint_id,
                attempts = update.attempts,
                reason = update.response_body.as_deref().unwrap_or_default(),
                "webhook delivery is dead"
            );
        }
    }
}
