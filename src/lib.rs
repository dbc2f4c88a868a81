//! Durable, at-least-once webhook delivery.
//!
//! Domain code hands events to a [`Dispatcher`], which fans each one out to
//! the owner's subscribed endpoints and persists one pending [`Delivery`]
//! per endpoint. A [`Worker`] polls the store, signs each payload with the
//! endpoint secret and POSTs it, then records success or schedules a retry
//! on a fixed backoff table until the delivery is declared dead.
//!
//! ## Guarantees
//! - Persistence before network I/O: a delivery exists in the store before
//!   any attempt is made
//! - At-least-once delivery per (event, endpoint); receivers dedupe on
//!   `X-Webhook-ID`
//! - Producers are never blocked or failed by webhook problems
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across deliveries
//! - Coordination between several workers sharing one store

mod admin;
mod client;
mod config;
mod dispatcher;
mod error;
mod retry;
mod shutdown;
mod signing;
mod storage;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use admin::{CreatedEndpoint, EndpointPatch, WebhookAdmin};
pub use client::{ReqwestClient, WebhookClient, WebhookRequest, WebhookResponse};
pub use config::{DispatcherSettings, Settings, WorkerSettings};
pub use dispatcher::{fan_out, DispatchRequest, Dispatcher, DispatcherConfig, FanOutReport};
pub use error::{AdminError, DispatchError, FailureReason, StoreError};
pub use retry::{
    after_success, dead_without_attempt, truncate_body, BackoffSchedule, RetryPolicy,
    StatusPolicy, MAX_RESPONSE_BODY,
};
pub use shutdown::{cancel_on_signal, wait_for_shutdown_signal};
pub use signing::{
    compute_signature, format_signature_header, parse_signature_header, parse_webhook_headers,
    verify_signature, verify_webhook_request, ParsedHeaders, VerificationError,
    DELIVERY_ID_HEADER, EVENT_HEADER, SIGNATURE_HEADER,
};
pub use storage::{DeliveryStore, EndpointAdminStore, EndpointRegistry, InMemoryStore};
pub use telemetry::init_tracing;
pub use types::{
    Delivery, DeliveryId, DeliveryStatus, DeliveryUpdate, Endpoint, EndpointId, EndpointView,
    Envelope, NewDelivery, OwnerId, Page, DEFAULT_MAX_ATTEMPTS,
};
pub use worker::{PollSummary, Worker, WorkerConfig};

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStore;
