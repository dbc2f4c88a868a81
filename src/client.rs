//! Outbound HTTP seam.
//!
//! The worker only talks to receivers through [`WebhookClient`], so tests can
//! script responses without a network. [`ReqwestClient`] is the production
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::FailureReason;
use crate::retry::{truncate_body, MAX_RESPONSE_BODY};
use crate::signing::{
    compute_signature, format_signature_header, DELIVERY_ID_HEADER, EVENT_HEADER, SIGNATURE_HEADER,
};
use crate::types::{Delivery, DeliveryId, Endpoint};

/// A signed POST ready to go out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    pub url: String,
    pub delivery_id: DeliveryId,
    pub event_type: String,
    /// Full `X-Webhook-Signature` value, `sha256=<hex>`.
    pub signature: String,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    /// Sign the stored payload with the endpoint secret.
    pub fn signed(delivery: &Delivery, endpoint: &Endpoint) -> Self {
        let signature = compute_signature(endpoint.secret.as_bytes(), &delivery.payload);
        Self {
            url: endpoint.url.clone(),
            delivery_id: delivery.id,
            event_type: delivery.event_type.clone(),
            signature: format_signature_header(&signature),
            body: delivery.payload.clone(),
        }
    }

    /// Headers in the order they are sent.
    pub fn headers(&self) -> [(&'static str, String); 4] {
        [
            ("Content-Type", "application/json".to_string()),
            (SIGNATURE_HEADER, self.signature.clone()),
            (EVENT_HEADER, self.event_type.clone()),
            (DELIVERY_ID_HEADER, self.delivery_id.to_string()),
        ]
    }
}

/// A 2xx answer from a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookResponse {
    pub status: u16,
    /// Truncated to [`MAX_RESPONSE_BODY`] bytes.
    pub body: String,
}

/// Sends one delivery attempt.
///
/// Implementations return `Ok` only for 2xx responses. Anything else,
/// including transport errors, is a [`FailureReason`].
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, FailureReason>;
}

/// Production client backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestClient {
    /// Build a client whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // A followed redirect would turn the signed POST into a bare GET.
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(format!("webhook-delivery/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeout })
    }

    /// Wrap an existing client. `timeout` is still applied per request.
    ///
    /// The caller's redirect policy is kept; disable redirects so a 3xx is
    /// reported as a failed attempt.
    pub fn from_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl WebhookClient for ReqwestClient {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, FailureReason> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(self.timeout)
            .body(request.body.clone());
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        let body = read_capped(response).await;

        debug!(
            delivery_id = %request.delivery_id,
            status = status.as_u16(),
            "webhook response received"
        );

        if status.is_success() {
            Ok(WebhookResponse {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(FailureReason::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

fn classify(err: reqwest::Error) -> FailureReason {
    if err.is_timeout() {
        FailureReason::Timeout
    } else {
        FailureReason::Network(err.to_string())
    }
}

/// Read at most [`MAX_RESPONSE_BODY`] bytes without buffering the rest.
async fn read_capped(mut response: reqwest::Response) -> String {
    let mut buf = Vec::with_capacity(MAX_RESPONSE_BODY);
    while buf.len() < MAX_RESPONSE_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) | Err(_) => break,
        }
    }
    truncate_body(&buf)
}
