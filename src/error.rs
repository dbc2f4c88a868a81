use thiserror::Error;

use crate::types::{DeliveryId, EndpointId};

/// Errors raised by endpoint and delivery persistence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backing store could not serve the request.
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("endpoint not found: {0}")]
    EndpointNotFound(EndpointId),

    #[error("delivery not found: {0}")]
    DeliveryNotFound(DeliveryId),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Errors returned when handing an event to the dispatcher.
///
/// Only [`crate::Dispatcher::try_dispatch`] surfaces these; the fire-and-forget
/// path logs and discards them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Dispatch queue is full.
    /// Caller must retry or apply backoff.
    #[error("dispatcher at capacity")]
    Backpressure,

    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,

    /// Event data could not be serialized into an envelope.
    #[error("failed to serialize event payload: {0}")]
    Serialization(String),
}

/// Reasons why an HTTP delivery attempt failed.
///
/// All variants count as one failed attempt. Whether a status code is
/// retried at all is decided by [`crate::StatusPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    /// Receiver answered with a non-2xx status.
    #[error("receiver returned status {status}")]
    Status { status: u16, body: String },
}

impl FailureReason {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FailureReason::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Text kept in `response_body` for audit.
    pub fn audit_body(&self) -> String {
        match self {
            FailureReason::Status { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors from the owner-facing management operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    /// Unknown id, or an id owned by someone else.
    #[error("not found")]
    NotFound,

    #[error("delivery {0} already succeeded and cannot be retried")]
    NotRetryable(DeliveryId),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),

    #[error("an endpoint must subscribe to at least one event type")]
    NoEvents,

    #[error(transparent)]
    Store(#[from] StoreError),
}
