use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Destination for webhook delivery.
///
/// Endpoints are owned by the registry; the delivery core only reads them.
/// The signing secret is fixed at creation and never leaves the crate through
/// [`EndpointView`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Logical identifier for the endpoint.
    pub id: EndpointId,

    /// Product user that registered the endpoint.
    pub owner_id: OwnerId,

    /// Target URL for webhook delivery.
    pub url: String,

    /// Secret for HMAC signing.
    pub secret: String,

    /// Event types this endpoint wants to receive.
    pub subscribed_events: BTreeSet<String>,

    /// Inactive endpoints receive nothing.
    pub active: bool,

    pub created_at: DateTime<Utc>,
}

impl Endpoint {
    /// Create an active endpoint with no subscriptions.
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: EndpointId(id.into()),
            owner_id: OwnerId(owner_id.into()),
            url: url.into(),
            secret: secret.into(),
            subscribed_events: BTreeSet::new(),
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Subscribe to an additional event type.
    pub fn with_event(mut self, event_type: impl Into<String>) -> Self {
        self.subscribed_events.insert(event_type.into());
        self
    }

    /// Replace the subscription set.
    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribed_events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Whether a dispatch of `event_type` should reach this endpoint.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.active && self.subscribed_events.contains(event_type)
    }

    /// Owner-facing projection without the secret.
    pub fn view(&self) -> EndpointView {
        EndpointView {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            url: self.url.clone(),
            subscribed_events: self.subscribed_events.clone(),
            active: self.active,
            created_at: self.created_at,
        }
    }
}

/// Endpoint as returned by listing and update calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointView {
    pub id: EndpointId,
    pub owner_id: OwnerId,
    pub url: String,
    pub subscribed_events: BTreeSet<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Unique identifier for an endpoint.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of endpoint IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub String);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for the product user owning endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub String);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic delivery identifier, sent to receivers as `X-Webhook-ID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(pub i64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default retry budget for a new delivery.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Dead,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "success" => Ok(DeliveryStatus::Success),
            "dead" => Ok(DeliveryStatus::Dead),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

/// One persisted intent: "this event must reach this endpoint".
///
/// `payload` is written once by the dispatcher. Everything after that only
/// touches the status and attempt metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub endpoint_id: EndpointId,
    pub event_type: String,

    /// Serialized [`Envelope`], signed and sent byte-for-byte.
    pub payload: Vec<u8>,

    pub status: DeliveryStatus,

    /// Number of failed attempts so far. A successful attempt does not count.
    pub attempts: u32,
    pub max_attempts: u32,

    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Pending and eligible at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// Row the dispatcher asks the store to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDelivery {
    pub endpoint_id: EndpointId,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub max_attempts: u32,
}

impl NewDelivery {
    pub fn new(endpoint_id: EndpointId, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            endpoint_id,
            event_type: event_type.into(),
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Outcome of one worker pass over a delivery, written back to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Outer JSON wrapper placed around an event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    /// RFC3339, UTC, second precision.
    pub timestamp: String,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, at: DateTime<Utc>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
            data,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Offset pagination for delivery listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Page {
    pub const MAX_LIMIT: usize = 100;

    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(20, 0)
    }
}
