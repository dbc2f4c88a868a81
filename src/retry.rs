use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::FailureReason;
use crate::types::{Delivery, DeliveryStatus, DeliveryUpdate};

/// Fixed sequence of waits between attempts.
///
/// Indexed by the number of failed attempts so far and clamped to the last
/// entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    steps: Vec<Duration>,
}

impl BackoffSchedule {
    /// Build a schedule. An empty list falls back to the default table.
    pub fn new(steps: Vec<Duration>) -> Self {
        if steps.is_empty() {
            return Self::default();
        }
        Self { steps }
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let index = (failures as usize).min(self.steps.len() - 1);
        self.steps[index]
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}

impl Default for BackoffSchedule {
    /// 30s, 2m, 10m, 30m, 2h.
    fn default() -> Self {
        Self {
            steps: vec![
                Duration::from_secs(30),
                Duration::from_secs(2 * 60),
                Duration::from_secs(10 * 60),
                Duration::from_secs(30 * 60),
                Duration::from_secs(2 * 60 * 60),
            ],
        }
    }
}

/// How receiver status codes feed into the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusPolicy {
    /// Every non-2xx status and every transport error is retried alike.
    #[default]
    Uniform,

    /// 4xx responses other than 408 and 429 kill the delivery at once.
    DeadOnClientError,
}

impl StatusPolicy {
    fn is_permanent(&self, failure: &FailureReason) -> bool {
        match (self, failure.status_code()) {
            (StatusPolicy::DeadOnClientError, Some(code)) => {
                (400..500).contains(&code) && code != 408 && code != 429
            }
            _ => false,
        }
    }
}

/// Schedule and status handling applied by the worker.
///
/// The attempt budget itself lives on each delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub schedule: BackoffSchedule,
    pub status_policy: StatusPolicy,
}

impl RetryPolicy {
    pub fn with_schedule(mut self, schedule: BackoffSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_status_policy(mut self, status_policy: StatusPolicy) -> Self {
        self.status_policy = status_policy;
        self
    }

    /// Transition after a failed attempt.
    ///
    /// The attempt is always counted. The delivery stays pending only while
    /// its own `max_attempts` budget has room left.
    pub fn after_failure(
        &self,
        delivery: &Delivery,
        failure: &FailureReason,
        now: DateTime<Utc>,
    ) -> DeliveryUpdate {
        let attempts = delivery.attempts.saturating_add(1);
        let exhausted = attempts >= delivery.max_attempts;

        let (status, next_retry_at) = if exhausted || self.status_policy.is_permanent(failure) {
            (DeliveryStatus::Dead, None)
        } else {
            let delay = self.schedule.delay_for(delivery.attempts);
            (DeliveryStatus::Pending, Some(now + to_chrono(delay)))
        };

        DeliveryUpdate {
            status,
            attempts,
            response_status: failure.status_code(),
            response_body: Some(truncate_body(failure.audit_body().as_bytes())),
            next_retry_at,
            delivered_at: None,
        }
    }
}

/// Transition after a 2xx response. Successful attempts are not counted.
pub fn after_success(
    delivery: &Delivery,
    status: u16,
    body: String,
    now: DateTime<Utc>,
) -> DeliveryUpdate {
    DeliveryUpdate {
        status: DeliveryStatus::Success,
        attempts: delivery.attempts,
        response_status: Some(status),
        response_body: Some(body),
        next_retry_at: None,
        delivered_at: Some(now),
    }
}

/// Terminal transition for a delivery with nobody to deliver to.
pub fn dead_without_attempt(delivery: &Delivery, reason: &str) -> DeliveryUpdate {
    DeliveryUpdate {
        status: DeliveryStatus::Dead,
        attempts: delivery.attempts,
        response_status: None,
        response_body: Some(reason.to_string()),
        next_retry_at: None,
        delivered_at: None,
    }
}

/// Cap stored on `response_body`.
pub const MAX_RESPONSE_BODY: usize = 1024;

/// Keep at most [`MAX_RESPONSE_BODY`] bytes, decoded lossily.
pub fn truncate_body(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_RESPONSE_BODY);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(52))
}
