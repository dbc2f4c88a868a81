use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};
use tracing::warn;

use crate::error::StoreError;
use crate::storage::{DeliveryStore, EndpointAdminStore, EndpointRegistry};
use crate::types::{
    Delivery, DeliveryId, DeliveryStatus, DeliveryUpdate, Endpoint, EndpointId, NewDelivery,
    OwnerId, Page,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS webhook_endpoints (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        url TEXT NOT NULL,
        secret TEXT NOT NULL,
        subscribed_events TEXT[] NOT NULL DEFAULT '{}',
        active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE INDEX IF NOT EXISTS webhook_endpoints_owner_idx
        ON webhook_endpoints (owner_id);

    CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id BIGSERIAL PRIMARY KEY,
        endpoint_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload BYTEA NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        response_status INTEGER,
        response_body TEXT,
        next_retry_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        delivered_at TIMESTAMPTZ
    );
    CREATE INDEX IF NOT EXISTS webhook_deliveries_due_idx
        ON webhook_deliveries (status, next_retry_at);
    CREATE INDEX IF NOT EXISTS webhook_deliveries_endpoint_idx
        ON webhook_deliveries (endpoint_id, id DESC);
";

const ENDPOINT_COLUMNS: &str =
    "id, owner_id, url, secret, subscribed_events, active, created_at";

const DELIVERY_COLUMNS: &str = "id, endpoint_id, event_type, payload, status, attempts, \
     max_attempts, response_status, response_body, next_retry_at, created_at, delivered_at";

/// PostgreSQL storage for endpoints and deliveries.
///
/// Endpoints and deliveries live in two tables; the delivery table doubles
/// as the work queue polled by the worker.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Wrap a connected client and create the tables if they are missing.
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client.batch_execute(SCHEMA).await?;
        Ok(Self { client })
    }
}

fn backend(err: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn corrupt(err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn from_db_int(value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(corrupt)
}

fn endpoint_from_row(row: &Row) -> Result<Endpoint, StoreError> {
    let events: Vec<String> = row.try_get("subscribed_events").map_err(corrupt)?;
    Ok(Endpoint {
        id: EndpointId(row.try_get("id").map_err(corrupt)?),
        owner_id: OwnerId(row.try_get("owner_id").map_err(corrupt)?),
        url: row.try_get("url").map_err(corrupt)?,
        secret: row.try_get("secret").map_err(corrupt)?,
        subscribed_events: events.into_iter().collect(),
        active: row.try_get("active").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
    })
}

fn delivery_from_row(row: &Row) -> Result<Delivery, StoreError> {
    let status: String = row.try_get("status").map_err(corrupt)?;
    let response_status: Option<i32> = row.try_get("response_status").map_err(corrupt)?;
    let response_status = response_status
        .map(|s| u16::try_from(s).map_err(corrupt))
        .transpose()?;

    Ok(Delivery {
        id: DeliveryId(row.try_get("id").map_err(corrupt)?),
        endpoint_id: EndpointId(row.try_get("endpoint_id").map_err(corrupt)?),
        event_type: row.try_get("event_type").map_err(corrupt)?,
        payload: row.try_get("payload").map_err(corrupt)?,
        status: status.parse::<DeliveryStatus>().map_err(corrupt)?,
        attempts: from_db_int(row.try_get("attempts").map_err(corrupt)?)?,
        max_attempts: from_db_int(row.try_get("max_attempts").map_err(corrupt)?)?,
        response_status,
        response_body: row.try_get("response_body").map_err(corrupt)?,
        next_retry_at: row.try_get("next_retry_at").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        delivered_at: row.try_get("delivered_at").map_err(corrupt)?,
    })
}

/// Decode the due rows, skipping any that no longer parse so one bad row
/// cannot stall the whole queue.
fn decode_pending<R>(
    rows: &[R],
    decode: impl Fn(&R) -> Result<Delivery, StoreError>,
) -> Vec<Delivery> {
    rows.iter()
        .filter_map(|row| match decode(row) {
            Ok(delivery) => Some(delivery),
            Err(err) => {
                warn!(error = %err, "skipping undecodable pending delivery");
                None
            }
        })
        .collect()
}

#[async_trait]
impl EndpointRegistry for PostgresStore {
    async fn find_active_endpoints(
        &self,
        owner_id: &OwnerId,
        event_type: &str,
    ) -> Result<Vec<Endpoint>, StoreError> {
        let query = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints
             WHERE owner_id = $1 AND active AND $2 = ANY(subscribed_events)
             ORDER BY created_at, id"
        );
        let rows = self
            .client
            .query(&query, &[&owner_id.0, &event_type])
            .await
            .map_err(backend)?;
        rows.iter().map(endpoint_from_row).collect()
    }

    async fn find_endpoint_by_id(&self, id: &EndpointId) -> Result<Option<Endpoint>, StoreError> {
        let query = format!("SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = $1");
        let row = self
            .client
            .query_opt(&query, &[&id.0])
            .await
            .map_err(backend)?;
        row.as_ref().map(endpoint_from_row).transpose()
    }
}

#[async_trait]
impl EndpointAdminStore for PostgresStore {
    async fn insert_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError> {
        let events: Vec<String> = endpoint.subscribed_events.into_iter().collect();
        self.client
            .execute(
                "INSERT INTO webhook_endpoints
                    (id, owner_id, url, secret, subscribed_events, active, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &endpoint.id.0,
                    &endpoint.owner_id.0,
                    &endpoint.url,
                    &endpoint.secret,
                    &events,
                    &endpoint.active,
                    &endpoint.created_at,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn list_endpoints(&self, owner_id: &OwnerId) -> Result<Vec<Endpoint>, StoreError> {
        let query = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints
             WHERE owner_id = $1
             ORDER BY created_at, id"
        );
        let rows = self
            .client
            .query(&query, &[&owner_id.0])
            .await
            .map_err(backend)?;
        rows.iter().map(endpoint_from_row).collect()
    }

    async fn update_endpoint(&self, endpoint: &Endpoint) -> Result<(), StoreError> {
        let events: Vec<&str> = endpoint.subscribed_events.iter().map(String::as_str).collect();
        let updated = self
            .client
            .execute(
                "UPDATE webhook_endpoints
                 SET url = $2, subscribed_events = $3, active = $4
                 WHERE id = $1",
                &[&endpoint.id.0, &endpoint.url, &events, &endpoint.active],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::EndpointNotFound(endpoint.id.clone()));
        }
        Ok(())
    }

    async fn delete_endpoint(&self, id: &EndpointId) -> Result<bool, StoreError> {
        let deleted = self
            .client
            .execute("DELETE FROM webhook_endpoints WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl DeliveryStore for PostgresStore {
    async fn create_delivery(&self, delivery: NewDelivery) -> Result<Delivery, StoreError> {
        let query = format!(
            "INSERT INTO webhook_deliveries (endpoint_id, event_type, payload, status, max_attempts)
             VALUES ($1, $2, $3, 'pending', $4)
             RETURNING {DELIVERY_COLUMNS}"
        );
        let row = self
            .client
            .query_one(
                &query,
                &[
                    &delivery.endpoint_id.0,
                    &delivery.event_type,
                    &delivery.payload,
                    &to_db_int(delivery.max_attempts),
                ],
            )
            .await
            .map_err(backend)?;
        delivery_from_row(&row)
    }

    async fn list_pending_deliveries(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delivery>, StoreError> {
        let query = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries
             WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1)
             ORDER BY created_at, id
             LIMIT $2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(&query, &[&now, &limit])
            .await
            .map_err(backend)?;
        Ok(decode_pending(&rows, delivery_from_row))
    }

    async fn record_delivery_outcome(
        &self,
        id: DeliveryId,
        update: &DeliveryUpdate,
    ) -> Result<(), StoreError> {
        let response_status = update.response_status.map(i32::from);
        let updated = self
            .client
            .execute(
                "UPDATE webhook_deliveries
                 SET status = $2,
                     attempts = GREATEST(attempts, $3),
                     response_status = $4,
                     response_body = $5,
                     next_retry_at = $6,
                     delivered_at = COALESCE($7, delivered_at)
                 WHERE id = $1",
                &[
                    &id.0,
                    &update.status.as_str(),
                    &to_db_int(update.attempts),
                    &response_status,
                    &update.response_body,
                    &update.next_retry_at,
                    &update.delivered_at,
                ],
            )
            .await
            .map_err(backend)?;
        if updated == 0 {
            return Err(StoreError::DeliveryNotFound(id));
        }
        Ok(())
    }

    async fn find_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError> {
        let query = format!("SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1");
        let row = self
            .client
            .query_opt(&query, &[&id.0])
            .await
            .map_err(backend)?;
        row.as_ref().map(delivery_from_row).transpose()
    }

    async fn list_deliveries_for_endpoint(
        &self,
        endpoint_id: &EndpointId,
        page: Page,
    ) -> Result<Vec<Delivery>, StoreError> {
        let query = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries
             WHERE endpoint_id = $1
             ORDER BY id DESC
             LIMIT $2 OFFSET $3"
        );
        let limit = i64::try_from(page.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(page.offset).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(&query, &[&endpoint_id.0, &limit, &offset])
            .await
            .map_err(backend)?;
        rows.iter().map(delivery_from_row).collect()
    }

    async fn reset_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError> {
        let query = format!(
            "UPDATE webhook_deliveries
             SET status = 'pending',
                 next_retry_at = NULL,
                 max_attempts = GREATEST(max_attempts, attempts + 1)
             WHERE id = $1 AND status <> 'success'
             RETURNING {DELIVERY_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(&query, &[&id.0])
            .await
            .map_err(backend)?;
        row.as_ref().map(delivery_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_counters_saturate_into_postgres_integers() {
        assert_eq!(to_db_int(5), 5);
        assert_eq!(to_db_int(u32::MAX), i32::MAX);
        assert_eq!(from_db_int(3), Ok(3));
        assert!(matches!(from_db_int(-1), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn undecodable_pending_rows_are_skipped() {
        let rows = [1_i64, -1, 2];
        let decoded = decode_pending(&rows, |&id| {
            if id < 0 {
                return Err(StoreError::Corrupt("unknown delivery status".to_string()));
            }
            Ok(Delivery {
                id: DeliveryId(id),
                endpoint_id: EndpointId("ep-a".to_string()),
                event_type: "license.sold".to_string(),
                payload: b"{}".to_vec(),
                status: DeliveryStatus::Pending,
                attempts: 0,
                max_attempts: 5,
                response_status: None,
                response_body: None,
                next_retry_at: None,
                created_at: Utc::now(),
                delivered_at: None,
            })
        });

        let ids: Vec<DeliveryId> = decoded.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![DeliveryId(1), DeliveryId(2)]);
    }
}
