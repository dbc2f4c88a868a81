use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{
    Delivery, DeliveryId, DeliveryStatus, DeliveryUpdate, Endpoint, EndpointId, NewDelivery,
    OwnerId, Page,
};

/// Read side of the endpoint registry, as seen by the delivery core.
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    /// Active endpoints of `owner_id` subscribed to `event_type`.
    async fn find_active_endpoints(
        &self,
        owner_id: &OwnerId,
        event_type: &str,
    ) -> Result<Vec<Endpoint>, StoreError>;

    async fn find_endpoint_by_id(&self, id: &EndpointId) -> Result<Option<Endpoint>, StoreError>;
}

/// Write side of the registry used by the management API.
#[async_trait]
pub trait EndpointAdminStore: EndpointRegistry {
    async fn insert_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError>;

    async fn list_endpoints(&self, owner_id: &OwnerId) -> Result<Vec<Endpoint>, StoreError>;

    /// Persist url, subscriptions and active flag. The secret is never
    /// rewritten.
    async fn update_endpoint(&self, endpoint: &Endpoint) -> Result<(), StoreError>;

    /// Returns `false` if nothing was deleted.
    async fn delete_endpoint(&self, id: &EndpointId) -> Result<bool, StoreError>;
}

/// Durable table of deliveries. The store is the queue.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Insert a pending delivery with `attempts = 0` and no retry time.
    async fn create_delivery(&self, delivery: NewDelivery) -> Result<Delivery, StoreError>;

    /// Up to `limit` pending deliveries due at `now`, oldest first.
    async fn list_pending_deliveries(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delivery>, StoreError>;

    /// Write a worker outcome. `attempts` is never lowered.
    async fn record_delivery_outcome(
        &self,
        id: DeliveryId,
        update: &DeliveryUpdate,
    ) -> Result<(), StoreError>;

    async fn find_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError>;

    /// Deliveries of one endpoint, newest first.
    async fn list_deliveries_for_endpoint(
        &self,
        endpoint_id: &EndpointId,
        page: Page,
    ) -> Result<Vec<Delivery>, StoreError>;

    /// Make a non-successful delivery due again.
    ///
    /// Sets status to pending and clears `next_retry_at`. Attempts are kept
    /// and `max_attempts` is raised to at least `attempts + 1`. Returns
    /// `None` if the delivery does not exist or already succeeded.
    async fn reset_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError>;
}

#[derive(Default)]
struct State {
    endpoints: HashMap<EndpointId, Endpoint>,
    deliveries: BTreeMap<DeliveryId, Delivery>,
    next_id: i64,
}

/// In-memory storage for tests and embedded deployments.
///
/// Holds endpoints and deliveries behind one lock, so nothing survives a
/// restart.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint as-is, keeping its id and secret.
    pub async fn with_endpoint(self, endpoint: Endpoint) -> Self {
        self.state
            .lock()
            .await
            .endpoints
            .insert(endpoint.id.clone(), endpoint);
        self
    }

    /// Every delivery, in id order.
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().await.deliveries.values().cloned().collect()
    }
}

#[async_trait]
impl EndpointRegistry for InMemoryStore {
    async fn find_active_endpoints(
        &self,
        owner_id: &OwnerId,
        event_type: &str,
    ) -> Result<Vec<Endpoint>, StoreError> {
        let state = self.state.lock().await;
        let mut matching: Vec<Endpoint> = state
            .endpoints
            .values()
            .filter(|e| &e.owner_id == owner_id && e.accepts(event_type))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching)
    }

    async fn find_endpoint_by_id(&self, id: &EndpointId) -> Result<Option<Endpoint>, StoreError> {
        Ok(self.state.lock().await.endpoints.get(id).cloned())
    }
}

#[async_trait]
impl EndpointAdminStore for InMemoryStore {
    async fn insert_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .endpoints
            .insert(endpoint.id.clone(), endpoint);
        Ok(())
    }

    async fn list_endpoints(&self, owner_id: &OwnerId) -> Result<Vec<Endpoint>, StoreError> {
        let state = self.state.lock().await;
        let mut owned: Vec<Endpoint> = state
            .endpoints
            .values()
            .filter(|e| &e.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(owned)
    }

    async fn update_endpoint(&self, endpoint: &Endpoint) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .endpoints
            .get_mut(&endpoint.id)
            .ok_or_else(|| StoreError::EndpointNotFound(endpoint.id.clone()))?;
        stored.url = endpoint.url.clone();
        stored.subscribed_events = endpoint.subscribed_events.clone();
        stored.active = endpoint.active;
        Ok(())
    }

    async fn delete_endpoint(&self, id: &EndpointId) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.endpoints.remove(id).is_some())
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn create_delivery(&self, delivery: NewDelivery) -> Result<Delivery, StoreError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let created = Delivery {
            id: DeliveryId(state.next_id),
            endpoint_id: delivery.endpoint_id,
            event_type: delivery.event_type,
            payload: delivery.payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts: delivery.max_attempts,
            response_status: None,
            response_body: None,
            next_retry_at: None,
            created_at: Utc::now(),
            delivered_at: None,
        };
        state.deliveries.insert(created.id, created.clone());
        Ok(created)
    }

    async fn list_pending_deliveries(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delivery>, StoreError> {
        let state = self.state.lock().await;
        let mut due: Vec<Delivery> = state
            .deliveries
            .values()
            .filter(|d| d.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn record_delivery_outcome(
        &self,
        id: DeliveryId,
        update: &DeliveryUpdate,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let delivery = state
            .deliveries
            .get_mut(&id)
            .ok_or(StoreError::DeliveryNotFound(id))?;

        delivery.status = update.status;
        delivery.attempts = delivery.attempts.max(update.attempts);
        delivery.response_status = update.response_status;
        delivery.response_body = update.response_body.clone();
        delivery.next_retry_at = update.next_retry_at;
        if update.delivered_at.is_some() {
            delivery.delivered_at = update.delivered_at;
        }
        Ok(())
    }

    async fn find_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError> {
        Ok(self.state.lock().await.deliveries.get(&id).cloned())
    }

    async fn list_deliveries_for_endpoint(
        &self,
        endpoint_id: &EndpointId,
        page: Page,
    ) -> Result<Vec<Delivery>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .deliveries
            .values()
            .rev()
            .filter(|d| &d.endpoint_id == endpoint_id)
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn reset_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(delivery) = state.deliveries.get_mut(&id) else {
            return Ok(None);
        };
        if delivery.status == DeliveryStatus::Success {
            return Ok(None);
        }

        delivery.status = DeliveryStatus::Pending;
        delivery.next_retry_at = None;
        delivery.max_attempts = delivery.max_attempts.max(delivery.attempts + 1);
        Ok(Some(delivery.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str, owner: &str) -> Endpoint {
        Endpoint::new(id, owner, format!("https://{id}.example.com/hook"), "secret")
            .with_event("license.sold")
    }

    #[tokio::test]
    async fn find_active_endpoints_filters_owner_event_and_flag() {
        let store = InMemoryStore::new()
            .with_endpoint(endpoint("a", "owner-1"))
            .await
            .with_endpoint(endpoint("b", "owner-1").with_active(false))
            .await
            .with_endpoint(endpoint("c", "owner-2"))
            .await
            .with_endpoint(endpoint("d", "owner-1").with_events(["payout.completed"]))
            .await;

        let found = store
            .find_active_endpoints(&OwnerId("owner-1".to_string()), "license.sold")
            .await
            .unwrap();

        let ids: Vec<_> = found.iter().map(|e| e.id.0.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn created_deliveries_are_pending_with_increasing_ids() {
        let store = InMemoryStore::new();
        let first = store
            .create_delivery(NewDelivery::new(EndpointId("a".into()), "e", b"1".to_vec()))
            .await
            .unwrap();
        let second = store
            .create_delivery(NewDelivery::new(EndpointId("a".into()), "e", b"2".to_vec()))
            .await
            .unwrap();

        assert!(second.id > first.id);
        assert_eq!(first.status, DeliveryStatus::Pending);
        assert_eq!(first.attempts, 0);
        assert_eq!(first.next_retry_at, None);
    }

    #[tokio::test]
    async fn pending_listing_honours_due_time_and_limit() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for i in 0..3 {
            store
                .create_delivery(NewDelivery::new(EndpointId("a".into()), "e", vec![i]))
                .await
                .unwrap();
        }
        store
            .record_delivery_outcome(
                DeliveryId(1),
                &DeliveryUpdate {
                    status: DeliveryStatus::Pending,
                    attempts: 1,
                    response_status: Some(500),
                    response_body: None,
                    next_retry_at: Some(now + chrono::Duration::seconds(30)),
                    delivered_at: None,
                },
            )
            .await
            .unwrap();

        let due = store.list_pending_deliveries(10, now).await.unwrap();
        assert_eq!(due.iter().map(|d| d.id.0).collect::<Vec<_>>(), vec![2, 3]);

        let limited = store.list_pending_deliveries(1, now).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, DeliveryId(2));

        let later = now + chrono::Duration::seconds(31);
        let due = store.list_pending_deliveries(10, later).await.unwrap();
        assert_eq!(due.iter().map(|d| d.id.0).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn outcome_never_lowers_attempts() {
        let store = InMemoryStore::new();
        let delivery = store
            .create_delivery(NewDelivery::new(EndpointId("a".into()), "e", b"{}".to_vec()))
            .await
            .unwrap();

        let mut update = DeliveryUpdate {
            status: DeliveryStatus::Pending,
            attempts: 3,
            response_status: None,
            response_body: None,
            next_retry_at: None,
            delivered_at: None,
        };
        store.record_delivery_outcome(delivery.id, &update).await.unwrap();
        update.attempts = 1;
        store.record_delivery_outcome(delivery.id, &update).await.unwrap();

        let stored = store.find_delivery(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
    }

    #[tokio::test]
    async fn reset_revives_dead_but_not_successful_deliveries() {
        let store = InMemoryStore::new();
        let dead = store
            .create_delivery(NewDelivery::new(EndpointId("a".into()), "e", b"{}".to_vec()))
            .await
            .unwrap();
        let done = store
            .create_delivery(NewDelivery::new(EndpointId("a".into()), "e", b"{}".to_vec()))
            .await
            .unwrap();

        let terminal = |status, attempts| DeliveryUpdate {
            status,
            attempts,
            response_status: None,
            response_body: None,
            next_retry_at: None,
            delivered_at: None,
        };
        store
            .record_delivery_outcome(dead.id, &terminal(DeliveryStatus::Dead, 5))
            .await
            .unwrap();
        store
            .record_delivery_outcome(done.id, &terminal(DeliveryStatus::Success, 0))
            .await
            .unwrap();

        let revived = store.reset_delivery(dead.id).await.unwrap().unwrap();
        assert_eq!(revived.status, DeliveryStatus::Pending);
        assert_eq!(revived.attempts, 5);
        assert_eq!(revived.max_attempts, 6);
        assert_eq!(revived.next_retry_at, None);

        assert!(store.reset_delivery(done.id).await.unwrap().is_none());
        assert!(store.reset_delivery(DeliveryId(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn endpoint_listing_is_newest_first_and_paged() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store
                .create_delivery(NewDelivery::new(EndpointId("a".into()), "e", vec![i]))
                .await
                .unwrap();
        }
        store
            .create_delivery(NewDelivery::new(EndpointId("b".into()), "e", b"{}".to_vec()))
            .await
            .unwrap();

        let page = store
            .list_deliveries_for_endpoint(&EndpointId("a".into()), Page::new(2, 1))
            .await
            .unwrap();
        assert_eq!(page.iter().map(|d| d.id.0).collect::<Vec<_>>(), vec![4, 3]);
    }
}
