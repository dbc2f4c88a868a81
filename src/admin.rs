//! Owner-facing management of endpoints and deliveries.
//!
//! Every call is scoped to an owner: ids belonging to someone else behave as
//! if they did not exist.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::AdminError;
use crate::storage::{DeliveryStore, EndpointAdminStore};
use crate::types::{Delivery, DeliveryId, Endpoint, EndpointId, EndpointView, OwnerId, Page};

/// Returned once, at creation. The secret is never readable again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedEndpoint {
    pub endpoint: EndpointView,
    pub secret: String,
}

/// Partial update of an endpoint. The secret cannot be changed; rotate by
/// deleting and recreating.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointPatch {
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
}

pub struct WebhookAdmin<S> {
    store: Arc<S>,
}

impl<S> WebhookAdmin<S>
where
    S: EndpointAdminStore + DeliveryStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn create_endpoint<I, E>(
        &self,
        owner_id: &OwnerId,
        url: &str,
        events: I,
    ) -> Result<CreatedEndpoint, AdminError>
    where
        I: IntoIterator<Item = E>,
        E: Into<String>,
    {
        let url = validate_url(url)?;
        let events = validate_events(events)?;
        let secret = generate_secret();

        let endpoint = Endpoint {
            id: EndpointId(uuid::Uuid::new_v4().to_string()),
            owner_id: owner_id.clone(),
            url,
            secret: secret.clone(),
            subscribed_events: events,
            active: true,
            created_at: Utc::now(),
        };
        self.store.insert_endpoint(endpoint.clone()).await?;

        info!(
            owner_id = %owner_id,
            endpoint_id = %endpoint.id,
            "webhook endpoint created"
        );

        Ok(CreatedEndpoint {
            endpoint: endpoint.view(),
            secret,
        })
    }

    pub async fn list_endpoints(&self, owner_id: &OwnerId) -> Result<Vec<EndpointView>, AdminError> {
        let endpoints = self.store.list_endpoints(owner_id).await?;
        Ok(endpoints.iter().map(Endpoint::view).collect())
    }

    pub async fn update_endpoint(
        &self,
        owner_id: &OwnerId,
        endpoint_id: &EndpointId,
        patch: EndpointPatch,
    ) -> Result<EndpointView, AdminError> {
        let mut endpoint = self.owned_endpoint(owner_id, endpoint_id).await?;

        if let Some(url) = patch.url {
            endpoint.url = validate_url(&url)?;
        }
        if let Some(events) = patch.events {
            endpoint.subscribed_events = validate_events(events)?;
        }
        if let Some(active) = patch.active {
            endpoint.active = active;
        }

        self.store.update_endpoint(&endpoint).await?;
        Ok(endpoint.view())
    }

    /// Remove an endpoint. Its deliveries stay for audit; pending ones die
    /// on their next attempt.
    pub async fn delete_endpoint(
        &self,
        owner_id: &OwnerId,
        endpoint_id: &EndpointId,
    ) -> Result<(), AdminError> {
        self.owned_endpoint(owner_id, endpoint_id).await?;
        if !self.store.delete_endpoint(endpoint_id).await? {
            return Err(AdminError::NotFound);
        }

        info!(owner_id = %owner_id, endpoint_id = %endpoint_id, "webhook endpoint deleted");
        Ok(())
    }

    /// Deliveries of one endpoint, newest first.
    pub async fn list_deliveries(
        &self,
        owner_id: &OwnerId,
        endpoint_id: &EndpointId,
        page: Page,
    ) -> Result<Vec<Delivery>, AdminError> {
        self.owned_endpoint(owner_id, endpoint_id).await?;
        Ok(self
            .store
            .list_deliveries_for_endpoint(endpoint_id, page)
            .await?)
    }

    /// Make a dead or pending delivery due immediately.
    ///
    /// Attempts are preserved. An exhausted delivery gets exactly one more
    /// attempt.
    pub async fn retry_delivery(
        &self,
        owner_id: &OwnerId,
        delivery_id: DeliveryId,
    ) -> Result<Delivery, AdminError> {
        let delivery = self
            .store
            .find_delivery(delivery_id)
            .await?
            .ok_or(AdminError::NotFound)?;
        self.owned_endpoint(owner_id, &delivery.endpoint_id).await?;

        let revived = self
            .store
            .reset_delivery(delivery_id)
            .await?
            .ok_or(AdminError::NotRetryable(delivery_id))?;

        info!(
            owner_id = %owner_id,
            delivery_id = %delivery_id,
            attempts = revived.attempts,
            "delivery queued for manual retry"
        );
        Ok(revived)
    }

    async fn owned_endpoint(
        &self,
        owner_id: &OwnerId,
        endpoint_id: &EndpointId,
    ) -> Result<Endpoint, AdminError> {
        match self.store.find_endpoint_by_id(endpoint_id).await? {
            Some(endpoint) if &endpoint.owner_id == owner_id => Ok(endpoint),
            _ => Err(AdminError::NotFound),
        }
    }
}

fn validate_url(raw: &str) -> Result<String, AdminError> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| AdminError::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed.to_string()),
        "http" | "https" => Err(AdminError::InvalidUrl("missing host".to_string())),
        other => Err(AdminError::InvalidUrl(format!("unsupported scheme: {other}"))),
    }
}

fn validate_events<I, E>(events: I) -> Result<BTreeSet<String>, AdminError>
where
    I: IntoIterator<Item = E>,
    E: Into<String>,
{
    let events: BTreeSet<String> = events
        .into_iter()
        .map(Into::into)
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    if events.is_empty() {
        return Err(AdminError::NoEvents);
    }
    Ok(events)
}

fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    format!("whsec_{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_prefixed_and_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert!(a.starts_with("whsec_"));
        assert_eq!(a.len(), "whsec_".len() + 64);
        assert_ne!(a, b);
    }

    #[test]
    fn url_validation() {
        assert_eq!(
            validate_url(" https://example.com/hook ").unwrap(),
            "https://example.com/hook"
        );
        assert!(matches!(validate_url("ftp://example.com"), Err(AdminError::InvalidUrl(_))));
        assert!(matches!(validate_url("not a url"), Err(AdminError::InvalidUrl(_))));
    }

    #[test]
    fn events_are_trimmed_and_deduplicated() {
        let events = validate_events(["license.sold", " license.sold ", ""]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(validate_events(Vec::<String>::new()), Err(AdminError::NoEvents));
    }
}
