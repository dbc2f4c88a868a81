use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use webhook_delivery::{
    verify_webhook_request, DeliveryStatus, DeliveryStore, Dispatcher, DispatcherConfig, Endpoint,
    Envelope, FailureReason, InMemoryStore, NewDelivery, OwnerId, RetryPolicy, ReqwestClient,
    WebhookClient, WebhookRequest, Worker, WorkerConfig, MAX_RESPONSE_BODY,
};

const SECRET: &str = "whsec_http_test";

#[derive(Clone)]
struct Receiver {
    status: StatusCode,
    body: String,
    delay: Duration,
    received: Arc<Mutex<Vec<(HeaderMap, Bytes)>>>,
}

impl Receiver {
    fn answering(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: Duration::ZERO,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::answering(StatusCode::OK, "late")
        }
    }
}

async fn handle(
    State(receiver): State<Receiver>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    receiver.received.lock().await.push((headers, body));
    if !receiver.delay.is_zero() {
        tokio::time::sleep(receiver.delay).await;
    }
    (receiver.status, receiver.body.clone())
}

/// Serve `receiver` on an ephemeral port and return its address.
async fn start(receiver: Receiver) -> SocketAddr {
    let app = Router::new()
        .route("/hook", post(handle))
        .with_state(receiver);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn request(addr: SocketAddr) -> WebhookRequest {
    let endpoint = Endpoint::new("ep-a", "owner-1", format!("http://{addr}/hook"), SECRET);
    let delivery = webhook_delivery::Delivery {
        id: webhook_delivery::DeliveryId(7),
        endpoint_id: endpoint.id.clone(),
        event_type: "license.sold".to_string(),
        payload: br#"{"event":"license.sold","timestamp":"2026-01-01T00:00:00Z","data":{"id":1}}"#
            .to_vec(),
        status: DeliveryStatus::Pending,
        attempts: 0,
        max_attempts: 5,
        response_status: None,
        response_body: None,
        next_retry_at: None,
        created_at: Utc::now(),
        delivered_at: None,
    };
    WebhookRequest::signed(&delivery, &endpoint)
}

fn header_pairs(headers: &HeaderMap) -> Vec<(&str, &str)> {
    headers
        .iter()
        .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?)))
        .collect()
}

#[tokio::test]
async fn test_receiver_gets_signed_json_post() {
    let receiver = Receiver::answering(StatusCode::OK, "thanks");
    let addr = start(receiver.clone()).await;
    let client = ReqwestClient::new(Duration::from_secs(5)).unwrap();
    let request = request(addr);

    let response = client.send(&request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, "thanks");

    let received = receiver.received.lock().await;
    assert_eq!(received.len(), 1);
    let (headers, body) = &received[0];

    assert_eq!(body.as_ref(), request.body.as_slice());
    assert_eq!(headers["content-type"], "application/json");

    let parsed = verify_webhook_request(header_pairs(headers), body, SECRET.as_bytes()).unwrap();
    assert_eq!(parsed.event.as_deref(), Some("license.sold"));
    assert_eq!(parsed.delivery_id.as_deref(), Some("7"));
}

#[tokio::test]
async fn test_non_2xx_is_a_failure_with_truncated_body() {
    let receiver = Receiver::answering(StatusCode::INTERNAL_SERVER_ERROR, "x".repeat(5_000));
    let addr = start(receiver).await;
    let client = ReqwestClient::new(Duration::from_secs(5)).unwrap();

    let failure = client.send(&request(addr)).await.unwrap_err();
    match failure {
        FailureReason::Status { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body.len(), MAX_RESPONSE_BODY);
        }
        other => panic!("expected status failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_not_modified_is_not_success() {
    let receiver = Receiver::answering(StatusCode::NOT_MODIFIED, "");
    let addr = start(receiver).await;
    let client = ReqwestClient::new(Duration::from_secs(5)).unwrap();

    let failure = client.send(&request(addr)).await.unwrap_err();
    assert_eq!(failure.status_code(), Some(304));
}

#[tokio::test]
async fn test_slow_receiver_times_out() {
    let addr = start(Receiver::slow(Duration::from_secs(3))).await;
    let client = ReqwestClient::new(Duration::from_millis(200)).unwrap();

    let failure = client.send(&request(addr)).await.unwrap_err();
    assert_eq!(failure, FailureReason::Timeout);
}

#[tokio::test]
async fn test_unreachable_receiver_is_a_network_failure() {
    // Bind then drop to get a port with nobody listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = ReqwestClient::new(Duration::from_secs(2)).unwrap();
    let failure = client.send(&request(addr)).await.unwrap_err();
    assert!(matches!(failure, FailureReason::Network(_)));
}

#[tokio::test]
async fn test_dispatch_to_delivery_end_to_end() {
    let receiver = Receiver::answering(StatusCode::NO_CONTENT, "");
    let addr = start(receiver.clone()).await;

    let endpoint = Endpoint::new("ep-a", "owner-1", format!("http://{addr}/hook"), SECRET)
        .with_event("license.sold");
    let store = Arc::new(InMemoryStore::new().with_endpoint(endpoint).await);

    let dispatcher = Dispatcher::spawn(store.clone(), store.clone(), DispatcherConfig::default());
    dispatcher.dispatch(
        &OwnerId("owner-1".to_string()),
        "license.sold",
        &json!({"license_id": 42}),
    );
    dispatcher.shutdown().await;

    let worker = Worker::with_reqwest(
        store.clone(),
        store.clone(),
        RetryPolicy::default(),
        WorkerConfig {
            request_timeout: Duration::from_secs(5),
            ..WorkerConfig::default()
        },
    )
    .unwrap();
    let summary = worker.poll_once().await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let deliveries = store.deliveries().await;
    assert_eq!(deliveries[0].status, DeliveryStatus::Success);
    assert_eq!(deliveries[0].response_status, Some(204));

    let received = receiver.received.lock().await;
    let (headers, body) = &received[0];
    verify_webhook_request(header_pairs(headers), body, SECRET.as_bytes()).unwrap();

    let envelope: Envelope = serde_json::from_slice(body).unwrap();
    assert_eq!(envelope.event, "license.sold");
    assert_eq!(envelope.data, json!({"license_id": 42}));
}

#[tokio::test]
async fn test_failed_attempt_is_recorded_against_real_receiver() {
    let receiver = Receiver::answering(StatusCode::SERVICE_UNAVAILABLE, "maintenance");
    let addr = start(receiver).await;

    let endpoint = Endpoint::new("ep-a", "owner-1", format!("http://{addr}/hook"), SECRET)
        .with_event("license.sold");
    let store = Arc::new(InMemoryStore::new().with_endpoint(endpoint.clone()).await);
    let created = store
        .create_delivery(NewDelivery::new(endpoint.id, "license.sold", b"{}".to_vec()))
        .await
        .unwrap();

    let worker = Worker::with_reqwest(
        store.clone(),
        store.clone(),
        RetryPolicy::default(),
        WorkerConfig::default(),
    )
    .unwrap();
    worker.poll_once().await.unwrap();

    let delivery = store.find_delivery(created.id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.response_status, Some(503));
    assert_eq!(delivery.response_body.as_deref(), Some("maintenance"));
    assert!(delivery.next_retry_at.is_some());
}

#[tokio::test]
async fn test_redirect_is_a_failed_attempt() {
    let hook_posts = Arc::new(AtomicUsize::new(0));
    let landing_hits = Arc::new(AtomicUsize::new(0));

    let posts = hook_posts.clone();
    let hits = landing_hits.clone();
    let app = Router::new()
        .route(
            "/hook",
            post(move || async move {
                posts.fetch_add(1, Ordering::SeqCst);
                (StatusCode::FOUND, [(header::LOCATION, "/landing")])
            }),
        )
        .route(
            "/landing",
            get(move || async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "landing page"
            }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let endpoint = Endpoint::new("ep-a", "owner-1", format!("http://{addr}/hook"), SECRET)
        .with_event("license.sold");
    let store = Arc::new(InMemoryStore::new().with_endpoint(endpoint.clone()).await);
    let created = store
        .create_delivery(NewDelivery::new(endpoint.id, "license.sold", b"{}".to_vec()))
        .await
        .unwrap();

    let worker = Worker::with_reqwest(
        store.clone(),
        store.clone(),
        RetryPolicy::default(),
        WorkerConfig::default(),
    )
    .unwrap();
    worker.poll_at(Utc::now()).await.unwrap();

    assert_eq!(hook_posts.load(Ordering::SeqCst), 1);
    assert_eq!(landing_hits.load(Ordering::SeqCst), 0);

    let delivery = store.find_delivery(created.id).await.unwrap().unwrap();
    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.response_status, Some(302));
    assert_eq!(delivery.delivered_at, None);
}
