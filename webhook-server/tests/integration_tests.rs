//! Integration tests for the webhook server.
//!
//! These tests start a real HTTP server, send actual HTTP requests,
//! and verify what reaches the delivery channel.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use webhook_server::{WebhookPayload, WebhookServer, WebhookServerConfig};

async fn start_server(
    port_range: (u16, u16),
) -> (WebhookServer, mpsc::UnboundedReceiver<WebhookPayload>, String) {
    let (tx, rx) = mpsc::unbounded_channel::<WebhookPayload>();
    let config = WebhookServerConfig {
        port_range,
        advertised_base_url: Some("http://bridge.test".to_string()),
        ..Default::default()
    };
    let server = WebhookServer::new(config, tx)
        .await
        .expect("Failed to create webhook server");
    let local = format!("http://127.0.0.1:{}", server.port());
    (server, rx, local)
}

#[tokio::test]
async fn test_webhook_delivery_end_to_end() {
    let (server, mut rx, local) = start_server((52000, 52100)).await;
    server.router().register("/notify").await;

    let client = reqwest::Client::new();
    let body = r#"{"notifications":[{"ep":"dev1","path":"/3303/0/5700","payload":"MjkuNzU="}]}"#;

    let response = client
        .put(format!("{local}/notify"))
        .header("Content-Type", "application/json")
        .header("Authentication", "0f1e2d")
        .body(body)
        .send()
        .await
        .expect("Failed to send HTTP request");
    assert_eq!(response.status(), 200);

    let delivery = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("Timeout waiting for delivery")
        .expect("No delivery received");

    assert_eq!(delivery.path, "/notify");
    assert_eq!(delivery.authentication.as_deref(), Some("0f1e2d"));
    assert_eq!(delivery.body, body);

    server.shutdown().await.expect("Failed to shutdown server");
}

#[tokio::test]
async fn test_post_deliveries_are_accepted() {
    let (server, mut rx, local) = start_server((52100, 52200)).await;
    server.router().register("/notify").await;

    let response = reqwest::Client::new()
        .post(format!("{local}/notify"))
        .body(r#"{"de-registrations":["dev1"]}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let delivery = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(delivery.authentication.is_none());
    assert!(delivery.body.contains("de-registrations"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_body_is_still_acknowledged() {
    let (server, mut rx, local) = start_server((52200, 52300)).await;
    server.router().register("/notify").await;

    let response = reqwest::Client::new()
        .put(format!("{local}/notify"))
        .body("this is not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let delivery = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.body, "this is not json");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_path_is_not_found() {
    let (server, mut rx, local) = start_server((52300, 52400)).await;
    server.router().register("/notify").await;

    let response = reqwest::Client::new()
        .put(format!("{local}/somewhere-else"))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let nothing = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(nothing.is_err(), "no delivery expected for unknown path");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_get_is_not_a_delivery() {
    let (server, mut rx, local) = start_server((52400, 52500)).await;
    server.router().register("/notify").await;

    let response = reqwest::Client::new()
        .get(format!("{local}/notify"))
        .send()
        .await
        .unwrap();
    assert_ne!(response.status(), 200);

    let nothing = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(nothing.is_err());

    server.shutdown().await.unwrap();
}
